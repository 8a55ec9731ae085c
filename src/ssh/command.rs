//! Remote command bookkeeping
//!
//! A [`RemoteCommand`] carries the command text and its I/O streams into
//! [`Communicator::start`](super::Communicator::start) and exposes the
//! asynchronous completion of the remote process through [`RemoteCommand::wait`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use super::error::{Phase, SshError};

pub type CommandInput = Box<dyn AsyncRead + Send + Unpin>;
pub type CommandOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Terminal result of a remote process
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub exit_status: u32,
    /// Signal name when the process was killed by a signal
    pub signal: Option<String>,
    /// Set when the command could not be run or its outcome not collected
    pub error: Option<Arc<SshError>>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self {
            exit_status: 0,
            signal: None,
            error: None,
        }
    }
}

/// Returned by [`RemoteCommand::wait`] for a failed or non-zero exit
#[derive(Clone)]
pub struct CommandError {
    pub command: String,
    /// Command text with secrets masked, used when rendering
    shown: String,
    pub exit_status: u32,
    pub signal: Option<String>,
    pub source: Option<Arc<SshError>>,
}

impl CommandError {
    pub fn phase(&self) -> Phase {
        Phase::Command
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(err) => write!(f, "error executing {:?}: {}", self.shown, err),
            None => write!(f, "{:?} exit status: {}", self.shown, self.exit_status),
        }
    }
}

impl fmt::Debug for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandError")
            .field("command", &self.shown)
            .field("exit_status", &self.exit_status)
            .field("signal", &self.signal)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Write half of a command's completion; firing consumes it
pub struct CompletionSender {
    tx: watch::Sender<Option<ExitOutcome>>,
}

impl CompletionSender {
    /// Publish the outcome. Status and error become visible together.
    pub fn complete(self, outcome: ExitOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

/// A command to run remotely
///
/// Shareable across tasks once started; every waiter sees the same outcome.
pub struct RemoteCommand {
    command: String,
    stdin: Mutex<Option<CommandInput>>,
    stdout: Mutex<Option<CommandOutput>>,
    stderr: Mutex<Option<CommandOutput>>,
    secrets: Vec<String>,
    completion: Option<watch::Receiver<Option<ExitOutcome>>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            secrets: Vec::new(),
            completion: None,
        }
    }

    /// Mask `secret` wherever the command text is logged or reported
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    /// Input fed to the remote process; empty by default
    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Mutex::new(Some(Box::new(reader)));
        self
    }

    /// Sink for remote stdout; discarded by default
    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Mutex::new(Some(Box::new(writer)));
        self
    }

    /// Sink for remote stderr; discarded by default
    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Mutex::new(Some(Box::new(writer)));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Command text safe to show in logs
    pub fn redacted(&self) -> String {
        self.secrets
            .iter()
            .fold(self.command.clone(), |text, secret| text.replace(secret.as_str(), "********"))
    }

    /// Arm a fresh completion signal, replacing any previous one
    pub fn init(&mut self) -> CompletionSender {
        let (tx, rx) = watch::channel(None);
        self.completion = Some(rx);
        CompletionSender { tx }
    }

    pub(crate) fn take_stdin(&mut self) -> CommandInput {
        self.stdin
            .get_mut()
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::empty()))
    }

    pub(crate) fn take_stdout(&mut self) -> CommandOutput {
        self.stdout
            .get_mut()
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::sink()))
    }

    pub(crate) fn take_stderr(&mut self) -> CommandOutput {
        self.stderr
            .get_mut()
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::sink()))
    }

    /// Outcome if the command has completed
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.completion.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Wait for the remote process to finish
    ///
    /// May be called any number of times; every call after completion sees
    /// the same result.
    pub async fn wait(&self) -> Result<(), CommandError> {
        let outcome = match &self.completion {
            None => ExitOutcome {
                error: Some(Arc::new(SshError::SessionError(
                    "command was never started".to_string(),
                ))),
                ..ExitOutcome::success()
            },
            Some(rx) => {
                let mut rx = rx.clone();
                let seen = match rx.wait_for(Option::is_some).await {
                    Ok(seen) => seen.clone().unwrap_or_else(ExitOutcome::success),
                    Err(_) => ExitOutcome {
                        error: Some(Arc::new(SshError::SessionError(
                            "command was dropped before completing".to_string(),
                        ))),
                        ..ExitOutcome::success()
                    },
                };
                seen
            }
        };

        if outcome.error.is_some() || outcome.exit_status != 0 {
            return Err(CommandError {
                command: self.command.clone(),
                shown: self.redacted(),
                exit_status: outcome.exit_status,
                signal: outcome.signal,
                source: outcome.error,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("command", &self.redacted())
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Shared in-memory sink for command output
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
