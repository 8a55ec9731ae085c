//! SSH Communicator
//!
//! Owns the live client connection to the target and runs commands on it.
//!
//! ```text
//!   Disconnected --connect()--> Connecting --> Connected
//!   Connected --disconnect()--> Disconnected
//!   Connected --session open fails--> Reconnecting --> Connected (once)
//! ```
//!
//! Every command gets its own session channel; channels are never reused.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Pty, Sig};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::agent::AgentHandle;
use super::auth::HopConfig;
use super::client::{handshake, ClientHandler};
use super::command::{CommandOutput, CompletionSender, ExitOutcome, RemoteCommand};
use super::config::ConnectionDescriptor;
use super::dial::{close_handle, BastionDialer, BastionLink, Dialer, DirectDialer};
use super::error::SshError;

/// Terminal size requested for the remote command
pub const PTY_COLS: u32 = 80;
pub const PTY_ROWS: u32 = 40;

/// How long the server gets to answer an agent forwarding request
pub const FORWARDING_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// No echo, 14.4kbaud in and out
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything needed to (re)establish the connection
pub struct SshConfig {
    pub target: Arc<HopConfig>,
    pub dialer: Arc<dyn Dialer>,
    /// Request a pseudo-terminal for commands
    pub pty: bool,
    pub agent: Option<Arc<AgentHandle>>,
    /// Ask the target to forward the agent back to us
    pub forward_agent: bool,
    /// Wait this long for the answer to each forwarding request
    pub forwarding_timeout: Duration,
}

impl SshConfig {
    /// Build hop configurations and the dialer for `descriptor`
    ///
    /// Connects to the agent when it is enabled; no other network I/O happens.
    pub async fn prepare(descriptor: &ConnectionDescriptor) -> Result<Self, SshError> {
        let agent = match (&descriptor.agent_socket, descriptor.use_agent) {
            (Some(socket), true) => Some(Arc::new(
                AgentHandle::connect(socket, descriptor.agent_identity.clone()).await?,
            )),
            (None, true) => {
                warn!("SSH Agent requested but SSH_AUTH_SOCK is not set; continuing without it");
                None
            }
            (_, false) => None,
        };

        let target = Arc::new(HopConfig::build(&descriptor.target, agent.clone())?);

        let dialer: Arc<dyn Dialer> = match &descriptor.bastion {
            Some(bastion) => {
                info!("Using bastion host {}", bastion.address());
                let bastion = Arc::new(HopConfig::build(bastion, agent.clone())?);
                Arc::new(BastionDialer::new(
                    bastion,
                    descriptor.target.host.clone(),
                    descriptor.target.port,
                ))
            }
            None => Arc::new(DirectDialer::new(
                descriptor.target.host.clone(),
                descriptor.target.port,
            )),
        };

        Ok(Self {
            target,
            dialer,
            pty: descriptor.pty,
            forward_agent: descriptor.agent_forwarding && agent.is_some(),
            forwarding_timeout: FORWARDING_REPLY_TIMEOUT,
            agent,
        })
    }
}

/// Authenticated client plus the bastion link carrying it, if any
struct Connection {
    client: Handle<ClientHandler>,
    address: String,
    bastion: Option<BastionLink>,
}

impl Connection {
    /// Close the target client (and with it the tunnel), then the bastion
    ///
    /// Both are attempted; the first failure is reported.
    async fn close(self) -> Result<(), SshError> {
        let tunnel = close_handle(&self.client, &self.address).await;
        let bastion = match &self.bastion {
            Some(link) => link.close().await,
            None => Ok(()),
        };
        tunnel.and(bastion)
    }
}

pub struct Communicator {
    descriptor: ConnectionDescriptor,
    config: SshConfig,
    connection: Option<Connection>,
    state: ConnectionState,
    agent_forwarding: bool,
}

impl Communicator {
    pub async fn new(descriptor: ConnectionDescriptor) -> Result<Self, SshError> {
        let config = SshConfig::prepare(&descriptor).await?;
        Ok(Self::with_config(descriptor, config))
    }

    pub fn with_config(descriptor: ConnectionDescriptor, config: SshConfig) -> Self {
        Self {
            descriptor,
            config,
            connection: None,
            state: ConnectionState::Disconnected,
            agent_forwarding: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Configured command timeout; callers enforce it
    pub fn timeout(&self) -> Duration {
        self.descriptor.timeout
    }

    /// Whether the target accepted agent forwarding on the live connection
    pub fn agent_forwarding(&self) -> bool {
        self.agent_forwarding
    }

    /// Whether the live connection runs through a bastion
    pub fn via_bastion(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.bastion.is_some())
    }

    /// Dial, handshake and authenticate, replacing any previous connection
    pub async fn connect(&mut self) -> Result<(), SshError> {
        if let Some(prior) = self.connection.take() {
            if let Err(e) = prior.close().await {
                debug!("closing previous connection: {}", e);
            }
        }
        if self.state != ConnectionState::Reconnecting {
            self.state = ConnectionState::Connecting;
        }
        self.agent_forwarding = false;

        let target = &self.config.target;
        debug!(
            "Connecting to remote host via SSH: host={} user={} methods={:?} \
             checking_host_key={} bastion={:?}",
            target.address(),
            target.user,
            target.methods,
            matches!(
                target.host_key,
                super::known_hosts::HostKeyPolicy::Pinned(_)
            ),
            self.descriptor.bastion.as_ref().map(|b| b.address()),
        );

        let connection = match self.establish().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("{}", e);
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        info!("Connected to {}", self.config.target.address());

        if self.config.forward_agent {
            self.agent_forwarding = self.request_agent_forwarding().await;
        }
        Ok(())
    }

    async fn establish(&self) -> Result<Connection, SshError> {
        debug!("connecting to TCP connection for SSH");
        let link = self.config.dialer.dial().await?;

        let agent_socket = self
            .config
            .agent
            .as_ref()
            .filter(|_| self.config.forward_agent)
            .map(|agent| agent.socket().to_path_buf());

        debug!("handshaking with SSH");
        match handshake(&self.config.target, link.stream, agent_socket).await {
            Ok(client) => Ok(Connection {
                client,
                address: self.config.target.address(),
                bastion: link.bastion,
            }),
            Err(e) => {
                if let Some(bastion) = link.bastion {
                    if let Err(close_err) = bastion.close().await {
                        debug!("{}", close_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Ask the server to forward our agent, via a throwaway session
    ///
    /// A refusal or missing answer is logged, never fatal.
    async fn request_agent_forwarding(&self) -> bool {
        let Some(connection) = &self.connection else {
            return false;
        };

        debug!("Setting up a session to request agent forwarding");
        let result = async {
            let mut channel = connection
                .client
                .channel_open_session()
                .await
                .map_err(|e| SshError::SessionError(e.to_string()))?;
            let reply = request_forwarding(
                &mut channel,
                &mut Vec::new(),
                self.config.forwarding_timeout,
            )
            .await;
            let _ = channel.close().await;
            reply
        }
        .await;

        match result {
            Ok(()) => {
                info!("agent forwarding enabled");
                true
            }
            Err(e) => {
                warn!("error forwarding agent: {}", e);
                false
            }
        }
    }

    /// Open a session channel, reconnecting once if that fails
    pub async fn new_session(&mut self) -> Result<Channel<Msg>, SshError> {
        debug!("opening new ssh session");
        let first = match &self.connection {
            Some(connection) => open_session(&connection.client).await,
            None => Err(SshError::NotConnected),
        };

        match first {
            Ok(channel) => Ok(channel),
            Err(e) => {
                warn!("ssh session open error: '{}', attempting reconnect", e);
                self.state = ConnectionState::Reconnecting;
                self.connect().await?;

                let connection = self.connection.as_ref().ok_or(SshError::NotConnected)?;
                open_session(&connection.client).await
            }
        }
    }

    /// Start `cmd` on a fresh session and return without waiting for it
    ///
    /// Completion is observed through [`RemoteCommand::wait`].
    pub async fn start(&mut self, cmd: &mut RemoteCommand) -> Result<(), SshError> {
        let done = cmd.init();
        let shown = cmd.redacted();
        let mut channel = self.new_session().await?;

        let pending = match self.prepare_channel(&mut channel, cmd.command(), &shown).await {
            Ok(pending) => pending,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        let mut stdin = cmd.take_stdin();
        let mut writer = channel.make_writer();
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
                debug!("stdin copy ended: {}", e);
            }
            // EOF for the remote side
            let _ = writer.shutdown().await;
        });

        tokio::spawn(drive_session(
            channel,
            pending,
            cmd.take_stdout(),
            cmd.take_stderr(),
            done,
            shown,
        ));
        Ok(())
    }

    /// Request forwarding, pty and exec on `channel`
    ///
    /// Returns messages that arrived while waiting for the replies.
    async fn prepare_channel(
        &self,
        channel: &mut Channel<Msg>,
        command: &str,
        shown: &str,
    ) -> Result<Vec<ChannelMsg>, SshError> {
        let mut pending = Vec::new();

        if self.config.forward_agent {
            if let Err(e) =
                request_forwarding(channel, &mut pending, self.config.forwarding_timeout).await
            {
                debug!("agent forwarding request on session failed: {}", e);
            }
        }

        if self.config.pty {
            channel
                .request_pty(true, "xterm", PTY_COLS, PTY_ROWS, 0, 0, TERMINAL_MODES)
                .await
                .map_err(|e| SshError::ChannelError(format!("pty request failed: {}", e)))?;
            await_reply(channel, &mut pending, "pty").await?;
        }

        debug!("starting remote command: {}", shown);
        channel
            .exec(true, format!("{}\n", command.trim()))
            .await
            .map_err(|e| SshError::ChannelError(format!("exec request failed: {}", e)))?;
        await_reply(channel, &mut pending, "exec").await?;

        Ok(pending)
    }

    /// Close the agent, then the connection; safe to call repeatedly
    pub async fn disconnect(&mut self) -> Result<(), SshError> {
        let agent = match &self.config.agent {
            Some(agent) => agent.close().await,
            None => Ok(()),
        };

        let connection = match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        if self.state != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.config.target.address());
        }
        self.state = ConnectionState::Disconnected;
        agent.and(connection)
    }
}

async fn open_session(client: &Handle<ClientHandler>) -> Result<Channel<Msg>, SshError> {
    client
        .channel_open_session()
        .await
        .map_err(|e| SshError::SessionError(e.to_string()))
}

/// Send `auth-agent-req@openssh.com` on `channel` and wait up to `timeout` for the answer
async fn request_forwarding(
    channel: &mut Channel<Msg>,
    pending: &mut Vec<ChannelMsg>,
    timeout: Duration,
) -> Result<(), SshError> {
    channel.agent_forward(true).await?;
    tokio::time::timeout(timeout, await_reply(channel, pending, "agent forwarding"))
        .await
        .unwrap_or_else(|_| {
            Err(SshError::ChannelError(
                "no reply to agent forwarding request".to_string(),
            ))
        })
}

/// Wait for the reply to a `want_reply` channel request
///
/// Anything else that arrives meanwhile is kept in `pending`.
async fn await_reply(
    channel: &mut Channel<Msg>,
    pending: &mut Vec<ChannelMsg>,
    request: &str,
) -> Result<(), SshError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::ChannelError(format!(
                    "{} request was rejected by the server",
                    request
                )))
            }
            Some(msg) => pending.push(msg),
            None => {
                return Err(SshError::ChannelError(format!(
                    "channel closed before {} reply",
                    request
                )))
            }
        }
    }
}

/// Copy output until the channel closes, then publish the exit outcome
async fn drive_session(
    mut channel: Channel<Msg>,
    pending: Vec<ChannelMsg>,
    mut stdout: CommandOutput,
    mut stderr: CommandOutput,
    done: CompletionSender,
    command: String,
) {
    let mut exit_status = None;
    let mut signal = None;
    let mut error = None;
    let mut pending = pending.into_iter();

    loop {
        let msg = match pending.next() {
            Some(msg) => msg,
            None => match channel.wait().await {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            ChannelMsg::Data { data } => {
                if let Err(e) = stdout.write_all(&data).await {
                    error.get_or_insert(SshError::IoError(e));
                }
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                if let Err(e) = stderr.write_all(&data).await {
                    error.get_or_insert(SshError::IoError(e));
                }
            }
            ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
            ChannelMsg::ExitSignal { signal_name, .. } => signal = Some(signal_name_of(signal_name)),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    for writer in [&mut stdout, &mut stderr] {
        if let Err(e) = writer.flush().await {
            error.get_or_insert(SshError::IoError(e));
        }
    }

    let outcome = exit_outcome(exit_status, signal, error);
    debug!(
        "remote command exited with '{}': {}",
        outcome.exit_status, command
    );
    done.complete(outcome);

    let _ = channel.close().await;
}

/// Derive the outcome of a finished session
///
/// A signal maps to 128 + its number (just 128 when unknown). A session
/// that ends without either status or signal is an error.
pub fn exit_outcome(
    exit_status: Option<u32>,
    signal: Option<String>,
    error: Option<SshError>,
) -> ExitOutcome {
    let (status, missing) = match (exit_status, &signal) {
        (Some(status), _) => (status, false),
        (None, Some(name)) => (128 + signal_number(name), false),
        (None, None) => (0, true),
    };

    let error = error.or_else(|| {
        missing.then(|| {
            SshError::ChannelError(
                "remote command exited without exit status or exit signal".to_string(),
            )
        })
    });

    ExitOutcome {
        exit_status: status,
        signal,
        error: error.map(Arc::new),
    }
}

fn signal_name_of(sig: Sig) -> String {
    match sig {
        Sig::Custom(name) => name,
        other => format!("{:?}", other),
    }
}

fn signal_number(name: &str) -> u32 {
    match name.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => 0,
    }
}
