//! Plugin entry: run `chef-client` on the configured host
//!
//! Resolves the connection, starts the command, waits for it within the
//! configured timeout and always disconnects afterwards.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::ssh::{
    Communicator, ConnectionDescriptor, ConnectionSettings, OutputBuffer, RemoteCommand,
};

/// Everything one plugin run needs
#[derive(Clone, Default)]
pub struct Plugin {
    pub settings: ConnectionSettings,
    pub run_list: Vec<String>,
    pub sudo_password: String,
}

/// Build the remote command line
///
/// The password is piped into `sudo -S` verbatim; nothing is escaped.
pub fn chef_client_command(sudo_password: &str, run_list: &[String]) -> String {
    let mut command = format!("echo {} | sudo -S chef-client", sudo_password);
    if !run_list.is_empty() {
        command.push_str(" -r ");
        command.push_str(&run_list.join(","));
    }
    command
}

impl Plugin {
    /// Run the plugin once
    ///
    /// `agent_socket` is the agent endpoint discovered at startup. Captured
    /// remote stdout is written to our stdout even when the command fails.
    pub async fn exec(&self, agent_socket: Option<PathBuf>) -> anyhow::Result<()> {
        let descriptor = ConnectionDescriptor::resolve(self.settings.clone(), agent_socket);
        let mut comm = Communicator::new(descriptor)
            .await
            .map_err(|e| anyhow!("{} failed: error creating ssh communicator: {}", e.phase(), e))?;

        let output = OutputBuffer::new();
        let result = self.run(&mut comm, output.clone()).await;

        if let Err(e) = comm.disconnect().await {
            warn!("error closing connection: {}", e);
        }

        let captured = output.contents();
        if !captured.is_empty() {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(&captured)
                .await
                .context("writing command output")?;
            stdout.flush().await.context("writing command output")?;
        }

        result.map_err(|e| anyhow!(self.mask(&e.to_string())))
    }

    async fn run(&self, comm: &mut Communicator, output: OutputBuffer) -> anyhow::Result<()> {
        comm.connect()
            .await
            .map_err(|e| anyhow!("{} failed: {}", e.phase(), e))?;

        let mut cmd = RemoteCommand::new(chef_client_command(&self.sudo_password, &self.run_list))
            .redact(self.sudo_password.clone())
            .stdout(output)
            .stderr(tokio::io::stderr());

        comm.start(&mut cmd)
            .await
            .map_err(|e| anyhow!("{} failed: error executing remote command: {}", e.phase(), e))?;

        let timeout = comm.timeout();
        match tokio::time::timeout(timeout, cmd.wait()).await {
            Ok(Ok(())) => {
                info!("chef-client finished successfully");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow!("{} failed: {}", e.phase(), e)),
            Err(_) => Err(anyhow!(
                "command failed: {:?} did not finish within {:?}",
                cmd.redacted(),
                timeout
            )),
        }
    }

    fn mask(&self, message: &str) -> String {
        if self.sudo_password.is_empty() {
            message.to_string()
        } else {
            message.replace(self.sudo_password.as_str(), "********")
        }
    }
}
