//! SSH Client implementation using russh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::auth::HopConfig;
use super::error::SshError;
use super::known_hosts::HostKeyPolicy;

/// Transport settings shared by every hop
pub fn ssh_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)), // Send keepalive every 30s
        keepalive_max: 3, // Disconnect after 3 missed keepalives (90s total)
        ..Default::default()
    })
}

/// Run the SSH handshake for `hop` over `stream` and authenticate
///
/// `agent_socket` enables serving agent channels the server opens back to us
/// once forwarding has been requested.
pub async fn handshake<S>(
    hop: &HopConfig,
    stream: S,
    agent_socket: Option<PathBuf>,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let address = hop.address();
    debug!("Handshaking with {}", address);

    let handler = ClientHandler::new(hop, agent_socket);
    let mut handle = client::connect_stream(ssh_config(), stream, handler)
        .await
        .map_err(|e| match e {
            e @ SshError::HostKeyMismatch { .. } => e,
            other => SshError::Handshake {
                host: address.clone(),
                reason: other.to_string(),
            },
        })?;

    debug!("SSH handshake with {} completed", address);

    hop.authenticate(&mut handle).await?;
    Ok(handle)
}

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events, including:
/// - Host key verification against the hop's [`HostKeyPolicy`]
/// - Agent channels opened by the server after agent forwarding was requested
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    host_key: HostKeyPolicy,
    /// Local agent socket forwarded channels are proxied to
    agent_socket: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(hop: &HopConfig, agent_socket: Option<PathBuf>) -> Self {
        Self {
            host: hop.host.clone(),
            port: hop.port,
            host_key: hop.host_key.clone(),
            agent_socket,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.host_key
            .check(&self.host, self.port, server_public_key)
            .map(|()| true)
    }

    /// Called when the server opens an `auth-agent@openssh.com` channel.
    /// Each one is proxied to a fresh connection on the local agent socket.
    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(socket) = self.agent_socket.clone() else {
            warn!(
                "{}:{} opened an agent channel but no agent is configured",
                self.host, self.port
            );
            return Ok(());
        };

        info!("Server opened agent forwarding channel");

        // We can't block here as this is called from the SSH event loop
        #[cfg(unix)]
        tokio::spawn(async move {
            let mut agent = match tokio::net::UnixStream::connect(&socket).await {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(
                        "Failed to reach SSH Agent at {} for forwarding: {}",
                        socket.display(),
                        e
                    );
                    return;
                }
            };
            let mut stream = channel.into_stream();
            match tokio::io::copy_bidirectional(&mut stream, &mut agent).await {
                Ok((to_agent, from_agent)) => debug!(
                    "Forwarded agent channel closed ({} bytes in, {} bytes out)",
                    to_agent, from_agent
                ),
                Err(e) => debug!("Forwarded agent channel ended: {}", e),
            }
        });

        #[cfg(not(unix))]
        drop((socket, channel));

        Ok(())
    }
}
