//! Dialing strategies
//!
//! A [`Dialer`] produces a fresh transport for the target's SSH handshake
//! each time it is called; nothing touches the network before that.
//!
//! ```text
//! direct:   Client --TCP--> [Target]
//! bastion:  Client --SSH--> [Bastion] --direct-tcpip--> [Target]
//! ```
//!
//! In bastion mode the target handshake runs over a `ChannelStream`
//! (SSH-over-SSH), so the bastion client must outlive it. The returned
//! [`Link`] carries that client as a [`BastionLink`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, info};

use super::auth::HopConfig;
use super::client::{handshake, ClientHandler};
use super::error::SshError;

/// Fixed timeout for establishing a TCP connection
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte stream an SSH handshake can run over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A freshly dialed transport to the target
pub struct Link {
    pub stream: Box<dyn Transport>,
    /// Set when the stream is tunneled through a bastion
    pub bastion: Option<BastionLink>,
}

/// Authenticated client connection to a bastion
pub struct BastionLink {
    handle: Handle<ClientHandler>,
    address: String,
}

impl BastionLink {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Disconnect from the bastion; a no-op when it is already gone
    pub async fn close(&self) -> Result<(), SshError> {
        close_handle(&self.handle, &self.address).await
    }
}

/// Send a disconnect on `handle` unless the session has already ended
pub async fn close_handle(handle: &Handle<ClientHandler>, address: &str) -> Result<(), SshError> {
    if handle.is_closed() {
        return Ok(());
    }
    debug!("Disconnecting from {}", address);
    handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
        .map_err(|e| SshError::SessionError(format!("failed to close {}: {}", address, e)))
}

/// Factory of raw connections to the target
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Link, SshError>;
}

/// Plain TCP to the target
#[derive(Debug, Clone)]
pub struct DirectDialer {
    host: String,
    port: u16,
}

impl DirectDialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self) -> Result<Link, SshError> {
        let address = format!("{}:{}", self.host, self.port);
        debug!("Dialing {}", address);

        let stream = connect_tcp(&address)
            .await
            .map_err(|reason| SshError::Dial {
                host: address.clone(),
                reason,
            })?;

        Ok(Link {
            stream: Box::new(stream),
            bastion: None,
        })
    }
}

/// SSH to a bastion, then a `direct-tcpip` tunnel to the target
#[derive(Debug, Clone)]
pub struct BastionDialer {
    bastion: Arc<HopConfig>,
    target_host: String,
    target_port: u16,
}

impl BastionDialer {
    pub fn new(bastion: Arc<HopConfig>, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bastion,
            target_host: target_host.into(),
            target_port,
        }
    }
}

#[async_trait]
impl Dialer for BastionDialer {
    async fn dial(&self) -> Result<Link, SshError> {
        let bastion_address = self.bastion.address();
        let target_address = format!("{}:{}", self.target_host, self.target_port);

        info!("Connecting to bastion: {}", bastion_address);
        let handle = async {
            let tcp = connect_tcp(&bastion_address).await?;
            handshake(&self.bastion, tcp, None)
                .await
                .map_err(|e| e.to_string())
        }
        .await
        .map_err(|reason| SshError::BastionDial {
            bastion: bastion_address.clone(),
            reason,
        })?;

        let link = BastionLink {
            handle,
            address: bastion_address,
        };

        info!(
            "Connecting via bastion ({}) to host: {}",
            link.address, target_address
        );
        let channel = match link
            .handle
            .channel_open_direct_tcpip(
                self.target_host.as_str(),
                u32::from(self.target_port),
                "127.0.0.1",
                0,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                // Don't leave the bastion session behind
                if let Err(close_err) = link.close().await {
                    debug!("{}", close_err);
                }
                return Err(SshError::Dial {
                    host: target_address,
                    reason: format!("tunnel via bastion {} failed: {}", link.address, e),
                });
            }
        };

        Ok(Link {
            stream: Box::new(channel.into_stream()),
            bastion: Some(link),
        })
    }
}

/// Resolve `address` and connect with TCP keep-alive enabled
///
/// The whole attempt, resolution included, is bounded by [`DIAL_TIMEOUT`].
async fn connect_tcp(address: &str) -> Result<TcpStream, String> {
    let attempt = async {
        let mut last_err = None;
        for addr in lookup_host(address).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(true)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        }))
    };

    let stream = tokio::time::timeout(DIAL_TIMEOUT, attempt)
        .await
        .map_err(|_| format!("timed out after {}s", DIAL_TIMEOUT.as_secs()))?
        .map_err(|e: io::Error| e.to_string())?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_dial_failure_names_target() {
        // Port 1 on loopback is closed on any sane test host
        let dialer = DirectDialer::new("127.0.0.1", 1);
        match dialer.dial().await {
            Err(SshError::Dial { host, .. }) => assert_eq!(host, "127.0.0.1:1"),
            Err(e) => panic!("Unexpected error type: {:?}", e),
            Ok(_) => panic!("dial to a closed port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_direct_dial_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let link = DirectDialer::new("127.0.0.1", port).dial().await.unwrap();
        assert!(link.bastion.is_none());
        let (_accepted, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let dialer = DirectDialer::new("host.invalid", 22);
        assert!(matches!(dialer.dial().await, Err(SshError::Dial { .. })));
    }
}
