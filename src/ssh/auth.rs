//! Per-hop authentication configuration
//!
//! [`HopConfig::build`] turns a [`HopDescriptor`] into the ordered list of
//! authentication methods and the host key policy for that hop. Methods are
//! offered in a fixed order: private key, password, agent.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::Handle;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use tracing::{debug, info, warn};

use super::agent::AgentHandle;
use super::client::ClientHandler;
use super::config::HopDescriptor;
use super::error::SshError;
use super::known_hosts::HostKeyPolicy;

/// A single way of proving identity to a server
#[derive(Clone)]
pub enum AuthMethod {
    PublicKey(Arc<PrivateKey>),
    Password(String),
    Agent(Arc<AgentHandle>),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent(_) => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Authentication and host verification settings for one hop
#[derive(Debug, Clone)]
pub struct HopConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub methods: Vec<AuthMethod>,
    pub host_key: HostKeyPolicy,
}

impl HopConfig {
    /// Build the configuration for `hop`
    ///
    /// Fails fast on an unusable private key or host key; nothing touches the
    /// network here.
    pub fn build(hop: &HopDescriptor, agent: Option<Arc<AgentHandle>>) -> Result<Self, SshError> {
        let address = hop.address();
        let host_key = HostKeyPolicy::for_hop(&hop.host, hop.port, hop.host_key.as_deref())?;

        let mut methods = Vec::new();
        if let Some(pem) = &hop.private_key {
            let key = read_private_key(pem, &address)?;
            methods.push(AuthMethod::PublicKey(Arc::new(key)));
        }
        if let Some(password) = &hop.password {
            methods.push(AuthMethod::Password(password.clone()));
        }
        if let Some(agent) = agent {
            methods.push(AuthMethod::Agent(agent));
        }

        debug!(
            "Auth methods for {}@{}: {:?}",
            hop.user, address, methods
        );

        Ok(Self {
            user: hop.user.clone(),
            host: hop.host.clone(),
            port: hop.port,
            methods,
            host_key,
        })
    }

    /// `host:port` of this hop
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Try each method in order until the server accepts one
    pub async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), SshError> {
        let address = self.address();

        if self.methods.is_empty() {
            debug!("No credentials configured for {}, trying 'none'", address);
            let result = handle.authenticate_none(&self.user).await?;
            if result.success() {
                info!("Authenticated to {} as {} (none)", address, self.user);
                return Ok(());
            }
            return Err(SshError::AuthenticationFailed {
                host: address,
                reason: "no credentials configured and server requires authentication"
                    .to_string(),
            });
        }

        let mut tried = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            debug!("Trying {} authentication for {}", method.name(), address);
            tried.push(method.name());

            let accepted = match method {
                AuthMethod::PublicKey(key) => {
                    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                    handle
                        .authenticate_publickey(
                            &self.user,
                            PrivateKeyWithHashAlg::new(key.clone(), hash_alg),
                        )
                        .await?
                        .success()
                }
                AuthMethod::Password(password) => handle
                    .authenticate_password(&self.user, password)
                    .await?
                    .success(),
                AuthMethod::Agent(agent) => match agent.authenticate(handle, &self.user).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Agent authentication to {} failed: {}", address, e);
                        false
                    }
                },
            };

            if accepted {
                info!(
                    "Authenticated to {} as {} ({})",
                    address,
                    self.user,
                    method.name()
                );
                return Ok(());
            }
        }

        Err(SshError::AuthenticationFailed {
            host: address,
            reason: format!("server rejected all methods ({})", tried.join(", ")),
        })
    }
}

/// A decoded PEM block
struct PemBlock<'a> {
    headers: Vec<(&'a str, &'a str)>,
    /// The block alone, BEGIN through END
    text: String,
}

/// Find the first well-formed PEM block in `text`
///
/// A block counts only if it has matching BEGIN/END lines and a body that
/// decodes as base64. Malformed blocks are skipped.
fn decode_pem(text: &str) -> Option<PemBlock<'_>> {
    let mut lines = text.lines().map(str::trim);

    while let Some(line) = lines.next() {
        let Some(label) = line
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
        else {
            continue;
        };
        let end = format!("-----END {}-----", label);

        let mut headers = Vec::new();
        let mut body = String::new();
        let mut raw = vec![line];
        let mut in_headers = true;
        let mut closed = false;

        for line in lines.by_ref() {
            raw.push(line);
            if line == end {
                closed = true;
                break;
            }
            if in_headers {
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim(), value.trim()));
                    continue;
                }
                in_headers = false;
                if line.is_empty() {
                    continue;
                }
            }
            body.push_str(line);
        }

        if closed && !body.is_empty() && BASE64.decode(body.as_bytes()).is_ok() {
            return Some(PemBlock {
                headers,
                text: raw.join("\n"),
            });
        }
    }
    None
}

/// Parse a PEM encoded private key for `hop`
///
/// Encrypted keys are rejected up front; there is no passphrase prompt.
/// Errors name the hop, never the key material.
pub fn read_private_key(pem: &str, hop: &str) -> Result<PrivateKey, SshError> {
    let block = decode_pem(pem).ok_or_else(|| SshError::NoKeyFound {
        hop: hop.to_string(),
    })?;

    let encrypted = block
        .headers
        .iter()
        .any(|(name, value)| *name == "Proc-Type" && *value == "4,ENCRYPTED");
    if encrypted {
        return Err(SshError::EncryptedKey {
            hop: hop.to_string(),
        });
    }

    // OpenSSH keys carry their cipher inside the body rather than a header
    if let Ok(key) = russh::keys::ssh_key::PrivateKey::from_openssh(block.text.as_str()) {
        if key.is_encrypted() {
            return Err(SshError::EncryptedKey {
                hop: hop.to_string(),
            });
        }
    }

    russh::keys::decode_secret_key(&block.text, None).map_err(|e| match e {
        russh::keys::Error::KeyIsEncrypted => SshError::EncryptedKey {
            hop: hop.to_string(),
        },
        other => SshError::KeyParse {
            hop: hop.to_string(),
            reason: other.to_string(),
        },
    })
}
