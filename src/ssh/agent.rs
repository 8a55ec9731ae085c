//! SSH Agent Client
//!
//! Provides SSH Agent integration via russh's [`AgentClient`]. The agent holds
//! the keys; signing of server challenges is delegated to it.
//!
//! # Authentication Flow
//! 1. Connect to the agent socket discovered at startup
//! 2. Request identity list from agent ([`AgentClient::request_identities`])
//! 3. Reorder the list so the configured identity is offered first
//!    ([`sort_identities`])
//! 4. For each key, attempt [`Handle::authenticate_publickey_with`] with [`AgentSigner`]
//!
//! Servers often drop the connection after a handful of rejected keys, so
//! offering the intended key first matters when the agent holds many.

use std::future::Future;
use std::path::{Path, PathBuf};

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::{ssh_key, PublicKey, PublicKeyBase64};
use russh::{AgentAuthError, CryptoVec, Signer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ssh::client::ClientHandler;
use crate::ssh::error::SshError;

type DynAgentClient = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`] trait.
///
/// russh's built-in `impl Signer for AgentClient` borrows the key from the
/// server's sign request across an `.await`, which the compiler cannot prove
/// `Send`. Cloning the key into the future first sidesteps that.
struct AgentSigner<'a> {
    agent: &'a mut DynAgentClient,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// A live agent connection shared by every hop of one communicator
///
/// The transport is released by [`AgentHandle::close`]; later calls are no-ops.
pub struct AgentHandle {
    agent: Mutex<Option<DynAgentClient>>,
    socket: PathBuf,
    identity: Option<String>,
}

impl AgentHandle {
    /// Connect to the agent listening on `socket`
    pub async fn connect(socket: &Path, identity: Option<String>) -> Result<Self, SshError> {
        info!("Connecting to SSH Agent at {}", socket.display());

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_uds(socket).await.map_err(|e| {
                SshError::AgentNotAvailable(format!(
                    "Failed to connect to SSH Agent at {}: {}. \
                     Make sure ssh-agent is running.",
                    socket.display(),
                    e
                ))
            })?;
            Ok(Self {
                agent: Mutex::new(Some(agent.dynamic())),
                socket: socket.to_path_buf(),
                identity,
            })
        }

        #[cfg(not(unix))]
        {
            let _ = identity;
            Err(SshError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Socket path of the agent, used to serve forwarded agent channels
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Identities held by the agent, preferred identity first
    pub async fn signers(&self) -> Result<Vec<PublicKey>, SshError> {
        let mut guard = self.agent.lock().await;
        let agent = guard
            .as_mut()
            .ok_or_else(|| SshError::AgentError("SSH Agent connection is closed".to_string()))?;
        Self::list(agent, self.identity.as_deref()).await
    }

    async fn list(
        agent: &mut DynAgentClient,
        identity: Option<&str>,
    ) -> Result<Vec<PublicKey>, SshError> {
        let mut keys = agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if let Some(id) = identity {
            if keys.len() >= 2 {
                let id_key = identity_public_key(id);
                sort_identities(&mut keys, id, id_key.as_deref());
            }
        }
        Ok(keys)
    }

    /// Authenticate `username` with agent-held keys
    ///
    /// Returns `Ok(false)` when the server rejected every key.
    pub async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let mut guard = self.agent.lock().await;
        let agent = guard
            .as_mut()
            .ok_or_else(|| SshError::AgentError("SSH Agent connection is closed".to_string()))?;

        let keys = Self::list(agent, self.identity.as_deref()).await?;
        if keys.is_empty() {
            return Err(SshError::AgentError(
                "SSH Agent has no keys loaded. Add keys with: ssh-add".to_string(),
            ));
        }

        info!(
            "SSH Agent reports {} key(s), attempting authentication",
            keys.len()
        );

        for key in keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());
            let comment = key.comment().to_string();
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

            let mut signer = AgentSigner { agent: &mut *agent };
            match handle
                .authenticate_publickey_with(username, key, hash_alg, &mut signer)
                .await
            {
                Ok(result) if result.success() => {
                    info!("SSH Agent authentication succeeded with key: {}", comment);
                    return Ok(true);
                }
                Ok(_) => debug!("Key rejected by server: {}", comment),
                Err(e) => warn!("Agent signing error for key {}: {}", comment, e),
            }
        }

        Ok(false)
    }

    /// Release the agent connection
    pub async fn close(&self) -> Result<(), SshError> {
        if self.agent.lock().await.take().is_some() {
            debug!("SSH Agent connection closed");
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.agent.lock().await.is_none()
    }
}

/// Move the key matching `identity` to the front of `keys`
///
/// Single pass over the list. An exact match (same wire encoding as `id_key`,
/// or a comment equal to `identity`) is swapped into slot 0 and ends the
/// scan. Otherwise each key whose comment ends with `identity` is swapped into
/// the next free slot at the head. Swapping can disturb the order of the
/// remaining keys, and several keys sharing a suffix all move forward in
/// encountered order; both are known quirks kept as-is.
pub fn sort_identities(keys: &mut [PublicKey], identity: &str, id_key: Option<&[u8]>) {
    if identity.is_empty() || keys.len() < 2 {
        return;
    }

    let mut head = 0;
    for i in 0..keys.len() {
        let exact = id_key.is_some_and(|id| keys[i].public_key_bytes() == id)
            || keys[i].comment() == identity;
        if exact {
            keys.swap(0, i);
            break;
        }

        if keys[i].comment().ends_with(identity) {
            keys.swap(head, i);
            head += 1;
        }
    }

    debug!(
        "Agent key order: {:?}",
        keys.iter().map(|k| k.comment()).collect::<Vec<_>>()
    );
}

/// Resolve an identity (key file path) to a wire-encoded public key
///
/// Reads the path and, unless it already ends in `.pub`, the `.pub` sibling.
/// Each blob is tried as a private key, a wire-encoded public key and an
/// authorized_keys line. Unreadable or unparseable files are skipped.
pub fn identity_public_key(identity: &str) -> Option<Vec<u8>> {
    let path = expand_tilde(Path::new(identity));
    let path = std::path::absolute(&path).ok()?;

    let mut paths = vec![path.clone()];
    if !path.to_string_lossy().ends_with(".pub") {
        let mut sibling = path.into_os_string();
        sibling.push(".pub");
        paths.push(PathBuf::from(sibling));
    }

    for p in &paths {
        let data = match std::fs::read(p) {
            Ok(data) => data,
            Err(e) => {
                debug!("error reading {}: {}", p.display(), e);
                continue;
            }
        };
        debug!("found identity data at {}", p.display());

        if let Some(key) = parse_identity_data(&data) {
            return Some(key);
        }
    }
    None
}

fn parse_identity_data(data: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(data).ok();

    if let Some(key) = text.and_then(|t| russh::keys::decode_secret_key(t, None).ok()) {
        debug!("parsed id private key");
        return Some(key.public_key().public_key_bytes());
    }

    if let Ok(key) = PublicKey::from_bytes(data) {
        debug!("parsed id public key");
        return Some(key.public_key_bytes());
    }

    if let Some(key) = text.and_then(|t| PublicKey::from_openssh(t.trim()).ok()) {
        debug!("parsed id authorized key");
        return Some(key.public_key_bytes());
    }

    None
}

/// Expand tilde in path
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}
