//! Host key verification
//!
//! A configured host key is staged as a single known_hosts entry in a
//! temporary file that is removed as soon as it has been loaded. Hops without
//! a configured host key accept any key the server presents.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts, or known only with other key types
    Unknown { fingerprint: String },
    /// Key differs from the known_hosts entry of the same type
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file
#[derive(Debug, Default)]
pub struct KnownHostsStore {
    hosts: HashMap<String, Vec<HostKeyEntry>>,
}

impl KnownHostsStore {
    /// Load entries from a known_hosts file
    pub fn load(path: &Path) -> Result<Self, SshError> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Parse: hostname keytype base64key [comment]
            // Or: hostname,alias keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are never written by us
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(Self { hosts })
    }

    /// Normalize a known_hosts hostname pattern for lookup
    ///
    /// `[host]:22` collapses to `host`, other ports keep the bracket form.
    fn normalize_hostname(host: &str) -> String {
        let host = host.to_lowercase();
        if let Some(inner) = host.strip_prefix('[') {
            if let Some((name, port)) = inner.split_once("]:") {
                if port == "22" {
                    return name.to_string();
                }
                return format!("[{}]:{}", name, port);
            }
            return inner.trim_end_matches(']').to_string();
        }
        host
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Compute fingerprint from stored base64 key
    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let Some(entries) = self.hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries.iter().filter(|e| e.key_type == actual_key_type) {
            if entry.key_data == actual_key_b64 {
                debug!(
                    "Host key verified for {} (type: {})",
                    lookup_key, actual_key_type
                );
                return HostKeyVerification::Verified;
            }
            return HostKeyVerification::Changed {
                expected_fingerprint: Self::compute_fingerprint_from_b64(&entry.key_data),
                actual_fingerprint: fingerprint,
            };
        }

        debug!(
            "Host {} known but no {} key stored",
            lookup_key, actual_key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }
}

/// Host identity check applied during the handshake of one hop
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Only the pinned key is accepted
    Pinned(Arc<KnownHostsStore>),
    /// Any key is accepted. Insecure; kept because an unset host key has
    /// always meant "do not check".
    AcceptAny,
}

impl HostKeyPolicy {
    /// Build the policy for a hop from its optional host key text
    pub fn for_hop(host: &str, port: u16, host_key: Option<&str>) -> Result<Self, SshError> {
        match host_key {
            Some(key) => Self::pin(host, port, key),
            None => {
                warn!(
                    "No host key configured for {}:{}; host key verification is disabled",
                    host, port
                );
                Ok(HostKeyPolicy::AcceptAny)
            }
        }
    }

    /// Pin `host_key` for exactly `host:port`
    ///
    /// The entry is written to a temporary known_hosts file that is deleted
    /// once loaded.
    pub fn pin(host: &str, port: u16, host_key: &str) -> Result<Self, SshError> {
        let hop = format!("{}:{}", host, port);
        let key = parse_host_key(host_key).map_err(|reason| SshError::InvalidHostKey {
            hop: hop.clone(),
            reason,
        })?;

        let mut staged = tempfile::Builder::new()
            .prefix("known_hosts")
            .tempfile()
            .map_err(|e| {
                SshError::Config(format!("failed to create temp known_hosts file: {}", e))
            })?;

        writeln!(
            staged,
            "{} {} {}",
            KnownHostsStore::make_key(host, port),
            key.algorithm().as_str(),
            BASE64.encode(key.public_key_bytes())
        )
        .and_then(|_| staged.flush())
        .map_err(|e| SshError::Config(format!("failed to write temp known_hosts file: {}", e)))?;

        let store = KnownHostsStore::load(staged.path())?;
        // Dropping the handle removes the file
        drop(staged);

        info!(
            "Pinned host key for {} ({})",
            hop,
            KnownHostsStore::fingerprint(&key)
        );
        Ok(HostKeyPolicy::Pinned(Arc::new(store)))
    }

    /// Check the key presented by `host:port`
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let store = match self {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting host key {} for {}:{} without verification",
                    KnownHostsStore::fingerprint(key),
                    host,
                    port
                );
                return Ok(());
            }
            HostKeyPolicy::Pinned(store) => store,
        };

        match store.verify(host, port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", host, port);
                Ok(())
            }
            HostKeyVerification::Unknown { fingerprint } => Err(SshError::HostKeyMismatch {
                host: format!("{}:{}", host, port),
                reason: format!(
                    "presented key {} ({}) does not match the configured host key",
                    fingerprint,
                    key.algorithm().as_str()
                ),
            }),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: format!("{}:{}", host, port),
                    reason: format!(
                        "expected {}, got {}",
                        expected_fingerprint, actual_fingerprint
                    ),
                })
            }
        }
    }
}

/// Parse `type base64 [comment]` or a bare base64 key blob
fn parse_host_key(text: &str) -> Result<PublicKey, String> {
    let text = text.trim();
    if let Ok(key) = PublicKey::from_openssh(text) {
        return Ok(key);
    }
    russh::keys::parse_public_key_base64(text).map_err(|e| e.to_string())
}
