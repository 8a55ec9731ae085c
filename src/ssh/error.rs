//! SSH Error types

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid host key for {hop}: {reason}")]
    InvalidHostKey { hop: String, reason: String },

    #[error("Failed to read key for {hop}: no key found")]
    NoKeyFound { hop: String },

    #[error(
        "Failed to read key for {hop}: password protected keys are not supported. \
         Please decrypt the key prior to use."
    )]
    EncryptedKey { hop: String },

    #[error("Failed to parse key for {hop}: {reason}")]
    KeyParse { hop: String, reason: String },

    #[error("SSH key error: {0}")]
    Key(String),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Error connecting to bastion {bastion}: {reason}")]
    BastionDial { bastion: String, reason: String },

    #[error("Error connecting to {host}: {reason}")]
    Dial { host: String, reason: String },

    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("Host key verification failed for {host}: {reason}")]
    HostKeyMismatch { host: String, reason: String },

    #[error("Authentication to {host} failed: {reason}")]
    AuthenticationFailed { host: String, reason: String },

    #[error("SSH client is not connected")]
    NotConnected,

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Phase of a run in which an error surfaced, used for the user-facing report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuration,
    Key,
    Agent,
    Dial,
    Handshake,
    Session,
    Command,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configuration => "configuration",
            Phase::Key => "key",
            Phase::Agent => "agent",
            Phase::Dial => "dial",
            Phase::Handshake => "handshake",
            Phase::Session => "session",
            Phase::Command => "command",
        };
        f.write_str(name)
    }
}

impl SshError {
    pub fn phase(&self) -> Phase {
        match self {
            SshError::Config(_) | SshError::InvalidHostKey { .. } => Phase::Configuration,
            SshError::NoKeyFound { .. }
            | SshError::EncryptedKey { .. }
            | SshError::KeyParse { .. }
            | SshError::Key(_) => Phase::Key,
            SshError::AgentNotAvailable(_) | SshError::AgentError(_) => Phase::Agent,
            SshError::BastionDial { .. } | SshError::Dial { .. } => Phase::Dial,
            SshError::Handshake { .. }
            | SshError::HostKeyMismatch { .. }
            | SshError::AuthenticationFailed { .. }
            | SshError::ProtocolError(_) => Phase::Handshake,
            SshError::NotConnected
            | SshError::SessionError(_)
            | SshError::ChannelError(_)
            | SshError::IoError(_) => Phase::Session,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_failed_hop_kind() {
        let err = SshError::Dial {
            host: "10.0.0.5:22".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.phase(), Phase::Dial);
        assert_eq!(err.phase().to_string(), "dial");
        assert!(err.to_string().contains("10.0.0.5:22"));

        let err = SshError::EncryptedKey {
            hop: "bastion:22".into(),
        };
        assert_eq!(err.phase(), Phase::Key);
        assert!(err.to_string().contains("bastion:22"));
    }

    #[test]
    fn test_key_library_errors_are_key_phase() {
        let err = SshError::from(russh::keys::Error::KeyIsEncrypted);
        assert!(matches!(err, SshError::Key(_)), "{err:?}");
        assert_eq!(err.phase(), Phase::Key);
        assert!(err.to_string().starts_with("SSH key error"));
    }
}
