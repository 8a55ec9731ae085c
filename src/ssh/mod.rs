//! SSH module - connection, authentication and remote command execution
//!
//! This module orchestrates the russh library; the protocol itself lives there.
//!
//! # Features
//! - Password, private key and SSH agent authentication per hop
//! - Agent identity preference and agent forwarding
//! - Host key pinning (or explicitly disabled verification)
//! - Bastion (jump host) tunneling over `direct-tcpip`
//! - One transparent reconnect when a session cannot be opened

mod agent;
mod auth;
mod client;
mod command;
mod communicator;
mod config;
mod dial;
mod error;
pub mod known_hosts;

pub use agent::{identity_public_key, sort_identities, AgentHandle};
pub use auth::{read_private_key, AuthMethod, HopConfig};
pub use client::{handshake, ssh_config, ClientHandler};
pub use command::{CommandError, CompletionSender, ExitOutcome, OutputBuffer, RemoteCommand};
pub use communicator::{
    exit_outcome, Communicator, ConnectionState, SshConfig, FORWARDING_REPLY_TIMEOUT, PTY_COLS,
    PTY_ROWS,
};
pub use config::{
    agent_enabled, discover_agent_socket, parse_duration, safe_duration, ConnectionDescriptor,
    ConnectionSettings, HopDescriptor, DEFAULT_PORT, DEFAULT_TIMEOUT, DEFAULT_USER,
};
pub use dial::{BastionDialer, BastionLink, Dialer, DirectDialer, Link, Transport, DIAL_TIMEOUT};
pub use error::{Phase, SshError};
pub use known_hosts::{HostKeyPolicy, HostKeyVerification, KnownHostsStore};
