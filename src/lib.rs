//! drone-chef-client - run chef-client on a remote host over SSH
//!
//! Connects to the target directly or through a bastion host, authenticates
//! with a password, a private key or the SSH agent, and runs a single command.

pub mod cli;
pub mod plugin;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honours `RUST_LOG` (default `info`). Logs go to stderr so stdout only
/// carries the remote command's output.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
