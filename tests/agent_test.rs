//! Agent authentication against a private `ssh-agent`
//!
//! Skipped when `ssh-agent` is not installed.

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use russh::keys::agent::client::AgentClient;
use tempfile::TempDir;

use drone_chef_client::ssh::{AgentHandle, Communicator, ConnectionDescriptor, ConnectionSettings};

use common::{Behavior, TestServer};

struct TestAgent {
    socket: PathBuf,
    pid: u32,
    _dir: TempDir,
}

impl TestAgent {
    /// Start an agent holding the other key first, then the client key
    async fn start() -> Option<Self> {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        let output = Command::new("ssh-agent")
            .arg("-a")
            .arg(&socket)
            .arg("-s")
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout
            .split(';')
            .find_map(|part| part.trim().strip_prefix("SSH_AGENT_PID="))
            .and_then(|v| v.parse().ok())?;

        let stream = tokio::net::UnixStream::connect(&socket).await.ok()?;
        let mut agent = AgentClient::connect(stream);
        for pem in [common::OTHER_KEY, common::CLIENT_KEY] {
            let key = russh::keys::decode_secret_key(pem, None).unwrap();
            agent.add_identity(&key, &[]).await.unwrap();
        }

        Some(Self {
            socket,
            pid,
            _dir: dir,
        })
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        let _ = Command::new("kill").arg(self.pid.to_string()).status();
    }
}

fn agent_settings(port: u16, identity: &str) -> ConnectionSettings {
    let mut settings = common::settings(port);
    settings.password = String::new();
    settings.agent = Some(true);
    settings.agent_identity = identity.to_string();
    settings
}

fn write_identity(dir: &Path) -> PathBuf {
    let path = dir.join("id_deploy");
    std::fs::write(&path, common::CLIENT_KEY).unwrap();
    path
}

#[tokio::test]
async fn test_signers_put_identity_first_and_close() {
    let Some(agent) = TestAgent::start().await else {
        return;
    };
    let keys = TempDir::new().unwrap();
    let identity = write_identity(keys.path());

    let handle = AgentHandle::connect(&agent.socket, Some(identity.to_string_lossy().into_owned()))
        .await
        .unwrap();
    assert_eq!(handle.socket(), agent.socket.as_path());

    let signers = handle.signers().await.unwrap();
    assert_eq!(signers.len(), 2);
    assert_eq!(
        signers[0].key_data(),
        common::client_public_key().key_data()
    );

    handle.close().await.unwrap();
    assert!(handle.is_closed().await);
    assert!(handle.signers().await.is_err());
    // Closing twice is fine
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_agent_login_offers_preferred_identity_first() {
    let Some(agent) = TestAgent::start().await else {
        return;
    };
    let server = TestServer::start(Behavior {
        password: None,
        authorized_key: Some(common::client_public_key()),
        ..Behavior::default()
    })
    .await;

    let keys = TempDir::new().unwrap();
    let identity = write_identity(keys.path());
    let mut settings = agent_settings(server.port, &identity.to_string_lossy());
    settings.agent_forwarding = false;

    let descriptor = ConnectionDescriptor::resolve(settings, Some(agent.socket.clone()));
    assert!(descriptor.use_agent);
    let mut comm = Communicator::new(descriptor).await.unwrap();

    comm.connect().await.unwrap();
    let offered = server.stats.offered_keys.lock().clone();
    assert_eq!(offered.len(), 1);
    assert_eq!(
        offered[0].key_data(),
        common::client_public_key().key_data()
    );

    comm.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_agent_tries_every_key() {
    let Some(agent) = TestAgent::start().await else {
        return;
    };
    let server = TestServer::start(Behavior {
        password: None,
        authorized_key: Some(common::client_public_key()),
        ..Behavior::default()
    })
    .await;

    let mut settings = agent_settings(server.port, "");
    settings.agent_forwarding = false;
    let descriptor = ConnectionDescriptor::resolve(settings, Some(agent.socket.clone()));
    let mut comm = Communicator::new(descriptor).await.unwrap();

    comm.connect().await.unwrap();
    // Agent order is kept: the other key is refused before the client key
    assert_eq!(server.stats.offered_keys.lock().len(), 2);
    comm.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_refused_agent_forwarding_is_not_fatal() {
    let Some(agent) = TestAgent::start().await else {
        return;
    };
    let server = TestServer::start(Behavior {
        password: None,
        authorized_key: Some(common::client_public_key()),
        ..Behavior::default()
    })
    .await;

    let settings = agent_settings(server.port, "");
    assert!(settings.agent_forwarding);
    let descriptor = ConnectionDescriptor::resolve(settings, Some(agent.socket.clone()));
    let mut comm = Communicator::new(descriptor).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), comm.connect())
        .await
        .expect("refusal should not wait for the reply timeout")
        .unwrap();
    assert_eq!(server.stats.agent_requests(), 1);
    assert!(!comm.agent_forwarding());

    let mut cmd = drone_chef_client::ssh::RemoteCommand::new("ssh-add -l");
    comm.start(&mut cmd).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), cmd.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.stats.agent_requests(), 2);
    comm.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_agent_requested_without_socket_is_skipped() {
    let server = TestServer::start(Behavior::default()).await;
    let mut settings = common::settings(server.port);
    settings.agent = Some(true);

    let descriptor = ConnectionDescriptor::resolve(settings, None);
    assert!(descriptor.use_agent);
    let mut comm = Communicator::new(descriptor).await.unwrap();

    // Password still works
    comm.connect().await.unwrap();
    comm.disconnect().await.unwrap();
}
