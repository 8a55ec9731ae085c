//! In-process SSH server used by the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, TcpStream};

use drone_chef_client::ssh::ConnectionSettings;

pub const PASSWORD: &str = "correct horse";
pub const HOST_KEY: &str = include_str!("../fixtures/host_ed25519");
pub const HOST_PUB: &str = include_str!("../fixtures/host_ed25519.pub");
pub const CLIENT_KEY: &str = include_str!("../fixtures/client_ed25519");
pub const CLIENT_PUB: &str = include_str!("../fixtures/client_ed25519.pub");
pub const OTHER_KEY: &str = include_str!("../fixtures/other_ed25519");
pub const OTHER_PUB: &str = include_str!("../fixtures/other_ed25519.pub");

/// How the test server behaves
#[derive(Clone)]
pub struct Behavior {
    pub password: Option<String>,
    pub authorized_key: Option<PublicKey>,
    /// Connections with an index below this refuse every session channel
    pub reject_sessions_below: usize,
    pub allow_tunnels: bool,
    pub stdout: String,
    pub exit_status: u32,
    /// Answer to agent forwarding requests; `None` never answers
    pub accept_agent_forwarding: Option<bool>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            password: Some(PASSWORD.to_string()),
            authorized_key: None,
            reject_sessions_below: 0,
            allow_tunnels: false,
            stdout: "ok\n".to_string(),
            exit_status: 0,
            accept_agent_forwarding: Some(false),
        }
    }
}

/// What the server observed
#[derive(Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub session_opens: AtomicUsize,
    pub execs: Mutex<Vec<String>>,
    pub ptys: Mutex<Vec<(String, u32, u32)>>,
    pub tunnels: Mutex<Vec<(String, u32)>>,
    /// Public keys presented with a signature, in order
    pub offered_keys: Mutex<Vec<PublicKey>>,
    pub agent_requests: AtomicUsize,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn session_opens(&self) -> usize {
        self.session_opens.load(Ordering::SeqCst)
    }

    pub fn agent_requests(&self) -> usize {
        self.agent_requests.load(Ordering::SeqCst)
    }
}

pub struct TestServer {
    pub port: u16,
    pub stats: Arc<Stats>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());

        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(0),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            inactivity_timeout: Some(Duration::from_secs(30)),
            keys: vec![host_key()],
            ..Default::default()
        });

        let mut server = Listener {
            behavior: Arc::new(behavior),
            stats: stats.clone(),
        };
        let task = tokio::spawn(async move {
            let _ = server.run_on_socket(config, &listener).await;
        });

        Self { port, stats, task }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn host_key() -> PrivateKey {
    russh::keys::decode_secret_key(HOST_KEY, None).unwrap()
}

pub fn client_public_key() -> PublicKey {
    PublicKey::from_openssh(CLIENT_PUB.trim()).unwrap()
}

/// Settings for password login to `port` on loopback with the host key pinned
pub fn settings(port: u16) -> ConnectionSettings {
    ConnectionSettings {
        host: "127.0.0.1".to_string(),
        port,
        user: "deploy".to_string(),
        password: PASSWORD.to_string(),
        host_key: HOST_PUB.trim().to_string(),
        agent: Some(false),
        timeout: "30s".to_string(),
        agent_forwarding: true,
        ..Default::default()
    }
}

/// Closed loopback port
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Listener {
    behavior: Arc<Behavior>,
    stats: Arc<Stats>,
}

impl russh::server::Server for Listener {
    type Handler = Connection;

    fn new_client(&mut self, _: Option<SocketAddr>) -> Self::Handler {
        let index = self.stats.connections.fetch_add(1, Ordering::SeqCst);
        Connection {
            index,
            behavior: self.behavior.clone(),
            stats: self.stats.clone(),
        }
    }
}

struct Connection {
    index: usize,
    behavior: Arc<Behavior>,
    stats: Arc<Stats>,
}

impl russh::server::Handler for Connection {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.behavior.password.as_deref() == Some(password) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(&mut self, _user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        self.stats.offered_keys.lock().push(key.clone());
        match &self.behavior.authorized_key {
            Some(allowed) if allowed.key_data() == key.key_data() => Ok(Auth::Accept),
            _ => Ok(Auth::reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.stats.session_opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.index >= self.behavior.reject_sessions_below)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.stats
            .tunnels
            .lock()
            .push((host_to_connect.to_string(), port_to_connect));
        if !self.behavior.allow_tunnels {
            return Ok(false);
        }

        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut upstream) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stats
            .ptys
            .lock()
            .push((term.to_string(), col_width, row_height));
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.stats.agent_requests.fetch_add(1, Ordering::SeqCst);
        match self.behavior.accept_agent_forwarding {
            Some(true) => {
                let _ = session.channel_success(channel);
                Ok(true)
            }
            Some(false) => {
                let _ = session.channel_failure(channel);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stats
            .execs
            .lock()
            .push(String::from_utf8_lossy(data).into_owned());
        let _ = session.channel_success(channel);

        let handle = session.handle();
        let stdout = self.behavior.stdout.clone();
        let exit_status = self.behavior.exit_status;
        tokio::spawn(async move {
            let _ = handle
                .data(channel, CryptoVec::from_slice(stdout.as_bytes()))
                .await;
            let _ = handle.exit_status_request(channel, exit_status).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}
