#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webssh::{CredentialRecord, ServerBuilder, StaticCredentials, Target};

pub const TEST_USER: &str = "testuser";
pub const TEST_SECRET: &str = "secret";
pub const EXPIRED_USER: &str = "former";
pub const DISABLED_USER: &str = "locked";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn client_ip() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn credentials() -> StaticCredentials {
    StaticCredentials::new()
        .with_user(TEST_USER, TEST_SECRET)
        .with_record(
            CredentialRecord::new(EXPIRED_USER, TEST_SECRET)
                .expires_at(Utc::now() - chrono::Duration::days(1)),
        )
        .with_record(CredentialRecord::new(DISABLED_USER, TEST_SECRET).enabled(false))
}

/// An in-process daemon on an ephemeral port with a scratch work dir.
pub struct TestDaemon {
    addr: SocketAddr,
    work_dir: TempDir,
    handle: JoinHandle<()>,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(|builder| builder).await
    }

    pub async fn start_with(configure: impl FnOnce(ServerBuilder) -> ServerBuilder) -> Self {
        let work_dir = tempfile::tempdir().expect("tempdir");
        let builder = ServerBuilder::new()
            .host_key(KeyPair::generate_ed25519())
            .auth_rejection_delay(1)
            .credentials(credentials())
            .work_dir(work_dir.path());
        let server = configure(builder).build().expect("build daemon");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            if let Err(err) = server.serve(listener).await {
                eprintln!("daemon error: {err}");
            }
        });

        Self {
            addr,
            work_dir,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn target(&self) -> Target {
        Target::new("127.0.0.1", self.addr.port())
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// `name` inside the work dir, as the absolute path string SFTP expects.
    pub fn path(&self, name: &str) -> String {
        self.work_dir.path().join(name).to_string_lossy().into_owned()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A raw SSH connection, for driving channel requests by hand.
pub async fn connect(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let config = Arc::new(client::Config::default());
    timeout(DEFAULT_TIMEOUT, client::connect(config, addr, TrustingClient))
        .await
        .expect("connect timed out")
        .expect("connect")
}

pub async fn connect_with_password(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let mut handle = connect(addr).await;
    let ok = handle
        .authenticate_password(TEST_USER, TEST_SECRET)
        .await
        .expect("auth");
    assert!(ok, "password auth rejected");
    handle
}

/// Reads channel messages until a request reply arrives.
pub async fn reply(channel: &mut Channel<client::Msg>) -> ChannelMsg {
    timeout(DEFAULT_TIMEOUT, async {
        loop {
            match channel.wait().await {
                Some(msg @ (ChannelMsg::Success | ChannelMsg::Failure)) => return msg,
                Some(_) => {}
                None => panic!("channel closed before reply"),
            }
        }
    })
    .await
    .expect("reply timed out")
}

/// Collects stdout and the exit status until the channel closes.
pub async fn drain(channel: &mut Channel<client::Msg>) -> (Vec<u8>, Option<u32>) {
    timeout(DEFAULT_TIMEOUT, async {
        let mut out = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => out.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        (out, status)
    })
    .await
    .expect("drain timed out")
}
