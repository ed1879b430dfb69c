use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webssh::{Credentials, Error, Gateway, SessionId, SessionRegistry, Window};

use super::common::{DEFAULT_TIMEOUT, TEST_SECRET, TEST_USER, TestDaemon, client_ip};

async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    timeout(DEFAULT_TIMEOUT, async {
        loop {
            let n = stream.read(&mut buf).await.expect("read terminal");
            assert!(n > 0, "terminal closed before {needle:?} appeared");
            seen.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&seen).contains(needle) {
                break;
            }
        }
    })
    .await
    .expect("terminal output timed out");
    String::from_utf8_lossy(&seen).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_round_trip_then_cleanup() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");

    let (mut browser, remote) = tokio::io::duplex(64 * 1024);
    let terminal = {
        let gateway = gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.run_terminal(&id, Window::new(80, 24), remote).await })
    };

    browser
        .write_all(b"echo marker-$((40 + 2))\n")
        .await
        .expect("write");
    read_until(&mut browser, "marker-42").await;

    gateway.resize_window(&id, 100, 40).await.expect("resize");
    browser.write_all(b"stty size\n").await.expect("write");
    read_until(&mut browser, "40 100").await;

    browser.write_all(b"exit\n").await.expect("write");
    let result = timeout(DEFAULT_TIMEOUT, terminal)
        .await
        .expect("terminal did not finish")
        .expect("join");
    assert!(result.is_ok(), "{result:?}");
    assert!(gateway.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_stream_ends_the_terminal() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");

    let (mut browser, remote) = tokio::io::duplex(64 * 1024);
    let terminal = {
        let gateway = gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.run_terminal(&id, Window::new(80, 24), remote).await })
    };

    browser.write_all(b"echo ready\n").await.expect("write");
    read_until(&mut browser, "ready").await;
    drop(browser);

    timeout(DEFAULT_TIMEOUT, terminal)
        .await
        .expect("terminal did not finish")
        .expect("join")
        .ok();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(gateway.registry().get(&id).is_none());
}

type Attached = (Gateway, SessionId, DuplexStream, JoinHandle<webssh::Result<()>>);

/// Opens a session and attaches a terminal that has echoed once.
async fn attach(daemon: &TestDaemon) -> Attached {
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");

    let (mut browser, remote) = tokio::io::duplex(64 * 1024);
    let terminal = {
        let gateway = gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.run_terminal(&id, Window::new(80, 24), remote).await })
    };
    browser.write_all(b"echo attached-$((1 + 1))\n").await.expect("write");
    read_until(&mut browser, "attached-2").await;
    (gateway, id, browser, terminal)
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_leaves_the_live_shell_alone() {
    let daemon = TestDaemon::start().await;
    let (gateway, id, mut browser, terminal) = attach(&daemon).await;

    let output = gateway.exec_command(&id, "echo side-channel").await.expect("exec");
    assert_eq!(output, b"side-channel\n");
    assert!(gateway.session(&id).expect("view").shell_attached);

    browser.write_all(b"echo still-$((6 * 7))\n").await.expect("write");
    read_until(&mut browser, "still-42").await;

    browser.write_all(b"exit\n").await.expect("write");
    timeout(DEFAULT_TIMEOUT, terminal)
        .await
        .expect("terminal did not finish")
        .expect("join")
        .expect("terminal result");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_terminal_is_refused_without_evicting() {
    let daemon = TestDaemon::start().await;
    let (gateway, id, mut browser, terminal) = attach(&daemon).await;

    let (intruder, _other) = tokio::io::duplex(1024);
    let err = gateway
        .run_terminal(&id, Window::new(80, 24), intruder)
        .await
        .expect_err("second terminal");
    assert!(matches!(err, Error::Session(_)), "{err:?}");
    assert!(gateway.registry().get(&id).is_some());

    browser.write_all(b"echo survivor-$((3 * 3))\n").await.expect("write");
    read_until(&mut browser, "survivor-9").await;

    browser.write_all(b"exit\n").await.expect("write");
    timeout(DEFAULT_TIMEOUT, terminal)
        .await
        .expect("terminal did not finish")
        .expect("join")
        .expect("terminal result");
    assert!(gateway.registry().is_empty());
}
