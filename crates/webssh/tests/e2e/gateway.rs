use std::sync::Arc;
use std::time::Duration;

use webssh::{Credentials, Error, Gateway, SessionId, SessionRegistry};

use super::common::{TEST_SECRET, TEST_USER, TestDaemon, client_ip};

async fn open(daemon: &TestDaemon) -> (Gateway, SessionId) {
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");
    (gateway, id)
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_command_returns_output() {
    let daemon = TestDaemon::start().await;
    let (gateway, id) = open(&daemon).await;

    let output = gateway.exec_command(&id, "echo hi").await.expect("exec");
    assert_eq!(output, b"hi\n");

    // Several commands share the one transport.
    let output = gateway.exec_command(&id, "echo again >&2").await.expect("exec");
    assert_eq!(output, b"again\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_validates_before_forwarding() {
    let daemon = TestDaemon::start().await;
    let (gateway, id) = open(&daemon).await;

    for (w, h) in [(39, 24), (8193, 24), (80, 1), (80, 4097)] {
        assert!(matches!(
            gateway.resize_window(&id, w, h).await,
            Err(Error::InvalidWindow { .. })
        ));
    }
    // A bad size never evicts the session.
    assert!(gateway.session(&id).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_evicts_idle_sessions() {
    let daemon = TestDaemon::start().await;
    let (gateway, id) = open(&daemon).await;
    let registry = Arc::clone(gateway.registry());

    assert_eq!(registry.sweep(Duration::from_secs(60)).await, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.sweep(Duration::from_millis(10)).await, 1);
    assert!(registry.get(&id).is_none());
    assert!(matches!(
        gateway.exec_command(&id, "echo gone").await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_closes_transport() {
    let daemon = TestDaemon::start().await;
    let (gateway, id) = open(&daemon).await;
    let session = gateway.registry().get(&id).expect("registered");

    gateway.disconnect(&id).await;
    assert!(session.is_closed());
    assert!(session.transport_closed());
    assert!(gateway.registry().is_empty());

    // Disconnecting twice is harmless.
    gateway.disconnect(&id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_refreshes_activity() {
    let daemon = TestDaemon::start().await;
    let (gateway, id) = open(&daemon).await;
    let before = gateway.session(&id).expect("view").last_active_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    gateway.touch(&id).expect("touch");
    let after = gateway.session(&id).expect("view").last_active_at;
    assert!(after > before);
    assert!(matches!(
        gateway.touch(&SessionId::from("missing")),
        Err(Error::SessionNotFound(_))
    ));
}
