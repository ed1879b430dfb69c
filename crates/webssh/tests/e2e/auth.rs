use std::sync::Arc;

use russh_keys::PublicKeyBase64;
use russh_keys::key::KeyPair;
use webssh::{Credentials, Error, Gateway, SessionRegistry, StaticCredentials};

use super::common::{
    DISABLED_USER, EXPIRED_USER, TEST_SECRET, TEST_USER, TestDaemon, client_ip, connect,
};

#[tokio::test(flavor = "multi_thread")]
async fn password_login_registers_session() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));

    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");

    let view = gateway.session(&id).expect("session view");
    assert_eq!(view.username, TEST_USER);
    assert_eq!(gateway.registry().len(), 1);
    gateway.disconnect(&id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_and_disabled_users_are_denied() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));

    for user in [EXPIRED_USER, DISABLED_USER] {
        let result = gateway
            .create_session(daemon.target(), Credentials::password(user, TEST_SECRET), client_ip())
            .await;
        assert!(matches!(result, Err(Error::Auth(_))), "{user}: {result:?}");
    }
    assert!(gateway.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_denied() {
    let daemon = TestDaemon::start().await;
    let mut handle = connect(daemon.addr()).await;
    let ok = handle
        .authenticate_password(TEST_USER, "not-the-secret")
        .await
        .expect("auth round trip");
    assert!(!ok);
}

#[tokio::test(flavor = "multi_thread")]
async fn authorized_key_logs_in() {
    let key = KeyPair::generate_ed25519();
    let public = key.clone_public_key().expect("public key");
    let daemon = TestDaemon::start_with(move |builder| {
        builder.credentials(StaticCredentials::new().with_key(public.public_key_bytes(), "laptop"))
    })
    .await;

    let mut handle = connect(daemon.addr()).await;
    let ok = handle
        .authenticate_publickey("anyone", Arc::new(key))
        .await
        .expect("auth round trip");
    assert!(ok);

    let stranger = KeyPair::generate_ed25519();
    let mut handle = connect(daemon.addr()).await;
    let ok = handle
        .authenticate_publickey("anyone", Arc::new(stranger))
        .await
        .expect("auth round trip");
    assert!(!ok);
}

fn key_pem(key: &KeyPair, passphrase: Option<&str>) -> String {
    let mut pem = Vec::new();
    match passphrase {
        Some(pass) => russh_keys::encode_pkcs8_pem_encrypted(key, pass.as_bytes(), 100, &mut pem),
        None => russh_keys::encode_pkcs8_pem(key, &mut pem),
    }
    .expect("encode key");
    String::from_utf8(pem).expect("pem is ascii")
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_logs_in_with_private_keys() {
    let key = KeyPair::generate_ed25519();
    let public = key.clone_public_key().expect("public key");
    let daemon = TestDaemon::start_with(move |builder| {
        builder.credentials(StaticCredentials::new().with_key(public.public_key_bytes(), "deploy"))
    })
    .await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));

    let plain = Credentials::private_key("deploy", key_pem(&key, None), None);
    let id = gateway
        .create_session(daemon.target(), plain, client_ip())
        .await
        .expect("unprotected key session");
    assert_eq!(gateway.exec_command(&id, "echo plain").await.expect("exec"), b"plain\n");

    let protected = Credentials::private_key(
        "deploy",
        key_pem(&key, Some("hunter2")),
        Some("hunter2".to_string()),
    );
    let id = gateway
        .create_session(daemon.target(), protected, client_ip())
        .await
        .expect("protected key session");
    assert_eq!(gateway.exec_command(&id, "echo sealed").await.expect("exec"), b"sealed\n");
    assert_eq!(gateway.registry().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_key_passphrase_registers_nothing() {
    let key = KeyPair::generate_ed25519();
    let public = key.clone_public_key().expect("public key");
    let daemon = TestDaemon::start_with(move |builder| {
        builder.credentials(StaticCredentials::new().with_key(public.public_key_bytes(), "deploy"))
    })
    .await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));

    let credentials = Credentials::private_key(
        "deploy",
        key_pem(&key, Some("hunter2")),
        Some("not-it".to_string()),
    );
    let result = gateway.create_session(daemon.target(), credentials, client_ip()).await;
    assert!(result.is_err());
    assert!(gateway.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_target_is_a_transport_error() {
    let daemon = TestDaemon::start().await;
    let target = daemon.target();
    drop(daemon);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let result = gateway
        .create_session(target, Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await;
    assert!(matches!(result, Err(ref e) if e.is_transport()), "{result:?}");
    assert!(gateway.registry().is_empty());
}
