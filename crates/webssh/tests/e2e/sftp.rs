use std::sync::Arc;

use webssh::{Credentials, Error, Gateway, SessionRegistry};

use super::common::{TEST_SECRET, TEST_USER, TestDaemon, client_ip};

#[tokio::test(flavor = "multi_thread")]
async fn upload_list_download_delete() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");
    assert!(gateway.session(&id).expect("view").sftp_available);

    let file = daemon.path("notes.txt");
    gateway
        .sftp_upload(&id, &file, b"remember the milk")
        .await
        .expect("upload");
    assert_eq!(
        std::fs::read(daemon.work_dir().join("notes.txt")).expect("on disk"),
        b"remember the milk"
    );

    let dir = daemon.path("archive");
    gateway.sftp_create_dir(&id, &dir).await.expect("mkdir");
    assert!(daemon.work_dir().join("archive").is_dir());

    let root = daemon.path("");
    let listing = gateway.sftp_list(&id, root.trim_end_matches('/')).await.expect("list");
    let names: Vec<_> = listing.entries.iter().map(|e| (e.name.as_str(), e.is_dir)).collect();
    assert_eq!(names, [("archive", true), ("notes.txt", false)]);
    assert_eq!(listing.entries[1].size, 17);
    assert_eq!(listing.breadcrumbs.first().map(|b| b.path.as_str()), Some("/"));

    let contents = gateway.sftp_download(&id, &file).await.expect("download");
    assert_eq!(contents, b"remember the milk");

    gateway.sftp_delete(&id, &file).await.expect("delete file");
    gateway.sftp_delete(&id, &dir).await.expect("delete dir");
    let listing = gateway.sftp_list(&id, root.trim_end_matches('/')).await.expect("list");
    assert!(listing.entries.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_file_is_an_sftp_error() {
    let daemon = TestDaemon::start().await;
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()));
    let id = gateway
        .create_session(daemon.target(), Credentials::password(TEST_USER, TEST_SECRET), client_ip())
        .await
        .expect("create session");

    let result = gateway.sftp_download(&id, &daemon.path("absent.bin")).await;
    assert!(matches!(result, Err(Error::Sftp(_))), "{result:?}");
    // The session stays usable.
    assert_eq!(gateway.exec_command(&id, "echo ok").await.expect("exec"), b"ok\n");
}
