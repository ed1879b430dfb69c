use std::time::Duration;

use russh::ChannelMsg;
use tokio::time::timeout;
use webssh::sshd::RESIZE_QUEUE_CAPACITY;

use super::common::{DEFAULT_TIMEOUT, TestDaemon, connect_with_password, drain, reply};

#[tokio::test(flavor = "multi_thread")]
async fn exec_reports_output_and_status() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.exec(true, "echo out; exit 3").await.expect("exec");
    let (out, status) = drain(&mut channel).await;
    assert_eq!(out, b"out\n");
    assert_eq!(status, Some(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_runs_in_work_dir() {
    let daemon = TestDaemon::start().await;
    std::fs::write(daemon.work_dir().join("marker.txt"), b"present").expect("write marker");
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.exec(true, "cat marker.txt").await.expect("exec");
    let (out, status) = drain(&mut channel).await;
    assert_eq!(out, b"present");
    assert_eq!(status, Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_activity_on_a_channel_is_rejected() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut busy = handle.channel_open_session().await.expect("open");
    busy.exec(true, "sleep 2").await.expect("exec");
    assert!(matches!(reply(&mut busy).await, ChannelMsg::Success));

    busy.exec(true, "echo again").await.expect("exec");
    assert!(matches!(reply(&mut busy).await, ChannelMsg::Failure));
    busy.request_shell(true).await.expect("shell");
    assert!(matches!(reply(&mut busy).await, ChannelMsg::Failure));
    busy.request_subsystem(true, "sftp").await.expect("subsystem");
    assert!(matches!(reply(&mut busy).await, ChannelMsg::Failure));
    busy.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await.expect("pty");
    assert!(matches!(reply(&mut busy).await, ChannelMsg::Failure));

    // The connection survives the rejections.
    let mut fresh = handle.channel_open_session().await.expect("open");
    fresh.exec(true, "echo ok").await.expect("exec");
    let (out, _) = drain(&mut fresh).await;
    assert_eq!(out, b"ok\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_subsystem_is_rejected() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.request_subsystem(true, "netconf").await.expect("subsystem");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Failure));

    // Still usable afterwards.
    channel.exec(true, "echo still-here").await.expect("exec");
    let (out, _) = drain(&mut channel).await;
    assert_eq!(out, b"still-here\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn env_passthrough_reaches_the_process() {
    let daemon = TestDaemon::start_with(|builder| builder.env_passthrough(true)).await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.set_env(true, "GREETING", "first").await.expect("env");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Success));
    channel.set_env(true, "GREETING", "hello").await.expect("env");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Success));
    channel.exec(true, "printf \"$GREETING\"").await.expect("exec");
    let (out, _) = drain(&mut channel).await;
    assert_eq!(out, b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn env_is_refused_without_passthrough() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.set_env(true, "GREETING", "hello").await.expect("env");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Failure));
    channel.exec(true, "printf \"${GREETING:-unset}\"").await.expect("exec");
    let (out, _) = drain(&mut channel).await;
    assert_eq!(out, b"unset");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_command_exits_nonzero() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.exec(true, "definitely-not-a-command-xyz").await.expect("exec");
    let (_, status) = drain(&mut channel).await;
    assert_eq!(status, Some(127));
}

#[tokio::test(flavor = "multi_thread")]
async fn answered_keepalives_keep_the_connection() {
    let daemon = TestDaemon::start_with(|builder| {
        builder.keepalive_interval(Duration::from_millis(100))
    })
    .await;
    let handle = connect_with_password(daemon.addr()).await;

    // Pings go out every 100ms of client silence. Unanswered ones would
    // drop the connection well before the command finishes.
    let mut channel = handle.channel_open_session().await.expect("open");
    channel.exec(true, "sleep 1; echo done").await.expect("exec");
    let (out, status) = drain(&mut channel).await;
    assert_eq!(out, b"done\n");
    assert_eq!(status, Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_burst_applies_the_final_size() {
    let daemon = TestDaemon::start().await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await.expect("pty");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Success));
    channel.request_shell(true).await.expect("shell");
    assert!(matches!(reply(&mut channel).await, ChannelMsg::Success));

    // Far more changes than the daemon queues at once.
    let burst = u32::try_from(RESIZE_QUEUE_CAPACITY * 20).expect("burst size");
    for i in 0..burst {
        channel.window_change(40 + i, 10 + i % 20, 0, 0).await.expect("window change");
    }
    channel.window_change(123, 45, 0, 0).await.expect("window change");
    tokio::time::sleep(Duration::from_millis(200)).await;

    channel.data(&b"stty size; exit\n"[..]).await.expect("write");
    let (out, status) = drain(&mut channel).await;
    let out = String::from_utf8_lossy(&out);
    assert!(out.contains("45 123"), "{out:?}");
    assert_eq!(status, Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_spawn_failure_is_reported() {
    let daemon = TestDaemon::start_with(|builder| builder.shell("/nonexistent/webssh-shell")).await;
    let handle = connect_with_password(daemon.addr()).await;

    let mut channel = handle.channel_open_session().await.expect("open");
    channel.request_shell(true).await.expect("shell");

    let (stderr, refused) = timeout(DEFAULT_TIMEOUT, async {
        let mut stderr = Vec::new();
        let mut refused = false;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::Failure => refused = true,
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        (stderr, refused)
    })
    .await
    .expect("channel did not close");

    assert!(refused);
    let stderr = String::from_utf8_lossy(&stderr);
    assert!(stderr.contains("failed to start shell"), "{stderr:?}");
}
