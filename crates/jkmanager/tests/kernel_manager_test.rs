//
// kernel_manager_test.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Tests for launching, supervising and shutting down kernel processes.
//!
//! The "kernels" here are shell commands. Most tests talk to them through
//! mock channels; the ZeroMQ tests have the test bind the kernel's sockets.

#[path = "common/mod.rs"]
mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{kernel_message, kernel_reply, wait_for, MockChannelFactory};
use jkmanager::channel::Channel;
use jkmanager::connection_file::ConnectionFile;
use jkmanager::error::KMError;
use jkmanager::kernel_manager::{KernelManager, KernelManagerOptions, ShutdownOutcome};
use jkmanager::session::{Session, Signer};
use jkmanager::wire_message::WireMessage;
use jkshared::connection_info::ConnectionInfo;
use jkshared::jupyter_message::{msg_type, JupyterChannel, JupyterMessage};
use jkshared::kernel_spec::KernelSpec;
use serde_json::json;
use tokio::task::JoinHandle;
use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

const WAIT: Duration = Duration::from_secs(5);

fn spec(argv: &[&str], resource_dir: PathBuf) -> KernelSpec {
    KernelSpec {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        display_name: String::from("Test Kernel"),
        language: String::from("sh"),
        interrupt_mode: None,
        env: HashMap::new(),
        metadata: None,
        resource_dir,
    }
}

fn options(dir: &tempfile::TempDir) -> KernelManagerOptions {
    KernelManagerOptions {
        connection_file: Some(dir.path().join("kernel.json")),
        launch_settle_time: Duration::from_millis(50),
        shutdown_wait: Duration::from_millis(300),
        shutdown_poll_interval: Duration::from_millis(20),
        ..KernelManagerOptions::default()
    }
}

fn manager(
    argv: &[&str],
    dir: &tempfile::TempDir,
) -> (KernelManager, Arc<MockChannelFactory>) {
    let factory = MockChannelFactory::new();
    let manager = KernelManager::from_spec(
        "test",
        spec(argv, dir.path().to_path_buf()),
        options(dir),
    )
    .with_channel_factory(factory.clone());
    (manager, factory)
}

/// Reply to every shutdown request on the control channel.
fn acknowledge_shutdown(factory: &MockChannelFactory) {
    factory
        .channel(JupyterChannel::Control)
        .respond_with(|msg| {
            (msg.msg_type() == msg_type::SHUTDOWN_REQUEST).then(|| {
                kernel_reply(
                    msg,
                    msg_type::SHUTDOWN_REPLY,
                    json!({"status": "ok", "restart": false}),
                )
            })
        });
}

#[test]
fn test_format_kernel_cmd() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager(
        &["kernel", "-f", "{connection_file}", "--resources", "{resource_dir}"],
        &dir,
    );
    let cmd = manager.format_kernel_cmd(&[String::from("--verbose")]);
    assert_eq!(
        cmd,
        vec![
            String::from("kernel"),
            String::from("-f"),
            dir.path().join("kernel.json").display().to_string(),
            String::from("--resources"),
            dir.path().display().to_string(),
            String::from("--verbose"),
        ]
    );
}

#[tokio::test]
async fn test_remote_ip_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockChannelFactory::new();
    let mut manager = KernelManager::from_spec(
        "test",
        spec(&["/bin/sh", "-c", "sleep 30"], dir.path().to_path_buf()),
        KernelManagerOptions {
            ip: String::from("192.168.1.20"),
            ..options(&dir)
        },
    )
    .with_channel_factory(factory.clone());

    let result = manager.start_kernel(&[]).await;
    assert!(matches!(result, Err(KMError::Config(_))));
    assert!(!manager.has_kernel());
    assert!(!manager.connection_file_path().exists());
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_shutdown_without_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, _) = manager(&["/bin/sh", "-c", "sleep 30"], &dir);
    assert_eq!(manager.shutdown().await, ShutdownOutcome::NotRunning);
    assert!(matches!(
        manager.create_client().await,
        Err(KMError::Config(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_writes_connection_file() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 30", "{connection_file}"], &dir);

    manager.start_kernel(&[]).await.unwrap();
    assert!(manager.has_kernel());
    assert!(manager.is_alive());
    assert!(factory.channel(JupyterChannel::Control).is_alive());

    let written = ConnectionFile::from_file(manager.connection_file_path()).unwrap();
    assert_eq!(written.info, *manager.connection_info());
    assert!(written.info.ports_assigned());
    assert_eq!(written.info.key.len(), 65);
    assert_eq!(written.info.kernel_name, "Test Kernel");
    assert_eq!(written.info.signature_scheme, "hmac-sha256");

    // A second launch while the first is running is refused
    assert!(matches!(
        manager.start_kernel(&[]).await,
        Err(KMError::Config(_))
    ));

    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unacknowledged_shutdown_kills_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 30"], &dir);
    manager.start_kernel(&[]).await.unwrap();
    let path = manager.connection_file_path().to_path_buf();
    assert!(path.exists());

    assert_eq!(manager.shutdown().await, ShutdownOutcome::Killed);

    let control = factory.channel(JupyterChannel::Control);
    let requests = control.sent_of_type(msg_type::SHUTDOWN_REQUEST);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].content["restart"], json!(false));
    assert!(!control.is_alive());

    assert!(!manager.has_kernel());
    assert!(!manager.is_alive());
    assert!(!path.exists());

    // Nothing left to shut down
    assert_eq!(manager.shutdown().await, ShutdownOutcome::NotRunning);
}

#[cfg(unix)]
#[tokio::test]
async fn test_acknowledged_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 30"], &dir);
    acknowledge_shutdown(&factory);
    manager.start_kernel(&[]).await.unwrap();

    assert_eq!(manager.shutdown().await, ShutdownOutcome::Acknowledged);

    // The kernel never actually exits, so it is killed after the grace period
    assert!(!manager.is_alive());
    assert!(!manager.connection_file_path().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_that_already_exited() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 1; exit 3"], &dir);
    manager.start_kernel(&[]).await.unwrap();

    assert!(wait_for(WAIT, || !manager.is_alive()).await);
    assert!(manager.has_kernel());
    assert_eq!(manager.shutdown().await, ShutdownOutcome::AlreadyExited);

    // No point asking a dead kernel to shut down
    assert!(factory
        .channel(JupyterChannel::Control)
        .sent_of_type(msg_type::SHUTDOWN_REQUEST)
        .is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_program_fails_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, _) = manager(&["/definitely/not/a/kernel"], &dir);

    let result = manager.start_kernel(&[]).await;
    assert!(matches!(result, Err(KMError::ProcessStartFailed(_))));
    assert!(!manager.has_kernel());
    assert!(!manager.connection_file_path().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_environment() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockChannelFactory::new();
    let mut kernel_spec = spec(
        &[
            "/bin/sh",
            "-c",
            "printf '%s %s' \"$JK_TEST_VAR\" \"$JK_OTHER_VAR\" > {resource_dir}/env.txt; sleep 30",
        ],
        dir.path().to_path_buf(),
    );
    kernel_spec
        .env
        .insert(String::from("JK_TEST_VAR"), String::from("from-spec"));
    let mut opts = options(&dir);
    opts.env
        .insert(String::from("JK_TEST_VAR"), String::from("from-options"));
    opts.env
        .insert(String::from("JK_OTHER_VAR"), String::from("extra"));

    let mut manager = KernelManager::from_spec("test", kernel_spec, opts)
        .with_channel_factory(factory.clone());
    manager.start_kernel(&[]).await.unwrap();

    let env_file = dir.path().join("env.txt");
    assert!(
        wait_for(WAIT, || {
            std::fs::read_to_string(&env_file).is_ok_and(|s| !s.is_empty())
        })
        .await
    );
    assert_eq!(
        std::fs::read_to_string(&env_file).unwrap(),
        "from-spec extra"
    );

    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_client_connects_to_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 30"], &dir);
    manager.start_kernel(&[]).await.unwrap();

    factory.channel(JupyterChannel::IOPub).push(kernel_message(
        msg_type::STATUS,
        json!({"execution_state": "starting"}),
    ));
    let client = manager
        .create_client_and_wait_for_connection(3, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(client.is_kernel_connected());
    assert!(client.is_alive());

    // The client's liveness follows the kernel process
    manager.shutdown().await;
    assert!(!client.is_alive());
    client.stop_channels().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_client_connection_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, factory) = manager(&["/bin/sh", "-c", "sleep 30"], &dir);
    manager.start_kernel(&[]).await.unwrap();

    let result = manager
        .create_client_and_wait_for_connection(2, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(KMError::ConnectionTimeout(2))));

    // Each attempt asked for kernel info on a fresh client
    let shell = factory.channel(JupyterChannel::Shell);
    assert_eq!(shell.sent_of_type(msg_type::KERNEL_INFO_REQUEST).len(), 2);
    assert!(!shell.is_alive());

    manager.shutdown().await;
}

/// The sockets of a kernel, bound by the test on the ports the manager wrote
/// to the connection file. Replies to kernel info, execute and shutdown
/// requests, and keeps publishing `idle` on iopub.
struct FakeKernel {
    tasks: Vec<JoinHandle<()>>,
}

impl FakeKernel {
    /// Wait for the connection file to appear, then bind the control socket,
    /// and every other socket too if `all_sockets` is set.
    async fn bind(path: &Path, all_sockets: bool) -> FakeKernel {
        let info = read_connection_file(path).await;
        let signer = Signer::new(info.key_bytes());
        let session = Arc::new(Session::new(info.key_bytes()));
        let mut tasks = Vec::new();

        let mut control = RouterSocket::new();
        control.bind(&info.endpoint(info.control_port)).await.unwrap();
        tasks.push(tokio::spawn(serve_requests(
            control,
            signer.clone(),
            session.clone(),
        )));
        if !all_sockets {
            return FakeKernel { tasks };
        }

        let mut shell = RouterSocket::new();
        shell.bind(&info.endpoint(info.shell_port)).await.unwrap();
        tasks.push(tokio::spawn(serve_requests(
            shell,
            signer.clone(),
            session.clone(),
        )));

        let mut stdin = RouterSocket::new();
        stdin.bind(&info.endpoint(info.stdin_port)).await.unwrap();
        tasks.push(tokio::spawn(serve_requests(
            stdin,
            signer.clone(),
            session.clone(),
        )));

        let mut iopub = PubSocket::new();
        iopub.bind(&info.endpoint(info.iopub_port)).await.unwrap();
        tasks.push(tokio::spawn(publish_idle(iopub, signer, session)));

        let mut heartbeat = RepSocket::new();
        heartbeat.bind(&info.endpoint(info.hb_port)).await.unwrap();
        tasks.push(tokio::spawn(async move {
            while let Ok(ping) = heartbeat.recv().await {
                if heartbeat.send(ping).await.is_err() {
                    break;
                }
            }
        }));

        FakeKernel { tasks }
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_connection_file(path: &Path) -> ConnectionInfo {
    loop {
        if let Ok(file) = ConnectionFile::from_file(path) {
            if file.info.ports_assigned() {
                return file.info;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn reply_for(session: &Session, request: &JupyterMessage) -> Option<JupyterMessage> {
    let (kind, content) = match request.msg_type() {
        msg_type::KERNEL_INFO_REQUEST => (
            msg_type::KERNEL_INFO_REPLY,
            json!({"status": "ok", "protocol_version": "5.3"}),
        ),
        msg_type::EXECUTE_REQUEST => (
            msg_type::EXECUTE_REPLY,
            json!({"status": "ok", "execution_count": 1}),
        ),
        msg_type::SHUTDOWN_REQUEST => (
            msg_type::SHUTDOWN_REPLY,
            json!({"status": "ok", "restart": false}),
        ),
        _ => return None,
    };
    Some(session.new_message(kind, content).reply_to(request))
}

async fn serve_requests(mut socket: RouterSocket, signer: Signer, session: Arc<Session>) {
    while let Ok(received) = socket.recv().await {
        let Ok(request) = WireMessage::from(received).to_jupyter(&signer) else {
            continue;
        };
        let Some(reply) = reply_for(&session, &request) else {
            continue;
        };
        let wire = WireMessage::from_jupyter(&reply, &signer).unwrap();
        if socket.send(ZmqMessage::try_from(wire).unwrap()).await.is_err() {
            break;
        }
    }
}

async fn publish_idle(mut socket: PubSocket, signer: Signer, session: Arc<Session>) {
    loop {
        let status = session.new_message(msg_type::STATUS, json!({"execution_state": "idle"}));
        let wire = WireMessage::from_jupyter(&status, &signer).unwrap();
        if socket.send(ZmqMessage::try_from(wire).unwrap()).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_over_zeromq() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = KernelManager::from_spec(
        "test",
        spec(&["/bin/sh", "-c", "sleep 30"], dir.path().to_path_buf()),
        options(&dir),
    );
    let path = manager.connection_file_path().to_path_buf();

    let (started, _kernel) =
        tokio::join!(manager.start_kernel(&[]), FakeKernel::bind(&path, true));
    started.unwrap();

    let client = manager
        .create_client_and_wait_for_connection(3, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(client.is_kernel_connected());
    assert!(client.is_alive());

    let msg_id = client.execute("1 + 1").await.unwrap();
    assert!(client.wait_for_pending(WAIT).await);
    let entry = client.execution_entry(&msg_id).unwrap();
    assert!(entry.complete);
    assert!(!entry.error);
    assert_eq!(entry.execution_index, Some(1));

    client.stop_channels().await;
    assert_eq!(manager.shutdown().await, ShutdownOutcome::Acknowledged);
    assert!(!manager.has_kernel());
    assert!(!path.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_that_dies_at_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = KernelManager::from_spec(
        "test",
        spec(&["/bin/sh", "-c", "exit 1"], dir.path().to_path_buf()),
        options(&dir),
    );

    // Nothing ever listens on the kernel's ports
    let result = tokio::time::timeout(WAIT, manager.start_kernel(&[]))
        .await
        .expect("start_kernel gives up on a dead kernel");
    assert!(matches!(result, Err(KMError::KernelExited(Some(1)))));
    assert!(!manager.has_kernel());
    assert!(!manager.connection_file_path().exists());
    assert_eq!(manager.shutdown().await, ShutdownOutcome::NotRunning);
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_that_never_listens() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = KernelManager::from_spec(
        "test",
        spec(&["/bin/sh", "-c", "sleep 30"], dir.path().to_path_buf()),
        KernelManagerOptions {
            connect_timeout: Duration::from_millis(300),
            ..options(&dir)
        },
    );

    let result = tokio::time::timeout(WAIT, manager.start_kernel(&[]))
        .await
        .expect("start_kernel gives up on a silent kernel");
    match result {
        Err(KMError::ConnectTimeout(channel, _)) => {
            assert_eq!(channel, JupyterChannel::Control)
        }
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(!manager.has_kernel());
    assert!(!manager.is_alive());
    assert!(!manager.connection_file_path().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreachable_channels_use_up_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = KernelManager::from_spec(
        "test",
        spec(&["/bin/sh", "-c", "sleep 30"], dir.path().to_path_buf()),
        KernelManagerOptions {
            connect_timeout: Duration::from_millis(300),
            ..options(&dir)
        },
    );
    let path = manager.connection_file_path().to_path_buf();

    // Only the control socket is bound
    let (started, _kernel) =
        tokio::join!(manager.start_kernel(&[]), FakeKernel::bind(&path, false));
    started.unwrap();

    let result = tokio::time::timeout(
        WAIT,
        manager.create_client_and_wait_for_connection(2, Duration::from_millis(200)),
    )
    .await
    .expect("client creation gives up");
    assert!(matches!(result, Err(KMError::ConnectionTimeout(2))));
    assert!(manager.is_alive());

    assert_eq!(manager.shutdown().await, ShutdownOutcome::Acknowledged);
}
