#![cfg(all(unix, feature = "cli"))]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streammux::core::{LinkConfig, MuxError, PriorityLink, StreamController};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/streammux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn spawn_serve(path: &Path, extra: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_streammux"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(path)
        .args(extra)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start")
}

/// The server accepts exactly one link, so only probe for the socket file.
fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        assert!(start.elapsed() < timeout, "socket never appeared");
        thread::sleep(Duration::from_millis(25));
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<i32> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("child status should be readable") {
            return status.code();
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn library_client_round_trips_through_serve() {
    let dir = unique_temp_dir("library");
    let sock_path = dir.join("mux.sock");
    let mut child = spawn_serve(&sock_path, &["--port", "11", "--count", "1"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let socket = UnixStream::connect(&sock_path).expect("client should connect");
    let link = PriorityLink::start(socket, LinkConfig::default()).expect("link should start");
    let controller =
        StreamController::with_defaults(Arc::new(link)).expect("controller should start");

    let stream = controller.connect(11, 3).expect("stream should open");
    stream.write_all(b"round trip").expect("write should succeed");
    let mut buf = [0u8; 10];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).expect("read should succeed");
        assert!(n > 0, "echo ended early");
        filled += n;
    }
    assert_eq!(&buf, b"round trip");
    stream
        .close(Duration::from_secs(3))
        .expect("close should complete");

    assert_eq!(wait_for_exit(&mut child, Duration::from_secs(5)), Some(0));
    drop(controller);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_prints_echo_as_json() {
    let dir = unique_temp_dir("send");
    let sock_path = dir.join("mux.sock");
    let mut child = spawn_serve(&sock_path, &["--count", "1"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let output = Command::new(env!("CARGO_BIN_EXE_streammux"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg(&sock_path)
        .arg("--data")
        .arg("hello mux")
        .output()
        .expect("send command should run");

    assert!(
        output.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let line = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).expect("stdout should be json");
    assert_eq!(value["payload"], "hello mux");
    assert_eq!(value["payload_size"], 9);
    assert_eq!(value["port"], 7);

    assert_eq!(wait_for_exit(&mut child, Duration::from_secs(5)), Some(0));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_to_unbound_port_fails() {
    let dir = unique_temp_dir("refused");
    let sock_path = dir.join("mux.sock");
    let mut child = spawn_serve(&sock_path, &["--port", "7"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let output = Command::new(env!("CARGO_BIN_EXE_streammux"))
        .arg("--log-level")
        .arg("error")
        .arg("send")
        .arg(&sock_path)
        .arg("--port")
        .arg("99")
        .arg("--data")
        .arg("nobody home")
        .output()
        .expect("send command should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"), "stderr: {stderr}");

    // The link is gone, so the server winds down on its own.
    assert_eq!(wait_for_exit(&mut child, Duration::from_secs(5)), Some(0));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_without_server_is_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = Command::new(env!("CARGO_BIN_EXE_streammux"))
        .arg("send")
        .arg(dir.join("absent.sock"))
        .arg("--data")
        .arg("x")
        .output()
        .expect("send command should run");
    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn serve_rejects_invalid_config() {
    let dir = unique_temp_dir("config");
    let config = dir.join("mux.json");
    std::fs::write(&config, r#"{"window_size": 0}"#).expect("config should be writable");

    let output = Command::new(env!("CARGO_BIN_EXE_streammux"))
        .arg("--config")
        .arg(&config)
        .arg("serve")
        .arg(dir.join("mux.sock"))
        .output()
        .expect("serve command should run");
    assert_eq!(output.status.code(), Some(60));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn refused_error_is_visible_to_library_callers() {
    let dir = unique_temp_dir("refused-lib");
    let sock_path = dir.join("mux.sock");
    let mut child = spawn_serve(&sock_path, &["--port", "5"]);
    wait_for_socket(&sock_path, Duration::from_secs(3));

    let socket = UnixStream::connect(&sock_path).expect("client should connect");
    let link = PriorityLink::start(socket, LinkConfig::default()).expect("link should start");
    let controller =
        StreamController::with_defaults(Arc::new(link)).expect("controller should start");
    let err = controller.connect(6, 3).expect_err("port 6 has no listener");
    assert!(matches!(err, MuxError::Refused { code: 1001 }));

    controller.shutdown();
    assert_eq!(wait_for_exit(&mut child, Duration::from_secs(5)), Some(0));
    let _ = std::fs::remove_dir_all(&dir);
}
