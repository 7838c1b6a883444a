//! Minimal echo server: accepts one link and echoes every stream on port 7.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send /tmp/streammux-echo-<pid>/echo.sock \
//!     --port 7 --data hello

#[cfg(unix)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::fs;
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;
    use std::thread;

    use streammux::core::{LinkConfig, PriorityLink, StreamController};

    let sock_dir = std::env::temp_dir().join(format!("streammux-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");
    let _ = fs::remove_file(&sock_path);

    let listener = UnixListener::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let (socket, _) = listener.accept()?;
    let link = PriorityLink::start(socket, LinkConfig::default())?;
    let controller = StreamController::with_defaults(Arc::new(link))?;
    let server = controller.bind(7)?;
    eprintln!("Link up, echoing streams on port {}", server.port());

    // Ends once the client drops the link.
    while let Ok(stream) = server.accept() {
        eprintln!("Stream {:?} opened", stream.local_id());
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            eprintln!("Stream {:?} finished", stream.local_id());
        });
    }

    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("echo-server needs Unix domain sockets");
}
