use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use streammux_core::{LinkConfig, MuxConfig, MuxError, PriorityLink, Stream, StreamController};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, mux_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const ECHO_CHUNK: usize = 4096;

pub fn run(args: ServeArgs, config: MuxConfig) -> CliResult<i32> {
    remove_stale_socket(&args.path)?;
    let listener = UnixListener::bind(&args.path).map_err(|err| io_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    tracing::info!(path = %args.path.display(), "waiting for link");
    let (socket, _) = listener
        .accept()
        .map_err(|err| io_error("accept failed", err))?;
    let link =
        PriorityLink::start(socket, LinkConfig::default()).map_err(|err| mux_error("link failed", err))?;
    let controller = StreamController::new(Arc::new(link), config)
        .map_err(|err| mux_error("controller failed", err))?;
    let server = controller
        .bind(args.port)
        .map_err(|err| mux_error("bind failed", err))?;
    tracing::info!(port = server.port(), "echoing streams");

    let mut echoes: Vec<JoinHandle<()>> = Vec::new();
    while running.load(Ordering::SeqCst) && controller.is_running() {
        if args.count.is_some_and(|count| echoes.len() >= count) {
            break;
        }
        let stream = match server.accept_timeout(ACCEPT_POLL) {
            Ok(stream) => stream,
            Err(MuxError::Timeout { .. }) => continue,
            Err(MuxError::Closed) => break,
            Err(err) => return Err(mux_error("accept failed", err)),
        };
        let handle = thread::Builder::new()
            .name(format!("streammux-echo-{}", echoes.len()))
            .spawn(move || echo_stream(&stream))
            .map_err(|err| io_error("echo thread failed", err))?;
        echoes.push(handle);
    }

    for handle in echoes {
        let _ = handle.join();
    }
    drop(server);
    controller.shutdown();
    let _ = fs::remove_file(&args.path);
    Ok(SUCCESS)
}

/// Echo until the peer closes, then leave the stream to its close handshake.
fn echo_stream(stream: &Stream) {
    let mut buf = [0u8; ECHO_CHUNK];
    let mut echoed = 0usize;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(stream_id = ?stream.local_id(), error = %err, "echo read ended");
                break;
            }
        };
        if let Err(err) = stream.write_all(&buf[..n]) {
            tracing::warn!(stream_id = ?stream.local_id(), error = %err, "echo write failed");
            break;
        }
        echoed += n;
    }
    tracing::info!(stream_id = ?stream.local_id(), bytes = echoed, "stream finished");
}

fn remove_stale_socket(path: &Path) -> CliResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).map_err(|err| io_error("stale socket removal failed", err))
        }
        Ok(_) => Err(CliError::new(
            USAGE,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(_) => Ok(()),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
