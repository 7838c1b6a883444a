use std::fs;
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use streammux_core::{LinkConfig, MuxConfig, PriorityLink, Stream, StreamController};

use crate::cmd::SendArgs;
use crate::exit::{io_error, mux_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_echo, EchoReport, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat, config: MuxConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;
    let started = Instant::now();

    let socket = UnixStream::connect(&args.path).map_err(|err| {
        io_error(&format!("connect to {} failed", args.path.display()), err)
    })?;
    let link =
        PriorityLink::start(socket, LinkConfig::default()).map_err(|err| mux_error("link failed", err))?;
    let controller = StreamController::new(Arc::new(link), config)
        .map_err(|err| mux_error("controller failed", err))?;

    let stream = controller
        .connect_timeout(args.port, args.priority, timeout)
        .map_err(|err| mux_error("connect failed", err))?;
    tracing::debug!(stream_id = ?stream.local_id(), port = args.port, "stream open");

    stream
        .write_all(&payload)
        .map_err(|err| mux_error("send failed", err))?;

    let (tx, rx) = mpsc::channel();
    let reader = stream.clone();
    let expected = payload.len();
    thread::Builder::new()
        .name("streammux-send-reader".to_string())
        .spawn(move || {
            let _ = tx.send(read_echo(&reader, expected));
        })
        .map_err(|err| io_error("reader thread failed", err))?;

    let echoed = match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(|err| mux_error("receive failed", err))?,
        Err(_) => {
            controller.shutdown();
            return Err(CliError::new(
                TIMEOUT,
                format!("no echo within {}ms", timeout.as_millis()),
            ));
        }
    };

    let stream_id = stream.local_id();
    stream
        .close(timeout)
        .map_err(|err| mux_error("close failed", err))?;
    controller.shutdown();

    print_echo(
        &EchoReport {
            port: args.port,
            stream_id,
            priority: args.priority,
            payload: &echoed,
            elapsed_ms: started.elapsed().as_millis(),
        },
        format,
    );
    Ok(SUCCESS)
}

/// Read `expected` bytes, or fewer if the server closes first.
fn read_echo(stream: &Stream, expected: usize) -> streammux_core::Result<Vec<u8>> {
    let mut out = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        match stream.read(&mut out[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    out.truncate(filled);
    Ok(out)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
