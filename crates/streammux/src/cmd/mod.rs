use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use streammux_core::MuxConfig;

use crate::exit::{io_error, mux_error, CliResult};
use crate::output::OutputFormat;

#[cfg(unix)]
pub mod send;
#[cfg(unix)]
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one link and echo every stream opened on a port.
    #[cfg(unix)]
    Serve(ServeArgs),
    /// Open one stream, send a payload and print the echo.
    #[cfg(unix)]
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: MuxConfig) -> CliResult<i32> {
    match command {
        #[cfg(unix)]
        Command::Serve(args) => serve::run(args, config),
        #[cfg(unix)]
        Command::Send(args) => send::run(args, format, config),
        Command::Version(args) => {
            let _ = (format, config);
            version::run(args)
        }
    }
}

/// Load a mux configuration file, or the defaults when none is given.
pub fn load_config(path: Option<&Path>) -> CliResult<MuxConfig> {
    let Some(path) = path else {
        return Ok(MuxConfig::default());
    };
    let text = fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    MuxConfig::from_json_str(&text)
        .map_err(|err| mux_error(&format!("invalid config {}", path.display()), err))
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Stream port to listen on (0 picks the lowest free port).
    #[arg(long, short = 'p', default_value = "7")]
    pub port: u16,
    /// Exit after echoing N streams.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Stream port on the server.
    #[arg(long, short = 'p', default_value = "7")]
    pub port: u16,
    /// Message priority for the stream (1 is most urgent).
    #[arg(long, default_value = "4", value_parser = clap::value_parser!(u8).range(1..))]
    pub priority: u8,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Time allowed for connecting and for the echo (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
