//! CLI for remote I²C bus access.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod io;
mod serve;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rbus::{Codec, TransportConfig};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rbus", version, about = "Remote I²C bus over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a local I²C bus to remote clients.
    Serve(serve::ServeArgs),

    /// Read from or write to a device on a remote bus.
    Io(io::IoArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Transport and codec flags. Client and server must pass the same values.
#[derive(Args, Debug, Clone)]
pub(crate) struct WireArgs {
    /// Protocol codec: binary, compact, json or simplejson.
    #[arg(short = 'P', long = "protocol", default_value = "binary")]
    codec: Codec,

    /// Use length-prefixed framing.
    #[arg(long)]
    framed: bool,

    /// Use an 8 KiB buffered transport.
    #[arg(long)]
    buffered: bool,

    /// Use TLS.
    #[arg(long)]
    secure: bool,
}

impl WireArgs {
    pub(crate) const fn transport(&self) -> TransportConfig {
        TransportConfig {
            secure: self.secure,
            buffered: self.buffered,
            framed: self.framed,
        }
    }
}

/// Log verbosity, overridden by `RUST_LOG` when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Session lifecycle and connection details.
    Debug,
    /// Every call with its bytes.
    Trace,
}

impl LogLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Builds the stderr diagnostics sink. Nothing is installed globally.
pub(crate) fn diagnostics(level: LogLevel) -> Dispatch {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    Dispatch::new(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish(),
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("rbus: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => serve::run(args).await,
            Command::Io(args) => io::run(&args),
            Command::Completion { shell } => {
                let mut cmd = Self::command();
                clap_complete::generate(shell, &mut cmd, "rbus", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}
