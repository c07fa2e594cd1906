//! `rbus serve`: expose a local bus on a TCP port.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use rbus::{Bus, Server, ServerOptions};
use tracing::Dispatch;

use crate::{LogLevel, WireArgs};

#[derive(Args, Debug)]
pub(crate) struct ServeArgs {
    /// Bus to serve: a number, a device path, or empty for the first one found.
    #[arg(short, long, default_value = "")]
    bus: String,

    /// Address to listen on.
    #[arg(long, default_value = "localhost:9090")]
    addr: String,

    #[command(flatten)]
    wire: WireArgs,

    /// PEM certificate chain, required with --secure.
    #[arg(long, requires = "secure")]
    cert: Option<PathBuf>,

    /// PEM private key, required with --secure.
    #[arg(long, requires = "secure")]
    key: Option<PathBuf>,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

pub(crate) async fn run(args: ServeArgs) -> Result<()> {
    let dispatch = crate::diagnostics(args.log_level);
    #[cfg(target_os = "linux")]
    {
        let bus = tracing::dispatcher::with_default(&dispatch, || open_bus(&args.bus))?;
        serve_bus(bus, &args, dispatch).await
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = dispatch;
        bail!("no local I2C driver on this platform")
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn serve_bus<B: Bus + Send + 'static>(
    bus: B,
    args: &ServeArgs,
    dispatch: Dispatch,
) -> Result<()> {
    let tls = if args.wire.secure {
        let (Some(cert), Some(key)) = (&args.cert, &args.key) else {
            bail!("--secure needs --cert and --key");
        };
        Some(
            rbus::tls::load_server_config(cert, key)
                .with_context(|| format!("failed to load {}", cert.display()))?,
        )
    } else {
        None
    };
    let options = ServerOptions {
        codec: args.wire.codec,
        transport: args.wire.transport(),
        tls,
    };

    let server = Server::new(bus, options)?.with_dispatch(dispatch.clone());
    let (listener, shutdown) = server
        .bind(args.addr.as_str())
        .with_context(|| format!("failed to listen on {}", args.addr))?;
    eprintln!("Serving on {}", shutdown.local_addr());

    let mut serving = tokio::task::spawn_blocking(move || server.serve(listener));
    let finished = tokio::select! {
        res = &mut serving => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    let res = match finished {
        Some(res) => res,
        None => {
            tracing::dispatcher::with_default(&dispatch, || tracing::info!("interrupted"));
            shutdown.shutdown();
            serving.await
        }
    };
    res.context("server thread panicked")??;
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_bus(name: &str) -> Result<rbus::linux::I2cDev> {
    let dev = rbus::linux::I2cDev::open(name)
        .with_context(|| format!("failed to open I2C bus {name:?}"))?;
    tracing::info!(path = %dev.path().display(), "opened bus");
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::{Cli, Command};

    fn parse(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from([&["rbus", "serve"][..], args].concat()).unwrap();
        match cli.command {
            Command::Serve(serve) => serve,
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn defaults_match_a_plain_local_server() {
        let args = parse(&[]);
        assert_eq!(args.log_level, LogLevel::Warn);
        assert_eq!(args.addr, "localhost:9090");
        assert_eq!(args.bus, "");
        assert_eq!(args.wire.codec, rbus::Codec::Binary);
    }

    #[test]
    fn certificate_flags_require_secure() {
        assert!(Cli::try_parse_from(["rbus", "serve", "--cert", "c.pem"]).is_err());
        let args = parse(&["--secure", "--cert", "c.pem", "--key", "k.pem", "-b", "1"]);
        assert!(args.wire.transport().secure);
        assert_eq!(args.bus, "1");
    }
}
