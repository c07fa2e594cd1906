//! `rbus io`: one read or write against a device on a remote bus.

use anyhow::{Context, Result, bail};
use clap::Args;
use rbus::{DialOptions, Frequency, MAX_ADDR, MAX_READ_LEN};

use crate::{LogLevel, WireArgs};

#[derive(Args, Debug)]
pub(crate) struct IoArgs {
    /// Device address.
    #[arg(short, long, value_parser = parse_address)]
    address: u16,

    /// Register to read from or write to.
    #[arg(short, long, value_parser = parse_byte)]
    register: u8,

    /// Number of bytes to read.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..))]
    length: u8,

    /// Write DATA to the register instead of reading.
    #[arg(short, long)]
    write: bool,

    /// Bytes to write, in decimal or 0x/0o/0b notation.
    #[arg(value_name = "DATA", value_parser = parse_byte)]
    data: Vec<u8>,

    /// Set the bus clock first, e.g. 400kHz.
    #[arg(long)]
    hz: Option<Frequency>,

    /// Server address.
    #[arg(long, default_value = "localhost:9090")]
    server: String,

    #[command(flatten)]
    wire: WireArgs,

    /// Log connection details to stderr.
    #[arg(short, long)]
    verbose: bool,
}

pub(crate) fn run(args: &IoArgs) -> Result<()> {
    let level = if args.verbose { LogLevel::Debug } else { LogLevel::Warn };
    let dispatch = crate::diagnostics(level);
    tracing::dispatcher::with_default(&dispatch, || {
        let out = exchange(args)?;
        if !out.is_empty() {
            println!("{out}");
        }
        Ok(())
    })
}

/// Performs the exchange and returns what to print.
fn exchange(args: &IoArgs) -> Result<String> {
    if args.write && args.data.is_empty() {
        bail!("-w needs at least one byte to write");
    }
    if !args.write && !args.data.is_empty() {
        bail!("unexpected data arguments without -w");
    }

    let opts = DialOptions {
        codec: args.wire.codec,
        transport: args.wire.transport(),
        ..DialOptions::default()
    };
    let bus = rbus::dial(&args.server, &opts)
        .with_context(|| format!("failed to connect to {}", args.server))?;

    if let Some(freq) = args.hz {
        bus.set_speed(freq)
            .with_context(|| format!("failed to set bus clock to {freq}"))?;
    }

    let out = if args.write {
        let mut buf = Vec::with_capacity(args.data.len() + 1);
        buf.push(args.register);
        buf.extend_from_slice(&args.data);
        bus.tx(args.address, &buf, &mut [])
            .with_context(|| format!("write to {:#x} failed", args.address))?;
        String::new()
    } else {
        let mut buf = vec![0u8; usize::from(args.length).min(MAX_READ_LEN)];
        bus.tx(args.address, &[args.register], &mut buf)
            .with_context(|| format!("read from {:#x} failed", args.address))?;
        format_bytes(&buf)
    };
    bus.close()?;
    Ok(out)
}

/// Parses an unsigned integer, honoring `0x`, `0o` and `0b` prefixes.
fn parse_uint(s: &str) -> Result<u64, String> {
    let lower = s.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        (lower.as_str(), 10)
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let n = parse_uint(s)?;
    u8::try_from(n).map_err(|_| format!("{s} does not fit in a byte"))
}

fn parse_address(s: &str) -> Result<u16, String> {
    match u16::try_from(parse_uint(s)?) {
        Ok(addr) if addr <= MAX_ADDR => Ok(addr),
        _ => Err(format!("address {s} is outside 0..={MAX_ADDR}")),
    }
}

/// Formats bytes as `0x11, 0x12`.
fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:#04x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::*;
    use crate::{Cli, Command};

    fn parse(args: &[&str]) -> IoArgs {
        let cli = Cli::try_parse_from([&["rbus", "io"][..], args].concat()).unwrap();
        match cli.command {
            Command::Io(io) => io,
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bytes_accept_common_notations() {
        assert_eq!(parse_byte("16"), Ok(16));
        assert_eq!(parse_byte("0x1F"), Ok(0x1F));
        assert_eq!(parse_byte("0o17"), Ok(0o17));
        assert_eq!(parse_byte("0b101"), Ok(5));
        assert!(parse_byte("256").is_err());
        assert!(parse_byte("0x").is_err());
        assert!(parse_byte("-1").is_err());
    }

    #[test]
    fn addresses_cover_ten_bit_range() {
        assert_eq!(parse_address("0x1FF"), Ok(0x1FF));
        assert_eq!(parse_address("0"), Ok(0));
        assert!(parse_address("512").is_err());
        assert!(parse_address("70000").is_err());
    }

    #[test]
    fn read_output_is_hex_list() {
        assert_eq!(format_bytes(&[0x11, 0x12]), "0x11, 0x12");
        assert_eq!(format_bytes(&[0]), "0x00");
        assert_eq!(format_bytes(&[]), "");
    }

    #[test]
    fn write_mode_collects_data() {
        let io = parse(&["-a", "0x50", "-r", "2", "-w", "0x10", "32"]);
        assert!(io.write);
        assert_eq!(io.data, [0x10, 32]);
        assert_eq!(io.length, 1);
        assert_eq!(io.wire.codec, rbus::Codec::Binary);
    }

    #[test]
    fn flags_map_to_transport() {
        let io = parse(&[
            "-a", "80", "-r", "0", "-l", "4", "-P", "compact", "--framed", "--hz", "400kHz",
        ]);
        assert_eq!(io.length, 4);
        assert_eq!(io.wire.codec, rbus::Codec::Compact);
        let t = io.wire.transport();
        assert!(t.framed && !t.buffered && !t.secure);
        assert_eq!(io.hz, Frequency::from_hz(400_000));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for bad in [
            &["-a", "512", "-r", "0"][..],
            &["-a", "80", "-r", "256"],
            &["-a", "80", "-r", "0", "-l", "0"],
            &["-a", "80", "-r", "0", "-P", "xml"],
            &["-r", "0"],
        ] {
            assert!(
                Cli::try_parse_from([&["rbus", "io"][..], bad].concat()).is_err(),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn data_without_write_flag_is_rejected() {
        let io = parse(&["-a", "80", "-r", "0", "7"]);
        let err = exchange(&io).unwrap_err();
        assert!(err.to_string().contains("-w"), "{err}");
    }

    #[test]
    fn write_without_data_is_rejected() {
        let io = parse(&["-a", "80", "-r", "0", "-w"]);
        assert!(exchange(&io).is_err());
    }
}
