//! The bus capability surface and its value types.

use std::fmt;
use std::str::FromStr;

use rbus_proto::{MAX_ADDR, MAX_READ_LEN};

use crate::error::{Error, Result};

/// An I²C-style bus: addressed write-then-read transactions and a clock.
///
/// Implemented by local drivers and by [`RemoteBus`](crate::RemoteBus), so
/// code written against a local bus works unchanged against a remote one.
pub trait Bus {
    /// Error reported by the bus.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Human-readable identity of the bus.
    fn describe(&self) -> std::result::Result<String, Self::Error>;

    /// Writes `write` to `addr`, then fills `read` from it.
    ///
    /// Either side may be empty for a one-directional transfer.
    fn tx(
        &mut self,
        addr: u16,
        write: &[u8],
        read: &mut [u8],
    ) -> std::result::Result<(), Self::Error>;

    /// Changes the bus clock, if supported.
    fn set_speed(&mut self, freq: Frequency) -> std::result::Result<(), Self::Error>;
}

/// Checks that `addr` fits the 10-bit address space.
pub(crate) fn check_addr(addr: u16) -> Result<()> {
    if addr > MAX_ADDR {
        return Err(Error::Validation(format!(
            "address {addr:#x} out of range 0..={MAX_ADDR:#x}"
        )));
    }
    Ok(())
}

/// Checks that a read of `len` bytes fits a single transaction.
pub(crate) fn check_read_len(len: usize) -> Result<()> {
    if len > MAX_READ_LEN {
        return Err(Error::Validation(format!(
            "read length {len} out of range 0..={MAX_READ_LEN}"
        )));
    }
    Ok(())
}

/// A bus clock frequency, stored as an integer count of micro-hertz.
///
/// This is also the wire representation, so conversions are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Frequency(i64);

impl Frequency {
    /// One micro-hertz.
    pub const MICRO_HERTZ: Self = Self(1);
    /// One milli-hertz.
    pub const MILLI_HERTZ: Self = Self(1_000);
    /// One hertz.
    pub const HERTZ: Self = Self(1_000_000);
    /// One kilohertz.
    pub const KILO_HERTZ: Self = Self(1_000_000_000);
    /// One megahertz.
    pub const MEGA_HERTZ: Self = Self(1_000_000_000_000);
    /// One gigahertz.
    pub const GIGA_HERTZ: Self = Self(1_000_000_000_000_000);

    /// Suffixes in display order, largest unit first.
    const UNITS: [(&'static str, Self); 6] = [
        ("GHz", Self::GIGA_HERTZ),
        ("MHz", Self::MEGA_HERTZ),
        ("kHz", Self::KILO_HERTZ),
        ("Hz", Self::HERTZ),
        ("mHz", Self::MILLI_HERTZ),
        ("µHz", Self::MICRO_HERTZ),
    ];

    /// Wraps a raw micro-hertz count.
    pub const fn from_micro_hertz(micro_hertz: i64) -> Self {
        Self(micro_hertz)
    }

    /// Converts whole hertz, or `None` if the result overflows.
    pub const fn from_hz(hz: i64) -> Option<Self> {
        match hz.checked_mul(Self::HERTZ.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Raw micro-hertz count, as sent on the wire.
    pub const fn as_micro_hertz(self) -> i64 {
        self.0
    }

    /// Whole hertz, truncating any sub-hertz part.
    pub const fn as_hz(self) -> i64 {
        self.0 / Self::HERTZ.0
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0Hz");
        }
        // MICRO_HERTZ divides everything, so this always finds a unit.
        let (suffix, unit) = Self::UNITS
            .iter()
            .find(|(_, unit)| self.0 % unit.0 == 0)
            .copied()
            .unwrap_or(("µHz", Self::MICRO_HERTZ));
        write!(f, "{}{suffix}", self.0 / unit.0)
    }
}

impl FromStr for Frequency {
    type Err = String;

    /// Parses `"400kHz"`, `"1.5MHz"`, `"100000Hz"` or a bare hertz count.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        let unit = match suffix.trim() {
            "" | "Hz" | "hz" => Self::HERTZ,
            "GHz" => Self::GIGA_HERTZ,
            "MHz" => Self::MEGA_HERTZ,
            "kHz" | "KHz" | "khz" => Self::KILO_HERTZ,
            "mHz" => Self::MILLI_HERTZ,
            "uHz" | "µHz" => Self::MICRO_HERTZ,
            other => return Err(format!("unknown frequency unit {other:?} in {s:?}")),
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("missing number in {s:?}"));
        }
        let overflow = || format!("frequency {s:?} is too large");
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid number in {s:?}"))?
        };
        let mut value = whole.checked_mul(unit.0).ok_or_else(overflow)?;

        let mut scale = unit.0;
        for digit in frac.bytes() {
            if !digit.is_ascii_digit() {
                return Err(format!("invalid number in {s:?}"));
            }
            if scale % 10 != 0 {
                return Err(format!("{s:?} is finer than one micro-hertz"));
            }
            scale /= 10;
            value = value
                .checked_add(i64::from(digit - b'0') * scale)
                .ok_or_else(overflow)?;
        }
        Ok(Self(value))
    }
}
