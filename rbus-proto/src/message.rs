//! Protocol message types for client↔server bus calls.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 9090;

/// Highest device address accepted on the wire (covers 10-bit addressing).
pub const MAX_ADDR: u16 = 0x1FF;

/// Maximum number of bytes a single transaction may read back.
pub const MAX_READ_LEN: usize = 255;

/// Request sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask the server to describe its bus.
    Describe,
    /// Write `write` to `addr`, then read `len` bytes back.
    Transact {
        /// Device address.
        addr: i16,
        /// Bytes written first. May be empty.
        write: Vec<u8>,
        /// Number of bytes to read after the write.
        len: i32,
    },
    /// Change the bus clock.
    SetSpeed {
        /// Bus frequency in micro-hertz.
        micro_hertz: i64,
    },
}

impl Request {
    /// Short name of the call, used in logs and protocol errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Describe => "describe",
            Self::Transact { .. } => "transact",
            Self::SetSpeed { .. } => "set_speed",
        }
    }
}

/// Response sent from server to client.
///
/// Exactly one response follows every request, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Reply to [`Request::Describe`].
    Describe(String),
    /// Bytes read by a successful [`Request::Transact`].
    Transact(Vec<u8>),
    /// Acknowledgment for [`Request::SetSpeed`].
    SetSpeed,
    /// The call failed on the server.
    Error(WireError),
}

/// The only error shape that crosses the wire: a message, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl WireError {
    /// Creates a wire error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WireError {}
