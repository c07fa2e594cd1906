//! Access an I²C bus on another machine as if it were local.
//!
//! A server owns the physical bus and answers calls; clients hold a
//! [`RemoteBus`] that implements the same [`Bus`] capability as a local
//! driver.
//!
//! # Quick start
//!
//! ```no_run
//! let bus = rbus::dial_defaults("raspberrypi.local:9090")?;
//! let mut buf = [0u8; 2];
//! bus.tx(0x50, &[0x10], &mut buf)?;
//! println!("{}: {buf:02X?}", bus.describe()?);
//! bus.close()?;
//! # Ok::<(), rbus::Error>(())
//! ```
//!
//! Both ends must agree out of band on the [`Codec`] and the
//! [`TransportConfig`]. A mismatch fails the first call: with
//! [`Error::Protocol`] when the reply cannot be decoded, or with
//! [`Error::Connection`] when the server rejects the request and hangs up.

mod bus;
mod client;
mod error;
#[cfg(target_os = "linux")]
pub mod linux;
mod server;
pub mod tls;
pub mod transport;

pub use bus::{Bus, Frequency};
pub use client::{DEFAULT_CONNECT_TIMEOUT, DialOptions, RemoteBus, dial, dial_defaults};
pub use error::{Error, Result, translate};
pub use rbus_proto::{Codec, DEFAULT_PORT, MAX_ADDR, MAX_READ_LEN, WireError};
pub use server::{Handler, Server, ServerOptions, ShutdownHandle};
pub use transport::{Transport, TransportConfig};
