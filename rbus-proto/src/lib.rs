//! Wire protocol for remote I²C bus access.
//!
//! A client sends one [`Request`] and blocks for exactly one [`Response`].
//! Messages are serialized with one of several [`Codec`]s; the codec is
//! configured identically on both ends and never negotiated.

mod codec;
mod message;

pub use codec::{Codec, CodecError};
pub use message::{DEFAULT_PORT, MAX_ADDR, MAX_READ_LEN, Request, Response, WireError};
