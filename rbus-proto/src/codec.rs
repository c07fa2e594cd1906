//! Self-delimiting message codecs over any `Read`/`Write` stream.
//!
//! Both ends must agree on the codec out of band. Every codec starts its
//! messages with a marker the others never produce, so decoding with the
//! wrong codec fails instead of yielding a plausible message.
//!
//! | Codec        | Layout                                                  |
//! |--------------|---------------------------------------------------------|
//! | `binary`     | `0x80 0x01` then MessagePack with named fields          |
//! | `compact`    | COBS(`0x82` + postcard payload) then `0x00`             |
//! | `json`       | `{"v":1,"msg":...}` then `\n`                           |
//! | `simplejson` | bare JSON value then `\n`                               |

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header written before every `binary` message.
const BINARY_HEADER: [u8; 2] = [0x80, 0x01];

/// Protocol id leading every `compact` payload.
const COMPACT_PROTOCOL_ID: u8 = 0x82;

/// Envelope version for the `json` codec.
const JSON_VERSION: u8 = 1;

/// Maximum encoded size of a single `compact` message (16 MiB).
const MAX_COMPACT: usize = 16 * 1024 * 1024;

/// Errors raised while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The underlying stream failed or ended.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The message could not be serialized.
    #[error("{codec} encode failed: {reason}")]
    Encode {
        /// Codec in use.
        codec: Codec,
        /// What the serializer reported.
        reason: String,
    },

    /// The bytes on the stream are not a valid message for this codec.
    #[error("{codec} decode failed: {reason}")]
    Decode {
        /// Codec in use.
        codec: Codec,
        /// What the deserializer reported.
        reason: String,
    },
}

impl CodecError {
    /// Returns `true` when the peer closed the stream between messages.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    fn encode(codec: Codec, reason: impl fmt::Display) -> Self {
        Self::Encode {
            codec,
            reason: reason.to_string(),
        }
    }

    fn decode(codec: Codec, reason: impl fmt::Display) -> Self {
        Self::Decode {
            codec,
            reason: reason.to_string(),
        }
    }
}

/// Serialization format used for every message on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Codec {
    /// Verbose binary: MessagePack with field names.
    #[default]
    Binary,
    /// Compact binary: COBS-framed postcard.
    Compact,
    /// Versioned JSON envelope.
    Json,
    /// Bare JSON.
    SimpleJson,
}

impl Codec {
    /// All codecs, in the order they are listed to users.
    pub const ALL: [Self; 4] = [Self::Binary, Self::Compact, Self::Json, Self::SimpleJson];

    /// Name used on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Compact => "compact",
            Self::Json => "json",
            Self::SimpleJson => "simplejson",
        }
    }

    /// Encodes `msg`, writes it to `w` and flushes.
    ///
    /// The flush marks the message boundary for framed transports.
    pub fn encode<W: Write + ?Sized>(
        self,
        w: &mut W,
        msg: &impl Serialize,
    ) -> Result<(), CodecError> {
        match self {
            Self::Binary => {
                let body = rmp_serde::to_vec_named(msg).map_err(|e| CodecError::encode(self, e))?;
                w.write_all(&BINARY_HEADER)?;
                w.write_all(&body)?;
            }
            Self::Compact => {
                let frame = postcard::to_allocvec_cobs(&(COMPACT_PROTOCOL_ID, msg))
                    .map_err(|e| CodecError::encode(self, e))?;
                if frame.len() > MAX_COMPACT {
                    return Err(CodecError::encode(self, "message exceeds 16 MiB limit"));
                }
                w.write_all(&frame)?;
            }
            Self::Json => {
                let envelope = JsonEnvelope {
                    v: JSON_VERSION,
                    msg,
                };
                write_json(self, w, &envelope)?;
            }
            Self::SimpleJson => write_json(self, w, msg)?,
        }
        w.flush()?;
        Ok(())
    }

    /// Reads exactly one message from `r` and decodes it.
    ///
    /// A stream that ends before the first byte of a message yields
    /// [`CodecError::Io`] with [`io::ErrorKind::UnexpectedEof`].
    pub fn decode<T: DeserializeOwned, R: Read + ?Sized>(
        self,
        r: &mut R,
    ) -> Result<T, CodecError> {
        match self {
            Self::Binary => {
                let mut header = [0u8; 2];
                r.read_exact(&mut header)?;
                if header != BINARY_HEADER {
                    return Err(CodecError::decode(
                        self,
                        format_args!("bad header {:02X}{:02X}", header[0], header[1]),
                    ));
                }
                rmp_serde::decode::from_read(r).map_err(|e| match e {
                    rmp_serde::decode::Error::InvalidMarkerRead(err)
                    | rmp_serde::decode::Error::InvalidDataRead(err)
                        if err.kind() != io::ErrorKind::UnexpectedEof =>
                    {
                        CodecError::Io(err)
                    }
                    e => CodecError::decode(self, e),
                })
            }
            Self::Compact => {
                let mut frame = read_cobs_frame(r)?;
                let (id, msg): (u8, T) = postcard::from_bytes_cobs(&mut frame)
                    .map_err(|e| CodecError::decode(self, e))?;
                if id != COMPACT_PROTOCOL_ID {
                    return Err(CodecError::decode(
                        self,
                        format_args!("bad protocol id {id:02X}"),
                    ));
                }
                Ok(msg)
            }
            Self::Json => {
                let envelope: JsonEnvelopeOwned<T> = read_json(self, r)?;
                if envelope.v != JSON_VERSION {
                    return Err(CodecError::decode(
                        self,
                        format_args!("unsupported envelope version {}", envelope.v),
                    ));
                }
                Ok(envelope.msg)
            }
            Self::SimpleJson => read_json(self, r),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "" => Ok(Self::Binary),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "simplejson" => Ok(Self::SimpleJson),
            _ => Err(format!(
                "unknown protocol {s:?} (expected binary, compact, json or simplejson)"
            )),
        }
    }
}

#[derive(Serialize)]
struct JsonEnvelope<'a, T: ?Sized> {
    v: u8,
    msg: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonEnvelopeOwned<T> {
    v: u8,
    msg: T,
}

fn write_json<W: Write + ?Sized, T: Serialize + ?Sized>(
    codec: Codec,
    w: &mut W,
    value: &T,
) -> Result<(), CodecError> {
    let mut line = serde_json::to_vec(value).map_err(|e| CodecError::encode(codec, e))?;
    line.push(b'\n');
    w.write_all(&line)?;
    Ok(())
}

/// Skips inter-message whitespace, then deserializes one JSON value.
///
/// The deserializer stops at the closing brace or quote, so nothing past
/// the value is consumed from `r`.
fn read_json<T: DeserializeOwned, R: Read + ?Sized>(
    codec: Codec,
    r: &mut R,
) -> Result<T, CodecError> {
    let first = loop {
        let b = read_byte(r)?;
        if !b.is_ascii_whitespace() {
            break b;
        }
    };
    let head = [first];
    let mut de = serde_json::Deserializer::from_reader(head.as_slice().chain(r));
    T::deserialize(&mut de).map_err(|e| {
        if e.is_io() {
            CodecError::Io(io::Error::other(e))
        } else {
            CodecError::decode(codec, e)
        }
    })
}

/// Reads up to and including the `0x00` terminator of a COBS frame.
///
/// The leading code byte and protocol id are checked before anything else
/// is read, so a peer speaking another codec fails here instead of leaving
/// the reader waiting for a terminator that never comes.
fn read_cobs_frame<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, CodecError> {
    let truncated = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::decode(Codec::Compact, "stream ended mid-message")
        } else {
            e.into()
        }
    };

    // The id is never zero, so the first COBS block holds at least it.
    let code = read_byte(r)?;
    if code < 2 {
        return Err(CodecError::decode(
            Codec::Compact,
            format_args!("bad frame start {code:02X}"),
        ));
    }
    let id = read_byte(r).map_err(truncated)?;
    if id != COMPACT_PROTOCOL_ID {
        return Err(CodecError::decode(
            Codec::Compact,
            format_args!("bad protocol id {id:02X}"),
        ));
    }

    let mut frame = vec![code, id];
    loop {
        let b = read_byte(r).map_err(truncated)?;
        frame.push(b);
        if b == 0 {
            return Ok(frame);
        }
        if frame.len() > MAX_COMPACT {
            return Err(CodecError::decode(Codec::Compact, "message exceeds 16 MiB limit"));
        }
    }
}

fn read_byte<R: Read + ?Sized>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, Response, WireError};

    fn transact() -> Request {
        Request::Transact {
            addr: 0x50,
            write: vec![0x10, 0x00, 0xFF],
            len: 2,
        }
    }

    #[test]
    fn roundtrip_transact_every_codec() {
        for codec in Codec::ALL {
            let mut buf = Vec::new();
            codec.encode(&mut buf, &transact()).unwrap();

            let mut cursor = io::Cursor::new(&buf);
            let decoded: Request = codec.decode(&mut cursor).unwrap();
            assert_eq!(decoded, transact(), "{codec}");
        }
    }

    #[test]
    fn consecutive_messages_share_a_stream() {
        for codec in Codec::ALL {
            let mut buf = Vec::new();
            codec.encode(&mut buf, &Request::Describe).unwrap();
            codec
                .encode(&mut buf, &Request::SetSpeed { micro_hertz: 400_000_000_000 })
                .unwrap();

            let mut cursor = io::Cursor::new(&buf);
            let a: Request = codec.decode(&mut cursor).unwrap();
            let b: Request = codec.decode(&mut cursor).unwrap();
            assert_eq!(a, Request::Describe);
            assert_eq!(b, Request::SetSpeed { micro_hertz: 400_000_000_000 });

            let end: Result<Request, _> = codec.decode(&mut cursor);
            assert!(end.unwrap_err().is_eof(), "{codec} should report clean EOF");
        }
    }

    #[test]
    fn response_variants_survive() {
        let cases = [
            Response::Describe("remote:/dev/i2c-1".into()),
            Response::Transact(vec![0x11, 0x12]),
            Response::Transact(Vec::new()),
            Response::SetSpeed,
            Response::Error(WireError::new("device did not ack")),
        ];
        for codec in Codec::ALL {
            for resp in &cases {
                let mut buf = Vec::new();
                codec.encode(&mut buf, resp).unwrap();
                let decoded: Response = codec.decode(&mut io::Cursor::new(&buf)).unwrap();
                assert_eq!(&decoded, resp, "{codec}");
            }
        }
    }

    #[test]
    fn mismatched_codecs_fail_to_decode() {
        let requests = [
            Request::Describe,
            transact(),
            Request::SetSpeed { micro_hertz: 0 },
            Request::Transact {
                addr: 0x1FF,
                write: vec![0xAB; 200],
                len: 255,
            },
        ];
        for writer in Codec::ALL {
            for reader in Codec::ALL {
                if writer == reader {
                    continue;
                }
                for req in &requests {
                    let mut buf = Vec::new();
                    writer.encode(&mut buf, req).unwrap();
                    let result: Result<Request, _> = reader.decode(&mut io::Cursor::new(&buf));
                    assert!(
                        result.is_err(),
                        "{writer} -> {reader} decoded {req:?} as {result:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_bad_binary_header() {
        let bytes = [0x80, 0x02, 0xA8];
        let result: Result<Request, _> = Codec::Binary.decode(&mut io::Cursor::new(&bytes[..]));
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    #[test]
    fn rejects_truncated_compact_frame() {
        let mut buf = Vec::new();
        Codec::Compact.encode(&mut buf, &transact()).unwrap();
        buf.pop();
        let result: Result<Request, _> = Codec::Compact.decode(&mut io::Cursor::new(&buf));
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    /// Reader that fails the test if anything past its prefix is read.
    struct Stall;

    impl Read for Stall {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            panic!("decoder read past the leading bytes");
        }
    }

    #[test]
    fn compact_rejects_foreign_codecs_from_leading_bytes() {
        for writer in [Codec::Binary, Codec::Json, Codec::SimpleJson] {
            let mut buf = Vec::new();
            writer.encode(&mut buf, &Request::Describe).unwrap();
            let head: &[u8] = &buf[..2];
            let mut r = head.chain(Stall);
            let result: Result<Request, _> = Codec::Compact.decode(&mut r);
            assert!(matches!(result, Err(CodecError::Decode { .. })), "{writer}");
        }
    }

    #[test]
    fn compact_reports_clean_eof_between_messages() {
        let result: Result<Request, _> = Codec::Compact.decode(&mut io::empty());
        assert!(result.unwrap_err().is_eof());
    }

    #[test]
    fn json_envelope_is_versioned() {
        let bytes = br#"{"v":2,"msg":"Describe"}"#;
        let result: Result<Request, _> = Codec::Json.decode(&mut io::Cursor::new(&bytes[..]));
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    #[test]
    fn parses_codec_names() {
        for codec in Codec::ALL {
            assert_eq!(codec.name().parse::<Codec>(), Ok(codec));
        }
        assert_eq!("".parse::<Codec>(), Ok(Codec::Binary));
        assert!("thrift".parse::<Codec>().is_err());
    }
}
