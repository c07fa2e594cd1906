//! Client side: dialing a server and the remote bus stub.
//!
//! [`RemoteBus`] forwards every call over one connection and blocks for the
//! reply. The protocol has no request ids, so calls are serialized on the
//! connection: a second caller waits until the first call has its response.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rbus_proto::{Codec, Request, Response};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConnection, StreamOwned};

use crate::bus::{self, Bus, Frequency};
use crate::error::{Error, Result};
use crate::tls;
use crate::transport::{Transport, TransportConfig};

/// Default bound on the TCP connect step.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How to reach and talk to a server. Must mirror the server's settings.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Message serialization format.
    pub codec: Codec,
    /// Socket decorators.
    pub transport: TransportConfig,
    /// Trust roots for the server certificate. `None` skips verification.
    pub tls_roots: Option<Vec<CertificateDer<'static>>>,
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Read/write deadline on the socket. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            transport: TransportConfig::default(),
            tls_roots: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: None,
        }
    }
}

/// Connects with the binary codec over plain TCP.
pub fn dial_defaults(addr: &str) -> Result<RemoteBus> {
    dial(addr, &DialOptions::default())
}

/// Connects to the server at `addr` (`host:port`).
///
/// Makes a single attempt: any failure while connecting, wrapping the
/// socket or completing the TLS handshake is returned as
/// [`Error::Connection`].
pub fn dial(addr: &str, opts: &DialOptions) -> Result<RemoteBus> {
    let stream = connect(addr, opts.connect_timeout)?;
    stream.set_nodelay(true).map_err(Error::Connection)?;
    stream
        .set_read_timeout(opts.io_timeout)
        .map_err(Error::Connection)?;
    stream
        .set_write_timeout(opts.io_timeout)
        .map_err(Error::Connection)?;

    let socket: Box<dyn Transport> = if opts.transport.secure {
        if opts.tls_roots.is_none() {
            tracing::warn!(%addr, "TLS certificate verification is disabled");
        }
        let config = tls::client_config(opts.tls_roots.as_deref())?;
        let conn = ClientConnection::new(config, tls::server_name(addr)?)?;
        let mut tls = StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(Error::Connection)?;
        }
        Box::new(tls)
    } else {
        Box::new(stream)
    };

    tracing::debug!(%addr, codec = %opts.codec, transport = %opts.transport, "connected");
    Ok(RemoteBus::new(
        opts.transport.wrap(socket),
        opts.codec,
        addr.to_owned(),
    ))
}

/// Tries each resolved address once, in order.
fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last = None;
    for sa in addr.to_socket_addrs().map_err(Error::Connection)? {
        match TcpStream::connect_timeout(&sa, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(Error::Connection(last.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{addr} resolved to no addresses"),
        )
    })))
}

/// The transport and codec of an open connection.
struct Conn {
    transport: Box<dyn Transport>,
    codec: Codec,
}

/// A bus on another machine, reached through a server.
///
/// Safe to share between threads; calls are serialized on the connection.
pub struct RemoteBus {
    /// `None` once closed.
    conn: Mutex<Option<Conn>>,
    /// Address the stub was dialed with.
    peer: String,
}

impl RemoteBus {
    /// Wraps an already-open transport.
    pub fn new(transport: Box<dyn Transport>, codec: Codec, peer: String) -> Self {
        Self {
            conn: Mutex::new(Some(Conn { transport, codec })),
            peer,
        }
    }

    /// Address of the server.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the server's description of its bus, prefixed `remote:`.
    pub fn describe(&self) -> Result<String> {
        self.send_expect(&Request::Describe, |r| match r {
            Response::Describe(s) => Ok(s),
            other => Err(other),
        })
    }

    /// Writes `write` to `addr`, then reads `read.len()` bytes back.
    ///
    /// Only as many bytes as `read` can hold are copied in, even if the
    /// server returns more. An empty write with an empty read does nothing.
    pub fn tx(&self, addr: u16, write: &[u8], read: &mut [u8]) -> Result<()> {
        bus::check_addr(addr)?;
        bus::check_read_len(read.len())?;
        if write.is_empty() && read.is_empty() {
            return Ok(());
        }
        let req = Request::Transact {
            addr: i16::try_from(addr).map_err(|e| Error::Validation(e.to_string()))?,
            write: write.to_vec(),
            len: i32::try_from(read.len()).map_err(|e| Error::Validation(e.to_string()))?,
        };
        let data = self.send_expect(&req, |r| match r {
            Response::Transact(data) => Ok(data),
            other => Err(other),
        })?;
        let n = read.len().min(data.len());
        read[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    /// Changes the remote bus clock.
    pub fn set_speed(&self, freq: Frequency) -> Result<()> {
        if freq.as_micro_hertz() < 0 {
            return Err(Error::Validation(format!("negative frequency {freq}")));
        }
        self.send_expect(
            &Request::SetSpeed {
                micro_hertz: freq.as_micro_hertz(),
            },
            |r| match r {
                Response::SetSpeed => Ok(()),
                other => Err(other),
            },
        )
    }

    /// Closes the connection.
    ///
    /// Closing an already-closed stub is a no-op and returns `Ok(())`.
    pub fn close(&self) -> Result<()> {
        let taken = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(mut conn) => {
                tracing::debug!(peer = %self.peer, "closing");
                conn.transport.close().map_err(Error::Connection)
            }
            None => Ok(()),
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Sends `req` and maps the reply through `pick`.
    ///
    /// The lock is held from encode to decode so replies cannot be handed
    /// to the wrong caller. A failed round trip leaves the stream at an
    /// unknown position, so the connection is closed and later calls
    /// return [`Error::Closed`].
    fn send_expect<T>(
        &self,
        req: &Request,
        pick: impl FnOnce(Response) -> std::result::Result<T, Response>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(Error::Closed)?;
        let sent = conn
            .codec
            .encode(&mut conn.transport, req)
            .and_then(|()| conn.codec.decode::<Response, _>(&mut conn.transport));
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(mut dead) = guard.take() {
                    tracing::warn!(
                        peer = %self.peer,
                        call = req.name(),
                        error = %e,
                        "round trip failed, dropping connection"
                    );
                    let _ = dead.transport.close();
                }
                return Err(e.into());
            }
        };
        drop(guard);

        match pick(resp) {
            Ok(v) => Ok(v),
            Err(Response::Error(e)) => Err(e.into()),
            Err(other) => Err(Error::Protocol(format!(
                "unexpected response to {}: {other:?}",
                req.name()
            ))),
        }
    }
}

impl fmt::Debug for RemoteBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBus")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        let conn = self.conn.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut conn) = conn.take() {
            let _ = conn.transport.close();
        }
    }
}

impl Bus for RemoteBus {
    type Error = Error;

    fn describe(&self) -> Result<String> {
        Self::describe(self)
    }

    fn tx(&mut self, addr: u16, write: &[u8], read: &mut [u8]) -> Result<()> {
        Self::tx(self, addr, write, read)
    }

    fn set_speed(&mut self, freq: Frequency) -> Result<()> {
        Self::set_speed(self, freq)
    }
}
