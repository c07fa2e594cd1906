//! Server side: the request handler and the TCP accept loop.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rbus_proto::{Codec, CodecError, MAX_ADDR, MAX_READ_LEN, Request, Response, WireError};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::Dispatch;

use crate::bus::{Bus, Frequency};
use crate::error::{Error, Result, translate};
use crate::transport::{Transport, TransportConfig};

/// Delay before retrying `accept` after a resource error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves one local bus to any number of connections.
///
/// Every call runs with the bus locked, so a transaction's write and read
/// phases never interleave with another connection's.
pub struct Handler<B> {
    bus: Mutex<B>,
}

impl<B: Bus> Handler<B> {
    /// Takes ownership of `bus` for the lifetime of the handler.
    pub fn new(bus: B) -> Self {
        Self {
            bus: Mutex::new(bus),
        }
    }

    /// Returns the bus back, consuming the handler.
    pub fn into_inner(self) -> B {
        self.bus.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the bus.
    fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bus)
    }

    /// `"remote:"` followed by the local bus description.
    pub fn describe(&self) -> std::result::Result<String, WireError> {
        let local = translate(self.with_bus(|bus| bus.describe()))?;
        let r = format!("remote:{local}");
        tracing::trace!(result = %r, "describe");
        Ok(r)
    }

    /// Writes `write` to `addr`, then reads exactly `len` bytes.
    ///
    /// On failure no bytes are returned, never a partial buffer.
    pub fn transact(
        &self,
        addr: i16,
        write: &[u8],
        len: i32,
    ) -> std::result::Result<Vec<u8>, WireError> {
        let addr = u16::try_from(addr)
            .ok()
            .filter(|&a| a <= MAX_ADDR)
            .ok_or_else(|| invalid(format!("address {addr} out of range 0..={MAX_ADDR}")))?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&l| l <= MAX_READ_LEN)
            .ok_or_else(|| invalid(format!("read length {len} out of range 0..={MAX_READ_LEN}")))?;

        let mut read = vec![0u8; len];
        translate(self.with_bus(|bus| bus.tx(addr, write, &mut read)))?;
        tracing::trace!(addr, write = %Hex(write), read = %Hex(&read), "transact");
        Ok(read)
    }

    /// Sets the bus clock from a micro-hertz count.
    pub fn set_speed(&self, micro_hertz: i64) -> std::result::Result<(), WireError> {
        let freq = Frequency::from_micro_hertz(micro_hertz);
        tracing::trace!(%freq, "set_speed");
        translate(self.with_bus(|bus| bus.set_speed(freq)))
    }

    /// Dispatches a decoded request to the matching call.
    pub fn handle(&self, req: Request) -> Response {
        let resp = match req {
            Request::Describe => self.describe().map(Response::Describe),
            Request::Transact { addr, write, len } => {
                self.transact(addr, &write, len).map(Response::Transact)
            }
            Request::SetSpeed { micro_hertz } => {
                self.set_speed(micro_hertz).map(|()| Response::SetSpeed)
            }
        };
        resp.unwrap_or_else(Response::Error)
    }
}

impl<B> fmt::Debug for Handler<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

/// Logs a rejected argument and returns it as a wire error.
fn invalid(message: String) -> WireError {
    let e = Error::Validation(message);
    tracing::warn!(error = %e, "rejected request");
    WireError::new(e.to_string())
}

/// Hex dump for logs: `10 FF 00`.
struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Transport settings the server applies to every accepted connection.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Message serialization format.
    pub codec: Codec,
    /// Socket decorators. `secure` requires `tls`.
    pub transport: TransportConfig,
    /// Certificate and key for the secure transport.
    pub tls: Option<Arc<ServerConfig>>,
}

/// TCP accept loop around a [`Handler`], one thread per connection.
pub struct Server<B> {
    handler: Arc<Handler<B>>,
    options: ServerOptions,
    /// Diagnostics sink installed on the accept loop and every worker.
    dispatch: Dispatch,
    stop: Arc<AtomicBool>,
}

impl<B: Bus + Send + 'static> Server<B> {
    /// Creates a server for `bus`, logging to the caller's current dispatcher.
    pub fn new(bus: B, options: ServerOptions) -> Result<Self> {
        if options.transport.secure && options.tls.is_none() {
            return Err(Error::Validation(
                "secure transport needs a certificate and key".into(),
            ));
        }
        Ok(Self {
            handler: Arc::new(Handler::new(bus)),
            options,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Sends the server's diagnostics to `dispatch`.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Binds `addr` and returns the listener together with a shutdown handle.
    pub fn bind(&self, addr: impl ToSocketAddrs) -> Result<(TcpListener, ShutdownHandle)> {
        let listener = TcpListener::bind(addr).map_err(Error::Connection)?;
        let local = listener.local_addr().map_err(Error::Connection)?;
        Ok((
            listener,
            ShutdownHandle {
                stop: Arc::clone(&self.stop),
                addr: local,
            },
        ))
    }

    /// Accepts connections until the listener fails or shutdown is requested.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::dispatcher::with_default(&self.dispatch, || self.accept_loop(listener))
    }

    fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().map_err(Error::Connection)?;
        tracing::info!(
            addr = %local,
            codec = %self.options.codec,
            transport = %self.options.transport,
            "listening"
        );

        loop {
            let accepted = listener.accept();
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!("shutting down");
                return Ok(());
            }
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) if listener_failed(&e) => return Err(Error::Connection(e)),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    if let Some(pause) = accept_backoff(&e) {
                        thread::sleep(pause);
                    }
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            let options = self.options.clone();
            let dispatch = self.dispatch.clone();
            let spawned = thread::Builder::new()
                .name(format!("rbus-{peer}"))
                .spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        let span = tracing::debug_span!("session", %peer);
                        let _enter = span.enter();
                        tracing::debug!("accepted");
                        match session(&handler, stream, &options) {
                            Ok(()) => tracing::debug!("disconnected"),
                            Err(e) => tracing::warn!(error = %e, "session ended"),
                        }
                    });
                });
            if let Err(e) = spawned {
                tracing::error!(%peer, error = %e, "failed to spawn session thread");
            }
        }
    }
}

impl<B> fmt::Debug for Server<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("stopping", &self.stop.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Returns `true` when an `accept` error means the listening socket itself
/// is unusable. Everything else concerns a single pending connection or a
/// temporary shortage of resources.
fn listener_failed(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::InvalidInput {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EBADF | libc::ENOTSOCK)) {
        return true;
    }
    false
}

/// Pause before retrying `accept`, so descriptor or memory exhaustion does
/// not turn the loop into a busy spin.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Stops a running [`Server::serve`] loop from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    /// Address the listener is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Asks the accept loop to return. Sessions already running finish on
    /// their own when their client disconnects.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept so it sees the flag.
        let _ = TcpStream::connect(self.addr);
    }
}

/// Serves one connection: decode, handle, encode, until clean EOF.
fn session<B: Bus>(
    handler: &Handler<B>,
    stream: TcpStream,
    options: &ServerOptions,
) -> std::result::Result<(), CodecError> {
    stream.set_nodelay(true)?;
    let socket: Box<dyn Transport> = match (&options.tls, options.transport.secure) {
        (Some(config), true) => {
            let conn = ServerConnection::new(Arc::clone(config)).map_err(io::Error::other)?;
            let mut tls = StreamOwned::new(conn, stream);
            while tls.conn.is_handshaking() {
                tls.conn.complete_io(&mut tls.sock)?;
            }
            Box::new(tls)
        }
        _ => Box::new(stream),
    };
    let mut transport = options.transport.wrap(socket);
    let codec = options.codec;

    loop {
        let req: Request = match codec.decode(&mut transport) {
            Ok(req) => req,
            // Clean disconnect.
            Err(e) if e.is_eof() => break,
            Err(e) => {
                let _ = transport.close();
                return Err(e);
            }
        };
        let resp = handler.handle(req);
        codec.encode(&mut transport, &resp)?;
    }
    let _ = transport.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus that echoes `write[0] + 1 + i` for each read byte.
    #[derive(Debug, Default)]
    struct Echo {
        speed: Option<Frequency>,
        fail: bool,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("device at {0:#x} did not acknowledge")]
    struct Nack(u16);

    impl Bus for Echo {
        type Error = Nack;

        fn describe(&self) -> std::result::Result<String, Nack> {
            Ok("echo".into())
        }

        fn tx(
            &mut self,
            addr: u16,
            write: &[u8],
            read: &mut [u8],
        ) -> std::result::Result<(), Nack> {
            if self.fail {
                read.fill(0xEE);
                return Err(Nack(addr));
            }
            let base = write.first().copied().unwrap_or(0);
            for (i, b) in read.iter_mut().enumerate() {
                *b = base.wrapping_add(1).wrapping_add(i as u8);
            }
            Ok(())
        }

        fn set_speed(&mut self, freq: Frequency) -> std::result::Result<(), Nack> {
            self.speed = Some(freq);
            Ok(())
        }
    }

    #[test]
    fn describe_is_prefixed() {
        let h = Handler::new(Echo::default());
        assert_eq!(h.describe().unwrap(), "remote:echo");
    }

    #[test]
    fn transact_returns_exactly_len_bytes() {
        let h = Handler::new(Echo::default());
        for len in [0, 1, 2, 255] {
            assert_eq!(h.transact(0x50, &[0x10], len).unwrap().len(), len as usize);
        }
        assert_eq!(h.transact(0x50, &[0x10], 2).unwrap(), [0x11, 0x12]);
    }

    #[test]
    fn failed_transact_returns_no_bytes() {
        let h = Handler::new(Echo {
            fail: true,
            ..Echo::default()
        });
        let resp = h.handle(Request::Transact {
            addr: 0x50,
            write: vec![1],
            len: 4,
        });
        assert_eq!(
            resp,
            Response::Error(WireError::new("device at 0x50 did not acknowledge"))
        );
    }

    #[test]
    fn rejects_out_of_range_arguments() {
        let h = Handler::new(Echo::default());
        assert!(h.transact(-1, &[], 1).is_err());
        assert!(h.transact(0x200, &[], 1).is_err());
        assert!(h.transact(0x50, &[], -1).is_err());
        assert!(h.transact(0x50, &[], 256).is_err());
    }

    #[test]
    fn set_speed_converts_micro_hertz() {
        let h = Handler::new(Echo::default());
        assert_eq!(
            h.handle(Request::SetSpeed {
                micro_hertz: 400_000_000_000
            }),
            Response::SetSpeed
        );
        assert_eq!(h.into_inner().speed, Frequency::from_hz(400_000));
    }

    #[test]
    fn hex_formats_bytes() {
        assert_eq!(Hex(&[0x10, 0xFF, 0x00]).to_string(), "10 FF 00");
        assert_eq!(Hex(&[]).to_string(), "");
    }

    #[test]
    fn per_connection_accept_errors_keep_serving() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::OutOfMemory,
        ] {
            assert!(!listener_failed(&kind.into()), "{kind:?}");
        }
        assert!(accept_backoff(&io::ErrorKind::ConnectionAborted.into()).is_none());
        assert_eq!(
            accept_backoff(&io::ErrorKind::OutOfMemory.into()),
            Some(ACCEPT_BACKOFF)
        );
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_not_fatal() {
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(!listener_failed(&emfile));
        assert_eq!(accept_backoff(&emfile), Some(ACCEPT_BACKOFF));
        assert!(listener_failed(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(listener_failed(&io::ErrorKind::InvalidInput.into()));
    }

    #[test]
    fn secure_without_certificate_is_rejected() {
        let options = ServerOptions {
            transport: TransportConfig {
                secure: true,
                ..TransportConfig::default()
            },
            ..ServerOptions::default()
        };
        assert!(matches!(
            Server::new(Echo::default(), options),
            Err(Error::Validation(_))
        ));
    }
}
