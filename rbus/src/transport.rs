//! Transport decorators composed beneath the codec.
//!
//! The stack is built bottom-up from a TCP or TLS socket: an optional
//! buffering layer, then an optional length-prefix framing layer. Both
//! ends must use the same [`TransportConfig`]; nothing is negotiated.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};

use rustls::{ClientConnection, ServerConnection, StreamOwned};

/// Read chunk and write batch size of the buffering layer.
pub const BUFFER_SIZE: usize = 8192;

/// Maximum allowed frame payload (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// A bidirectional byte stream that can be closed explicitly.
pub trait Transport: Read + Write + Send {
    /// Flushes pending output and shuts the stream down.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for StreamOwned<ClientConnection, TcpStream> {
    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        // The peer may already be gone; the shutdown below still matters.
        let _ = self.conn.complete_io(&mut self.sock);
        self.sock.shutdown(Shutdown::Both)
    }
}

impl Transport for StreamOwned<ServerConnection, TcpStream> {
    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.conn.complete_io(&mut self.sock);
        self.sock.shutdown(Shutdown::Both)
    }
}

/// Which decorators wrap the socket. All combinations are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportConfig {
    /// Use TLS over TCP.
    pub secure: bool,
    /// Batch reads and writes through an 8 KiB buffer.
    pub buffered: bool,
    /// Prefix every message with its `u32` big-endian length.
    pub framed: bool,
}

impl TransportConfig {
    /// Applies the buffering and framing layers on top of `socket`.
    ///
    /// TLS is applied by the caller, since it differs between client and
    /// server.
    pub fn wrap(self, socket: Box<dyn Transport>) -> Box<dyn Transport> {
        let mut t = socket;
        if self.buffered {
            t = Box::new(Buffered::new(t));
        }
        if self.framed {
            t = Box::new(Framed::new(t));
        }
        t
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "tls" } else { "tcp" })?;
        if self.buffered {
            f.write_str("+buffered")?;
        }
        if self.framed {
            f.write_str("+framed")?;
        }
        Ok(())
    }
}

/// Buffers reads in fixed chunks and holds writes until flushed.
pub struct Buffered<T: Transport> {
    /// Read side; the inner transport is reached through `get_mut`.
    inner: BufReader<T>,
    /// Pending output.
    wbuf: Vec<u8>,
}

impl<T: Transport> Buffered<T> {
    /// Wraps `inner` with [`BUFFER_SIZE`] buffers.
    pub fn new(inner: T) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_SIZE, inner),
            wbuf: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        if !self.wbuf.is_empty() {
            self.inner.get_mut().write_all(&self.wbuf)?;
            self.wbuf.clear();
        }
        Ok(())
    }
}

impl<T: Transport> fmt::Debug for Buffered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffered")
            .field("buffered_in", &self.inner.buffer().len())
            .field("pending_out", &self.wbuf.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Read for Buffered<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Transport> Write for Buffered<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.wbuf.len() + buf.len() > BUFFER_SIZE {
            self.drain()?;
        }
        if buf.len() >= BUFFER_SIZE {
            return self.inner.get_mut().write(buf);
        }
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.get_mut().flush()
    }
}

impl<T: Transport> Transport for Buffered<T> {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.inner.get_mut().close()
    }
}

/// Length-prefixed framing: each flush emits `[u32 BE length][payload]`.
///
/// Reads consume whole frames and hand their bytes out in order.
pub struct Framed<T: Transport> {
    inner: T,
    /// Payload of the frame being written.
    wbuf: Vec<u8>,
    /// Payload of the frame being read.
    rbuf: Vec<u8>,
    /// Read position within `rbuf`.
    rpos: usize,
}

impl<T: Transport> Framed<T> {
    /// Wraps `inner` with length-prefix framing.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            wbuf: Vec::new(),
            rbuf: Vec::new(),
            rpos: 0,
        }
    }

    /// Loads the next non-empty frame. Returns `false` on clean EOF.
    fn next_frame(&mut self) -> io::Result<bool> {
        loop {
            let mut header = [0u8; 4];
            // Only an EOF before the first header byte is clean.
            match self.inner.read_exact(&mut header[..1]) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
            self.inner.read_exact(&mut header[1..])?;
            let len = u32::from_be_bytes(header);
            if len > MAX_FRAME {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds 16 MiB limit"),
                ));
            }
            self.rbuf.resize(len as usize, 0);
            self.inner.read_exact(&mut self.rbuf)?;
            self.rpos = 0;
            if len > 0 {
                return Ok(true);
            }
        }
    }
}

impl<T: Transport> fmt::Debug for Framed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framed")
            .field("pending_out", &self.wbuf.len())
            .field("unread_in", &(self.rbuf.len() - self.rpos))
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Read for Framed<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rpos == self.rbuf.len() && !self.next_frame()? {
            return Ok(0);
        }
        let n = buf.len().min(self.rbuf.len() - self.rpos);
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }
}

impl<T: Transport> Write for Framed<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.wbuf.is_empty() {
            let len = u32::try_from(self.wbuf.len())
                .ok()
                .filter(|&len| len <= MAX_FRAME)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit")
                })?;
            let mut frame = Vec::with_capacity(4 + self.wbuf.len());
            frame.extend_from_slice(&len.to_be_bytes());
            frame.append(&mut self.wbuf);
            self.inner.write_all(&frame)?;
        }
        self.inner.flush()
    }
}

impl<T: Transport> Transport for Framed<T> {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory transport: reads from `input`, records writes and flushes.
    #[derive(Default)]
    struct Pipe {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
        writes: usize,
        flushes: usize,
        closed: bool,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    impl Transport for Pipe {
        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn framed_prefixes_each_flush() {
        let mut t = Framed::new(Pipe::default());
        t.write_all(b"ab").unwrap();
        t.write_all(b"c").unwrap();
        t.flush().unwrap();
        t.flush().unwrap();
        assert_eq!(t.inner.output, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn framed_reads_across_frames() {
        let pipe = Pipe {
            input: io::Cursor::new(vec![0, 0, 0, 2, 1, 2, 0, 0, 0, 0, 0, 0, 0, 1, 3]),
            ..Pipe::default()
        };
        let mut t = Framed::new(pipe);
        let mut out = Vec::new();
        t.read_to_end(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn framed_rejects_oversized_frame() {
        let pipe = Pipe {
            input: io::Cursor::new((32u32 * 1024 * 1024).to_be_bytes().to_vec()),
            ..Pipe::default()
        };
        let mut t = Framed::new(pipe);
        let err = t.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn framed_reports_truncated_payload() {
        let pipe = Pipe {
            input: io::Cursor::new(vec![0, 0, 0, 4, 1, 2]),
            ..Pipe::default()
        };
        let mut t = Framed::new(pipe);
        let err = t.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn framed_eof_inside_header_is_not_clean() {
        for cut in 1..4 {
            let pipe = Pipe {
                input: io::Cursor::new(vec![0; cut]),
                ..Pipe::default()
            };
            let mut t = Framed::new(pipe);
            let err = t.read(&mut [0u8; 8]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof, "cut after {cut}");
        }

        let mut t = Framed::new(Pipe::default());
        assert_eq!(t.read(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn buffered_batches_writes_until_flush() {
        let mut t = Buffered::new(Pipe::default());
        for b in 0..10u8 {
            t.write_all(&[b]).unwrap();
        }
        assert!(t.inner.get_ref().output.is_empty());
        t.flush().unwrap();
        let pipe = t.inner.get_ref();
        assert_eq!(pipe.output, (0..10).collect::<Vec<u8>>());
        assert_eq!(pipe.writes, 1);
        assert_eq!(pipe.flushes, 1);
    }

    #[test]
    fn close_flushes_through_the_stack() {
        let mut t = Framed::new(Buffered::new(Pipe::default()));
        t.write_all(b"xy").unwrap();
        t.close().unwrap();
        let pipe = t.inner.inner.get_ref();
        assert!(pipe.closed);
        assert_eq!(pipe.output, [0, 0, 0, 2, b'x', b'y']);
    }

    #[test]
    fn displays_layers() {
        let cfg = TransportConfig {
            secure: true,
            buffered: true,
            framed: true,
        };
        assert_eq!(cfg.to_string(), "tls+buffered+framed");
        assert_eq!(TransportConfig::default().to_string(), "tcp");
    }
}
