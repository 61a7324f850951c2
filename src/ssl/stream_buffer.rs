/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::{BufRead, Read, Write, Result as IoResult};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::ssl::SslConnection;

/// Size of the look-back region kept in front of the get area.
pub const PUTBACK: usize = 4;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A buffered plain byte stream over an [`SslConnection`]
///
/// The get and put areas are allocated on first use and sized
/// independently. Each refill of the get area keeps the last
/// [`PUTBACK`] consumed bytes in front of the new data, so that up to four
/// bytes can be [`unget()`](StreamBuffer::unget())ed at any time. The
/// opening handshake is driven on first use.
///
/// Check [`is_shutdown()`](StreamBuffer::is_shutdown()) before
/// [`is_closed()`](StreamBuffer::is_closed()) when a read returns no data:
/// the former means the peer asked to close, the latter that the transport
/// is gone.
pub struct StreamBuffer<C> {
    connection: C,
    get: Vec<u8>,
    get_begin: usize,
    get_pos: usize,
    get_end: usize,
    get_size: usize,
    put: Vec<u8>,
    put_size: usize,
    shutdown_done: bool,
}

impl<C: SslConnection> StreamBuffer<C> {
    pub fn new(connection: C) -> Self {
        Self::with_sizes(connection, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_sizes(connection: C, get_size: usize, put_size: usize) -> Self {
        Self {
            connection,
            get: Vec::new(),
            get_begin: PUTBACK,
            get_pos: PUTBACK,
            get_end: PUTBACK,
            get_size: get_size.max(1),
            put: Vec::new(),
            put_size: put_size.max(1),
            shutdown_done: false,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn into_inner(self) -> C {
        self.connection
    }

    /// Bytes that can be read without touching the connection.
    pub fn available(&self) -> usize {
        self.get_end - self.get_pos
    }

    fn handshake(&mut self) -> Result<()> {
        while !self.connection.is_connected() {
            if self.connection.handshake()? {
                debug!("SSL handshake completed");
                break;
            }
        }
        Ok(())
    }

    /// Pulls at most `max_import` decrypted bytes into the get area; returns
    /// the number of bytes imported, `0` at the end of the session or when
    /// the get area is already full. Unread bytes and the putback region are
    /// moved to the front of the buffer first.
    pub fn import(&mut self, max_import: usize) -> Result<usize> {
        self.handshake()?;
        if self.get.is_empty() {
            self.get = vec![0u8; PUTBACK + self.get_size];
        }

        let unread = self.get_end - self.get_pos;
        let keep = (self.get_pos - self.get_begin).min(PUTBACK);
        self.get.copy_within(self.get_pos - keep..self.get_end, PUTBACK - keep);
        self.get_begin = PUTBACK - keep;
        self.get_pos = PUTBACK;
        self.get_end = PUTBACK + unread;

        let limit = max_import.min(self.get_size - unread);
        if limit == 0 {
            return Ok(0);
        }
        let count = self.connection.read(&mut self.get[self.get_end..self.get_end + limit])?;
        trace!("Imported {} byte(s)", count);
        self.get_end += count;
        Ok(count)
    }

    /// Steps back one byte in the get area; returns `false` if the putback
    /// region is exhausted.
    pub fn unget(&mut self) -> bool {
        match self.get_pos > self.get_begin {
            true => {
                self.get_pos -= 1;
                true
            },
            false => false,
        }
    }

    /// Makes room in the put area. The put area is allocated on the first
    /// call; later calls send the buffered data through the connection and
    /// keep whatever was not accepted. `Some(byte)` is appended afterwards,
    /// `None` forces the buffer to be flushed completely.
    pub fn overflow(&mut self, byte: Option<u8>) -> Result<()> {
        self.handshake()?;
        if self.put.capacity() == 0 {
            self.put = Vec::with_capacity(self.put_size);
        } else {
            match byte {
                Some(_) => {
                    while self.put.len() >= self.put_size {
                        self.send_some()?;
                    }
                },
                None => self.sync()?,
            }
        }
        if let Some(byte) = byte {
            self.put.push(byte);
        }
        Ok(())
    }

    fn send_some(&mut self) -> Result<usize> {
        let count = self.connection.write(&self.put)?;
        if count == 0 {
            return Err(Error::Incomplete);
        }
        self.put.drain(..count);
        Ok(count)
    }

    /// Sends all buffered output.
    pub fn sync(&mut self) -> Result<()> {
        while !self.put.is_empty() {
            self.send_some()?;
        }
        Ok(())
    }

    /// Flushes pending output, then performs the close-notify handshake;
    /// returns `true` once it has completed. Calling it again after
    /// completion, or after [`release()`](StreamBuffer::release()), is
    /// harmless.
    pub fn shutdown(&mut self) -> Result<bool> {
        if self.shutdown_done {
            return Ok(true);
        }
        if self.connection.is_connected() {
            self.sync()?;
        }
        if self.connection.shutdown()? {
            debug!("SSL shutdown completed");
            self.shutdown_done = true;
        }
        Ok(self.shutdown_done)
    }

    /// Frees both buffers; unread input and unsent output are dropped.
    pub fn release(&mut self) {
        self.get = Vec::new();
        self.put = Vec::new();
        self.get_begin = PUTBACK;
        self.get_pos = PUTBACK;
        self.get_end = PUTBACK;
    }

    pub fn is_shutdown(&self) -> bool {
        self.connection.is_shutdown()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

impl<C: SslConnection> Read for StreamBuffer<C> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let available = self.fill_buf()?;
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.consume(count);
        Ok(count)
    }
}

impl<C: SslConnection> BufRead for StreamBuffer<C> {
    fn fill_buf(&mut self) -> IoResult<&[u8]> {
        if self.get_pos >= self.get_end {
            self.import(self.get_size)?;
        }
        Ok(&self.get[self.get_pos..self.get_end])
    }

    fn consume(&mut self, amt: usize) {
        self.get_pos = (self.get_pos + amt).min(self.get_end);
    }
}

impl<C: SslConnection> Write for StreamBuffer<C> {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.put.capacity() == 0 || self.put.len() >= self.put_size {
            self.overflow(Some(buf[0]))?;
            return Ok(1);
        }
        let count = (self.put_size - self.put.len()).min(buf.len());
        self.put.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(self.overflow(None)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MemoryConnection {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        handshake_steps: usize,
        connected: bool,
        max_write: usize,
        shutdown_calls: usize,
        peer_closed: bool,
    }

    impl SslConnection for MemoryConnection {
        fn handshake(&mut self) -> Result<bool> {
            self.handshake_steps += 1;
            self.connected = self.handshake_steps >= 2;
            Ok(self.connected)
        }

        fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
            let count = buffer.len().min(self.inbound.len());
            for (slot, byte) in buffer.iter_mut().zip(self.inbound.drain(..count)) {
                *slot = byte;
            }
            if count == 0 {
                self.peer_closed = true;
            }
            Ok(count)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            let count = data.len().min(self.max_write.max(1));
            self.outbound.extend_from_slice(&data[..count]);
            Ok(count)
        }

        fn shutdown(&mut self) -> Result<bool> {
            self.shutdown_calls += 1;
            Ok(true)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_shutdown(&self) -> bool {
            self.peer_closed
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn with_input(data: &[u8]) -> MemoryConnection {
        MemoryConnection {
            inbound: data.iter().copied().collect(),
            max_write: usize::MAX,
            ..MemoryConnection::default()
        }
    }

    #[test]
    fn handshake_runs_on_first_read() {
        let mut stream = StreamBuffer::with_sizes(with_input(b"hello"), 16, 16);
        let mut text = String::new();
        stream.read_to_string(&mut text).expect("Failed to read!");
        assert_eq!(text, "hello");
        assert_eq!(stream.connection().handshake_steps, 2);
        assert!(stream.is_shutdown());
        assert!(!stream.is_closed());
    }

    #[test]
    fn putback_survives_refill() {
        let mut stream = StreamBuffer::with_sizes(with_input(b"abcdefgh"), 6, 16);
        let mut first = [0u8; 6];
        stream.read_exact(&mut first).expect("Failed to read!");
        assert_eq!(stream.import(6).expect("Failed to import!"), 2);

        assert!(stream.unget());
        assert!(stream.unget());
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).expect("Failed to read!");
        assert_eq!(rest, b"efgh");
    }

    #[test]
    fn import_keeps_unread_bytes() {
        let mut stream = StreamBuffer::with_sizes(with_input(b"abcdefgh"), 4, 16);
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).expect("Failed to read!");
        assert_eq!(stream.available(), 3);

        assert_eq!(stream.import(4).expect("Failed to import!"), 1);
        assert_eq!(stream.available(), 4);
        assert_eq!(stream.import(4).expect("Failed to import!"), 0);

        assert!(stream.unget());
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).expect("Failed to read!");
        assert_eq!(&first, b"a");
        assert_eq!(rest, b"abcdefgh");
    }

    #[test]
    fn putback_is_limited() {
        let mut stream = StreamBuffer::with_sizes(with_input(b"abcdefgh"), 8, 16);
        let mut all = [0u8; 8];
        stream.read_exact(&mut all).expect("Failed to read!");
        stream.import(8).expect("Failed to import!");
        for _ in 0..PUTBACK {
            assert!(stream.unget());
        }
        assert!(!stream.unget());
        assert_eq!(stream.available(), PUTBACK);
    }

    #[test]
    fn partial_writes_keep_leftover() {
        let mut connection = with_input(b"");
        connection.max_write = 3;
        let mut stream = StreamBuffer::with_sizes(connection, 16, 4);
        stream.write_all(b"0123456789").expect("Failed to write!");
        stream.flush().expect("Failed to flush!");
        assert_eq!(stream.connection().outbound, b"0123456789");
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut stream = StreamBuffer::new(with_input(b""));
        stream.write_all(b"bye").expect("Failed to write!");
        assert!(stream.shutdown().expect("Failed to shut down!"));
        stream.release();
        assert!(stream.shutdown().expect("Failed to shut down!"));
        assert_eq!(stream.connection().shutdown_calls, 1);
        assert_eq!(stream.connection().outbound, b"bye");
    }

    #[test]
    fn no_tls_always_fails() {
        let mut stream = StreamBuffer::new(crate::ssl::NoTlsConnection);
        let mut buffer = [0u8; 4];
        assert!(stream.read(&mut buffer).is_err());
        assert!(stream.shutdown().is_err());
        assert!(stream.is_closed());
    }
}
