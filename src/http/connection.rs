/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::{Read, Write, ErrorKind};

use log::trace;

use crate::error::{Error, Result};
use crate::http::{HttpMessage, MessageProgress, MessageReader, MessageWriter, Reply, Request};

const READ_CHUNK: usize = 8192;

/// Blocking HTTP message exchange over any byte stream
///
/// Works on a [`TcpSocket`](crate::net::TcpSocket) (honoring its timeout)
/// as well as on an SSL [`StreamBuffer`](crate::ssl::StreamBuffer). Bytes
/// received beyond the end of a message are kept for the next one.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    input: Vec<u8>,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            input: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Received bytes that have not been parsed yet.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    pub(crate) fn clear_input(&mut self) {
        self.input.clear();
    }

    /// Runs the parser over the buffered input.
    pub(crate) fn parse<M: HttpMessage>(&mut self, reader: &mut MessageReader, message: &mut M) -> Result<MessageProgress> {
        let (consumed, progress) = reader.advance(&self.input, message.message_mut())?;
        self.input.drain(..consumed);
        Ok(progress)
    }
}

impl<S: Read + Write> Connection<S> {
    /// Sends a complete message.
    pub fn send<M: HttpMessage>(&mut self, message: &mut M) -> Result<()> {
        let mut writer = MessageWriter::new();
        let mut out = Vec::new();
        writer.advance(message, true, &mut out)?;
        trace!("Sending message of {} byte(s)", out.len());
        self.stream.write_all(&out)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Sends a request with its complete body.
    pub fn send_request(&mut self, request: &mut Request) -> Result<()> {
        self.send(request)
    }

    /// Sends a reply with its complete body.
    pub fn send_reply(&mut self, reply: &mut Reply) -> Result<()> {
        self.send(reply)
    }

    /// Receives one message; returns `false` if the stream ended before the
    /// first byte of the message.
    pub fn receive<M: HttpMessage>(&mut self, reader: &mut MessageReader, message: &mut M) -> Result<bool> {
        loop {
            if !self.input.is_empty() && self.parse(reader, message)?.finished() {
                return Ok(true);
            }
            if reader.is_finished() {
                return Ok(true);
            }
            if self.fill()? == 0 {
                if !reader.is_started() {
                    message.message_mut().stop(false);
                    return Ok(false);
                }
                reader.finish_eof(message.message_mut())?;
                return Ok(true);
            }
        }
    }

    /// Receives the next request; returns `false` on a clean end of stream.
    pub fn receive_request(&mut self, request: &mut Request) -> Result<bool> {
        let mut reader = MessageReader::requests();
        request.clear();
        if !self.receive(&mut reader, request)? {
            return Ok(false);
        }
        if let Some(start) = reader.start_line() {
            start.apply_to_request(request);
        }
        Ok(true)
    }

    /// Receives the final reply; interim (1xx) replies are skipped.
    pub fn receive_reply(&mut self, reply: &mut Reply) -> Result<()> {
        self.receive_reply_for(reply, false)
    }

    /// Like [`receive_reply()`](Connection::receive_reply()), for a request
    /// whose reply has no body (`HEAD`).
    pub fn receive_reply_for(&mut self, reply: &mut Reply, bodyless: bool) -> Result<()> {
        loop {
            let mut reader = MessageReader::replies();
            reader.set_bodyless(bodyless);
            reply.clear();
            if !self.receive(&mut reader, reply)? {
                return Err(Error::Incomplete);
            }
            if let Some(start) = reader.start_line() {
                start.apply_to_reply(reply);
            }
            if !reply.is_informational() {
                return Ok(());
            }
            trace!("Skipping interim reply {}", reply.status());
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(count) => {
                    self.input.extend_from_slice(&buffer[..count]);
                    return Ok(count);
                },
                Err(error) if error.kind() == ErrorKind::Interrupted => (),
                Err(error) => return Err(unwrap_error(error)),
            }
        }
    }
}

/// Recovers the typed error from an I/O error created by this crate.
fn unwrap_error(error: std::io::Error) -> Error {
    match error.get_ref().map(|inner| inner.is::<Error>()) {
        Some(true) => match error.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Incomplete,
        },
        _ => Error::Io(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let count = buf.len().min(7);
            self.input.read(&mut buf[..count])
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn duplex(input: &[u8]) -> Connection<Duplex> {
        Connection::new(Duplex {
            input: Cursor::new(input.to_vec()),
            output: Vec::new(),
        })
    }

    #[test]
    fn pipelined_requests() {
        let mut connection = duplex(b"GET /one HTTP/1.1\r\n\r\nPOST /two?x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        let mut request = Request::default();

        assert!(connection.receive_request(&mut request).expect("Failed to receive!"));
        assert_eq!((request.method(), request.url()), ("GET", "/one"));

        assert!(connection.receive_request(&mut request).expect("Failed to receive!"));
        assert_eq!((request.method(), request.url(), request.query()), ("POST", "/two", "x"));
        assert_eq!(request.body().as_slice(), b"abc");

        assert!(!connection.receive_request(&mut request).expect("Failed to receive!"));
    }

    #[test]
    fn skips_interim_reply() {
        let mut connection = duplex(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\ngone");
        let mut reply = Reply::default();
        connection.receive_reply(&mut reply).expect("Failed to receive!");
        assert_eq!(reply.status(), 404);
        assert_eq!(reply.reason(), "Not Found");
        assert_eq!(reply.body().as_slice(), b"gone");
    }

    #[test]
    fn truncated_reply() {
        let mut connection = duplex(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        let mut reply = Reply::default();
        assert!(matches!(connection.receive_reply(&mut reply), Err(Error::Incomplete)));
    }

    #[test]
    fn sends_complete_request() {
        let mut connection = duplex(b"");
        let mut request = Request::with_method("POST", "/submit");
        request.body_mut().extend(b"payload");
        connection.send_request(&mut request).expect("Failed to send!");
        assert_eq!(connection.get_ref().output, b"POST /submit HTTP/1.1\r\nContent-Length: 7\r\n\r\npayload");
    }
}
