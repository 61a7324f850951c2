/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::Write;

use log::trace;

use crate::error::{Error, Result};
use crate::http::{HttpMessage, Message, MessageHeader, MessageProgress, Reply, Request};

/// Longest start, header, chunk-size or trailer line accepted.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Which start line a [`MessageReader`] expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
}

/// A parsed start line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, target: String },
    Reply { status: u16, reason: String },
}

impl StartLine {
    pub(crate) fn apply_to_request(&self, request: &mut Request) {
        if let Self::Request { method, target } = self {
            request.set_method(method);
            request.set_target(target);
        }
    }

    pub(crate) fn apply_to_reply(&self, reply: &mut Reply) {
        if let Self::Reply { status, reason } = self {
            reply.set_status_with_reason(*status, reason);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    StartLine,
    Header,
    Length(usize),
    UntilClose,
    ChunkSize,
    ChunkData(usize),
    ChunkEnd,
    Trailer,
    Finished,
}

/// Incremental HTTP/1.x message parser
///
/// Bytes are fed with [`advance()`](MessageReader::advance()) in pieces of
/// any size. The header fields go into the message header; the decoded body
/// is appended to the message body. Parsing stops at the end of the message,
/// so bytes of a pipelined follow-up message are left unconsumed.
#[derive(Debug)]
pub struct MessageReader {
    kind: MessageKind,
    state: ReadState,
    line: Vec<u8>,
    start: Option<StartLine>,
    bodyless: bool,
}

impl MessageReader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            state: ReadState::StartLine,
            line: Vec::new(),
            start: None,
            bodyless: false,
        }
    }

    pub fn requests() -> Self {
        Self::new(MessageKind::Request)
    }

    pub fn replies() -> Self {
        Self::new(MessageKind::Reply)
    }

    /// Expect a reply without body regardless of its header (reply to `HEAD`).
    pub fn set_bodyless(&mut self, bodyless: bool) {
        self.bodyless = bodyless;
    }

    pub fn start_line(&self) -> Option<&StartLine> {
        self.start.as_ref()
    }

    /// Any byte of the message has been consumed.
    pub fn is_started(&self) -> bool {
        self.state != ReadState::StartLine || !self.line.is_empty()
    }

    pub fn is_header_complete(&self) -> bool {
        !matches!(self.state, ReadState::StartLine | ReadState::Header)
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReadState::Finished
    }

    pub fn reset(&mut self) {
        self.state = ReadState::StartLine;
        self.line.clear();
        self.start = None;
        self.bodyless = false;
    }

    /// Consumes bytes from `input`; returns how many were consumed and what
    /// has been achieved.
    pub fn advance(&mut self, input: &[u8], message: &mut Message) -> Result<(usize, MessageProgress)> {
        let mut pos = 0;
        let mut progress = MessageProgress::NONE;

        if self.state == ReadState::StartLine && !message.is_receiving() && !input.is_empty() {
            message.start_receiving()?;
        }

        while pos < input.len() && self.state != ReadState::Finished {
            match self.state {
                ReadState::Length(remaining) => {
                    let count = remaining.min(input.len() - pos);
                    message.body_mut().extend(&input[pos..pos + count]);
                    pos += count;
                    progress |= MessageProgress::BODY;
                    match remaining - count {
                        0 => self.finish(message, &mut progress),
                        left => self.state = ReadState::Length(left),
                    }
                },
                ReadState::ChunkData(remaining) => {
                    let count = remaining.min(input.len() - pos);
                    message.body_mut().extend(&input[pos..pos + count]);
                    pos += count;
                    progress |= MessageProgress::BODY;
                    self.state = match remaining - count {
                        0 => ReadState::ChunkEnd,
                        left => ReadState::ChunkData(left),
                    };
                },
                ReadState::UntilClose => {
                    message.body_mut().extend(&input[pos..]);
                    pos = input.len();
                    progress |= MessageProgress::BODY;
                },
                _ => match self.take_line(input, &mut pos)? {
                    Some(line) => self.on_line(&line, message, &mut progress)?,
                    None => break,
                },
            }
        }

        Ok((pos, progress))
    }

    /// Handles the end of the stream: completes a body delimited by the
    /// connection close, fails with [`Error::Incomplete`] otherwise.
    pub fn finish_eof(&mut self, message: &mut Message) -> Result<MessageProgress> {
        match self.state {
            ReadState::Finished => Ok(MessageProgress::NONE),
            ReadState::UntilClose => {
                let mut progress = MessageProgress::NONE;
                self.finish(message, &mut progress);
                Ok(progress)
            },
            _ => {
                message.stop(false);
                Err(Error::Incomplete)
            },
        }
    }

    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<String>> {
        let rest = &input[*pos..];
        let (chunk, complete) = match rest.iter().position(|byte| *byte == b'\n') {
            Some(index) => (&rest[..=index], true),
            None => (rest, false),
        };
        if self.line.len() + chunk.len() > MAX_LINE_LENGTH {
            return Err(Error::http("line too long"));
        }
        self.line.extend_from_slice(chunk);
        *pos += chunk.len();
        if !complete {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn on_line(&mut self, line: &str, message: &mut Message, progress: &mut MessageProgress) -> Result<()> {
        match self.state {
            ReadState::StartLine => {
                if line.is_empty() {
                    return Ok(());
                }
                let (start, major, minor) = parse_start_line(self.kind, line)?;
                trace!("Start line: {:?}", start);
                message.header_mut().set_version(major, minor);
                self.start = Some(start);
                self.state = ReadState::Header;
            },
            ReadState::Header => match line.is_empty() {
                true => {
                    *progress |= MessageProgress::HEADER;
                    self.on_header_complete(message, progress);
                },
                false => parse_field(line, message.header_mut())?,
            },
            ReadState::ChunkSize => {
                let size = parse_chunk_size(line)?;
                trace!("Chunk of {} byte(s)", size);
                self.state = match size {
                    0 => ReadState::Trailer,
                    size => ReadState::ChunkData(size),
                };
            },
            ReadState::ChunkEnd => match line.is_empty() {
                true => self.state = ReadState::ChunkSize,
                false => return Err(Error::http("chunk data is not followed by CRLF")),
            },
            ReadState::Trailer => match line.is_empty() {
                true => self.finish(message, progress),
                false => {
                    parse_field(line, message.header_mut())?;
                    *progress |= MessageProgress::TRAILER;
                },
            },
            _ => (),
        }
        Ok(())
    }

    fn on_header_complete(&mut self, message: &mut Message, progress: &mut MessageProgress) {
        let header = message.header();
        let bodyless = match &self.start {
            Some(StartLine::Reply { status, .. }) => self.bodyless || (100..200).contains(status) || *status == 204 || *status == 304,
            _ => false,
        };
        let state = if bodyless {
            ReadState::Finished
        } else if header.is_chunked() {
            ReadState::ChunkSize
        } else if header.has("Content-Length") {
            match header.content_length() {
                0 => ReadState::Finished,
                length => ReadState::Length(length),
            }
        } else {
            match self.kind {
                MessageKind::Request => ReadState::Finished,
                MessageKind::Reply => ReadState::UntilClose,
            }
        };
        match state {
            ReadState::Finished => self.finish(message, progress),
            state => self.state = state,
        }
    }

    fn finish(&mut self, message: &mut Message, progress: &mut MessageProgress) {
        self.state = ReadState::Finished;
        message.stop(true);
        *progress |= MessageProgress::FINISHED;
    }
}

fn parse_version(text: &str) -> Result<(u8, u8)> {
    let version = text.strip_prefix("HTTP/").ok_or_else(|| Error::http(format!("invalid protocol \"{}\"", text)))?;
    let (major, minor) = version.split_once('.').ok_or_else(|| Error::http(format!("invalid version \"{}\"", version)))?;
    match (major.parse::<u8>(), minor.parse::<u8>()) {
        (Ok(major), Ok(minor)) => Ok((major, minor)),
        _ => Err(Error::http(format!("invalid version \"{}\"", version))),
    }
}

fn parse_start_line(kind: MessageKind, line: &str) -> Result<(StartLine, u8, u8)> {
    match kind {
        MessageKind::Request => {
            let mut parts = line.split(' ').filter(|part| !part.is_empty());
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(target), Some(version), None) => {
                    let (major, minor) = parse_version(version)?;
                    let start = StartLine::Request {
                        method: method.to_owned(),
                        target: target.to_owned(),
                    };
                    Ok((start, major, minor))
                },
                _ => Err(Error::http(format!("malformed request line \"{}\"", line.escape_debug()))),
            }
        },
        MessageKind::Reply => {
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next().map(str::parse::<u16>)) {
                (Some(version), Some(Ok(status))) if (100..1000).contains(&status) => {
                    let (major, minor) = parse_version(version)?;
                    let start = StartLine::Reply {
                        status,
                        reason: parts.next().unwrap_or_default().to_owned(),
                    };
                    Ok((start, major, minor))
                },
                _ => Err(Error::http(format!("malformed status line \"{}\"", line.escape_debug()))),
            }
        },
    }
}

fn parse_field(line: &str, header: &mut MessageHeader) -> Result<()> {
    if line.starts_with(&[' ', '\t'][..]) {
        return Err(Error::http("obsolete header line folding"));
    }
    let (key, value) = line.split_once(':').ok_or_else(|| Error::http(format!("malformed header field \"{}\"", line.escape_debug())))?;
    header.add(key, value.trim())
}

fn parse_chunk_size(line: &str) -> Result<usize> {
    let size = line.split(';').next().unwrap_or_default().trim();
    match size.is_empty() {
        true => Err(Error::http("missing chunk size")),
        false => usize::from_str_radix(size, 16).map_err(|_| Error::http(format!("invalid chunk size \"{}\"", size))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Header,
    Body,
    Finished,
}

/// Incremental HTTP/1.x message serializer
///
/// Each call to [`advance()`](MessageWriter::advance()) appends to the output
/// what the message holds so far: the header on the first call, then the
/// body data written since the previous call. A message whose body is
/// complete on the first call is sent with `Content-Length`; otherwise the
/// body is streamed with chunked transfer coding (or, for HTTP/1.0, until
/// the connection closes).
#[derive(Debug)]
pub struct MessageWriter {
    state: WriteState,
    chunked: bool,
    bodyless: bool,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            state: WriteState::Header,
            chunked: false,
            bodyless: false,
        }
    }

    /// Send no body regardless of the message content (`HEAD`, 204, 304).
    pub fn set_bodyless(&mut self, bodyless: bool) {
        self.bodyless = bodyless;
    }

    pub fn is_header_sent(&self) -> bool {
        self.state != WriteState::Header
    }

    pub fn is_finished(&self) -> bool {
        self.state == WriteState::Finished
    }

    pub fn reset(&mut self) {
        self.state = WriteState::Header;
        self.chunked = false;
        self.bodyless = false;
    }

    /// Appends the next part of `message` to `out`; `complete` tells that the
    /// application has written the whole body.
    pub fn advance<M: HttpMessage>(&mut self, message: &mut M, complete: bool, out: &mut Vec<u8>) -> Result<MessageProgress> {
        let mut progress = MessageProgress::NONE;

        if self.state == WriteState::Header {
            message.message_mut().start_sending()?;
            self.prepare_header(message.message_mut(), complete)?;
            write_head(&message.start_line(), message.header(), out)?;
            progress |= MessageProgress::HEADER;
            self.state = WriteState::Body;
        }

        if self.state == WriteState::Body {
            let data = message.body_mut().take();
            if !self.bodyless && !data.is_empty() {
                if self.chunked {
                    write!(out, "{:X}\r\n", data.len())?;
                    out.extend_from_slice(&data);
                    out.extend_from_slice(b"\r\n");
                } else {
                    out.extend_from_slice(&data);
                }
                progress |= MessageProgress::BODY;
            }
            if complete {
                if self.chunked && !self.bodyless {
                    out.extend_from_slice(b"0\r\n\r\n");
                }
                self.state = WriteState::Finished;
                message.message_mut().stop(true);
                progress |= MessageProgress::FINISHED;
            }
        }

        Ok(progress)
    }

    fn prepare_header(&mut self, message: &mut Message, complete: bool) -> Result<()> {
        let length = message.body().available();
        if self.bodyless {
            self.chunked = false;
            if complete && length > 0 {
                message.header_mut().set("Content-Length", &length.to_string())?;
            }
            return Ok(());
        }
        let header = message.header_mut();
        if complete && !header.is_chunked() {
            self.chunked = false;
            header.set("Content-Length", &length.to_string())?;
        } else if header.version() >= (1, 1) {
            self.chunked = true;
            header.remove("Content-Length");
            header.set("Transfer-Encoding", "chunked")?;
        } else {
            self.chunked = false;
            header.remove("Transfer-Encoding");
            header.set("Connection", "close")?;
        }
        Ok(())
    }
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the start line, the header fields and the empty line ending them.
pub fn write_head(start_line: &str, header: &MessageHeader, out: &mut Vec<u8>) -> Result<()> {
    write!(out, "{}\r\n", start_line)?;
    for (key, value) in header.iter() {
        write!(out, "{}: {}\r\n", key, value)?;
    }
    out.extend_from_slice(b"\r\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut MessageReader, input: &[u8], message: &mut Message) -> (usize, MessageProgress) {
        let mut total = 0;
        let mut progress = MessageProgress::NONE;
        for piece in input.chunks(3) {
            let (consumed, step) = reader.advance(piece, message).expect("Failed to parse!");
            total += consumed;
            progress |= step;
            if reader.is_finished() {
                break;
            }
        }
        (total, progress)
    }

    #[test]
    fn parses_request_in_small_pieces() {
        let input = b"\r\nPOST /upload?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = MessageReader::requests();
        let mut request = Request::default();
        let (consumed, progress) = read_all(&mut reader, input, request.message_mut());

        assert_eq!(consumed, input.len());
        assert!(progress.header() && progress.body() && progress.finished());
        assert_eq!(reader.start_line(), Some(&StartLine::Request { method: "POST".into(), target: "/upload?x=1".into() }));
        assert_eq!(request.header().get("host"), Some("localhost"));
        assert_eq!(request.body().as_slice(), b"hello");
    }

    #[test]
    fn stops_at_message_boundary() {
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut reader = MessageReader::requests();
        let mut message = Message::new();
        let (consumed, progress) = reader.advance(input, &mut message).unwrap();
        assert!(progress.finished());
        assert_eq!(&input[consumed..], b"GET /b HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn decodes_chunked_body_with_trailer() {
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nChecksum: abc\r\n\r\n";
        let mut reader = MessageReader::replies();
        let mut reply = Reply::default();
        let (consumed, progress) = read_all(&mut reader, input, reply.message_mut());

        assert_eq!(consumed, input.len());
        assert!(progress.trailer() && progress.finished());
        assert_eq!(reply.body().as_slice(), b"Wikipedia");
        assert_eq!(reply.header().get("checksum"), Some("abc"));
    }

    #[test]
    fn reply_until_close() {
        let mut reader = MessageReader::replies();
        let mut message = Message::new();
        reader.advance(b"HTTP/1.0 200 OK\r\n\r\nsome data", &mut message).unwrap();
        assert!(!reader.is_finished());
        assert!(reader.finish_eof(&mut message).unwrap().finished());
        assert_eq!(message.body().as_slice(), b"some data");
    }

    #[test]
    fn truncated_body_is_incomplete() {
        let mut reader = MessageReader::replies();
        let mut message = Message::new();
        reader.advance(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &mut message).unwrap();
        assert!(matches!(reader.finish_eof(&mut message), Err(Error::Incomplete)));
    }

    #[test]
    fn interim_reply_has_no_body() {
        let mut reader = MessageReader::replies();
        let mut message = Message::new();
        let (consumed, progress) = reader.advance(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n", &mut message).unwrap();
        assert!(progress.finished());
        assert_eq!(consumed, 25);
    }

    #[test]
    fn rejects_malformed_input() {
        let cases: [&[u8]; 4] = [
            b"GET /\r\n\r\n",
            b"GET / HTTP/x.y\r\n\r\n",
            b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
            b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        ];
        for input in cases {
            let mut reader = MessageReader::requests();
            let mut message = Message::new();
            assert!(matches!(reader.advance(input, &mut message), Err(Error::Http(_))), "{:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn rejects_overlong_line() {
        let mut reader = MessageReader::requests();
        let mut message = Message::new();
        let line = vec![b'a'; MAX_LINE_LENGTH + 1];
        assert!(matches!(reader.advance(&line, &mut message), Err(Error::Http(_))));
    }

    #[test]
    fn writes_content_length_when_complete() {
        let mut reply = Reply::default();
        reply.body_mut().extend(b"Hello");
        let mut writer = MessageWriter::new();
        let mut out = Vec::new();
        let progress = writer.advance(&mut reply, true, &mut out).unwrap();

        assert!(progress.finished());
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello");
    }

    #[test]
    fn streams_chunks() {
        let mut reply = Reply::default();
        let mut writer = MessageWriter::new();
        let mut out = Vec::new();

        reply.body_mut().extend(b"Wiki");
        assert!(!writer.advance(&mut reply, false, &mut out).unwrap().finished());
        reply.body_mut().extend(b"pedia");
        assert!(writer.advance(&mut reply, true, &mut out).unwrap().finished());

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
    }

    #[test]
    fn written_message_parses_back() {
        let mut request = Request::with_method("PUT", "/data");
        request.header_mut().set("Host", "example.com").unwrap();
        let mut writer = MessageWriter::new();
        let mut out = Vec::new();
        request.body_mut().extend(b"first,");
        writer.advance(&mut request, false, &mut out).unwrap();
        request.body_mut().extend(b"second");
        writer.advance(&mut request, true, &mut out).unwrap();

        let mut reader = MessageReader::requests();
        let mut received = Request::default();
        let (consumed, progress) = reader.advance(&out, received.message_mut()).unwrap();
        assert_eq!(consumed, out.len());
        assert!(progress.finished());
        assert_eq!(received.body().as_slice(), b"first,second");
    }

    #[test]
    fn bodyless_reply_keeps_length_but_no_data() {
        let mut reply = Reply::default();
        reply.body_mut().extend(b"Hello");
        let mut writer = MessageWriter::new();
        writer.set_bodyless(true);
        let mut out = Vec::new();
        assert!(writer.advance(&mut reply, true, &mut out).unwrap().finished());
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
    }
}
