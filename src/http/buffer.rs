/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::{BufRead, Read, Write, Result as IoResult};

const INITIAL_CAPACITY: usize = 256;

/// Growable byte buffer holding (part of) an HTTP message body
///
/// Written data is appended at the end, read data is consumed from the
/// front. The storage grows geometrically; consumed space at the front is
/// reclaimed before growing.
#[derive(Debug, Default, Clone)]
pub struct MessageBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Bytes that can be read.
    pub fn available(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.grow(data.len());
        self.data.extend_from_slice(data);
    }

    /// Drops all unread bytes; returns how many there were.
    pub fn discard(&mut self) -> usize {
        let count = self.available();
        self.clear();
        count
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Removes and returns all unread bytes.
    pub fn take(&mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        if self.pos > 0 {
            data.drain(..self.pos);
        }
        self.pos = 0;
        data
    }

    fn grow(&mut self, additional: usize) {
        if self.pos > 0 && self.data.len() + additional > self.data.capacity() {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
        let required = self.data.len() + additional;
        if required > self.data.capacity() {
            let mut capacity = self.data.capacity().max(INITIAL_CAPACITY);
            while capacity < required {
                capacity = capacity.saturating_mul(2);
            }
            self.data.reserve_exact(capacity - self.data.len());
        }
    }
}

impl Read for MessageBuffer {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let count = self.available().min(buf.len());
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.consume(count);
        Ok(count)
    }
}

impl BufRead for MessageBuffer {
    fn fill_buf(&mut self) -> IoResult<&[u8]> {
        Ok(self.as_slice())
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.data.len());
        if self.pos == self.data.len() {
            self.clear();
        }
    }
}

impl Write for MessageBuffer {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut buffer = MessageBuffer::new();
        write!(buffer, "Hello {}!", 42).unwrap();
        assert_eq!(buffer.available(), 9);

        let mut head = [0u8; 5];
        buffer.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"Hello");

        let mut rest = String::new();
        buffer.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, " 42!");
        assert!(buffer.is_empty());
    }

    #[test]
    fn grows_geometrically() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(&[1u8; 300]);
        assert!(buffer.data.capacity() >= 512);
        buffer.extend(&[2u8; 1000]);
        assert_eq!(buffer.available(), 1300);
        assert!(buffer.data.capacity().is_power_of_two());
    }

    #[test]
    fn reclaims_consumed_space() {
        let mut buffer = MessageBuffer::with_capacity(INITIAL_CAPACITY);
        buffer.extend(&[0u8; 200]);
        buffer.consume(150);
        buffer.extend(&[7u8; 100]);
        assert_eq!(buffer.available(), 150);
        assert_eq!(buffer.data.capacity(), INITIAL_CAPACITY);
        assert_eq!(MessageBuffer::take(&mut buffer).len(), 150);
    }

    #[test]
    fn discard_empties() {
        let mut buffer = MessageBuffer::new();
        buffer.extend(b"unread body");
        assert_eq!(buffer.discard(), 11);
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.discard(), 0);
    }
}
