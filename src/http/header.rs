/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::fmt::{Debug, Formatter};

use crate::error::{Error, Result};

/// Capacity of the [`MessageHeader`] arena in bytes.
pub const HEADER_CAPACITY: usize = 4096;

/// HTTP header fields stored in a fixed-size byte arena
///
/// Fields are kept in insertion order as NUL-terminated key and value
/// strings, followed by one extra NUL that ends the sequence. Keys keep
/// their case but are matched case-insensitively. The arena never grows:
/// [`add()`](MessageHeader::add()) fails *before* touching existing fields
/// when a field does not fit.
pub struct MessageHeader {
    arena: Box<[u8; HEADER_CAPACITY]>,
    end: usize,
    major: u8,
    minor: u8,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self {
            arena: Box::new([0u8; HEADER_CAPACITY]),
            end: 0,
            major: 1,
            minor: 1,
        }
    }

    /// Appends a field; duplicates are allowed.
    pub fn add(&mut self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        let required = key.len() + value.len() + 2;
        if self.end + required + 1 > HEADER_CAPACITY {
            return Err(Error::http(format!("header field \"{}\" exceeds the header capacity", key)));
        }
        let mut pos = self.end;
        for part in [key.as_bytes(), value.as_bytes()] {
            self.arena[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
            self.arena[pos] = 0;
            pos += 1;
        }
        self.end = pos;
        self.arena[self.end] = 0;
        Ok(())
    }

    /// Value of the first field named `key`, ignoring case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(name, _)| name.eq_ignore_ascii_case(key)).map(|(_, value)| value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces all fields named `key` by a single one.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        let freed: usize = self.iter().filter(|(name, _)| name.eq_ignore_ascii_case(key)).map(|(name, value)| name.len() + value.len() + 2).sum();
        if self.end - freed + key.len() + value.len() + 2 + 1 > HEADER_CAPACITY {
            return Err(Error::http(format!("header field \"{}\" exceeds the header capacity", key)));
        }
        self.remove(key);
        self.add(key, value)
    }

    /// Removes all fields named `key`; returns how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        let mut removed = 0;
        let mut cursor = 0;
        while let Some((name_end, value_end)) = self.field_at(cursor) {
            let next = value_end + 1;
            if self.slice(cursor, name_end).eq_ignore_ascii_case(key) {
                self.arena.copy_within(next..=self.end, cursor);
                self.end -= next - cursor;
                removed += 1;
            } else {
                cursor = next;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.end = 0;
        self.arena[0] = 0;
    }

    pub fn iter(&self) -> HeaderIter<'_> {
        HeaderIter {
            header: self,
            cursor: 0,
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Bytes of the arena in use, including the terminator.
    pub fn used(&self) -> usize {
        self.end + 1
    }

    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn version_major(&self) -> u8 {
        self.major
    }

    pub fn version_minor(&self) -> u8 {
        self.minor
    }

    pub fn set_version(&mut self, major: u8, minor: u8) {
        self.major = major;
        self.minor = minor;
    }

    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding").map(|value| value.trim().eq_ignore_ascii_case("chunked")).unwrap_or(false)
    }

    /// The leading decimal digits of `Content-Length`; `0` if the field is
    /// absent or does not start with a digit.
    pub fn content_length(&self) -> usize {
        self.get("Content-Length")
            .map(|value| value.trim_start().bytes().take_while(u8::is_ascii_digit).fold(0usize, |total, digit| {
                total.saturating_mul(10).saturating_add(usize::from(digit - b'0'))
            }))
            .unwrap_or(0)
    }

    /// Without a `Connection` field keep-alive is the default from HTTP/1.1
    /// on; otherwise the field must say `keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.get("Connection") {
            Some(value) => value.trim().eq_ignore_ascii_case("keep-alive"),
            None => self.major == 1 && self.minor >= 1,
        }
    }

    fn field_at(&self, cursor: usize) -> Option<(usize, usize)> {
        if cursor >= self.end {
            return None;
        }
        let name_end = cursor + self.arena[cursor..self.end].iter().position(|byte| *byte == 0)?;
        let value_end = name_end + 1 + self.arena[name_end + 1..self.end].iter().position(|byte| *byte == 0)?;
        Some((name_end, value_end))
    }

    fn slice(&self, from: usize, to: usize) -> &str {
        std::str::from_utf8(&self.arena[from..to]).unwrap_or_default()
    }
}

fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.bytes().any(|byte| byte <= b' ' || byte == b':' || byte == 0x7F) {
        return Err(Error::http(format!("invalid header field name \"{}\"", key.escape_debug())));
    }
    if value.bytes().any(|byte| byte == 0 || byte == b'\r' || byte == b'\n') {
        return Err(Error::http(format!("invalid value for header field \"{}\"", key)));
    }
    Ok(())
}

/// Iterator over the `(key, value)` pairs of a [`MessageHeader`].
pub struct HeaderIter<'a> {
    header: &'a MessageHeader,
    cursor: usize,
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.header;
        let (name_end, value_end) = header.field_at(self.cursor)?;
        let item = (header.slice(self.cursor, name_end), header.slice(name_end + 1, value_end));
        self.cursor = value_end + 1;
        Some(item)
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MessageHeader {
    fn clone(&self) -> Self {
        Self {
            arena: self.arena.clone(),
            end: self.end,
            major: self.major,
            minor: self.minor,
        }
    }
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
