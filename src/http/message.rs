/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::fmt::{Debug, Formatter};
use std::ops::{BitOr, BitOrAssign};

use crate::error::{Error, Result};
use crate::http::{MessageBuffer, MessageHeader};

/// What a single send or receive step has achieved
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageProgress(u8);

impl MessageProgress {
    pub const NONE: Self = Self(0);
    pub const HEADER: Self = Self(1);
    pub const BODY: Self = Self(2);
    pub const TRAILER: Self = Self(4);
    pub const FINISHED: Self = Self(8);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }

    pub fn header(&self) -> bool {
        self.contains(Self::HEADER)
    }

    pub fn body(&self) -> bool {
        self.contains(Self::BODY)
    }

    pub fn trailer(&self) -> bool {
        self.contains(Self::TRAILER)
    }

    pub fn finished(&self) -> bool {
        self.contains(Self::FINISHED)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MessageProgress {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageProgress {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Debug for MessageProgress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [(Self::HEADER, "HEADER"), (Self::BODY, "BODY"), (Self::TRAILER, "TRAILER"), (Self::FINISHED, "FINISHED")];
        let set: Vec<&str> = names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name).collect();
        write!(f, "MessageProgress({})", set.join(" | "))
    }
}

/// Header, body and transfer state shared by requests and replies
///
/// The body is an in-memory [`MessageBuffer`]: when sending, the
/// application writes into it and the engine takes what has been written so
/// far; when receiving, the engine appends decoded body data and the
/// application reads from it.
#[derive(Debug, Default, Clone)]
pub struct Message {
    header: MessageHeader,
    body: MessageBuffer,
    sending: bool,
    receiving: bool,
    finished: bool,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    pub fn body(&self) -> &MessageBuffer {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut MessageBuffer {
        &mut self.body
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// The last transfer of this message has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drops body data that has not been read.
    pub fn discard(&mut self) -> usize {
        self.body.discard()
    }

    /// Resets the message for reuse; the header version goes back to 1.1.
    pub fn clear(&mut self) {
        self.header.clear();
        self.header.set_version(1, 1);
        self.body.clear();
        self.sending = false;
        self.receiving = false;
        self.finished = false;
    }

    pub(crate) fn start_sending(&mut self) -> Result<()> {
        if self.sending || self.receiving {
            return Err(Error::Pending);
        }
        self.sending = true;
        self.finished = false;
        Ok(())
    }

    pub(crate) fn start_receiving(&mut self) -> Result<()> {
        if self.sending || self.receiving {
            return Err(Error::Pending);
        }
        self.receiving = true;
        self.finished = false;
        Ok(())
    }

    /// Ends the current transfer; `finished` tells whether it completed.
    pub(crate) fn stop(&mut self, finished: bool) {
        self.sending = false;
        self.receiving = false;
        self.finished = finished;
    }
}

/// Common access to the [`Message`] inside a request or a reply
pub trait HttpMessage {
    fn message(&self) -> &Message;

    fn message_mut(&mut self) -> &mut Message;

    /// The start line as sent on the wire, without line terminator.
    fn start_line(&self) -> String;

    fn header(&self) -> &MessageHeader {
        self.message().header()
    }

    fn header_mut(&mut self) -> &mut MessageHeader {
        self.message_mut().header_mut()
    }

    fn body(&self) -> &MessageBuffer {
        self.message().body()
    }

    fn body_mut(&mut self) -> &mut MessageBuffer {
        self.message_mut().body_mut()
    }

    fn discard(&mut self) -> usize {
        self.message_mut().discard()
    }
}
