/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use crate::http::{HttpMessage, Message};

pub const CONTINUE: u16 = 100;
pub const OK: u16 = 200;
pub const MULTIPLE_CHOICES: u16 = 300;
pub const BAD_REQUEST: u16 = 400;
pub const UNAUTHORIZED: u16 = 401;
pub const NOT_FOUND: u16 = 404;
pub const REQUEST_ENTITY_TOO_LARGE: u16 = 413;
pub const INTERNAL_SERVER_ERROR: u16 = 500;

/// Standard reason phrase for the status codes used by this crate.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        CONTINUE => "Continue",
        OK => "OK",
        MULTIPLE_CHOICES => "Multiple Choices",
        BAD_REQUEST => "Bad Request",
        UNAUTHORIZED => "Unauthorized",
        NOT_FOUND => "Not Found",
        REQUEST_ENTITY_TOO_LARGE => "Request Entity Too Large",
        INTERNAL_SERVER_ERROR => "Internal Server Error",
        _ => "Unknown",
    }
}

/// An HTTP reply: status code, reason phrase and a [`Message`]
#[derive(Debug, Clone)]
pub struct Reply {
    message: Message,
    status: u16,
    reason: String,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            message: Message::new(),
            status,
            reason: reason_phrase(status).to_owned(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Sets the status code together with its standard reason phrase.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = reason_phrase(status).to_owned();
    }

    pub fn set_status_with_reason(&mut self, status: u16, reason: &str) {
        self.status = status;
        self.reason = reason.to_owned();
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Replies that never carry a body.
    pub fn is_bodyless(&self) -> bool {
        self.is_informational() || self.status == 204 || self.status == 304
    }

    /// Makes the reply reusable for a new exchange.
    pub fn clear(&mut self) {
        self.message.clear();
        self.set_status(OK);
    }
}

impl HttpMessage for Reply {
    fn message(&self) -> &Message {
        &self.message
    }

    fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    fn start_line(&self) -> String {
        let (major, minor) = self.message.header().version();
        format!("HTTP/{}.{} {} {}", major, minor, self.status, self.reason)
    }
}

impl Default for Reply {
    fn default() -> Self {
        Self::new(OK)
    }
}
