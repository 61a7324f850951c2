/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::ErrorKind;
use std::time::Duration;

use mio::{Poll, Events, Token, Registry};

use crate::error::Result;
use crate::system::Readiness;

/// Token reserved for the waker of an [`EventLoop`](crate::system::EventLoop).
pub(crate) const WAKE: Token = Token(usize::MAX);

/// Block without a deadline.
pub const WAIT_INFINITE: Option<Duration> = None;

/// The longest wait that is handed to the OS multiplexer in a single call;
/// longer waits are clamped to this value.
pub const WAIT_MAX: Duration = Duration::from_millis(i32::MAX as u64);

pub(crate) fn clamp_wait(wait: Option<Duration>) -> Option<Duration> {
    wait.map(|time| time.min(WAIT_MAX))
}

/// The smaller of two waits, where `None` means "infinite".
pub(crate) fn min_wait(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Thin wrapper around the **`mio`** poll instance and its event buffer.
#[derive(Debug)]
pub(crate) struct Selector {
    poll: Poll,
    events: Events,
}

impl Selector {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<&Events> {
        match self.poll.poll(&mut self.events, clamp_wait(timeout)) {
            Ok(()) => Ok(&self.events),
            Err(error) if error.kind() == ErrorKind::Interrupted => {
                self.events.clear();
                Ok(&self.events)
            },
            Err(error) => Err(error.into()),
        }
    }

    /// Waits for events and returns the readiness reported for `token`.
    pub fn wait_token(&mut self, token: Token, timeout: Option<Duration>) -> Result<Readiness> {
        let events = self.poll(timeout)?;
        Ok(events.iter()
            .filter(|event| event.token() == token)
            .fold(Readiness::NONE, |readiness, event| readiness | Readiness::from(event)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_are_clamped() {
        assert_eq!(clamp_wait(WAIT_INFINITE), None);
        assert_eq!(clamp_wait(Some(Duration::from_secs(u64::MAX / 2))), Some(WAIT_MAX));
        assert_eq!(clamp_wait(Some(Duration::from_millis(5))), Some(Duration::from_millis(5)));
    }

    #[test]
    fn min_wait_treats_none_as_infinite() {
        let short = Some(Duration::from_millis(1));
        let long = Some(Duration::from_millis(9));
        assert_eq!(min_wait(short, long), short);
        assert_eq!(min_wait(None, long), long);
        assert_eq!(min_wait(short, None), short);
        assert_eq!(min_wait(None, None), None);
    }
}
