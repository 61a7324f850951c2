/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::time::{Duration, Instant};

/// Deadline of a "blocking" operation; no deadline means wait forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeout {
    deadline: Option<Instant>,
}

impl Timeout {
    /// A duration too large to be represented as a deadline waits forever.
    pub fn start(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.and_then(|duration| Instant::now().checked_add(duration)),
        }
    }

    /// Time left until the deadline, saturating at zero.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.deadline.map(|deadline| Instant::now() >= deadline).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_expires() {
        let timeout = Timeout::start(None);
        assert_eq!(timeout.remaining_time(), None);
        assert!(!timeout.expired());
    }

    #[test]
    fn zero_expires_at_once() {
        let timeout = Timeout::start(Some(Duration::ZERO));
        assert_eq!(timeout.remaining_time(), Some(Duration::ZERO));
        assert!(timeout.expired());
    }

    #[test]
    fn counts_down() {
        let timeout = Timeout::start(Some(Duration::from_secs(60)));
        let remaining = timeout.remaining_time().unwrap();
        assert!(remaining <= Duration::from_secs(60) && remaining > Duration::from_secs(59));
        assert!(!timeout.expired());
    }
}
