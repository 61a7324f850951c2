/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Waker;

/// An atomic flag that wakes up the selector whenever its state changes.
#[derive(Debug)]
pub(crate) struct Flag {
    waker: Arc<Waker>,
    flag: AtomicBool,
}

impl Flag {
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            waker,
            flag: AtomicBool::new(false),
        }
    }

    pub fn raise(&self) -> Result<bool> {
        match self.flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => self.waker.wake().map(always),
            Err(_) => Ok(false)
        }
    }

    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    pub fn check(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn wake(&self) -> Result<()> {
        self.waker.wake()
    }
}

fn always<T>(_: T) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    #[test]
    fn raise_wakes_the_selector_once() {
        let mut poll = Poll::new().unwrap();
        let flag = Flag::new(Arc::new(Waker::new(poll.registry(), Token(7)).unwrap()));
        assert!(!flag.check());

        assert!(flag.raise().unwrap());
        assert!(!flag.raise().unwrap());
        assert!(flag.check());

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|event| event.token() == Token(7)));

        assert!(flag.clear());
        assert!(!flag.clear());
        assert!(!flag.check());
    }

    #[test]
    fn wake_leaves_the_flag_down() {
        let mut poll = Poll::new().unwrap();
        let flag = Flag::new(Arc::new(Waker::new(poll.registry(), Token(3)).unwrap()));
        flag.wake().unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|event| event.token() == Token(3)));
        assert!(!flag.check());
        assert!(flag.raise().unwrap());
    }
}
