/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Waker;
use parking_lot::Mutex;

use log::warn;

/// A message that can be handed to an [`EventQueue`] from any thread
///
/// Every `Clone + Send + 'static` type is an event. The queue stores its own
/// copy of the pushed value and dispatches it by run-time type.
pub trait Event: Any + Send {
    fn clone_event(&self) -> Box<dyn Event>;

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Clone> Event for T {
    fn clone_event(&self) -> Box<dyn Event> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Thread-safe FIFO of [`Event`]s
///
/// Events are delivered in push order, exactly once. The queue lock is not
/// held while an event is dispatched, so a handler may push further events.
/// Events that were never delivered are destroyed together with the queue.
pub struct EventQueue {
    events: Mutex<VecDeque<Box<dyn Event>>>,
    exit: AtomicBool,
    waker: Option<Arc<Waker>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            exit: AtomicBool::new(false),
            waker: None,
        }
    }

    pub(crate) fn with_waker(waker: Arc<Waker>) -> Self {
        Self {
            waker: Some(waker),
            ..Self::new()
        }
    }

    pub fn push_event(&self, event: &dyn Event) {
        self.events.lock().push_back(event.clone_event());
        if let Some(waker) = &self.waker {
            if let Err(error) = waker.wake() {
                warn!("Failed to wake the event loop: {:?}", error);
            }
        }
    }

    /// Dispatches queued events one at a time until the queue is empty or
    /// [`exit()`](EventQueue::exit()) was requested; returns the number of
    /// events dispatched.
    pub fn process_events<F>(&self, mut dispatch: F) -> usize
    where
        F: FnMut(&dyn Event),
    {
        let mut count = 0;
        while !self.exit.load(Ordering::Acquire) {
            let event = match self.events.lock().pop_front() {
                Some(event) => event,
                None => break,
            };
            dispatch(event.as_ref());
            count += 1;
        }
        count
    }

    /// Stops processing; events that are still queued stay queued.
    pub fn exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn restart(&self) {
        self.exit.store(false, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for EventQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.len())
            .field("exit", &self.is_exiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Clone, Debug, PartialEq)]
    struct Numbered(usize);

    #[derive(Clone)]
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_in_push_order_exactly_once() {
        let queue = EventQueue::new();
        for n in 0..16 {
            queue.push_event(&Numbered(n));
        }

        let mut seen = Vec::new();
        let count = queue.process_events(|event| {
            seen.push(event.as_any().downcast_ref::<Numbered>().map(|numbered| numbered.0));
        });

        assert_eq!(count, 16);
        assert_eq!(seen, (0..16).map(Some).collect::<Vec<_>>());
        assert_eq!(queue.process_events(|_| ()), 0);
    }

    #[test]
    fn handler_may_push_events() {
        let queue = EventQueue::new();
        queue.push_event(&Numbered(0));

        let mut seen = Vec::new();
        queue.process_events(|event| {
            if let Some(Numbered(n)) = event.as_any().downcast_ref::<Numbered>() {
                seen.push(*n);
                if *n < 3 {
                    queue.push_event(&Numbered(n + 1));
                }
            }
        });
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn exit_keeps_remaining_events() {
        let queue = EventQueue::new();
        for n in 0..4 {
            queue.push_event(&Numbered(n));
        }

        let mut seen = 0;
        queue.process_events(|_| {
            seen += 1;
            if seen == 2 {
                queue.exit();
            }
        });
        assert_eq!(seen, 2);
        assert_eq!(queue.len(), 2);

        queue.restart();
        assert_eq!(queue.process_events(|_| ()), 2);
    }

    #[test]
    fn undelivered_events_are_destroyed() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = EventQueue::new();
        let original = Tracked(drops.clone());
        for _ in 0..5 {
            queue.push_event(&original);
        }
        drop(original);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn push_from_other_threads() {
        let queue = Arc::new(EventQueue::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for n in 0..25 {
                        queue.push_event(&Numbered(t * 100 + n));
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|thread| thread.join().expect("Failed to join with pusher thread!"));

        let mut per_thread = vec![Vec::new(); 4];
        queue.process_events(|event| {
            if let Some(Numbered(n)) = event.as_any().downcast_ref::<Numbered>() {
                per_thread[n / 100].push(n % 100);
            }
        });
        for sequence in per_thread {
            assert_eq!(sequence, (0..25).collect::<Vec<_>>());
        }
    }
}
