/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};

use log::warn;

/// A list of callbacks owned by the object that emits them
///
/// [`connect()`](Signal::connect()) returns a [`Subscription`]; the callback
/// stays connected for as long as the subscription is kept alive. Callbacks
/// may connect or disconnect other callbacks, and may drop their own
/// subscription, while the signal is being sent.
pub struct Signal<T: ?Sized + 'static> {
    slots: Rc<RefCell<Slots<T>>>,
}

struct Slots<T: ?Sized + 'static> {
    next: u64,
    handlers: Vec<(u64, Rc<RefCell<dyn FnMut(&T)>>)>,
}

trait Disconnect {
    fn disconnect(&self, id: u64);
}

impl<T: ?Sized + 'static> Disconnect for RefCell<Slots<T>> {
    fn disconnect(&self, id: u64) {
        match self.try_borrow_mut() {
            Ok(mut slots) => slots.handlers.retain(|(handler_id, _)| *handler_id != id),
            Err(_) => warn!("Failed to disconnect signal handler #{}", id),
        }
    }
}

impl<T: ?Sized + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Rc::new(RefCell::new(Slots {
                next: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn connect<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&T) + 'static,
    {
        let id = {
            let mut slots = self.slots.borrow_mut();
            slots.next += 1;
            let id = slots.next;
            let handler: Rc<RefCell<dyn FnMut(&T)>> = Rc::new(RefCell::new(handler));
            slots.handlers.push((id, handler));
            id
        };
        let slot: Weak<RefCell<Slots<T>>> = Rc::downgrade(&self.slots);
        Subscription {
            slot,
            id,
        }
    }

    /// Invokes every connected callback with `arg`; returns how many ran.
    pub fn send(&self, arg: &T) -> usize {
        let handlers: Vec<(u64, Rc<RefCell<dyn FnMut(&T)>>)> = self.slots.borrow()
            .handlers
            .iter()
            .map(|(id, handler)| (*id, Rc::clone(handler)))
            .collect();

        let mut count = 0;
        for (id, handler) in handlers {
            if !self.is_connected(id) {
                continue;
            }
            match handler.try_borrow_mut() {
                Ok(mut handler) => {
                    (&mut *handler)(arg);
                    count += 1;
                },
                Err(_) => warn!("Skipped re-entrant invocation of signal handler #{}", id),
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_connected(&self, id: u64) -> bool {
        self.slots.borrow().handlers.iter().any(|(handler_id, _)| *handler_id == id)
    }
}

impl<T: ?Sized + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("handlers", &self.len()).finish()
    }
}

/// Keeps a signal callback connected; dropping it disconnects the callback.
#[must_use = "dropping a Subscription disconnects its callback"]
pub struct Subscription {
    slot: Weak<dyn Disconnect>,
    id: u64,
}

impl Subscription {
    pub fn is_connected(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.disconnect(self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn dropping_subscription_disconnects() {
        let signal: Signal<u32> = Signal::new();
        let total = Rc::new(Cell::new(0));

        let counter = total.clone();
        let subscription = signal.connect(move |value| counter.set(counter.get() + *value));
        assert_eq!(signal.send(&5), 1);
        assert_eq!(total.get(), 5);

        drop(subscription);
        assert!(signal.is_empty());
        assert_eq!(signal.send(&5), 0);
        assert_eq!(total.get(), 5);
    }

    #[test]
    fn handler_may_disconnect_a_later_handler() {
        let signal: Signal<()> = Signal::new();
        let calls = Rc::new(Cell::new(0));
        let victim: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let slot = victim.clone();
        let _first = signal.connect(move |_| {
            slot.borrow_mut().take();
        });
        let counter = calls.clone();
        *victim.borrow_mut() = Some(signal.connect(move |_| counter.set(counter.get() + 1)));

        assert_eq!(signal.send(&()), 1);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn unsized_arguments() {
        let signal: Signal<str> = Signal::new();
        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        let _subscription = signal.connect(move |text: &str| sink.borrow_mut().push_str(text));
        signal.send("ready");
        assert_eq!(seen.borrow().as_str(), "ready");
    }

    #[test]
    fn subscription_outliving_signal() {
        let signal: Signal<()> = Signal::new();
        let subscription = signal.connect(|_| ());
        assert!(subscription.is_connected());
        drop(signal);
        assert!(!subscription.is_connected());
    }
}
