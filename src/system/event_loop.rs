/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Interest, Token, Waker};
use mio::event::Source;
use slab::Slab;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::system::{Event, EventQueue, Readiness, SelectableId, Signal, Subscription};
use crate::system::selectable::Dispatch;
use crate::system::selector::{Selector, WAKE, min_wait};
use crate::system::timer::TimerQueue;
use crate::utilities::Flag;

const DEFAULT_CAPACITY: usize = 128;

/// A single-threaded reactor that drives [`Selectable`](crate::system::Selectable)
/// objects, [`Timer`](crate::system::Timer)s and cross-thread [`Event`]s
///
/// Each thread that wants to do asynchronous I/O creates its own
/// `EventLoop`. The loop itself is **not** `Send`: sockets, servers and
/// timers are attached to it on the same thread and their signals are
/// delivered from within [`run()`](EventLoop::run()). Other threads interact
/// with the loop through a [`LoopController`], which can post events and
/// make the loop exit.
///
/// `EventLoop` is a cheap handle; clones refer to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    selector: RefCell<Selector>,
    slots: RefCell<Slots>,
    timers: RefCell<TimerQueue>,
    queue: Arc<EventQueue>,
    exit: Arc<Flag>,
    idle_timeout: Cell<Option<Duration>>,
    running: Cell<bool>,
    event_received: Signal<dyn Event>,
    idle: Signal<EventLoop>,
    exited: Signal<EventLoop>,
}

struct Slot {
    generation: u64,
    target: Weak<dyn Dispatch>,
    readiness: Readiness,
    queued: bool,
}

struct Slots {
    entries: Slab<Slot>,
    generation: u64,
    ready: VecDeque<SelectableId>,
}

impl Slots {
    fn get_mut(&mut self, id: SelectableId) -> Option<&mut Slot> {
        self.entries.get_mut(id.index()).filter(|slot| slot.generation == id.generation())
    }

    fn mark(&mut self, token: Token, readiness: Readiness) {
        if let Some(slot) = self.entries.get_mut(token.0) {
            slot.readiness |= readiness;
            if !slot.queued {
                slot.queued = true;
                self.ready.push_back(SelectableId::new(token.0, slot.generation));
            }
        }
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a loop that collects up to `capacity` readiness events per
    /// call into the OS multiplexer.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let selector = Selector::new(capacity)?;
        let waker = Arc::new(Waker::new(selector.registry(), WAKE)?);
        Ok(Self {
            inner: Rc::new(LoopInner {
                selector: RefCell::new(selector),
                slots: RefCell::new(Slots {
                    entries: Slab::new(),
                    generation: 0,
                    ready: VecDeque::new(),
                }),
                timers: RefCell::new(TimerQueue::new()),
                queue: Arc::new(EventQueue::with_waker(waker.clone())),
                exit: Arc::new(Flag::new(waker)),
                idle_timeout: Cell::new(None),
                running: Cell::new(false),
                event_received: Signal::new(),
                idle: Signal::new(),
                exited: Signal::new(),
            }),
        })
    }

    /// Runs the loop until [`exit()`](EventLoop::exit()) is called, either
    /// on this thread or through a [`LoopController`].
    ///
    /// An error returned by an attached object while it is being serviced
    /// stops the loop and is returned to the caller. The
    /// [`exited()`](EventLoop::exited()) signal is sent in either case.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(Error::Pending);
        }
        debug!("Event loop started");

        let mut last_activity = Instant::now();
        let result = loop {
            if self.inner.exit.check() {
                break Ok(());
            }
            let idle_timeout = self.inner.idle_timeout.get();
            let idle_wait = idle_timeout.map(|limit| limit.saturating_sub(last_activity.elapsed()));
            match self.iterate(idle_wait) {
                Ok(0) => {
                    if let Some(limit) = idle_timeout {
                        if last_activity.elapsed() >= limit {
                            trace!("Event loop is idle");
                            self.inner.idle.send(self);
                            last_activity = Instant::now();
                        }
                    }
                },
                Ok(_) => last_activity = Instant::now(),
                Err(error) => break Err(error),
            }
        };

        self.inner.exit.clear();
        self.inner.queue.restart();
        self.inner.running.set(false);
        debug!("Event loop exited: {:?}", result);
        self.inner.exited.send(self);
        result
    }

    /// Performs a single loop iteration, waiting at most `timeout` for
    /// readiness; returns the number of signals delivered.
    pub fn poll_once(&self, timeout: Option<Duration>) -> Result<usize> {
        self.iterate(timeout)
    }

    /// Makes [`run()`](EventLoop::run()) return after the current iteration.
    /// An exit requested while the loop is not running is kept, so the next
    /// `run()` returns right away. Blocking calls of attached objects fail
    /// with [`Error::Cancelled`] until `run()` has returned.
    pub fn exit(&self) {
        self.inner.queue.exit();
        if let Err(error) = self.inner.exit.raise() {
            warn!("Failed to wake the event loop: {:?}", error);
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.exit.check()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn controller(&self) -> LoopController {
        LoopController {
            exit: self.inner.exit.clone(),
            queue: self.inner.queue.clone(),
        }
    }

    /// Sends the [`idle()`](EventLoop::idle()) signal whenever nothing happened
    /// for `timeout`; `None` disables it.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.idle_timeout.set(timeout);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.idle_timeout.get()
    }

    pub fn idle(&self) -> &Signal<EventLoop> {
        &self.inner.idle
    }

    pub fn exited(&self) -> &Signal<EventLoop> {
        &self.inner.exited
    }

    /// Sent for every event taken off the event queue.
    pub fn event_received(&self) -> &Signal<dyn Event> {
        &self.inner.event_received
    }

    /// Connects `handler` to events of type `E` only.
    pub fn on_event<E, F>(&self, mut handler: F) -> Subscription
    where
        E: Event,
        F: FnMut(&E) + 'static,
    {
        self.inner.event_received.connect(move |event| {
            if let Some(event) = event.as_any().downcast_ref::<E>() {
                handler(event);
            }
        })
    }

    pub fn push_event(&self, event: &dyn Event) {
        self.inner.queue.push_event(event);
    }

    /// Number of objects currently attached.
    pub fn attached_count(&self) -> usize {
        self.inner.slots.borrow().entries.len()
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Loop iteration
    // ~~~~~~~~~~~~~~~~~~~~~~~

    fn iterate(&self, wait: Option<Duration>) -> Result<usize> {
        let mut count = self.process_events();
        count += self.process_timers();

        let busy = count > 0
            || self.inner.exit.check()
            || !self.inner.queue.is_empty()
            || !self.inner.slots.borrow().ready.is_empty();
        let wait = match busy {
            true => Some(Duration::ZERO),
            false => {
                let timers = self.inner.timers.borrow();
                min_wait(timers.wait_time(timers.now()), wait)
            },
        };

        self.select(wait)?;
        Ok(count + self.dispatch_ready()?)
    }

    fn process_events(&self) -> usize {
        self.inner.queue.process_events(|event| {
            trace!("Dispatching event: {}", event.type_name());
            self.inner.event_received.send(event);
        })
    }

    fn process_timers(&self) -> usize {
        let due = {
            let mut timers = self.inner.timers.borrow_mut();
            let now = timers.now();
            timers.expire(now)
        };
        due.into_iter().map(|expired| expired.fire()).filter(|fired| *fired).count()
    }

    fn select(&self, wait: Option<Duration>) -> Result<()> {
        let mut selector = self.inner.selector.try_borrow_mut().map_err(|_| Error::Pending)?;
        let events = selector.poll(wait)?;
        let mut slots = self.inner.slots.borrow_mut();
        for event in events.iter().filter(|event| event.token() != WAKE) {
            slots.mark(event.token(), Readiness::from(event));
        }
        Ok(())
    }

    fn dispatch_ready(&self) -> Result<usize> {
        let mut batch = std::mem::take(&mut self.inner.slots.borrow_mut().ready);
        let mut count = 0;

        while let Some(id) = batch.pop_front() {
            let next = {
                let mut slots = self.inner.slots.borrow_mut();
                match slots.get_mut(id) {
                    Some(slot) if slot.queued => {
                        slot.queued = false;
                        Some((slot.target.clone(), std::mem::take(&mut slot.readiness)))
                    },
                    _ => None,
                }
            };
            let (target, readiness) = match next {
                Some((target, readiness)) => (target, readiness),
                None => continue,
            };
            if let Some(target) = target.upgrade() {
                match target.on_run(readiness) {
                    Ok(true) => count += 1,
                    Ok(false) => (),
                    Err(error) => {
                        self.inner.slots.borrow_mut().ready.extend(batch);
                        return Err(error);
                    },
                }
            }
        }
        Ok(count)
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Crate-internal registry
    // ~~~~~~~~~~~~~~~~~~~~~~~

    pub(crate) fn insert(&self, target: Weak<dyn Dispatch>) -> SelectableId {
        let mut slots = self.inner.slots.borrow_mut();
        slots.generation += 1;
        let generation = slots.generation;
        let index = slots.entries.insert(Slot {
            generation,
            target,
            readiness: Readiness::NONE,
            queued: false,
        });
        SelectableId::new(index, generation)
    }

    pub(crate) fn remove(&self, id: SelectableId) {
        match self.inner.slots.try_borrow_mut() {
            Ok(mut slots) => {
                if slots.get_mut(id).is_some() {
                    slots.entries.remove(id.index());
                }
            },
            Err(_) => warn!("Failed to detach {:?}: slots are busy", id),
        }
    }

    /// Queues `id` for servicing in the current (or next) iteration, without
    /// waiting for the selector.
    pub(crate) fn set_ready(&self, id: SelectableId) {
        let mut slots = self.inner.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(id) {
            if !slot.queued {
                slot.queued = true;
                slots.ready.push_back(id);
            }
        }
    }

    pub(crate) fn cancel_ready(&self, id: SelectableId) {
        if let Some(slot) = self.inner.slots.borrow_mut().get_mut(id) {
            slot.queued = false;
            slot.readiness = Readiness::NONE;
        }
    }

    /// Waits for readiness of `id` outside of [`run()`](EventLoop::run());
    /// readiness found for other objects is kept for the next dispatch.
    pub(crate) fn wait_for(&self, id: SelectableId, timeout: Option<Duration>) -> Result<Readiness> {
        if let Some(slot) = self.inner.slots.borrow_mut().get_mut(id) {
            if !slot.readiness.is_empty() {
                return Ok(std::mem::take(&mut slot.readiness));
            }
        }

        let mut selector = self.inner.selector.try_borrow_mut().map_err(|_| Error::Pending)?;
        let events = selector.poll(timeout)?;
        let mut slots = self.inner.slots.borrow_mut();
        let mut readiness = Readiness::NONE;
        for event in events.iter().filter(|event| event.token() != WAKE) {
            if event.token() == id.token() {
                readiness |= Readiness::from(event);
            } else {
                slots.mark(event.token(), Readiness::from(event));
            }
        }
        Ok(readiness)
    }

    pub(crate) fn register_source(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        let selector = self.inner.selector.try_borrow().map_err(|_| Error::Pending)?;
        selector.registry().register(source, token, interest)?;
        Ok(())
    }

    pub(crate) fn deregister_source(&self, source: &mut dyn Source) -> Result<()> {
        let selector = self.inner.selector.try_borrow().map_err(|_| Error::Pending)?;
        selector.registry().deregister(source)?;
        Ok(())
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerQueue> {
        &self.inner.timers
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for EventLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.inner.running.get())
            .field("exiting", &self.inner.exit.check())
            .field("attached", &self.inner.slots.try_borrow().map(|slots| slots.entries.len()).ok())
            .finish()
    }
}

/// A thread-safe handle to an [`EventLoop`]
///
/// Unlike the `EventLoop` itself, a `LoopController` *can* be moved across
/// the thread boundary. This is useful, for example, to post events from a
/// worker thread or to stop the loop from a Ctrl+C (SIGINT) handler.
#[derive(Debug, Clone)]
pub struct LoopController {
    exit: Arc<Flag>,
    queue: Arc<EventQueue>,
}

impl LoopController {
    /// Asks the loop to exit; returns `true` if this call changed the state.
    pub fn exit(&self) -> std::io::Result<bool> {
        self.queue.exit();
        self.exit.raise()
    }

    pub fn exiting(&self) -> bool {
        self.exit.check()
    }

    pub fn push_event(&self, event: &dyn Event) {
        self.queue.push_event(event);
    }

    pub fn wake(&self) -> std::io::Result<()> {
        self.exit.wake()
    }
}
