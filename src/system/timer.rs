/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::system::{EventLoop, Signal};
use crate::system::selector::clamp_wait;

type TimerKey = (u64, u64);

/// Started timers of one [`EventLoop`], ordered by expiry
///
/// Expiry times are whole milliseconds relative to the creation of the
/// queue. Several timers may share an expiry; a sequence number keeps them
/// in start order.
pub(crate) struct TimerQueue {
    base: Instant,
    sequence: u64,
    timers: BTreeMap<TimerKey, Weak<TimerInner>>,
}

/// A timer taken off the queue because it expired.
pub(crate) struct Expired {
    timer: Rc<TimerInner>,
    epoch: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            sequence: 0,
            timers: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> u64 {
        to_millis(self.base.elapsed())
    }

    pub fn instant(&self, millis: u64) -> Option<Instant> {
        self.base.checked_add(Duration::from_millis(millis))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    fn schedule(&mut self, timer: &Rc<TimerInner>, expiry: u64) -> TimerKey {
        self.sequence += 1;
        let key = (expiry, self.sequence);
        self.timers.insert(key, Rc::downgrade(timer));
        key
    }

    fn unschedule(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    /// Time left until the earliest timer expires; `None` if no timer is
    /// started.
    pub fn wait_time(&self, now: u64) -> Option<Duration> {
        self.timers.keys().next().map(|(expiry, _)| clamp_wait(Some(Duration::from_millis(expiry.saturating_sub(now)))).unwrap_or(Duration::ZERO))
    }

    /// Removes every timer that expired at `now` and reschedules the periodic
    /// ones, one interval after their *previous* expiry. Each timer is
    /// returned at most once per call, even if it fell behind by several
    /// intervals.
    pub fn expire(&mut self, now: u64) -> Vec<Expired> {
        let later = self.timers.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.timers, later);

        let mut expired = Vec::with_capacity(due.len());
        for ((expiry, _), timer) in due {
            let timer = match timer.upgrade() {
                Some(timer) => timer,
                None => continue,
            };
            let epoch = {
                let mut state = timer.state.borrow_mut();
                state.key = None;
                if state.interval.is_zero() {
                    state.active = false;
                } else {
                    let next = match expiry.checked_add(to_millis(state.interval)) {
                        Some(next) => next,
                        None => {
                            warn!("Timer expiry overflows, the timer will not expire again!");
                            u64::MAX
                        },
                    };
                    state.key = Some(self.schedule(&timer, next));
                }
                state.epoch
            };
            expired.push(Expired { timer, epoch });
        }
        expired
    }
}

impl Expired {
    /// Sends the timeout signal, unless the timer has been stopped or
    /// restarted since it was taken off the queue. Returns `true` if the
    /// signal was sent.
    pub fn fire(self) -> bool {
        if self.timer.state.borrow().epoch != self.epoch {
            return false;
        }
        let timer = Timer { inner: self.timer };
        trace!("Timer expired: {:?}", timer);
        timer.inner.timeout.send(&timer);
        true
    }
}

impl Debug for TimerQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue").field("timers", &self.timers.len()).finish()
    }
}

fn to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A periodic (or one-shot) timer driven by an [`EventLoop`]
///
/// The [`timeout()`](Timer::timeout()) signal is sent each time the timer
/// expires. A periodic timer is rescheduled relative to its previous expiry,
/// so it does not drift when the loop is healthy. The timer may be stopped,
/// restarted or dropped from within its own timeout handler.
///
/// `Timer` is a cheap handle; clones refer to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

pub(crate) struct TimerInner {
    state: RefCell<TimerState>,
    timeout: Signal<Timer>,
}

struct TimerState {
    event_loop: Option<EventLoop>,
    active: bool,
    delay: Duration,
    interval: Duration,
    key: Option<TimerKey>,
    epoch: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(TimerInner {
                state: RefCell::new(TimerState {
                    event_loop: None,
                    active: false,
                    delay: Duration::ZERO,
                    interval: Duration::ZERO,
                    key: None,
                    epoch: 0,
                }),
                timeout: Signal::new(),
            }),
        }
    }

    /// Attaches the timer to `event_loop`. A timer that was started while
    /// detached begins counting now.
    pub fn attach(&self, event_loop: &EventLoop) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.event_loop.is_some() {
            return Err(Error::AlreadyAttached);
        }
        state.event_loop = Some(event_loop.clone());
        if state.active {
            self.schedule(&mut state);
        }
        Ok(())
    }

    /// Detaches the timer; a started timer stays started and resumes when it
    /// is attached again.
    pub fn detach(&self) {
        let mut state = self.inner.state.borrow_mut();
        Self::unschedule(&mut state);
        state.event_loop = None;
    }

    pub fn event_loop(&self) -> Option<EventLoop> {
        self.inner.state.borrow().event_loop.clone()
    }

    /// Starts the timer with the given `interval`, restarting it if it is
    /// already active. A zero interval makes a one-shot timer that fires on
    /// the next loop iteration.
    pub fn start(&self, interval: Duration) {
        self.start_after(interval, interval)
    }

    /// Starts the timer so that it first expires after `delay`, then every
    /// `interval`. A zero `interval` makes a one-shot timer.
    pub fn start_after(&self, delay: Duration, interval: Duration) {
        let mut state = self.inner.state.borrow_mut();
        Self::unschedule(&mut state);
        state.epoch += 1;
        state.active = true;
        state.delay = delay;
        state.interval = interval;
        if state.event_loop.is_some() {
            self.schedule(&mut state);
        }
    }

    pub fn stop(&self) {
        let mut state = self.inner.state.borrow_mut();
        Self::unschedule(&mut state);
        state.epoch += 1;
        state.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().active
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.borrow().interval
    }

    /// The point in time of the next expiry, if the timer is scheduled.
    pub fn expiry(&self) -> Option<Instant> {
        let state = self.inner.state.borrow();
        match (&state.event_loop, state.key) {
            (Some(event_loop), Some((expiry, _))) => event_loop.timers().try_borrow().ok().and_then(|timers| timers.instant(expiry)),
            _ => None,
        }
    }

    pub fn timeout(&self) -> &Signal<Timer> {
        &self.inner.timeout
    }

    fn schedule(&self, state: &mut TimerState) {
        if let Some(event_loop) = &state.event_loop {
            let mut timers = event_loop.timers().borrow_mut();
            let expiry = timers.now().saturating_add(to_millis(state.delay));
            state.key = Some(timers.schedule(&self.inner, expiry));
        }
    }

    fn unschedule(state: &mut TimerState) {
        if let (Some(event_loop), Some(key)) = (&state.event_loop, state.key.take()) {
            match event_loop.timers().try_borrow_mut() {
                Ok(mut timers) => timers.unschedule(key),
                Err(_) => warn!("Failed to unschedule timer: queue is busy"),
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.inner.state.try_borrow() {
            Ok(state) => f.debug_struct("Timer")
                .field("active", &state.active)
                .field("interval", &state.interval)
                .field("expiry", &state.key.map(|(expiry, _)| expiry))
                .finish(),
            Err(_) => f.debug_struct("Timer").finish_non_exhaustive(),
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let (Some(event_loop), Some(key)) = (&state.event_loop, state.key.take()) {
            if let Ok(mut timers) = event_loop.timers().try_borrow_mut() {
                timers.unschedule(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn arm(queue: &mut TimerQueue, timer: &Timer, expiry: u64, interval: u64) {
        let mut state = timer.inner.state.borrow_mut();
        state.active = true;
        state.interval = Duration::from_millis(interval);
        state.key = Some(queue.schedule(&timer.inner, expiry));
    }

    fn expiry_of(timer: &Timer) -> Option<u64> {
        timer.inner.state.borrow().key.map(|(expiry, _)| expiry)
    }

    #[test]
    fn never_fires_early() {
        let mut queue = TimerQueue::new();
        let timer = Timer::new();
        arm(&mut queue, &timer, 100, 50);

        assert!(queue.expire(0).is_empty());
        assert!(queue.expire(99).is_empty());
        assert_eq!(queue.wait_time(90), Some(Duration::from_millis(10)));
        assert_eq!(queue.expire(100).len(), 1);
    }

    #[test]
    fn reschedules_from_previous_expiry() {
        let mut queue = TimerQueue::new();
        let timer = Timer::new();
        arm(&mut queue, &timer, 100, 50);

        assert_eq!(queue.expire(130).len(), 1);
        assert_eq!(expiry_of(&timer), Some(150));

        // fell behind by several intervals: fires once per call
        assert_eq!(queue.expire(420).len(), 1);
        assert_eq!(expiry_of(&timer), Some(200));
        assert_eq!(queue.wait_time(420), Some(Duration::ZERO));
    }

    #[test]
    fn overflowing_expiry_is_pinned() {
        let mut queue = TimerQueue::new();
        let timer = Timer::new();
        arm(&mut queue, &timer, u64::MAX - 10, 50);

        assert_eq!(queue.expire(u64::MAX - 1).len(), 1);
        assert_eq!(expiry_of(&timer), Some(u64::MAX));
        assert!(timer.is_active());
    }

    #[test]
    fn one_shot_timer_is_deactivated() {
        let mut queue = TimerQueue::new();
        let timer = Timer::new();
        arm(&mut queue, &timer, 10, 0);

        assert_eq!(queue.expire(10).len(), 1);
        assert!(!timer.is_active());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.wait_time(10), None);
    }

    #[test]
    fn dropped_timers_are_skipped() {
        let mut queue = TimerQueue::new();
        let timer = Timer::new();
        arm(&mut queue, &timer, 10, 10);
        drop(timer);
        assert!(queue.expire(100).is_empty());
    }

    #[test]
    fn stopped_timer_does_not_fire() {
        let mut queue = TimerQueue::new();
        let first = Timer::new();
        let second = Timer::new();
        arm(&mut queue, &first, 10, 10);
        arm(&mut queue, &second, 10, 10);

        let fired = Rc::new(Cell::new(0));
        let victim = second.clone();
        let _stopper = first.timeout().connect(move |_| victim.stop());
        let counter = fired.clone();
        let _counter = second.timeout().connect(move |_| counter.set(counter.get() + 1));

        for expired in queue.expire(10) {
            expired.fire();
        }
        assert_eq!(fired.get(), 0);
    }
}
