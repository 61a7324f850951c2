/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;
use std::time::Duration;

use mio::{Interest, Token};
use mio::event::{Event as MioEvent, Source};

use log::warn;

use crate::error::{Error, Result};
use crate::system::EventLoop;
use crate::system::selector::Selector;

const PRIVATE: Token = Token(0);
const PRIVATE_CAPACITY: usize = 8;

/// Handle of an object attached to an [`EventLoop`]
///
/// The index names the slot inside the loop, the generation tells apart
/// objects that have been given the same slot one after another. A handle
/// whose generation no longer matches is ignored by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectableId {
    index: usize,
    generation: u64,
}

impl SelectableId {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self {
            index,
            generation,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.index)
    }
}

/// Readiness reported by the selector for one registered object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(1);
    pub const WRITABLE: Self = Self(2);
    pub const ERROR: Self = Self(4);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(&self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for Readiness {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl From<&MioEvent> for Readiness {
    fn from(event: &MioEvent) -> Self {
        let mut readiness = Self::NONE;
        if event.is_readable() || event.is_read_closed() {
            readiness |= Self::READABLE;
        }
        if event.is_writable() || event.is_write_closed() {
            readiness |= Self::WRITABLE;
        }
        if event.is_error() {
            // pending operations must observe the error, whatever their direction
            readiness |= Self::ERROR | Self::READABLE | Self::WRITABLE;
        }
        readiness
    }
}

/// Capability of being attached to, and notified by, an [`EventLoop`]
///
/// An object is attached to at most one loop at a time. When the loop finds
/// the object ready it invokes [`run()`](Selectable::run()), which returns
/// `true` if a signal was delivered.
pub trait Selectable {
    /// Attaches the object to `event_loop`. Fails with
    /// [`Error::AlreadyAttached`] if the object is attached already.
    fn attach(&self, event_loop: &EventLoop) -> Result<()>;

    /// Detaches the object, cancelling any outstanding operation.
    fn detach(&self);

    /// Drops the state of outstanding operations and any ready notification
    /// the loop holds for this object. Safe to call when nothing is pending.
    fn cancel(&self);

    /// Services the object once; returns `true` if a signal was delivered.
    fn run(&self) -> Result<bool>;

    fn event_loop(&self) -> Option<EventLoop>;

    fn is_attached(&self) -> bool {
        self.event_loop().is_some()
    }
}

/// Hook the event loop calls for a ready object.
pub(crate) trait Dispatch {
    fn on_run(self: Rc<Self>, readiness: Readiness) -> Result<bool>;
}

/// Tracks where an OS source is registered: with the attached event loop, or
/// with a private selector that serves "blocking" calls of an object that is
/// not attached to any loop.
#[derive(Debug)]
pub(crate) struct Registration {
    interest: Interest,
    attachment: Option<(EventLoop, SelectableId)>,
    private: Option<Selector>,
    registered: bool,
}

impl Registration {
    pub fn new(interest: Interest) -> Self {
        Self {
            interest,
            attachment: None,
            private: None,
            registered: false,
        }
    }

    pub fn event_loop(&self) -> Option<&EventLoop> {
        self.attachment.as_ref().map(|(event_loop, _)| event_loop)
    }

    pub fn id(&self) -> Option<SelectableId> {
        self.attachment.as_ref().map(|(_, id)| *id)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn require(&self) -> Result<(&EventLoop, SelectableId)> {
        match &self.attachment {
            Some((event_loop, id)) => Ok((event_loop, *id)),
            None => Err(Error::NotAttached),
        }
    }

    pub fn attach(&mut self, event_loop: &EventLoop, id: SelectableId, source: Option<&mut dyn Source>) -> Result<()> {
        if self.attachment.is_some() {
            return Err(Error::AlreadyAttached);
        }
        match source {
            Some(source) => {
                self.deregister(source);
                self.private = None;
                self.attachment = Some((event_loop.clone(), id));
                self.register(source)
            },
            None => {
                self.private = None;
                self.attachment = Some((event_loop.clone(), id));
                Ok(())
            },
        }
    }

    pub fn detach(&mut self, source: Option<&mut dyn Source>) -> Option<(EventLoop, SelectableId)> {
        if let Some(source) = source {
            self.deregister(source);
        }
        self.attachment.take()
    }

    pub fn register(&mut self, source: &mut dyn Source) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        match &self.attachment {
            Some((event_loop, id)) => event_loop.register_source(source, id.token(), self.interest)?,
            None => {
                if self.private.is_none() {
                    self.private = Some(Selector::new(PRIVATE_CAPACITY)?);
                }
                if let Some(selector) = &self.private {
                    selector.registry().register(source, PRIVATE, self.interest)?;
                }
            },
        }
        self.registered = true;
        Ok(())
    }

    pub fn deregister(&mut self, source: &mut dyn Source) {
        if !self.registered {
            return;
        }
        let result = match (&self.attachment, &self.private) {
            (Some((event_loop, _)), _) => event_loop.deregister_source(source),
            (None, Some(selector)) => selector.registry().deregister(source).map_err(Error::from),
            (None, None) => Ok(()),
        };
        if let Err(error) = result {
            warn!("Failed to de-register: {:?}", error);
        }
        self.registered = false;
    }

    /// Waits until the selector reports readiness for `source`, or the
    /// timeout expires (in which case the returned readiness is empty).
    pub fn wait(&mut self, source: &mut dyn Source, timeout: Option<Duration>) -> Result<Readiness> {
        self.register(source)?;
        match (&self.attachment, &mut self.private) {
            (Some((event_loop, id)), _) => event_loop.wait_for(*id, timeout),
            (None, Some(selector)) => selector.wait_token(PRIVATE, timeout),
            (None, None) => Ok(Readiness::NONE),
        }
    }

    pub fn set_ready(&self) {
        if let Some((event_loop, id)) = &self.attachment {
            event_loop.set_ready(*id);
        }
    }

    pub fn cancel_ready(&self) {
        if let Some((event_loop, id)) = &self.attachment {
            event_loop.cancel_ready(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_flags() {
        let mut readiness = Readiness::READABLE | Readiness::WRITABLE;
        assert!(readiness.is_readable());
        assert!(readiness.is_writable());
        assert!(!readiness.is_error());
        readiness.remove(Readiness::READABLE);
        assert!(!readiness.is_readable());
        assert!(readiness.is_writable());
        readiness.remove(Readiness::WRITABLE);
        assert!(readiness.is_empty());
        assert!(!readiness.contains(Readiness::NONE));
    }

    #[test]
    fn unattached_registration_requires_loop() {
        let registration = Registration::new(Interest::READABLE);
        assert!(matches!(registration.require(), Err(Error::NotAttached)));
        assert!(registration.id().is_none());
    }
}
