/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefMut;
use std::io::{Read, Write, Result as IoResult, ErrorKind};
use std::time::Duration;

use mio::Interest;
use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;

use log::trace;

use crate::error::{Error, Result};
use crate::system::{EventLoop, Readiness, Selectable, SelectableId};
use crate::system::selectable::Registration;
use crate::utilities::Timeout;

/// Non-blocking byte transport underneath an [`IoDevice`]
///
/// Both functions must return [`ErrorKind::WouldBlock`] rather than block.
pub trait Transport: Source {
    fn try_read(&mut self, buffer: &mut [u8]) -> IoResult<usize>;

    fn try_write(&mut self, buffer: &[u8]) -> IoResult<usize>;
}

impl Transport for MioTcpStream {
    fn try_read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        self.read(buffer)
    }

    fn try_write(&mut self, buffer: &[u8]) -> IoResult<usize> {
        self.write(buffer)
    }
}

/// Runs `op` until it does not fail with [`ErrorKind::Interrupted`];
/// [`ErrorKind::WouldBlock`] becomes `Ok(None)`.
pub(crate) fn attempt<R, F>(mut op: F) -> IoResult<Option<R>>
where
    F: FnMut() -> IoResult<R>,
{
    loop {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(error) => match error.kind() {
                ErrorKind::Interrupted => (),
                ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(error),
            },
        }
    }
}

/// Retries `op` until it completes, waiting for readiness of `source` in
/// between; fails with [`Error::TimedOut`] once `timeout` has expired and
/// with [`Error::Cancelled`] if the attached loop is exiting.
pub(crate) fn block_on<S, R, F>(source: &mut S, registration: &mut Registration, timeout: Option<Duration>, mut op: F) -> Result<R>
where
    S: Source,
    F: FnMut(&mut S) -> IoResult<Option<R>>,
{
    if is_cancelled(registration) {
        return Err(Error::Cancelled);
    }

    let timeout = Timeout::start(timeout);

    loop {
        if let Some(value) = op(source)? {
            return Ok(value);
        }
        let remaining = timeout.remaining_time();
        registration.wait(source, remaining)?;
        if is_cancelled(registration) {
            return Err(Error::Cancelled);
        }
        if timeout.expired() {
            return op(source)?.ok_or(Error::TimedOut);
        }
    }
}

fn is_cancelled(registration: &Registration) -> bool {
    registration.event_loop().map(EventLoop::is_exiting).unwrap_or(false)
}

struct Pending {
    buffer: Vec<u8>,
    result: Option<Result<usize>>,
    signalled: bool,
}

impl Pending {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            result: None,
            signalled: false,
        }
    }

    fn settle(&mut self, result: IoResult<Option<usize>>) {
        match result {
            Ok(Some(count)) => self.result = Some(Ok(count)),
            Ok(None) => (),
            Err(error) => self.result = Some(Err(error.into())),
        }
    }

    fn available(&self) -> usize {
        match &self.result {
            Some(Ok(count)) => *count,
            _ => 0,
        }
    }
}

/// Which direction of an [`IoDevice`] completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Input,
    Output,
}

/// The read/write state machine shared by all [`IoDevice`]s
///
/// Holds one pending-read and one pending-write slot. Starting a second
/// operation of the same kind while one is outstanding fails with
/// [`Error::Pending`]; so does any blocking call while either is
/// outstanding.
#[doc(hidden)]
pub struct DeviceCore<T> {
    transport: Option<T>,
    registration: Registration,
    read: Option<Pending>,
    write: Option<Pending>,
    timeout: Option<Duration>,
}

impl<T: Transport> DeviceCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            transport: None,
            registration: Registration::new(Interest::READABLE | Interest::WRITABLE),
            read: None,
            write: None,
            timeout: None,
        }
    }

    pub(crate) fn open(&mut self, mut transport: T) -> Result<()> {
        self.close();
        if self.registration.is_attached() {
            self.registration.register(&mut transport)?;
        }
        self.transport = Some(transport);
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Option<T> {
        self.cancel();
        let mut transport = self.transport.take()?;
        self.registration.deregister(&mut transport);
        Some(transport)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub(crate) fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.registration
    }

    pub(crate) fn attach(&mut self, event_loop: &EventLoop, id: SelectableId) -> Result<()> {
        let source = self.transport.as_mut().map(|transport| transport as &mut dyn Source);
        self.registration.attach(event_loop, id, source)
    }

    pub(crate) fn detach(&mut self) -> Option<(EventLoop, SelectableId)> {
        self.cancel();
        let source = self.transport.as_mut().map(|transport| transport as &mut dyn Source);
        self.registration.detach(source)
    }

    pub(crate) fn event_loop(&self) -> Option<EventLoop> {
        self.registration.event_loop().cloned()
    }

    pub(crate) fn set_ready(&self) {
        self.registration.set_ready();
    }

    /// Waits for readiness of the transport, like the blocking calls do.
    pub(crate) fn block_on<R, F>(&mut self, op: F) -> Result<R>
    where
        F: FnMut(&mut T) -> IoResult<Option<R>>,
    {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        block_on(transport, &mut self.registration, self.timeout, op)
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.read.is_some()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.write.is_some()
    }

    fn is_busy(&self) -> bool {
        self.read.is_some() || self.write.is_some()
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Read functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Starts reading up to `len` bytes; returns the number of bytes that
    /// were available right away. The input signal follows in either case.
    pub(crate) fn begin_read(&mut self, len: usize) -> Result<usize> {
        self.registration.require()?;
        if self.read.is_some() {
            return Err(Error::Pending);
        }
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut pending = Pending::new(vec![0u8; len]);
        let buffer = &mut pending.buffer;
        let result = attempt(|| transport.try_read(buffer));
        pending.settle(result);

        let available = pending.available();
        let completed = pending.result.is_some();
        self.read = Some(pending);
        if completed {
            trace!("Read completed immediately: {} byte(s)", available);
            self.registration.set_ready();
        }
        Ok(available)
    }

    /// Finishes the outstanding read and returns the data; an empty vector
    /// means end of stream. Blocks (up to the device timeout) if the read
    /// has not completed yet. The pending state is cleared even on error.
    pub(crate) fn end_read(&mut self) -> Result<Vec<u8>> {
        let mut pending = self.read.take().ok_or(Error::NotPending)?;
        let result = match pending.result.take() {
            Some(result) => result,
            None => {
                let buffer = &mut pending.buffer;
                self.block_on(|transport| attempt(|| transport.try_read(buffer)))
            },
        };
        let count = result?;
        pending.buffer.truncate(count);
        Ok(pending.buffer)
    }

    pub(crate) fn read_some(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if self.is_busy() {
            return Err(Error::Pending);
        }
        self.block_on(|transport| attempt(|| transport.try_read(buffer)))
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Write functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Starts writing `data`; returns the number of bytes that were written
    /// right away. The output signal follows in either case.
    pub(crate) fn begin_write(&mut self, data: &[u8]) -> Result<usize> {
        self.registration.require()?;
        if self.write.is_some() {
            return Err(Error::Pending);
        }
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut pending = Pending::new(data.to_vec());
        let buffer = &pending.buffer;
        let result = attempt(|| transport.try_write(buffer));
        pending.settle(result);

        let accepted = pending.available();
        let completed = pending.result.is_some();
        self.write = Some(pending);
        if completed {
            trace!("Write completed immediately: {} byte(s)", accepted);
            self.registration.set_ready();
        }
        Ok(accepted)
    }

    /// Finishes the outstanding write; returns the number of bytes written,
    /// which may be less than requested.
    pub(crate) fn end_write(&mut self) -> Result<usize> {
        let mut pending = self.write.take().ok_or(Error::NotPending)?;
        match pending.result.take() {
            Some(result) => result,
            None => {
                let buffer = &pending.buffer;
                self.block_on(|transport| attempt(|| transport.try_write(buffer)))
            },
        }
    }

    pub(crate) fn write_some(&mut self, data: &[u8]) -> Result<usize> {
        if self.is_busy() {
            return Err(Error::Pending);
        }
        self.block_on(|transport| attempt(|| transport.try_write(data)))
    }

    pub(crate) fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.write_some(data)? {
                0 => return Err(Error::Incomplete),
                count => data = &data[count..],
            }
        }
        Ok(())
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Dispatch
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Drops both pending operations and any ready notification the loop
    /// holds for this device.
    pub(crate) fn cancel(&mut self) {
        self.read = None;
        self.write = None;
        self.registration.cancel_ready();
    }

    /// Advances the pending operations and reports at most one completion
    /// that has not been signalled yet, input before output. If the other
    /// direction has completed as well, the device is queued again.
    pub(crate) fn on_run(&mut self, readiness: Readiness) -> Option<Completion> {
        if let Some(transport) = self.transport.as_mut() {
            if readiness.is_error() {
                trace!("Transport reported an error condition");
            }
            if let Some(pending) = self.read.as_mut().filter(|pending| pending.result.is_none()) {
                let buffer = &mut pending.buffer;
                let result = attempt(|| transport.try_read(buffer));
                pending.settle(result);
            }
            if let Some(pending) = self.write.as_mut().filter(|pending| pending.result.is_none()) {
                let buffer = &pending.buffer;
                let result = attempt(|| transport.try_write(buffer));
                pending.settle(result);
            }
        }

        let input = unsignalled(&mut self.read);
        let output = unsignalled(&mut self.write);
        match (input, output) {
            (true, output) => {
                mark_signalled(&mut self.read);
                if output {
                    self.registration.set_ready();
                }
                Some(Completion::Input)
            },
            (false, true) => {
                mark_signalled(&mut self.write);
                Some(Completion::Output)
            },
            (false, false) => None,
        }
    }
}

fn unsignalled(slot: &mut Option<Pending>) -> bool {
    slot.as_ref().map(|pending| pending.result.is_some() && !pending.signalled).unwrap_or(false)
}

fn mark_signalled(slot: &mut Option<Pending>) {
    if let Some(pending) = slot.as_mut() {
        pending.signalled = true;
    }
}

impl<T: Transport> Default for DeviceCore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-phase (begin/end) and blocking I/O on a [`Selectable`] byte device
///
/// `begin_*` starts an operation and returns immediately; the device sends
/// its input (or output) signal from within the event loop once the
/// operation has completed, and the result is then collected with the
/// matching `end_*` call. One read and one write may be outstanding at the
/// same time. The blocking calls ([`read_some()`](IoDevice::read_some()),
/// [`write_some()`](IoDevice::write_some()),
/// [`write_all()`](IoDevice::write_all())) fail with [`Error::Pending`]
/// while any operation is outstanding.
///
/// Blocking calls, as well as `end_*` calls made before the operation has
/// completed, wait at most for the device [timeout](IoDevice::set_timeout());
/// `None` means wait forever.
pub trait IoDevice: Selectable {
    type Transport: Transport;

    #[doc(hidden)]
    fn device(&self) -> RefMut<'_, DeviceCore<Self::Transport>>;

    fn begin_read(&self, len: usize) -> Result<usize> {
        self.device().begin_read(len)
    }

    fn end_read(&self) -> Result<Vec<u8>> {
        self.device().end_read()
    }

    fn read_some(&self, buffer: &mut [u8]) -> Result<usize> {
        self.device().read_some(buffer)
    }

    fn begin_write(&self, data: &[u8]) -> Result<usize> {
        self.device().begin_write(data)
    }

    fn end_write(&self) -> Result<usize> {
        self.device().end_write()
    }

    fn write_some(&self, data: &[u8]) -> Result<usize> {
        self.device().write_some(data)
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        self.device().write_all(data)
    }

    fn is_reading(&self) -> bool {
        self.device().is_reading()
    }

    fn is_writing(&self) -> bool {
        self.device().is_writing()
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        self.device().set_timeout(timeout)
    }

    fn timeout(&self) -> Option<Duration> {
        self.device().timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_maps_would_block() {
        let mut calls = 0;
        let result: IoResult<Option<usize>> = attempt(|| {
            calls += 1;
            match calls {
                1 => Err(std::io::Error::from(ErrorKind::Interrupted)),
                _ => Err(std::io::Error::from(ErrorKind::WouldBlock)),
            }
        });
        assert!(matches!(result, Ok(None)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn attempt_passes_errors() {
        let result = attempt(|| Err::<usize, _>(std::io::Error::from(ErrorKind::ConnectionReset)));
        assert_eq!(result.map_err(|error| error.kind()).err(), Some(ErrorKind::ConnectionReset));
    }

    #[test]
    fn unattached_device_rejects_begin() {
        let mut device: DeviceCore<MioTcpStream> = DeviceCore::new();
        assert!(matches!(device.begin_read(16), Err(Error::NotAttached)));
        assert!(matches!(device.begin_write(b"data"), Err(Error::NotAttached)));
        assert!(matches!(device.end_read(), Err(Error::NotPending)));
        assert!(matches!(device.end_write(), Err(Error::NotPending)));
    }

    #[test]
    fn closed_device_is_not_connected() {
        let mut device: DeviceCore<MioTcpStream> = DeviceCore::new();
        let mut buffer = [0u8; 8];
        assert!(matches!(device.read_some(&mut buffer), Err(Error::NotConnected)));
        assert!(!device.is_open());
    }
}
