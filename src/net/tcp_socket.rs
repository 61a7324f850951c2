/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io::{Read, Write, Result as IoResult, ErrorKind};
use std::net::{SocketAddr, Shutdown};
use std::rc::{Rc, Weak};

use mio::net::TcpStream as MioTcpStream;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::net::{Endpoint, TcpSocketOptions};
use crate::system::{Completion, DeviceCore, Dispatch, EventLoop, IoDevice, Readiness, Selectable, Signal};

/// A TCP stream between a local and a remote socket
///
/// Connecting, reading and writing are available both as two-phase
/// operations (`begin_*` / `end_*`, completed through the
/// [`connected()`](TcpSocket::connected()),
/// [`input_ready()`](TcpSocket::input_ready()) and
/// [`output_ready()`](TcpSocket::output_ready()) signals of an attached
/// socket) and as "blocking" calls with ***timeout*** support. The blocking
/// calls also work on a socket that is not attached to any
/// [`EventLoop`](crate::system::EventLoop).
///
/// Connecting tries every address the [`Endpoint`] resolves to, in order,
/// and fails with the error of the last attempt.
///
/// `TcpSocket` is a cheap handle; clones refer to the same socket.
#[derive(Clone)]
pub struct TcpSocket {
    inner: Rc<SocketInner>,
}

struct SocketInner {
    state: RefCell<SocketState>,
    connected: Signal<TcpSocket>,
    input_ready: Signal<TcpSocket>,
    output_ready: Signal<TcpSocket>,
}

struct SocketState {
    device: DeviceCore<MioTcpStream>,
    connecting: Option<Connecting>,
    connected: bool,
    options: TcpSocketOptions,
}

struct Connecting {
    remaining: VecDeque<SocketAddr>,
    result: Option<Result<()>>,
    signalled: bool,
}

impl TcpSocket {
    pub fn new() -> Self {
        Self::with_options(TcpSocketOptions::default())
    }

    pub fn with_options(options: TcpSocketOptions) -> Self {
        Self {
            inner: Rc::new(SocketInner {
                state: RefCell::new(SocketState {
                    device: DeviceCore::new(),
                    connecting: None,
                    connected: false,
                    options,
                }),
                connected: Signal::new(),
                input_ready: Signal::new(),
                output_ready: Signal::new(),
            }),
        }
    }

    pub(crate) fn from_stream(stream: MioTcpStream, options: TcpSocketOptions) -> Result<Self> {
        let socket = Self::with_options(options);
        {
            let mut state = socket.inner.state.borrow_mut();
            state.device.open(stream)?;
            state.connected = true;
            state.apply_options();
        }
        Ok(socket)
    }

    pub fn connected(&self) -> &Signal<TcpSocket> {
        &self.inner.connected
    }

    pub fn input_ready(&self) -> &Signal<TcpSocket> {
        &self.inner.input_ready
    }

    pub fn output_ready(&self) -> &Signal<TcpSocket> {
        &self.inner.output_ready
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.borrow().connecting.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().device.transport().and_then(|stream| stream.peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().device.transport().and_then(|stream| stream.local_addr().ok())
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let state = self.inner.state.borrow();
        let stream = state.device.transport().ok_or(Error::NotConnected)?;
        stream.shutdown(how)?;
        Ok(())
    }

    /// Closes the socket, cancelling all outstanding operations. The socket
    /// stays attached and may be connected again.
    pub fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.connecting = None;
        state.connected = false;
        if state.device.close().is_some() {
            debug!("Socket closed");
        }
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Connect functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Connects to `endpoint`, blocking up to the socket timeout for each
    /// resolved address.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.check_idle()?;
        let mut last_error = None;
        for addr in endpoint.resolve()? {
            match state.connect_blocking(addr) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!("Failed to connect to {}: {}", addr, error);
                    state.device.close();
                    last_error = Some(error);
                },
            }
        }
        Err(last_error.unwrap_or(Error::NotConnected))
    }

    /// Starts connecting to `endpoint`; the socket must be attached. Returns
    /// `true` if the connection was established right away. Either way the
    /// [`connected()`](TcpSocket::connected()) signal follows and
    /// [`end_connect()`](TcpSocket::end_connect()) must be called.
    pub fn begin_connect(&self, endpoint: &Endpoint) -> Result<bool> {
        let mut state = self.inner.state.borrow_mut();
        state.device.registration().require()?;
        state.check_idle()?;
        let remaining: VecDeque<SocketAddr> = endpoint.resolve()?.into_iter().collect();
        state.connecting = Some(Connecting {
            remaining,
            result: None,
            signalled: false,
        });
        state.connect_next();
        let completed = matches!(state.connecting.as_ref().and_then(|connecting| connecting.result.as_ref()), Some(Ok(())));
        Ok(completed)
    }

    /// Finishes connecting, blocking up to the socket timeout if the
    /// connection is still in progress. On error the socket is closed before
    /// the error is returned. A no-op on a connected socket.
    pub fn end_connect(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let mut connecting = match state.connecting.take() {
            Some(connecting) => connecting,
            None => return match state.connected {
                true => Ok(()),
                false => Err(Error::NotPending),
            },
        };
        let result = match connecting.result.take() {
            Some(result) => result,
            None => state.finish_connect(connecting.remaining),
        };
        match result {
            Ok(()) => {
                state.connected = true;
                state.apply_options();
                Ok(())
            },
            Err(error) => {
                state.connected = false;
                state.device.close();
                Err(error)
            },
        }
    }
}

impl SocketState {
    fn check_idle(&self) -> Result<()> {
        if self.connecting.is_some() || self.device.is_reading() || self.device.is_writing() {
            return Err(Error::Pending);
        }
        if self.connected {
            return Err(Error::AlreadyConnected);
        }
        Ok(())
    }

    fn apply_options(&mut self) {
        let no_delay = self.options.no_delay;
        if let Some(stream) = self.device.transport() {
            if let Err(error) = stream.set_nodelay(no_delay) {
                warn!("Failed to set TCP_NODELAY: {:?}", error);
            }
        }
    }

    fn connect_blocking(&mut self, addr: SocketAddr) -> Result<()> {
        self.device.open(MioTcpStream::connect(addr)?)?;
        self.device.block_on(|stream| check_connected(stream).map(|done| done.then_some(())))?;
        self.connected = true;
        self.apply_options();
        Ok(())
    }

    /// Starts a non-blocking connect to the next remaining address, until
    /// one is in progress or has completed; records the outcome otherwise.
    fn connect_next(&mut self) {
        loop {
            let addr = match self.connecting.as_mut().and_then(|connecting| connecting.remaining.pop_front()) {
                Some(addr) => addr,
                None => {
                    self.settle_connect(Err(Error::NotConnected));
                    return;
                },
            };
            trace!("Connecting to {}", addr);
            let attempt = MioTcpStream::connect(addr)
                .map_err(Error::from)
                .and_then(|stream| self.device.open(stream))
                .and_then(|()| self.poll_connected());
            match attempt {
                Ok(true) => {
                    self.settle_connect(Ok(()));
                    return;
                },
                Ok(false) => return,
                Err(error) => {
                    debug!("Failed to connect to {}: {}", addr, error);
                    self.device.close();
                    if self.connecting.as_ref().map(|connecting| connecting.remaining.is_empty()).unwrap_or(true) {
                        self.settle_connect(Err(error));
                        return;
                    }
                },
            }
        }
    }

    fn poll_connected(&mut self) -> Result<bool> {
        match self.device.transport_mut() {
            Some(stream) => Ok(check_connected(stream)?),
            None => Err(Error::NotConnected),
        }
    }

    fn settle_connect(&mut self, result: Result<()>) {
        if let Some(connecting) = self.connecting.as_mut() {
            connecting.result = Some(result);
        }
        self.device.set_ready();
    }

    fn finish_connect(&mut self, remaining: VecDeque<SocketAddr>) -> Result<()> {
        let mut last_error = match self.device.is_open() {
            true => match self.device.block_on(|stream| check_connected(stream).map(|done| done.then_some(()))) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            },
            false => Error::NotConnected,
        };
        for addr in remaining {
            self.device.close();
            match self.connect_blocking(addr) {
                Ok(()) => return Ok(()),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    /// Advances a connect in progress; returns `true` if the outcome is ready
    /// to be signalled.
    fn on_connecting(&mut self) -> bool {
        let in_progress = self.connecting.as_ref().map(|connecting| connecting.result.is_none()).unwrap_or(false);
        if in_progress {
            match self.poll_connected() {
                Ok(true) => self.settle_connect(Ok(())),
                Ok(false) => (),
                Err(error) => {
                    debug!("Connect failed: {}", error);
                    self.device.close();
                    let exhausted = self.connecting.as_ref().map(|connecting| connecting.remaining.is_empty()).unwrap_or(true);
                    match exhausted {
                        true => self.settle_connect(Err(error)),
                        false => self.connect_next(),
                    }
                },
            }
        }
        match self.connecting.as_mut() {
            Some(connecting) if connecting.result.is_some() && !connecting.signalled => {
                connecting.signalled = true;
                true
            },
            _ => false,
        }
    }
}

/// `Ok(false)` while the connection attempt is still in progress.
fn check_connected(stream: &mut MioTcpStream) -> IoResult<bool> {
    if let Some(error) = stream.take_error()? {
        return Err(error);
    }
    loop {
        break match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) if error.kind() == ErrorKind::NotConnected => Ok(false),
            Err(error) => Err(error),
        };
    }
}

enum Notify {
    Connected,
    Input,
    Output,
}

impl Dispatch for SocketInner {
    fn on_run(self: Rc<Self>, readiness: Readiness) -> Result<bool> {
        let notify = {
            let mut state = self.state.borrow_mut();
            if state.connecting.is_some() {
                state.on_connecting().then_some(Notify::Connected)
            } else {
                state.device.on_run(readiness).map(|completion| match completion {
                    Completion::Input => Notify::Input,
                    Completion::Output => Notify::Output,
                })
            }
        };
        let socket = TcpSocket { inner: self };
        match notify {
            Some(Notify::Connected) => socket.inner.connected.send(&socket),
            Some(Notify::Input) => socket.inner.input_ready.send(&socket),
            Some(Notify::Output) => socket.inner.output_ready.send(&socket),
            None => return Ok(false),
        };
        Ok(true)
    }
}

impl Selectable for TcpSocket {
    fn attach(&self, event_loop: &EventLoop) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.device.registration().is_attached() {
            return Err(Error::AlreadyAttached);
        }
        let target: Weak<dyn Dispatch> = Rc::downgrade(&self.inner) as Weak<_>;
        let id = event_loop.insert(target);
        if let Err(error) = state.device.attach(event_loop, id) {
            event_loop.remove(id);
            return Err(error);
        }
        Ok(())
    }

    fn detach(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.connecting = None;
        if let Some((event_loop, id)) = state.device.detach() {
            event_loop.remove(id);
        }
    }

    fn cancel(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.connecting.take().is_some() && !state.connected {
            state.device.close();
        }
        state.device.cancel();
    }

    fn run(&self) -> Result<bool> {
        Dispatch::on_run(self.inner.clone(), Readiness::NONE)
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.state.borrow().device.event_loop()
    }
}

impl IoDevice for TcpSocket {
    type Transport = MioTcpStream;

    fn device(&self) -> RefMut<'_, DeviceCore<MioTcpStream>> {
        RefMut::map(self.inner.state.borrow_mut(), |state| &mut state.device)
    }
}

impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        Ok(self.write_some(buf)?)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TcpSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("local_addr", &self.local_addr())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some((event_loop, id)) = state.device.detach() {
            event_loop.remove(id);
        }
        state.device.close();
    }
}
