/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::Interest;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::net::{Endpoint, TcpServerOptions, TcpSocket, TcpSocketOptions};
use crate::system::{attempt, block_on, Dispatch, EventLoop, Readiness, Registration, Selectable, Signal};

/// A TCP socket server, listening for connections
///
/// Once attached and after [`begin_accept()`](TcpServer::begin_accept()),
/// the server sends its [`connection_pending()`](TcpServer::connection_pending())
/// signal as soon as a connection is waiting; the connection is then taken
/// with [`accept()`](TcpServer::accept()). Called without a pending
/// connection, `accept()` blocks up to the server timeout.
///
/// Accepted sockets are *not* attached to any loop.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    state: RefCell<ServerState>,
    connection_pending: Signal<TcpServer>,
}

struct ServerState {
    listener: Option<MioTcpListener>,
    registration: Registration,
    accepting: bool,
    queue: VecDeque<(MioTcpStream, SocketAddr)>,
    timeout: Option<Duration>,
    socket_options: TcpSocketOptions,
}

impl TcpServer {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ServerInner {
                state: RefCell::new(ServerState {
                    listener: None,
                    registration: Registration::new(Interest::READABLE),
                    accepting: false,
                    queue: VecDeque::new(),
                    timeout: None,
                    socket_options: TcpSocketOptions::default(),
                }),
                connection_pending: Signal::new(),
            }),
        }
    }

    /// Creates a server that listens on `endpoint`.
    pub fn bind(endpoint: &Endpoint, options: &TcpServerOptions) -> Result<Self> {
        let server = Self::new();
        server.listen(endpoint, options)?;
        Ok(server)
    }

    /// Starts listening on the first address `endpoint` resolves to.
    pub fn listen(&self, endpoint: &Endpoint, options: &TcpServerOptions) -> Result<()> {
        let addr = endpoint.resolve()?.into_iter().next().ok_or(Error::NotConnected)?;
        let mut listener = create_listener(addr, options)?;

        let mut state = self.inner.state.borrow_mut();
        state.close();
        if state.registration.is_attached() {
            state.registration.register(&mut listener)?;
        }
        debug!("Listening on {:?}", listener.local_addr());
        state.listener = Some(listener);
        Ok(())
    }

    pub fn connection_pending(&self) -> &Signal<TcpServer> {
        &self.inner.connection_pending
    }

    /// Asks for one [`connection_pending()`](TcpServer::connection_pending())
    /// signal; the server must be attached and listening.
    pub fn begin_accept(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.registration.require()?;
        if state.listener.is_none() {
            return Err(Error::NotConnected);
        }
        state.accepting = true;
        state.drain_backlog();
        if !state.queue.is_empty() {
            state.registration.set_ready();
        }
        Ok(())
    }

    /// Takes the next pending connection, blocking up to the server timeout
    /// if there is none.
    pub fn accept(&self) -> Result<TcpSocket> {
        let mut state = self.inner.state.borrow_mut();
        let (stream, addr) = match state.queue.pop_front() {
            Some(connection) => connection,
            None => {
                let timeout = state.timeout;
                let ServerState { listener, registration, .. } = &mut *state;
                let listener = listener.as_mut().ok_or(Error::NotConnected)?;
                block_on(listener, registration, timeout, |listener| attempt(|| listener.accept()))?
            },
        };
        debug!("Accepted connection from {}", addr);
        TcpSocket::from_stream(stream, state.socket_options.clone())
    }

    /// Takes the next pending connection without blocking.
    pub fn try_accept(&self) -> Result<Option<TcpSocket>> {
        let mut state = self.inner.state.borrow_mut();
        if state.queue.is_empty() {
            state.drain_backlog();
        }
        match state.queue.pop_front() {
            Some((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                TcpSocket::from_stream(stream, state.socket_options.clone()).map(Some)
            },
            None => Ok(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.borrow_mut().timeout = timeout;
    }

    /// Options applied to accepted sockets.
    pub fn set_socket_options(&self, options: TcpSocketOptions) {
        self.inner.state.borrow_mut().socket_options = options;
    }

    pub fn close(&self) {
        self.inner.state.borrow_mut().close();
    }
}

impl ServerState {
    fn close(&mut self) {
        self.accepting = false;
        self.queue.clear();
        self.registration.cancel_ready();
        if let Some(mut listener) = self.listener.take() {
            self.registration.deregister(&mut listener);
        }
    }

    fn drain_backlog(&mut self) {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return,
        };
        loop {
            match attempt(|| listener.accept()) {
                Ok(Some(connection)) => {
                    trace!("Connection queued: {}", connection.1);
                    self.queue.push_back(connection);
                },
                Ok(None) => break,
                Err(error) => {
                    warn!("Failed to accept connection: {:?}", error);
                    break;
                },
            }
        }
    }
}

fn create_listener(addr: SocketAddr, options: &TcpServerOptions) -> Result<MioTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(options.backlog).unwrap_or(i32::MAX))?;
    if let Some(timeout) = options.defer_accept {
        set_defer_accept(&socket, timeout)?;
    }
    Ok(MioTcpListener::from_std(socket.into()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_defer_accept(socket: &Socket, timeout: Duration) -> Result<()> {
    use std::os::fd::AsRawFd;

    let optval = libc::c_int::try_from(timeout.as_secs().max(1)).unwrap_or(libc::c_int::MAX);
    // SAFETY: the descriptor is owned by `socket` and stays open for the
    // call; `optval` is a live c_int and the length passed matches its size.
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    match result {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error().into()),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_defer_accept(_socket: &Socket, _timeout: Duration) -> Result<()> {
    trace!("Deferred accept is not supported on this platform");
    Ok(())
}

impl Dispatch for ServerInner {
    fn on_run(self: Rc<Self>, _readiness: Readiness) -> Result<bool> {
        let pending = {
            let mut state = self.state.borrow_mut();
            state.drain_backlog();
            match state.accepting && !state.queue.is_empty() {
                true => {
                    state.accepting = false;
                    true
                },
                false => false,
            }
        };
        if !pending {
            return Ok(false);
        }
        let server = TcpServer { inner: self };
        server.inner.connection_pending.send(&server);
        Ok(true)
    }
}

impl Selectable for TcpServer {
    fn attach(&self, event_loop: &EventLoop) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.registration.is_attached() {
            return Err(Error::AlreadyAttached);
        }
        let target: Weak<dyn Dispatch> = Rc::downgrade(&self.inner) as Weak<_>;
        let id = event_loop.insert(target);
        let ServerState { listener, registration, .. } = &mut *state;
        let source = listener.as_mut().map(|listener| listener as &mut dyn mio::event::Source);
        if let Err(error) = registration.attach(event_loop, id, source) {
            event_loop.remove(id);
            return Err(error);
        }
        Ok(())
    }

    fn detach(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.accepting = false;
        state.registration.cancel_ready();
        let ServerState { listener, registration, .. } = &mut *state;
        let source = listener.as_mut().map(|listener| listener as &mut dyn mio::event::Source);
        if let Some((event_loop, id)) = registration.detach(source) {
            event_loop.remove(id);
        }
    }

    fn cancel(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.accepting = false;
        state.registration.cancel_ready();
    }

    fn run(&self) -> Result<bool> {
        Dispatch::on_run(self.inner.clone(), Readiness::NONE)
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.state.borrow().registration.event_loop().cloned()
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TcpServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer").field("local_addr", &self.local_addr()).finish()
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let ServerState { listener, registration, .. } = state;
        let source = listener.as_mut().map(|listener| listener as &mut dyn mio::event::Source);
        if let Some((event_loop, id)) = registration.detach(source) {
            event_loop.remove(id);
        }
    }
}
