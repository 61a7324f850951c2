/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::http::{reply, Authentication, Authenticator, Connection, HttpMessage, MessageReader, MessageWriter, Reply, Request};
use crate::net::{Endpoint, TcpSocket};
use crate::system::{EventLoop, IoDevice, Selectable, Signal, Subscription, Timer};

const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Sending,
    Sent,
    Receiving,
    Received,
}

/// An HTTP/1.1 client talking to one server
///
/// The blocking calls ([`send()`](Client::send()),
/// [`receive()`](Client::receive()), [`call()`](Client::call())) connect on
/// demand and honor the client timeout. [`call()`](Client::call()) answers
/// one `401` challenge when an [`Authentication`] for its scheme has been
/// registered, and repeats the request with credentials.
///
/// On an attached client the same exchange runs as two-phase operations:
/// [`begin_send()`](Client::begin_send()) is followed by the
/// [`request_sent()`](Client::request_sent()) signal and
/// [`end_send()`](Client::end_send()),
/// [`begin_receive()`](Client::begin_receive()) by the
/// [`reply_received()`](Client::reply_received()) signal and
/// [`end_receive()`](Client::end_receive()). Transport failures in between
/// are kept and returned by the `end_*` call.
///
/// The connection is kept open as long as the server allows it.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    socket: TcpSocket,
    deferred: Timer,
    state: RefCell<ClientState>,
    subscriptions: RefCell<Vec<Subscription>>,
    request_sent: Signal<Client>,
    reply_received: Signal<Client>,
}

struct ClientState {
    endpoint: Endpoint,
    connection: Connection<TcpSocket>,
    authenticator: Authenticator,
    phase: Phase,
    outbound: Vec<u8>,
    reader: MessageReader,
    reply: Reply,
    bodyless: bool,
    fault: Option<Error>,
    buffer_size: usize,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        let socket = TcpSocket::new();
        let inner = Rc::new(ClientInner {
            socket: socket.clone(),
            deferred: Timer::new(),
            state: RefCell::new(ClientState {
                endpoint,
                connection: Connection::new(socket),
                authenticator: Authenticator::new(),
                phase: Phase::Idle,
                outbound: Vec::new(),
                reader: MessageReader::replies(),
                reply: Reply::default(),
                bodyless: false,
                fault: None,
                buffer_size: DEFAULT_BUFFER_SIZE,
            }),
            subscriptions: RefCell::new(Vec::new()),
            request_sent: Signal::new(),
            reply_received: Signal::new(),
        });

        let subscriptions = vec![
            inner.socket.connected().connect(Self::handler(&inner, Client::on_connected)),
            inner.socket.output_ready().connect(Self::handler(&inner, Client::on_output)),
            inner.socket.input_ready().connect(Self::handler(&inner, Client::on_input)),
        ];
        let weak = Rc::downgrade(&inner);
        let deferred = inner.deferred.timeout().connect(move |_: &Timer| {
            if let Some(inner) = weak.upgrade() {
                Client { inner }.on_deferred();
            }
        });
        let mut slots = inner.subscriptions.borrow_mut();
        slots.extend(subscriptions);
        slots.push(deferred);
        drop(slots);

        Self { inner }
    }

    fn handler(inner: &Rc<ClientInner>, callback: fn(&Client)) -> impl FnMut(&TcpSocket) + 'static {
        let weak: Weak<ClientInner> = Rc::downgrade(inner);
        move |_| {
            if let Some(inner) = weak.upgrade() {
                callback(&Client { inner });
            }
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.state.borrow().endpoint.clone()
    }

    /// Targets another server; the current connection is closed.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        self.close();
        self.inner.state.borrow_mut().endpoint = endpoint;
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.socket.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.socket.timeout()
    }

    /// Size of the reads issued by [`begin_receive()`](Client::begin_receive()).
    pub fn set_buffer_size(&self, size: usize) {
        self.inner.state.borrow_mut().buffer_size = size.max(1);
    }

    pub fn add_authentication(&self, method: Box<dyn Authentication>) {
        self.inner.state.borrow_mut().authenticator.add(method);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.socket.is_connected()
    }

    pub fn socket(&self) -> &TcpSocket {
        &self.inner.socket
    }

    pub fn request_sent(&self) -> &Signal<Client> {
        &self.inner.request_sent
    }

    pub fn reply_received(&self) -> &Signal<Client> {
        &self.inner.reply_received
    }

    /// Closes the connection, abandoning any exchange in progress.
    pub fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.reset_exchange();
        state.connection.clear_input();
        self.inner.deferred.stop();
        self.inner.socket.close();
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Blocking functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Sends `request` with its complete body, connecting first if needed.
    pub fn send(&self, request: &mut Request) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.require_idle()?;
        if !self.inner.socket.is_connected() {
            let endpoint = state.endpoint.clone();
            debug!("Connecting to {}", endpoint);
            state.connection.clear_input();
            self.inner.socket.connect(&endpoint)?;
        }
        state.prepare(request)?;
        let result = state.connection.send(request);
        if result.is_err() {
            self.inner.socket.close();
        }
        result
    }

    /// Receives the reply to the last request sent.
    pub fn receive(&self) -> Result<Reply> {
        let mut state = self.inner.state.borrow_mut();
        state.require_idle()?;
        let mut reply = Reply::default();
        let bodyless = state.bodyless;
        if let Err(error) = state.connection.receive_reply_for(&mut reply, bodyless) {
            state.connection.clear_input();
            self.inner.socket.close();
            return Err(error);
        }
        if !reply.header().is_keep_alive() {
            trace!("Server does not keep the connection alive");
            state.connection.clear_input();
            self.inner.socket.close();
        }
        Ok(reply)
    }

    /// Sends `request` and receives its reply, retrying once with
    /// credentials after a `401` challenge that a registered
    /// [`Authentication`] can answer.
    pub fn call(&self, request: &mut Request) -> Result<Reply> {
        let body = request.body().as_slice().to_vec();
        self.send(request)?;
        let reply = self.receive()?;
        if reply.status() != reply::UNAUTHORIZED || !self.inner.state.borrow_mut().authenticator.on_challenge(&reply) {
            return Ok(reply);
        }

        debug!("Repeating request for {} with credentials", request.url());
        request.body_mut().clear();
        request.body_mut().extend(&body);
        self.send(request)?;
        self.receive()
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Two-phase functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Starts sending `request` with its complete body; the client must be
    /// attached. Connects first if needed.
    pub fn begin_send(&self, request: &mut Request) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.require_idle()?;
        if !self.inner.socket.is_attached() {
            return Err(Error::NotAttached);
        }
        state.prepare(request)?;
        let mut outbound = Vec::new();
        MessageWriter::new().advance(request, true, &mut outbound)?;
        state.outbound = outbound;
        state.fault = None;

        if self.inner.socket.is_connected() {
            self.inner.socket.begin_write(&state.outbound)?;
            state.phase = Phase::Sending;
        } else {
            let endpoint = state.endpoint.clone();
            debug!("Connecting to {}", endpoint);
            state.connection.clear_input();
            self.inner.socket.begin_connect(&endpoint)?;
            state.phase = Phase::Connecting;
        }
        Ok(())
    }

    /// Collects the outcome of [`begin_send()`](Client::begin_send()).
    pub fn end_send(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        match state.phase {
            Phase::Sent => {
                state.phase = Phase::Idle;
                state.outbound.clear();
                match state.fault.take() {
                    Some(error) => Err(error),
                    None => Ok(()),
                }
            },
            Phase::Connecting | Phase::Sending => Err(Error::Pending),
            _ => Err(Error::NotPending),
        }
    }

    /// Starts receiving the reply to the last request sent; the client must
    /// be attached.
    pub fn begin_receive(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.require_idle()?;
        if !self.inner.socket.is_attached() {
            return Err(Error::NotAttached);
        }
        state.reader.reset();
        let bodyless = state.bodyless;
        state.reader.set_bodyless(bodyless);
        state.reply.clear();
        state.fault = None;
        state.phase = Phase::Receiving;

        match state.parse_buffered() {
            Ok(false) => {
                let size = state.buffer_size;
                self.inner.socket.begin_read(size)?;
            },
            Ok(true) => self.defer(),
            Err(error) => {
                state.fail(error);
                self.defer();
            },
        }
        Ok(())
    }

    /// Collects the reply announced by the
    /// [`reply_received()`](Client::reply_received()) signal.
    pub fn end_receive(&self) -> Result<Reply> {
        let mut state = self.inner.state.borrow_mut();
        match state.phase {
            Phase::Received => (),
            Phase::Receiving => return Err(Error::Pending),
            _ => return Err(Error::NotPending),
        }
        state.phase = Phase::Idle;
        let reply = std::mem::take(&mut state.reply);
        let fault = state.fault.take();
        if fault.is_some() || !reply.header().is_keep_alive() {
            state.connection.clear_input();
            self.inner.socket.close();
        }
        match fault {
            Some(error) => Err(error),
            None => Ok(reply),
        }
    }

    fn defer(&self) {
        self.inner.deferred.start_after(Duration::ZERO, Duration::ZERO);
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Signal handlers
    // ~~~~~~~~~~~~~~~~~~~~~~~

    fn on_connected(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Connecting {
                return;
            }
            let result = self.inner.socket.end_connect().and_then(|_| self.inner.socket.begin_write(&state.outbound));
            match result {
                Ok(_) => {
                    state.phase = Phase::Sending;
                    return;
                },
                Err(error) => {
                    warn!("Failed to connect to {}: {}", state.endpoint, error);
                    state.fault = Some(error);
                    state.phase = Phase::Sent;
                },
            }
        }
        self.inner.request_sent.send(self);
    }

    fn on_output(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Sending {
                return;
            }
            let result = self.inner.socket.end_write().and_then(|count| {
                let count = count.min(state.outbound.len());
                state.outbound.drain(..count);
                match state.outbound.is_empty() {
                    true => Ok(true),
                    false => self.inner.socket.begin_write(&state.outbound).map(|_| false),
                }
            });
            match result {
                Ok(false) => return,
                Ok(true) => trace!("Request sent"),
                Err(error) => {
                    warn!("Failed to send request: {}", error);
                    state.fault = Some(error);
                },
            }
            state.phase = Phase::Sent;
        }
        self.inner.request_sent.send(self);
    }

    fn on_input(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Receiving {
                return;
            }
            match self.receive_step(&mut state) {
                Ok(false) => return,
                Ok(true) => trace!("Reply received: {}", state.reply.status()),
                Err(error) => {
                    warn!("Failed to receive reply: {}", error);
                    state.fail(error);
                },
            }
        }
        self.inner.reply_received.send(self);
    }

    /// Returns `true` once the reply is complete.
    fn receive_step(&self, state: &mut ClientState) -> Result<bool> {
        let data = self.inner.socket.end_read()?;
        if data.is_empty() {
            let ClientState { reader, reply, .. } = state;
            reader.finish_eof(reply.message_mut())?;
            state.complete_reply();
            return Ok(true);
        }
        state.connection.feed(&data);
        if state.parse_buffered()? {
            return Ok(true);
        }
        self.inner.socket.begin_read(state.buffer_size)?;
        Ok(false)
    }

    fn on_deferred(&self) {
        if self.inner.state.borrow().phase == Phase::Received {
            self.inner.reply_received.send(self);
        }
    }
}

impl ClientState {
    fn require_idle(&self) -> Result<()> {
        match self.phase {
            Phase::Idle => Ok(()),
            _ => Err(Error::Pending),
        }
    }

    fn prepare(&mut self, request: &mut Request) -> Result<()> {
        if !request.header().has("Host") {
            request.header_mut().set("Host", &self.endpoint.to_string())?;
        }
        self.authenticator.authorize(request)?;
        self.bodyless = request.method().eq_ignore_ascii_case("HEAD");
        Ok(())
    }

    /// Parses buffered input, skipping interim replies; returns `true` once
    /// the final reply is complete.
    fn parse_buffered(&mut self) -> Result<bool> {
        loop {
            if self.connection.buffered() == 0 {
                return Ok(false);
            }
            let ClientState { connection, reader, reply, .. } = self;
            if !connection.parse(reader, reply)?.finished() {
                return Ok(false);
            }
            if self.complete_reply() {
                return Ok(true);
            }
        }
    }

    /// Applies the parsed status line; returns `false` for an interim reply,
    /// after resetting for the final one.
    fn complete_reply(&mut self) -> bool {
        if let Some(start) = self.reader.start_line() {
            start.apply_to_reply(&mut self.reply);
        }
        if !self.reply.is_informational() {
            self.phase = Phase::Received;
            return true;
        }
        trace!("Skipping interim reply {}", self.reply.status());
        self.reader.reset();
        self.reader.set_bodyless(self.bodyless);
        self.reply.clear();
        false
    }

    fn fail(&mut self, error: Error) {
        self.fault = Some(error);
        self.phase = Phase::Received;
    }

    fn reset_exchange(&mut self) {
        self.phase = Phase::Idle;
        self.outbound.clear();
        self.reader.reset();
        self.reply.clear();
        self.fault = None;
    }
}

impl Selectable for Client {
    fn attach(&self, event_loop: &EventLoop) -> Result<()> {
        self.inner.socket.attach(event_loop)?;
        if let Err(error) = self.inner.deferred.attach(event_loop) {
            self.inner.socket.detach();
            return Err(error);
        }
        Ok(())
    }

    fn detach(&self) {
        self.inner.state.borrow_mut().reset_exchange();
        self.inner.deferred.detach();
        self.inner.socket.detach();
    }

    fn cancel(&self) {
        self.inner.state.borrow_mut().reset_exchange();
        self.inner.deferred.stop();
        self.inner.socket.cancel();
    }

    fn run(&self) -> Result<bool> {
        self.inner.socket.run()
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.socket.event_loop()
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.try_borrow();
        f.debug_struct("Client")
            .field("endpoint", &state.as_ref().map(|state| state.endpoint.to_string()).ok())
            .field("phase", &state.as_ref().map(|state| state.phase).ok())
            .finish()
    }
}
