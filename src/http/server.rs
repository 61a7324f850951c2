/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::io::Write;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;

use log::{debug, trace, warn};

use crate::error::Result;
use crate::http::reply::{self, reason_phrase};
use crate::http::{Authorizer, HttpMessage, MessageReader, MessageWriter, Reply, Request};
use crate::net::{Endpoint, TcpServer, TcpServerOptions, TcpSocket};
use crate::system::{EventLoop, IoDevice, Selectable, Subscription, Timer};

/// Handles one request on behalf of a [`Service`]
///
/// The server calls the functions in this order:
/// 1. [`begin_request()`](Responder::begin_request()) once the request
///    header is complete,
/// 2. [`read_request()`](Responder::read_request()) whenever body data has
///    arrived; body data left unread is discarded afterwards,
/// 3. [`begin_reply()`](Responder::begin_reply()) once the request is
///    complete, to set status and header fields,
/// 4. [`write_reply()`](Responder::write_reply()) until it returns `true`.
///    A reply that is complete after the first call is sent with
///    `Content-Length`, otherwise it is streamed in chunks. A call that
///    writes nothing and returns `false` is repeated on a later loop
///    iteration, so other connections are served in the meantime.
///
/// An error returned before the reply header has been sent results in a
/// `500` reply and the connection being closed; a later error just closes
/// the connection.
pub trait Responder {
    fn begin_request(&mut self, _request: &Request) -> Result<()> {
        Ok(())
    }

    fn read_request(&mut self, _request: &mut Request) -> Result<()> {
        Ok(())
    }

    fn begin_reply(&mut self, _request: &Request, _reply: &mut Reply) -> Result<()> {
        Ok(())
    }

    fn write_reply(&mut self, request: &Request, reply: &mut Reply) -> Result<bool>;
}

/// Creates a [`Responder`] for each request routed to it.
pub trait Service {
    fn create_responder(&self, request: &Request) -> Box<dyn Responder>;
}

impl<F> Service for F
where
    F: Fn(&Request) -> Box<dyn Responder>,
{
    fn create_responder(&self, request: &Request) -> Box<dyn Responder> {
        self(request)
    }
}

/// Replies with a status code and its reason phrase as plain text.
struct StatusResponder {
    status: u16,
}

impl Responder for StatusResponder {
    fn begin_reply(&mut self, _request: &Request, reply: &mut Reply) -> Result<()> {
        reply.set_status(self.status);
        reply.header_mut().set("Content-Type", "text/plain")
    }

    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> Result<bool> {
        write!(reply.body_mut(), "{} {}\r\n", self.status, reason_phrase(self.status))?;
        Ok(true)
    }
}

/// Settings of a [`Server`]
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Requests announcing or sending a larger body get a `413` reply.
    pub max_request_size: usize,
    /// Size of each read from a connection.
    pub buffer_size: usize,
    /// Connections waiting this long for the next request are closed.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_request_size: 1024 * 1024,
            buffer_size: 8192,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// An HTTP/1.1 server running on an [`EventLoop`]
///
/// Requests are routed to the [`Service`] registered for the longest prefix
/// of the request URL; requests without a matching service get a `404`
/// reply. A service may be protected by an [`Authorizer`]. Connections are
/// kept alive as the client asks, and pipelined requests are answered in
/// order.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    listener: TcpServer,
    event_loop: EventLoop,
    state: RefCell<ServerState>,
    subscription: RefCell<Option<Subscription>>,
}

struct ServerState {
    routes: Vec<Route>,
    connections: Slab<Rc<ServerConnection>>,
    options: ServerOptions,
}

struct Route {
    prefix: String,
    service: Rc<dyn Service>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Server {
    /// Listens on `endpoint` and serves connections on `event_loop`.
    pub fn new(event_loop: &EventLoop, endpoint: &Endpoint, options: ServerOptions) -> Result<Self> {
        let listener = TcpServer::bind(endpoint, &TcpServerOptions::default())?;
        Self::with_listener(event_loop, listener, options)
    }

    /// Serves the connections of a listening, detached `listener`.
    pub fn with_listener(event_loop: &EventLoop, listener: TcpServer, options: ServerOptions) -> Result<Self> {
        listener.attach(event_loop)?;
        let inner = Rc::new(ServerInner {
            listener,
            event_loop: event_loop.clone(),
            state: RefCell::new(ServerState {
                routes: Vec::new(),
                connections: Slab::new(),
                options,
            }),
            subscription: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let subscription = inner.listener.connection_pending().connect(move |_: &TcpServer| {
            if let Some(inner) = weak.upgrade() {
                Server { inner }.on_connection_pending();
            }
        });
        *inner.subscription.borrow_mut() = Some(subscription);
        inner.listener.begin_accept()?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.local_addr()
    }

    pub fn options(&self) -> ServerOptions {
        self.inner.state.borrow().options.clone()
    }

    /// Routes requests whose URL starts with `prefix` to `service`.
    pub fn add_service(&self, prefix: &str, service: Rc<dyn Service>) {
        self.add_route(prefix, service, None);
    }

    /// Like [`add_service()`](Server::add_service()), admitting only
    /// requests that `authorizer` grants access.
    pub fn add_protected_service(&self, prefix: &str, service: Rc<dyn Service>, authorizer: Arc<dyn Authorizer>) {
        self.add_route(prefix, service, Some(authorizer));
    }

    pub fn remove_service(&self, prefix: &str) -> bool {
        let mut state = self.inner.state.borrow_mut();
        let count = state.routes.len();
        state.routes.retain(|route| route.prefix != prefix);
        state.routes.len() != count
    }

    fn add_route(&self, prefix: &str, service: Rc<dyn Service>, authorizer: Option<Arc<dyn Authorizer>>) {
        let mut state = self.inner.state.borrow_mut();
        state.routes.retain(|route| route.prefix != prefix);
        state.routes.push(Route {
            prefix: prefix.to_owned(),
            service,
            authorizer,
        });
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().connections.len()
    }

    /// Stops listening and closes all connections.
    pub fn close(&self) {
        self.inner.listener.close();
        let connections: Vec<Rc<ServerConnection>> = self.inner.state.borrow().connections.iter().map(|(_, connection)| connection.clone()).collect();
        for connection in connections {
            connection.close();
        }
    }

    fn on_connection_pending(&self) {
        loop {
            match self.inner.listener.try_accept() {
                Ok(Some(socket)) => self.open_connection(socket),
                Ok(None) => break,
                Err(error) => {
                    warn!("Failed to accept connection: {:?}", error);
                    break;
                },
            }
        }
        if let Err(error) = self.inner.listener.begin_accept() {
            warn!("Failed to resume accepting: {:?}", error);
        }
    }

    fn open_connection(&self, socket: TcpSocket) {
        let connection = {
            let mut state = self.inner.state.borrow_mut();
            let entry = state.connections.vacant_entry();
            let connection = Rc::new(ServerConnection::new(entry.key(), Rc::downgrade(&self.inner), socket));
            entry.insert(connection.clone());
            connection
        };
        let options = self.options();
        debug!("Connection #{} opened: {:?}", connection.key, connection.socket.peer_addr());
        if let Err(error) = connection.start(&self.inner.event_loop, options) {
            warn!("Failed to start connection #{}: {:?}", connection.key, error);
            connection.close();
        }
    }
}

impl ServerInner {
    fn find_route(&self, url: &str) -> Option<(Rc<dyn Service>, Option<Arc<dyn Authorizer>>)> {
        let state = self.state.borrow();
        state
            .routes
            .iter()
            .filter(|route| url.starts_with(route.prefix.as_str()))
            .max_by_key(|route| route.prefix.len())
            .map(|route| (route.service.clone(), route.authorizer.clone()))
    }

    fn remove(&self, connection: &ServerConnection) {
        let removed = {
            let mut state = self.state.borrow_mut();
            match state.connections.get(connection.key).map(|entry| std::ptr::eq(entry.as_ref(), connection)) {
                Some(true) => Some(state.connections.remove(connection.key)),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!("Connection #{} closed", connection.key);
        }
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("local_addr", &self.local_addr()).field("connections", &self.connection_count()).finish()
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~
// Connections
// ~~~~~~~~~~~~~~~~~~~~~~~

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reading,
    Replying,
    Closed,
}

struct ServerConnection {
    key: usize,
    server: Weak<ServerInner>,
    socket: TcpSocket,
    idle: Timer,
    resume: Timer,
    state: RefCell<ConnectionState>,
    subscriptions: RefCell<Vec<Subscription>>,
}

struct ConnectionState {
    options: ServerOptions,
    phase: Phase,
    reader: MessageReader,
    writer: MessageWriter,
    request: Request,
    reply: Reply,
    responder: Option<Box<dyn Responder>>,
    input: Vec<u8>,
    output: Vec<u8>,
    body_size: usize,
    keep_alive: bool,
    closing: bool,
}

impl ConnectionState {
    fn reset_exchange(&mut self) {
        self.phase = Phase::Reading;
        self.reader.reset();
        self.writer.reset();
        self.request.clear();
        self.reply.clear();
        self.responder = None;
        self.body_size = 0;
    }
}

type Handler = fn(&ServerConnection) -> Result<()>;

impl ServerConnection {
    fn new(key: usize, server: Weak<ServerInner>, socket: TcpSocket) -> Self {
        Self {
            key,
            server,
            socket,
            idle: Timer::new(),
            resume: Timer::new(),
            state: RefCell::new(ConnectionState {
                options: ServerOptions::default(),
                phase: Phase::Reading,
                reader: MessageReader::requests(),
                writer: MessageWriter::new(),
                request: Request::default(),
                reply: Reply::default(),
                responder: None,
                input: Vec::new(),
                output: Vec::new(),
                body_size: 0,
                keep_alive: true,
                closing: false,
            }),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    fn start(self: &Rc<Self>, event_loop: &EventLoop, options: ServerOptions) -> Result<()> {
        self.socket.attach(event_loop)?;
        self.idle.attach(event_loop)?;
        self.resume.attach(event_loop)?;

        let weak = Rc::downgrade(self);
        let idle = self.idle.timeout().connect(move |_: &Timer| {
            if let Some(connection) = weak.upgrade() {
                debug!("Connection #{} is idle", connection.key);
                connection.close();
            }
        });
        *self.subscriptions.borrow_mut() = vec![
            self.socket.input_ready().connect(Self::handler(self, ServerConnection::on_input)),
            self.socket.output_ready().connect(Self::handler(self, ServerConnection::on_output)),
            self.resume.timeout().connect(Self::handler(self, ServerConnection::on_resume)),
            idle,
        ];

        let mut state = self.state.borrow_mut();
        state.options = ServerOptions {
            buffer_size: options.buffer_size.max(1),
            ..options
        };
        self.arm_idle(&state);
        self.socket.begin_read(state.options.buffer_size)?;
        Ok(())
    }

    fn handler<T: 'static>(this: &Rc<Self>, callback: Handler) -> impl FnMut(&T) + 'static {
        let weak: Weak<ServerConnection> = Rc::downgrade(this);
        move |_: &T| {
            if let Some(connection) = weak.upgrade() {
                let result = callback(&connection);
                let closed = connection.state.try_borrow().map(|state| state.phase == Phase::Closed).unwrap_or(false);
                match result {
                    Err(error) => {
                        debug!("Connection #{} failed: {}", connection.key, error);
                        connection.close();
                    },
                    Ok(()) if closed => connection.close(),
                    Ok(()) => (),
                }
            }
        }
    }

    fn close(&self) {
        self.idle.stop();
        self.resume.stop();
        self.socket.close();
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.phase = Phase::Closed;
        }
        self.subscriptions.borrow_mut().clear();
        if let Some(server) = self.server.upgrade() {
            server.remove(self);
        }
    }

    fn arm_idle(&self, state: &ConnectionState) {
        if let Some(timeout) = state.options.idle_timeout {
            self.idle.start_after(timeout, Duration::ZERO);
        }
    }

    fn resume_reading(&self, state: &ConnectionState) -> Result<()> {
        if state.phase == Phase::Reading && !self.socket.is_reading() {
            self.socket.begin_read(state.options.buffer_size)?;
        }
        Ok(())
    }

    fn flush(&self, state: &ConnectionState) -> Result<()> {
        if !state.output.is_empty() && !self.socket.is_writing() {
            self.socket.begin_write(&state.output)?;
        }
        Ok(())
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Request side
    // ~~~~~~~~~~~~~~~~~~~~~~~

    fn on_input(&self) -> Result<()> {
        let data = self.socket.end_read()?;
        let mut state = self.state.borrow_mut();
        if data.is_empty() {
            trace!("Connection #{} closed by peer", self.key);
            state.phase = Phase::Closed;
            return Ok(());
        }
        state.input.extend_from_slice(&data);
        self.process(&mut state)?;
        self.resume_reading(&state)
    }

    fn process(&self, state: &mut ConnectionState) -> Result<()> {
        while state.phase == Phase::Reading && !state.input.is_empty() {
            let ConnectionState { reader, input, request, .. } = &mut *state;
            let (consumed, progress) = match reader.advance(input, request.message_mut()) {
                Ok(result) => result,
                Err(error) => {
                    debug!("Connection #{} received a malformed request: {}", self.key, error);
                    return self.fail(state, reply::BAD_REQUEST);
                },
            };
            state.input.drain(..consumed);

            if progress.header() {
                self.on_request_header(state)?;
            }
            if progress.body() && state.phase == Phase::Reading {
                self.on_request_body(state)?;
            }
            if progress.finished() && state.phase == Phase::Reading {
                self.begin_reply(state)?;
            }
        }
        Ok(())
    }

    fn on_request_header(&self, state: &mut ConnectionState) -> Result<()> {
        self.idle.stop();
        if let Some(start) = state.reader.start_line() {
            start.apply_to_request(&mut state.request);
        }
        trace!("Connection #{}: {} {}", self.key, state.request.method(), state.request.target());

        if state.request.header().content_length() > state.options.max_request_size {
            return self.fail(state, reply::REQUEST_ENTITY_TOO_LARGE);
        }

        let responder = self.route(state);
        let ConnectionState { responder: slot, request, .. } = &mut *state;
        let responder = slot.insert(responder);
        if let Err(error) = responder.begin_request(request) {
            warn!("Connection #{} failed to begin request: {}", self.key, error);
            return self.fail(state, reply::INTERNAL_SERVER_ERROR);
        }

        let expects_continue = state.request.header().get("Expect").map(|value| value.trim().eq_ignore_ascii_case("100-continue")).unwrap_or(false);
        if expects_continue && state.request.header().version() >= (1, 1) {
            state.output.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
            self.flush(state)?;
        }
        Ok(())
    }

    fn route(&self, state: &mut ConnectionState) -> Box<dyn Responder> {
        let route = self.server.upgrade().and_then(|server| server.find_route(state.request.url()));
        let (service, authorizer) = match route {
            Some(route) => route,
            None => {
                debug!("Connection #{}: no service for {}", self.key, state.request.url());
                return Box::new(StatusResponder { status: reply::NOT_FOUND });
            },
        };
        if let Some(authorizer) = authorizer {
            if !authorizer.authorize(&state.request, &mut state.reply).is_granted() {
                debug!("Connection #{}: access to {} denied", self.key, state.request.url());
                return Box::new(StatusResponder { status: state.reply.status() });
            }
        }
        service.create_responder(&state.request)
    }

    fn on_request_body(&self, state: &mut ConnectionState) -> Result<()> {
        state.body_size += state.request.body().available();
        if state.body_size > state.options.max_request_size {
            return self.fail(state, reply::REQUEST_ENTITY_TOO_LARGE);
        }
        let ConnectionState { responder, request, .. } = &mut *state;
        let result = match responder.as_mut() {
            Some(responder) => responder.read_request(request),
            None => Ok(()),
        };
        state.request.discard();
        if let Err(error) = result {
            warn!("Connection #{} failed to read request: {}", self.key, error);
            return self.fail(state, reply::INTERNAL_SERVER_ERROR);
        }
        Ok(())
    }

    /// Answers with an error status and closes the connection afterwards.
    fn fail(&self, state: &mut ConnectionState, status: u16) -> Result<()> {
        debug!("Connection #{}: replying {} and closing", self.key, status);
        state.responder = Some(Box::new(StatusResponder { status }));
        state.closing = true;
        state.input.clear();
        state.reply.clear();
        state.writer.reset();
        self.begin_reply(state)
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Reply side
    // ~~~~~~~~~~~~~~~~~~~~~~~

    fn begin_reply(&self, state: &mut ConnectionState) -> Result<()> {
        state.phase = Phase::Replying;
        state.keep_alive = !state.closing && state.request.header().is_keep_alive();

        let ConnectionState { responder, request, reply, .. } = &mut *state;
        let result = match responder.as_mut() {
            Some(responder) => responder.begin_reply(request, reply),
            None => Ok(()),
        };
        if let Err(error) = result {
            if !state.closing {
                warn!("Connection #{} failed to begin reply: {}", self.key, error);
                return self.fail(state, reply::INTERNAL_SERVER_ERROR);
            }
            warn!("Connection #{} failed to begin error reply: {}", self.key, error);
        }

        let bodyless = state.request.method().eq_ignore_ascii_case("HEAD") || state.reply.is_bodyless();
        state.writer.set_bodyless(bodyless);
        self.produce(state)
    }

    fn produce(&self, state: &mut ConnectionState) -> Result<()> {
        loop {
            let ConnectionState { responder, request, reply, .. } = &mut *state;
            let complete = match responder.as_mut() {
                Some(responder) => match responder.write_reply(request, reply) {
                    Ok(complete) => complete,
                    Err(error) if !state.writer.is_header_sent() && !state.closing => {
                        warn!("Connection #{} failed to write reply: {}", self.key, error);
                        return self.fail(state, reply::INTERNAL_SERVER_ERROR);
                    },
                    Err(error) => return Err(error),
                },
                None => true,
            };

            let header_sent = state.writer.is_header_sent();
            if !header_sent {
                self.set_connection_field(state)?;
            }
            let ConnectionState { writer, reply, output, .. } = &mut *state;
            writer.advance(reply, complete, output)?;
            if !header_sent {
                state.keep_alive = state.keep_alive && state.reply.header().is_keep_alive();
            }
            if state.writer.is_finished() || !state.output.is_empty() {
                break;
            }
            if !complete {
                trace!("Connection #{}: reply body not ready yet", self.key);
                self.resume.start_after(Duration::ZERO, Duration::ZERO);
                return Ok(());
            }
        }
        self.flush(state)
    }

    fn on_resume(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.phase == Phase::Replying && state.output.is_empty() && !state.writer.is_finished() {
            return self.produce(&mut state);
        }
        Ok(())
    }

    fn set_connection_field(&self, state: &mut ConnectionState) -> Result<()> {
        let version = state.request.header().version();
        let header = state.reply.header_mut();
        if !state.keep_alive {
            header.set("Connection", "close")?;
        } else if version < (1, 1) {
            header.set("Connection", "keep-alive")?;
        }
        Ok(())
    }

    fn on_output(&self) -> Result<()> {
        let count = self.socket.end_write()?;
        let mut state = self.state.borrow_mut();
        let count = count.min(state.output.len());
        state.output.drain(..count);
        if !state.output.is_empty() {
            return self.flush(&state);
        }
        if state.phase != Phase::Replying {
            return Ok(());
        }
        if !state.writer.is_finished() {
            return self.produce(&mut state);
        }
        self.finish_exchange(&mut state)
    }

    fn finish_exchange(&self, state: &mut ConnectionState) -> Result<()> {
        trace!("Connection #{}: replied {}", self.key, state.reply.status());
        if !state.keep_alive {
            state.phase = Phase::Closed;
            return Ok(());
        }
        state.reset_exchange();
        self.arm_idle(state);
        self.process(state)?;
        self.resume_reading(state)
    }
}
