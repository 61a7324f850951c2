/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::{RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};

use mio::{Interest, Registry, Token};
use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use socket2::{Domain, Protocol, Socket, Type};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::net::{Endpoint, UdpSocketOptions};
use crate::system::{Completion, DeviceCore, Dispatch, EventLoop, IoDevice, Readiness, Selectable, Signal, Transport};

/// The datagram transport of a [`UdpSocket`]
///
/// A connected socket exchanges datagrams with its peer only. Otherwise
/// datagrams are sent to the configured target and the sender of the last
/// received datagram is remembered.
pub struct UdpTransport {
    socket: MioUdpSocket,
    control: Socket,
    target: Option<SocketAddr>,
    sender: Option<SocketAddr>,
    connected: bool,
}

impl Source for UdpTransport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> IoResult<()> {
        self.socket.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> IoResult<()> {
        self.socket.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> IoResult<()> {
        self.socket.deregister(registry)
    }
}

impl Transport for UdpTransport {
    fn try_read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        if self.connected {
            return self.socket.recv(buffer);
        }
        let (count, sender) = self.socket.recv_from(buffer)?;
        self.sender = Some(sender);
        Ok(count)
    }

    fn try_write(&mut self, buffer: &[u8]) -> IoResult<usize> {
        if self.connected {
            return self.socket.send(buffer);
        }
        match self.target {
            Some(target) => self.socket.send_to(buffer, target),
            None => Err(IoError::new(ErrorKind::NotConnected, "no target address")),
        }
    }
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("target", &self.target)
            .field("connected", &self.connected)
            .finish()
    }
}

/// A UDP socket
///
/// Binding and connecting complete synchronously; the two-phase variants
/// exist so that a UDP socket can be driven exactly like a
/// [`TcpSocket`](crate::net::TcpSocket), their signals are sent from the
/// next loop iteration.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<UdpInner>,
}

struct UdpInner {
    state: RefCell<UdpState>,
    bound: Signal<UdpSocket>,
    connected: Signal<UdpSocket>,
    input_ready: Signal<UdpSocket>,
    output_ready: Signal<UdpSocket>,
}

struct UdpState {
    device: DeviceCore<UdpTransport>,
    binding: Option<Step>,
    connecting: Option<Step>,
    options: UdpSocketOptions,
}

struct Step {
    result: Option<Result<()>>,
    signalled: bool,
}

impl Step {
    fn completed(result: Result<()>) -> Self {
        Self {
            result: Some(result),
            signalled: false,
        }
    }
}

impl UdpSocket {
    pub fn new() -> Self {
        Self::with_options(UdpSocketOptions::default())
    }

    pub fn with_options(options: UdpSocketOptions) -> Self {
        Self {
            inner: Rc::new(UdpInner {
                state: RefCell::new(UdpState {
                    device: DeviceCore::new(),
                    binding: None,
                    connecting: None,
                    options,
                }),
                bound: Signal::new(),
                connected: Signal::new(),
                input_ready: Signal::new(),
                output_ready: Signal::new(),
            }),
        }
    }

    pub fn bound(&self) -> &Signal<UdpSocket> {
        &self.inner.bound
    }

    pub fn connected(&self) -> &Signal<UdpSocket> {
        &self.inner.connected
    }

    pub fn input_ready(&self) -> &Signal<UdpSocket> {
        &self.inner.input_ready
    }

    pub fn output_ready(&self) -> &Signal<UdpSocket> {
        &self.inner.output_ready
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Bind functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.check_idle()?;
        let result = state.bind(endpoint);
        if result.is_err() {
            state.device.close();
        }
        result
    }

    /// Binds the socket; the outcome is collected with
    /// [`end_bind()`](UdpSocket::end_bind()) after the
    /// [`bound()`](UdpSocket::bound()) signal.
    pub fn begin_bind(&self, endpoint: &Endpoint) -> Result<bool> {
        let mut state = self.inner.state.borrow_mut();
        state.device.registration().require()?;
        state.check_idle()?;
        let result = state.bind(endpoint);
        state.binding = Some(Step::completed(result));
        state.device.set_ready();
        Ok(true)
    }

    /// On error the socket is closed before the error is returned.
    pub fn end_bind(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let result = match state.binding.take().and_then(|mut step| step.result.take()) {
            Some(result) => result,
            None => return Err(Error::NotPending),
        };
        if result.is_err() {
            state.device.close();
        }
        result
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Connect functions
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Connects the socket to `endpoint`, binding it to an ephemeral port
    /// first if necessary.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.check_idle()?;
        if state.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let result = state.connect(endpoint);
        if result.is_err() {
            state.device.close();
        }
        result
    }

    pub fn begin_connect(&self, endpoint: &Endpoint) -> Result<bool> {
        let mut state = self.inner.state.borrow_mut();
        state.device.registration().require()?;
        state.check_idle()?;
        let result = state.connect(endpoint);
        state.connecting = Some(Step::completed(result));
        state.device.set_ready();
        Ok(true)
    }

    /// On error the socket is closed before the error is returned. A no-op
    /// on a connected socket.
    pub fn end_connect(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let result = match state.connecting.take().and_then(|mut step| step.result.take()) {
            Some(result) => result,
            None => return match state.is_connected() {
                true => Ok(()),
                false => Err(Error::NotPending),
            },
        };
        if result.is_err() {
            state.device.close();
        }
        result
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~
    // Addressing and options
    // ~~~~~~~~~~~~~~~~~~~~~~~

    /// Sets the destination of datagrams written to an unconnected socket.
    pub fn set_target(&self, endpoint: &Endpoint) -> Result<()> {
        let target = endpoint.resolve()?.into_iter().next().ok_or(Error::NotConnected)?;
        let mut state = self.inner.state.borrow_mut();
        let transport = state.device.transport_mut().ok_or(Error::NotConnected)?;
        transport.target = Some(target);
        Ok(())
    }

    /// The sender of the last datagram read from an unconnected socket.
    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().device.transport().and_then(|transport| transport.sender)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().device.transport().and_then(|transport| transport.socket.local_addr().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().device.transport().and_then(|transport| transport.control.peer_addr().ok()).and_then(|addr| addr.as_socket())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    /// Sets the unicast and multicast hop limit (TTL) of outgoing datagrams.
    pub fn set_hop_limit(&self, hops: u32) -> Result<()> {
        let state = self.inner.state.borrow();
        let transport = state.device.transport().ok_or(Error::NotConnected)?;
        set_hop_limit(transport, hops)
    }

    /// Joins the multicast `group` on the default interface.
    pub fn join_multicast_group(&self, group: IpAddr) -> Result<()> {
        let state = self.inner.state.borrow();
        let transport = state.device.transport().ok_or(Error::NotConnected)?;
        match group {
            IpAddr::V4(group) => transport.control.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => transport.control.join_multicast_v6(&group, 0)?,
        }
        debug!("Joined multicast group {}", group);
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.binding = None;
        state.connecting = None;
        state.device.close();
    }
}

impl UdpState {
    fn check_idle(&self) -> Result<()> {
        if self.binding.is_some() || self.connecting.is_some() || self.device.is_reading() || self.device.is_writing() {
            return Err(Error::Pending);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device.transport().map(|transport| transport.connected).unwrap_or(false)
    }

    fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        let addr = endpoint.resolve()?.into_iter().next().ok_or(Error::NotConnected)?;
        let transport = create_transport(addr, &self.options)?;
        trace!("UDP socket bound to {:?}", transport.socket.local_addr());
        self.device.open(transport)
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let addrs = endpoint.resolve()?;
        let mut last_error = Error::NotConnected;
        for addr in addrs {
            if !self.device.is_open() {
                let local = match addr {
                    SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
                    SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
                };
                self.device.open(create_transport(local, &self.options)?)?;
            }
            let transport = self.device.transport_mut().ok_or(Error::NotConnected)?;
            match transport.socket.connect(addr) {
                Ok(()) => {
                    transport.connected = true;
                    transport.target = Some(addr);
                    debug!("UDP socket connected to {}", addr);
                    return Ok(());
                },
                Err(error) => last_error = error.into(),
            }
        }
        Err(last_error)
    }

    /// Priority chain: connecting, then binding, then the device.
    fn on_run(&mut self, readiness: Readiness) -> Option<Notify> {
        if let Some(step) = self.connecting.as_mut().filter(|step| !step.signalled) {
            step.signalled = true;
            return Some(Notify::Connected);
        }
        if let Some(step) = self.binding.as_mut().filter(|step| !step.signalled) {
            step.signalled = true;
            return Some(Notify::Bound);
        }
        self.device.on_run(readiness).map(|completion| match completion {
            Completion::Input => Notify::Input,
            Completion::Output => Notify::Output,
        })
    }
}

fn create_transport(addr: SocketAddr, options: &UdpSocketOptions) -> Result<UdpTransport> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(options.reuse_address)?;
    socket.set_broadcast(options.broadcast)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let control = socket.try_clone()?;
    let transport = UdpTransport {
        socket: MioUdpSocket::from_std(socket.into()),
        control,
        target: None,
        sender: None,
        connected: false,
    };
    if let Some(hops) = options.hop_limit {
        set_hop_limit(&transport, hops)?;
    }
    Ok(transport)
}

fn set_hop_limit(transport: &UdpTransport, hops: u32) -> Result<()> {
    match transport.socket.local_addr()? {
        SocketAddr::V4(_) => {
            transport.control.set_ttl(hops)?;
            transport.control.set_multicast_ttl_v4(hops)?;
        },
        SocketAddr::V6(_) => {
            transport.control.set_unicast_hops_v6(hops)?;
            transport.control.set_multicast_hops_v6(hops)?;
        },
    }
    Ok(())
}

enum Notify {
    Bound,
    Connected,
    Input,
    Output,
}

impl Dispatch for UdpInner {
    fn on_run(self: Rc<Self>, readiness: Readiness) -> Result<bool> {
        let notify = self.state.borrow_mut().on_run(readiness);
        let socket = UdpSocket { inner: self };
        let signal = match notify {
            Some(Notify::Bound) => &socket.inner.bound,
            Some(Notify::Connected) => &socket.inner.connected,
            Some(Notify::Input) => &socket.inner.input_ready,
            Some(Notify::Output) => &socket.inner.output_ready,
            None => return Ok(false),
        };
        signal.send(&socket);
        Ok(true)
    }
}

impl Selectable for UdpSocket {
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
        state.binding = None;
        state.connecting = None;
        if let Some((event_loop, id)) = state.device.detach() {
            event_loop.remove(id);
        }
    }

    fn cancel(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.binding = None;
        state.connecting = None;
        state.device.cancel();
    }

    fn run(&self) -> Result<bool> {
        Dispatch::on_run(self.inner.clone(), Readiness::NONE)
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.state.borrow().device.event_loop()
    }
}

impl IoDevice for UdpSocket {
    type Transport = UdpTransport;

    fn device(&self) -> RefMut<'_, DeviceCore<UdpTransport>> {
        RefMut::map(self.inner.state.borrow_mut(), |state| &mut state.device)
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for UdpSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local_addr", &self.local_addr())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some((event_loop, id)) = state.device.detach() {
            event_loop.remove(id);
        }
        state.device.close();
    }
}
