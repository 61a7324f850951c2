/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ptio_rs::net::{Endpoint, UdpSocket};
use ptio_rs::system::{EventLoop, IoDevice, Selectable};
use ptio_rs::Error;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bound_socket() -> UdpSocket {
    let socket = UdpSocket::new();
    socket.set_timeout(Some(Duration::from_secs(5)));
    socket.bind(&Endpoint::ip4_loopback(0)).unwrap();
    socket
}

#[test]
fn datagram_to_target_and_reply_to_sender() {
    init_logger();
    let alice = bound_socket();
    let bob = bound_socket();

    alice.set_target(&Endpoint::from(bob.local_addr().unwrap())).unwrap();
    assert_eq!(alice.write_some(b"ping").unwrap(), 4);

    let mut buffer = [0u8; 64];
    let count = bob.read_some(&mut buffer).unwrap();
    assert_eq!(&buffer[..count], b"ping");
    let sender = bob.last_sender().unwrap();
    assert_eq!(sender, alice.local_addr().unwrap());

    bob.set_target(&Endpoint::from(sender)).unwrap();
    bob.write_some(b"pong").unwrap();
    let count = alice.read_some(&mut buffer).unwrap();
    assert_eq!(&buffer[..count], b"pong");
}

#[test]
fn connected_socket_talks_to_its_peer() {
    init_logger();
    let server = bound_socket();
    let client = UdpSocket::new();
    client.set_timeout(Some(Duration::from_secs(5)));
    client.connect(&Endpoint::from(server.local_addr().unwrap())).unwrap();
    assert!(client.is_connected());
    assert_eq!(client.peer_addr(), server.local_addr());
    assert!(matches!(client.connect(&Endpoint::ip4_loopback(9)), Err(Error::AlreadyConnected)));

    client.write_some(b"hello").unwrap();
    let mut buffer = [0u8; 16];
    let count = server.read_some(&mut buffer).unwrap();
    assert_eq!(&buffer[..count], b"hello");
}

#[test]
fn unbound_socket_cannot_write() {
    init_logger();
    let socket = UdpSocket::new();
    assert!(matches!(socket.write_some(b"x"), Err(Error::NotConnected)));
    assert!(matches!(socket.set_target(&Endpoint::ip4_loopback(9)), Err(Error::NotConnected)));
}

#[test]
fn read_times_out_without_datagrams() {
    init_logger();
    let socket = bound_socket();
    socket.set_timeout(Some(Duration::from_millis(30)));
    let mut buffer = [0u8; 16];
    assert!(matches!(socket.read_some(&mut buffer), Err(Error::TimedOut)));
}

#[test]
fn two_phase_bind_and_read() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let socket = UdpSocket::new();
    socket.attach(&event_loop).unwrap();

    let sender = bound_socket();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let target = sender.clone();
    let _bound = socket.bound().connect(move |socket: &UdpSocket| {
        socket.end_bind().unwrap();
        socket.begin_read(64).unwrap();
        target.set_target(&Endpoint::from(socket.local_addr().unwrap())).unwrap();
        target.write_some(b"datagram").unwrap();
    });
    let _input = socket.input_ready().connect(move |socket: &UdpSocket| {
        sink.borrow_mut().extend(socket.end_read().unwrap());
        socket.event_loop().unwrap().exit();
    });

    assert!(socket.begin_bind(&Endpoint::ip4_loopback(0)).unwrap());
    assert!(matches!(socket.begin_bind(&Endpoint::ip4_loopback(0)), Err(Error::Pending)));
    event_loop.run().unwrap();

    assert_eq!(*received.borrow(), b"datagram");
    assert_eq!(socket.last_sender(), sender.local_addr());
}
