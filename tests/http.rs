/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ptio_rs::http::{reply, BasicAuthentication, BasicUserListAuthorizer, Client, HttpMessage, Reply, Request, Responder, Server, ServerOptions};
use ptio_rs::net::Endpoint;
use ptio_rs::system::{EventLoop, LoopController, Selectable};
use ptio_rs::Error;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Hello;

impl Responder for Hello {
    fn begin_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<()> {
        reply.header_mut().set("Content-Type", "text/plain")
    }

    fn write_reply(&mut self, request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        write!(reply.body_mut(), "Hello, {}!", request.url())?;
        Ok(true)
    }
}

#[derive(Default)]
struct Echo {
    data: Vec<u8>,
}

impl Responder for Echo {
    fn read_request(&mut self, request: &mut Request) -> ptio_rs::Result<()> {
        request.body_mut().read_to_end(&mut self.data)?;
        Ok(())
    }

    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        reply.body_mut().extend(&self.data);
        Ok(true)
    }
}

/// Leaves the request body unread and reports what is left of it.
struct Ignore;

impl Responder for Ignore {
    fn write_reply(&mut self, request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        write!(reply.body_mut(), "{}", request.body().available())?;
        Ok(true)
    }
}

struct Stream {
    next: u32,
}

impl Responder for Stream {
    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        writeln!(reply.body_mut(), "line {}", self.next)?;
        self.next += 1;
        Ok(self.next > 3)
    }
}

/// Has nothing to send until the gate opens.
struct Wait {
    gate: Arc<AtomicBool>,
}

impl Responder for Wait {
    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        if !self.gate.load(Ordering::Acquire) {
            return Ok(false);
        }
        reply.body_mut().extend(b"done");
        Ok(true)
    }
}

struct TestServer {
    endpoint: Endpoint,
    gate: Arc<AtomicBool>,
    controller: LoopController,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(options: ServerOptions) -> Self {
        let (sender, receiver) = mpsc::channel();
        let gate = Arc::new(AtomicBool::new(false));
        let wait_gate = gate.clone();
        let thread = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server = Server::new(&event_loop, &Endpoint::ip4_loopback(0), options).unwrap();
            server.add_service("/hello", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Hello) }));
            server.add_service("/echo", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Echo::default()) }));
            server.add_service("/ignore", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Ignore) }));
            server.add_service("/stream", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Stream { next: 1 }) }));
            server.add_service("/wait", Rc::new(move |_: &Request| -> Box<dyn Responder> { Box::new(Wait { gate: wait_gate.clone() }) }));

            let authorizer = Arc::new(BasicUserListAuthorizer::new("test"));
            authorizer.add_user("Aladdin", "open sesame");
            server.add_protected_service("/private", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Hello) }), authorizer);

            sender.send((server.local_addr().unwrap(), event_loop.controller())).unwrap();
            event_loop.run().unwrap();
            server.close();
        });
        let (addr, controller) = receiver.recv().unwrap();
        Self {
            endpoint: Endpoint::from(addr),
            gate,
            controller,
            thread: Some(thread),
        }
    }

    fn client(&self) -> Client {
        let client = Client::new(self.endpoint.clone());
        client.set_timeout(Some(Duration::from_secs(5)));
        client
    }

    fn open(&self, data: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(self.endpoint.resolve().unwrap()[0]).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(data).unwrap();
        stream
    }

    fn raw(&self, data: &[u8]) -> String {
        let mut stream = self.open(data);
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8(response).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.controller.exit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn connection_is_kept_alive() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let client = server.client();

    let reply = client.call(&mut Request::new("/hello")).unwrap();
    assert_eq!(reply.status(), reply::OK);
    assert_eq!(reply.body().as_slice(), b"Hello, /hello!");
    assert_eq!(reply.header().get("Content-Type"), Some("text/plain"));
    assert_eq!(reply.header().content_length(), 14);
    let local = client.socket().local_addr();

    let reply = client.call(&mut Request::new("/hello/again")).unwrap();
    assert_eq!(reply.body().as_slice(), b"Hello, /hello/again!");
    assert!(client.is_connected());
    assert_eq!(client.socket().local_addr(), local);
}

#[test]
fn unknown_url_is_not_found() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let reply = server.client().call(&mut Request::new("/missing")).unwrap();
    assert_eq!(reply.status(), reply::NOT_FOUND);
    assert_eq!(reply.reason(), "Not Found");
    assert_eq!(reply.body().as_slice(), b"404 Not Found\r\n");
}

#[test]
fn request_body_is_echoed() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let mut request = Request::with_method("POST", "/echo");
    request.body_mut().extend(b"some request data");
    let reply = server.client().call(&mut request).unwrap();
    assert_eq!(reply.status(), reply::OK);
    assert_eq!(reply.body().as_slice(), b"some request data");
}

#[test]
fn unread_request_body_is_discarded() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let client = server.client();
    for _ in 0..2 {
        let mut request = Request::with_method("POST", "/ignore");
        request.body_mut().extend(&[b'x'; 3000]);
        let reply = client.call(&mut request).unwrap();
        assert_eq!(reply.body().as_slice(), b"0");
    }
}

#[test]
fn streamed_reply_is_chunked() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let reply = server.client().call(&mut Request::new("/stream")).unwrap();
    assert!(reply.header().is_chunked());
    assert_eq!(reply.body().as_slice(), b"line 1\nline 2\nline 3\n");
}

#[test]
fn waiting_reply_does_not_block_other_connections() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let mut waiting = server.open(b"GET /wait HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    thread::sleep(Duration::from_millis(50));

    let reply = server.client().call(&mut Request::new("/hello")).unwrap();
    assert_eq!(reply.body().as_slice(), b"Hello, /hello!");

    server.gate.store(true, Ordering::Release);
    let mut response = String::new();
    waiting.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(response.ends_with("\r\n\r\n4\r\ndone\r\n0\r\n\r\n"));
}

#[test]
fn zero_buffer_size_still_reads_requests() {
    init_logger();
    let options = ServerOptions {
        buffer_size: 0,
        ..ServerOptions::default()
    };
    let server = TestServer::start(options);
    let reply = server.client().call(&mut Request::new("/hello")).unwrap();
    assert_eq!(reply.status(), reply::OK);
    assert_eq!(reply.body().as_slice(), b"Hello, /hello!");
}

#[test]
fn head_reply_has_no_body() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let client = server.client();
    let reply = client.call(&mut Request::with_method("HEAD", "/hello")).unwrap();
    assert_eq!(reply.status(), reply::OK);
    assert_eq!(reply.header().content_length(), 14);
    assert!(reply.body().is_empty());

    let reply = client.call(&mut Request::new("/hello")).unwrap();
    assert_eq!(reply.body().as_slice(), b"Hello, /hello!");
}

#[test]
fn protected_service_requires_credentials() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());

    let reply = server.client().call(&mut Request::new("/private")).unwrap();
    assert_eq!(reply.status(), reply::UNAUTHORIZED);
    assert_eq!(reply.header().get("WWW-Authenticate"), Some("Basic realm=\"test\""));

    let client = server.client();
    client.add_authentication(Box::new(BasicAuthentication::new("Aladdin", "open sesame")));
    let reply = client.call(&mut Request::new("/private")).unwrap();
    assert_eq!(reply.status(), reply::OK);
    assert_eq!(reply.body().as_slice(), b"Hello, /private!");

    let client = server.client();
    client.add_authentication(Box::new(BasicAuthentication::new("Aladdin", "wrong")));
    let reply = client.call(&mut Request::new("/private")).unwrap();
    assert_eq!(reply.status(), reply::UNAUTHORIZED);
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let response = server.raw(b"GET /hello/1 HTTP/1.1\r\nHost: test\r\n\r\nGET /hello/2 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    let first = response.find("Hello, /hello/1!").unwrap();
    let second = response.find("Hello, /hello/2!").unwrap();
    assert!(first < second);
    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(response.contains("Connection: close\r\n"));
}

#[test]
fn http10_request_closes_the_connection() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let response = server.raw(b"GET /hello HTTP/1.0\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("Hello, /hello!"));
}

#[test]
fn malformed_request_gets_bad_request() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let response = server.raw(b"GET /hello HTTP/1.1\r\nBroken header line\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("Connection: close\r\n"));
}

#[test]
fn oversized_request_is_rejected() {
    init_logger();
    let options = ServerOptions {
        max_request_size: 1024,
        ..ServerOptions::default()
    };
    let server = TestServer::start(options);
    let response = server.raw(b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 5000\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"));
}

#[test]
fn idle_connection_is_closed() {
    init_logger();
    let options = ServerOptions {
        idle_timeout: Some(Duration::from_millis(50)),
        ..ServerOptions::default()
    };
    let server = TestServer::start(options);
    assert_eq!(server.raw(b""), "");
}

#[test]
fn two_phase_exchange_on_the_loop() {
    init_logger();
    let server = TestServer::start(ServerOptions::default());
    let event_loop = EventLoop::new().unwrap();
    let client = server.client();
    client.attach(&event_loop).unwrap();

    let replies = Rc::new(RefCell::new(Vec::new()));
    let _sent = client.request_sent().connect(|client: &Client| {
        client.end_send().unwrap();
        client.begin_receive().unwrap();
    });
    let sink = replies.clone();
    let _received = client.reply_received().connect(move |client: &Client| {
        let reply = client.end_receive().unwrap();
        sink.borrow_mut().push(reply.body().as_slice().to_vec());
        if sink.borrow().len() == 2 {
            client.event_loop().unwrap().exit();
        } else {
            client.begin_send(&mut Request::new("/hello/second")).unwrap();
        }
    });

    client.begin_send(&mut Request::new("/hello/first")).unwrap();
    assert!(matches!(client.begin_send(&mut Request::new("/hello")), Err(Error::Pending)));
    assert!(matches!(client.end_receive(), Err(Error::NotPending)));
    event_loop.run().unwrap();

    assert_eq!(*replies.borrow(), vec![b"Hello, /hello/first!".to_vec(), b"Hello, /hello/second!".to_vec()]);
}

#[test]
fn two_phase_calls_require_a_loop() {
    init_logger();
    let client = Client::new(Endpoint::ip4_loopback(9));
    assert!(matches!(client.begin_send(&mut Request::new("/")), Err(Error::NotAttached)));
    assert!(matches!(client.end_send(), Err(Error::NotPending)));
}
