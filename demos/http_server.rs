/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::Arc;

use ptio_rs::http::{reply, BasicUserListAuthorizer, HttpMessage, Reply, Request, Responder, Server, ServerOptions};
use ptio_rs::net::Endpoint;
use ptio_rs::system::EventLoop;

use log::{info, warn, error};

const PORT_NUMBER: u16 = 8080;
const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    /* Initialize the log output */
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    /* Print logo */
    info!("ptio - Example HTTP Server [Version {}]", PKG_VERSION);

    /* Create the event loop */
    let event_loop = EventLoop::new().expect("Failed to create event loop!");

    /* Register loop controller with Ctrl+C handler */
    let controller = event_loop.controller();
    ctrlc::set_handler(move || {
        warn!("Shutdown has been requested!");
        controller.exit().expect("Failed to stop the event loop!");
    })
    .expect("Failed to register CTRL+C handler!");

    /* Bind the server to a local socket */
    let server = match Server::new(&event_loop, &Endpoint::ip4_loopback(PORT_NUMBER), ServerOptions::default()) {
        Ok(server) => server,
        Err(error) => return error!("Failed to start server: {:?}", error),
    };

    /* Register services */
    server.add_service("/", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Hello) }));
    server.add_service("/echo", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Echo::default()) }));
    server.add_service("/count", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Count { next: 1 }) }));

    let authorizer = Arc::new(BasicUserListAuthorizer::new("ptio demo"));
    authorizer.add_user("Aladdin", "open sesame");
    server.add_protected_service("/private", Rc::new(|_: &Request| -> Box<dyn Responder> { Box::new(Hello) }), authorizer);

    /* Serve until Ctrl+C is pressed */
    info!("Waiting for incoming connections on {:?}...", server.local_addr());
    if let Err(error) = event_loop.run() {
        error!("Event loop failed: {:?}", error);
    }

    /* Bye! */
    server.close();
    info!("That's it, goodbye!");
}

/// Answers every request with a small HTML page.
struct Hello;

impl Responder for Hello {
    fn begin_reply(&mut self, request: &Request, reply: &mut Reply) -> ptio_rs::Result<()> {
        info!("Request: {} {}", request.method(), request.target());
        reply.header_mut().set("Content-Type", "text/html")
    }

    fn write_reply(&mut self, request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        write!(reply.body_mut(), "<!DOCTYPE html>\r\n<title>Hello</title><h1>Hello from {}!</h1>", request.url())?;
        Ok(true)
    }
}

/// Sends the request body back.
#[derive(Default)]
struct Echo {
    data: Vec<u8>,
}

impl Responder for Echo {
    fn read_request(&mut self, request: &mut Request) -> ptio_rs::Result<()> {
        request.body_mut().read_to_end(&mut self.data)?;
        Ok(())
    }

    fn begin_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<()> {
        info!("Echoing {} byte(s)", self.data.len());
        reply.set_status(reply::OK);
        reply.header_mut().set("Content-Type", "application/octet-stream")
    }

    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        reply.body_mut().extend(&self.data);
        Ok(true)
    }
}

/// Streams ten lines, one chunk each.
struct Count {
    next: u32,
}

impl Responder for Count {
    fn write_reply(&mut self, _request: &Request, reply: &mut Reply) -> ptio_rs::Result<bool> {
        writeln!(reply.body_mut(), "line {}", self.next)?;
        self.next += 1;
        Ok(self.next > 10)
    }
}
