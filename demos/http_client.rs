/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use ptio_rs::http::{BasicAuthentication, Client, HttpMessage, Request};
use ptio_rs::net::Endpoint;
use ptio_rs::system::{EventLoop, Selectable};

use log::{info, warn, error};

const REMOTE_HOST: &str = "localhost";
const PORT_NUMBER: u16 = 8080;
const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    /* Initialize the log output */
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    /* Print logo */
    info!("ptio - Example HTTP Client [Version {}]", PKG_VERSION);

    /* Create the event loop */
    let event_loop = EventLoop::new().expect("Failed to create event loop!");

    /* Register loop controller with Ctrl+C handler */
    let controller = event_loop.controller();
    ctrlc::set_handler(move || {
        warn!("Shutdown has been requested!");
        controller.exit().expect("Failed to stop the event loop!");
    })
    .expect("Failed to register CTRL+C handler!");

    /* Blocking calls */
    let client = Client::new(Endpoint::new(REMOTE_HOST, PORT_NUMBER));
    client.set_timeout(Some(Duration::from_secs(10)));
    client.add_authentication(Box::new(BasicAuthentication::new("Aladdin", "open sesame")));

    for url in ["/", "/count", "/private"] {
        let mut request = Request::new(url);
        match client.call(&mut request) {
            Ok(reply) => info!("{} -> {} {}: {:?}", url, reply.status(), reply.reason(), String::from_utf8_lossy(reply.body().as_slice())),
            Err(error) => return error!("Request for {} failed: {:?}", url, error),
        }
    }

    /* The same exchange, driven by the event loop */
    if let Err(error) = client.attach(&event_loop) {
        return error!("Failed to attach client: {:?}", error);
    }
    let sent = client.request_sent().connect(|client: &Client| {
        if let Err(error) = client.end_send().and_then(|_| client.begin_receive()) {
            error!("Failed to send request: {:?}", error);
            if let Some(event_loop) = client.event_loop() {
                event_loop.exit();
            }
        }
    });
    let remaining = Rc::new(Cell::new(3u32));
    let counter = remaining.clone();
    let received = client.reply_received().connect(move |client: &Client| {
        match client.end_receive() {
            Ok(reply) => info!("Echo -> {} {}: {:?}", reply.status(), reply.reason(), String::from_utf8_lossy(reply.body().as_slice())),
            Err(error) => error!("Failed to receive reply: {:?}", error),
        }
        counter.set(counter.get().saturating_sub(1));
        match (counter.get(), client.event_loop()) {
            (0, Some(event_loop)) => event_loop.exit(),
            _ => send_echo(client, counter.get()),
        }
    });
    send_echo(&client, remaining.get());

    if let Err(error) = event_loop.run() {
        error!("Event loop failed: {:?}", error);
    }
    drop((sent, received));

    /* Bye! */
    info!("That's it, goodbye!");
}

fn send_echo(client: &Client, index: u32) {
    let mut request = Request::with_method("POST", "/echo");
    request.body_mut().extend(format!("Message #{}", index).as_bytes());
    if let Err(error) = client.begin_send(&mut request) {
        error!("Failed to send request: {:?}", error);
    }
}
