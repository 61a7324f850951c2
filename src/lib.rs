/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */

//! **ptio** provides a single-threaded ***event loop*** with timers,
//! non-blocking TCP/UDP sockets with two-phase (`begin_*`/`end_*`) I/O, an
//! HTTP/1.1 message engine and a buffered SSL stream.
//!
//! Every [`system::Selectable`] object (sockets, servers, HTTP clients) is
//! attached to exactly one [`system::EventLoop`]. A `begin_*` call starts an
//! operation and returns at once; the object then sends a completion
//! [`system::Signal`] from within the loop, and the result is collected with
//! the matching `end_*` call. The same objects also offer "blocking" calls
//! with ***timeout*** support, which work with or without a loop.
//!
//! The loop itself is driven on one thread. Other threads interact with it
//! through a [`system::LoopController`], which can post
//! [`system::Event`]s and ask the loop to exit; exiting also cancels any
//! blocking call in progress on the loop thread. The I/O layer is built on
//! the [**`mio`**](mio) library, so all platforms supported by `mio` are
//! supported by **ptio** as well.
//!
//! # Usage
//!
//! Create a [`system::EventLoop`], attach objects to it, start operations,
//! connect to their signals and call [`run()`](system::EventLoop::run()).
//! An HTTP server is set up with [`http::Server`] and one or more
//! [`http::Service`]s; [`http::Client`] talks to it.
//!
//! # Examples
//!
//! Examples can be found in the `demos` sub-directory.

mod error;
mod utilities;

pub mod http;
pub mod net;
pub mod ssl;
pub mod system;

pub use error::{Error, Result};
