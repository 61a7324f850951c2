/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
mod connection;
mod stream_buffer;

pub use connection::{NoTlsConnection, SslConnection};
pub use stream_buffer::{StreamBuffer, DEFAULT_BUFFER_SIZE, PUTBACK};
