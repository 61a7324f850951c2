/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use crate::error::{Error, Result};

/// The TLS engine underneath a [`StreamBuffer`](crate::ssl::StreamBuffer)
///
/// Implementations own the transport (usually a
/// [`TcpSocket`](crate::net::TcpSocket)) and perform the record layer and
/// the handshakes. All functions may block.
pub trait SslConnection {
    /// Performs one step of the opening handshake; returns `true` once the
    /// handshake has completed.
    fn handshake(&mut self) -> Result<bool>;

    /// Reads decrypted data; `Ok(0)` means the peer closed the session.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Encrypts and sends data; returns the number of bytes consumed.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Performs one step of the close-notify handshake; returns `true` once
    /// it has completed.
    fn shutdown(&mut self) -> Result<bool>;

    /// The opening handshake has completed.
    fn is_connected(&self) -> bool;

    /// The peer has asked to close the session; data may still be pending.
    fn is_shutdown(&self) -> bool;

    /// The transport is closed.
    fn is_closed(&self) -> bool;
}

/// Stand-in for builds without a TLS backend: every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTlsConnection;

const NO_TLS: &str = "no TLS backend available";

impl SslConnection for NoTlsConnection {
    fn handshake(&mut self) -> Result<bool> {
        Err(Error::ssl(NO_TLS))
    }

    fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
        Err(Error::ssl(NO_TLS))
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::ssl(NO_TLS))
    }

    fn shutdown(&mut self) -> Result<bool> {
        Err(Error::ssl(NO_TLS))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn is_shutdown(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        true
    }
}
