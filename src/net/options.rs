/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::time::Duration;

/// Options applied to a [`TcpSocket`](crate::net::TcpSocket) once connected.
#[derive(Debug, Clone, Default)]
pub struct TcpSocketOptions {
    pub no_delay: bool,
}

/// Options for a listening [`TcpServer`](crate::net::TcpServer)
///
/// `defer_accept` asks the OS to report a connection only once data has
/// arrived on it, waiting at most the given time. It is ignored on platforms
/// that lack the feature.
#[derive(Debug, Clone)]
pub struct TcpServerOptions {
    pub backlog: u32,
    pub defer_accept: Option<Duration>,
    pub reuse_address: bool,
}

impl Default for TcpServerOptions {
    fn default() -> Self {
        Self {
            backlog: 64,
            defer_accept: None,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UdpSocketOptions {
    pub reuse_address: bool,
    pub broadcast: bool,
    pub hop_limit: Option<u32>,
}
