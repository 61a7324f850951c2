/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
mod endpoint;
mod options;
mod tcp_server;
mod tcp_socket;
mod udp_socket;

pub use endpoint::{Endpoint, Host};
pub use options::{TcpServerOptions, TcpSocketOptions, UdpSocketOptions};
pub use tcp_server::TcpServer;
pub use tcp_socket::TcpSocket;
pub use udp_socket::{UdpSocket, UdpTransport};
