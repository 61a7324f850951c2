/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */

//! HTTP/1.1 messages, a blocking and two-phase client, and a server with
//! URL-prefix routing and Basic authentication.

mod authenticator;
mod authorizer;
mod buffer;
mod client;
mod codec;
mod connection;
mod header;
mod message;
pub mod reply;
mod request;
mod server;

pub use authenticator::{basic_credentials, parse_basic_credentials, Authentication, Authenticator, BasicAuthentication};
pub use authorizer::{AccessDecision, Authorization, Authorizer, BasicUserListAuthorizer};
pub use buffer::MessageBuffer;
pub use client::Client;
pub use codec::{write_head, MessageKind, MessageReader, MessageWriter, StartLine, MAX_LINE_LENGTH};
pub use connection::Connection;
pub use header::{HeaderIter, MessageHeader, HEADER_CAPACITY};
pub use message::{HttpMessage, Message, MessageProgress};
pub use reply::Reply;
pub use request::Request;
pub use server::{Responder, Server, ServerOptions, Service};
