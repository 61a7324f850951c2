/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
mod flag;
mod timeout;

pub(crate) use flag::Flag;
pub(crate) use timeout::Timeout;
