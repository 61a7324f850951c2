/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
mod event;
mod event_loop;
mod io_device;
mod selectable;
mod selector;
mod signal;
mod timer;

pub use event::{Event, EventQueue};
pub use event_loop::{EventLoop, LoopController};
pub use io_device::{IoDevice, Transport};
#[doc(hidden)]
pub use io_device::DeviceCore;
pub use selectable::{Readiness, Selectable, SelectableId};
pub use selector::{WAIT_INFINITE, WAIT_MAX};
pub use signal::{Signal, Subscription};
pub use timer::Timer;

pub(crate) use io_device::{attempt, block_on, Completion};
pub(crate) use selectable::{Dispatch, Registration};
