//! Transport layers (§4.4-§4.6): the glue between a non-blocking fd and a protocol's
//! callback contract. Each variant drives an OS readiness notifier (`tokio::io::unix::AsyncFd`,
//! the same "register for readable/writable, retry the syscall" pattern the teacher's
//! networking code runs) and translates readiness into `data_received`/`eof_received`/
//! `connection_lost`/`pause_writing`/`resume_writing` calls.

pub mod datagram;
pub mod stream;
pub mod unix_pipe;

use std::cell::RefCell;
use std::rc::Rc;

use crate::protocol::AbstractProtocol;

/// Coerces a concrete protocol handle to the trait object form transports hold, via a
/// function boundary so the compiler's unsized-coercion kicks in on the return value.
pub(crate) fn erase_protocol<P: AbstractProtocol + 'static>(
    protocol: Rc<RefCell<P>>,
) -> Rc<RefCell<dyn AbstractProtocol>> {
    protocol
}
