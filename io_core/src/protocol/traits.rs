//! `AbstractProtocol` / `AbstractTransport` contracts (§6), grounded on
//! `scarletio/core/protocols_and_transports/abstract.py`: default no-op method bodies so
//! concrete protocols/transports only override what they actually use.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use crate::extra_info::ExtraInfo;

/// Callbacks a transport invokes on its protocol. Every method has a default no-op body;
/// concrete protocols override the ones relevant to their role (read-only, read-write,
/// datagram).
pub trait AbstractProtocol {
    /// Called exactly once, before any other callback. The transport is handed over as a
    /// shared handle (every transport in this crate carries its mutable state behind an
    /// inner `RefCell`, so `&self` is enough for protocols to drive it).
    fn connection_made(&mut self, _transport: Rc<dyn AbstractTransport>) {}

    /// Called zero or more times; `data` is never empty.
    fn data_received(&mut self, _data: Bytes) {}

    /// Called once. Returning `true` keeps the write side open and removes the transport's
    /// reader; returning `false` tells the transport to close.
    fn eof_received(&mut self) -> bool {
        false
    }

    /// Called exactly once, last. `None` means a clean close, `Some` carries the cause.
    fn connection_lost(&mut self, _exception: Option<anyhow::Error>) {}

    fn pause_writing(&mut self) {}

    fn resume_writing(&mut self) {}

    fn datagram_received(&mut self, _data: Bytes, _address: SocketAddr) {}

    fn error_received(&mut self, _error: std::io::Error) {}
}

/// Methods protocols invoke on their transport. Every concrete transport keeps its mutable
/// state behind an inner `RefCell` and is always handed around as `Rc<Self>`, so these all
/// take `&self`.
pub trait AbstractTransport {
    fn get_extra_info(&self) -> &ExtraInfo;

    fn is_closing(&self) -> bool {
        true
    }

    fn close(&self) {}

    fn abort(&self) {}

    fn write(&self, _data: Bytes) {}

    fn writelines(&self, lines: Vec<Bytes>) {
        let mut joined = Vec::with_capacity(lines.iter().map(Bytes::len).sum());
        for line in lines {
            joined.extend_from_slice(&line);
        }
        self.write(Bytes::from(joined));
    }

    fn write_eof(&self) {}

    fn can_write_eof(&self) -> bool {
        false
    }

    fn get_write_buffer_size(&self) -> usize {
        0
    }

    fn get_write_buffer_limits(&self) -> (usize, usize) {
        (0, 0)
    }

    fn set_write_buffer_limits(&self, _low: Option<usize>, _high: Option<usize>) {}

    fn pause_reading(&self) -> bool {
        false
    }

    fn resume_reading(&self) -> bool {
        false
    }
}
