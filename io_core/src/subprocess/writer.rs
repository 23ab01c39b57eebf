//! Stdin-side handle for a spawned subprocess: writes queue through the pipe's write
//! transport exactly like any other `AbstractTransport`, with a `drain` that matches
//! `subprocess_writer.py`'s "yield once before checking, so a closing connection has a
//! chance to fail the waiter rather than return success" behavior.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::ConnectionError;
use crate::protocol::AbstractTransport;
use crate::transport::unix_pipe::UnixWritePipeTransport;

use super::protocols::{SubprocessDrain, SubprocessWriteProtocol};

pub struct SubprocessWriter {
    protocol: Rc<RefCell<SubprocessWriteProtocol>>,
    transport: Rc<UnixWritePipeTransport>,
}

impl SubprocessWriter {
    pub(super) fn new(protocol: Rc<RefCell<SubprocessWriteProtocol>>, transport: Rc<UnixWritePipeTransport>) -> Self {
        Self { protocol, transport }
    }

    pub fn write(&self, data: Bytes) {
        self.transport.write(data);
    }

    pub fn writelines(&self, chunks: impl IntoIterator<Item = Bytes>) {
        for chunk in chunks {
            self.transport.write(chunk);
        }
    }

    pub fn write_eof(&self) {
        self.transport.write_eof();
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn is_closing(&self) -> bool {
        self.transport.is_closing()
    }

    pub fn get_write_buffer_size(&self) -> usize {
        self.transport.get_write_buffer_size()
    }

    pub fn drain(&self) -> SubprocessDrain {
        SubprocessDrain { protocol: self.protocol.clone(), transport: self.transport.clone(), yielded_once: false }
    }
}
