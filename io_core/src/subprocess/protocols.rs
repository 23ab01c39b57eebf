//! Protocols wired to a subprocess's three standard pipes: `SubprocessReadPipeProtocol`
//! for stdout/stderr and `SubprocessWriteProtocol` for stdin.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;

use crate::error::ConnectionError;
use crate::flow_control::NoopFlowControl;
use crate::protocol::{AbstractProtocol, AbstractTransport, ReadProtocol};
use crate::transport::unix_pipe::UnixWritePipeTransport;

/// Wraps a plain `ReadProtocol` for a subprocess's stdout or stderr pipe. `eof_received`
/// always reports `false`: unlike a stream-socket read protocol (which keeps the write
/// side usable after a peer's clean EOF), a subprocess pipe has no write side of its own
/// to keep open, so there is nothing to decline closing for.
pub struct SubprocessReadPipeProtocol {
    pub read: ReadProtocol<NoopFlowControl>,
}

impl SubprocessReadPipeProtocol {
    pub fn new(pause_threshold: usize) -> Self {
        Self { read: ReadProtocol::new(NoopFlowControl::default(), pause_threshold) }
    }
}

impl AbstractProtocol for SubprocessReadPipeProtocol {
    fn data_received(&mut self, data: Bytes) {
        self.read.data_received(data);
    }

    fn eof_received(&mut self) -> bool {
        self.read.eof_received();
        false
    }

    fn connection_lost(&mut self, exception: Option<anyhow::Error>) {
        match exception {
            Some(error) => self.read.set_exception(error),
            None => {
                self.read.eof_received();
            }
        }
    }
}

/// Drain bookkeeping, shared with the transport's `pause_writing`/`resume_writing`.
pub struct SubprocessWriteProtocol {
    paused: bool,
    waker: Option<Waker>,
    closing_error: Option<Rc<anyhow::Error>>,
}

impl Default for SubprocessWriteProtocol {
    fn default() -> Self {
        Self { paused: false, waker: None, closing_error: None }
    }
}

impl AbstractProtocol for SubprocessWriteProtocol {
    fn pause_writing(&mut self) {
        self.paused = true;
    }

    fn resume_writing(&mut self) {
        self.paused = false;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn connection_lost(&mut self, exception: Option<anyhow::Error>) {
        self.closing_error = exception.map(Rc::new);
        self.paused = false;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Future backing `SubprocessWriter::drain`. Grounded on `subprocess_writer.py`'s
/// `drain`: if the pipe is already closing, it yields once before checking anything, so a
/// `connection_lost` racing the call has a chance to land first.
pub struct SubprocessDrain {
    pub(super) protocol: Rc<RefCell<SubprocessWriteProtocol>>,
    pub(super) transport: Rc<UnixWritePipeTransport>,
    pub(super) yielded_once: bool,
}

impl Future for SubprocessDrain {
    type Output = Result<(), ConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.transport.is_closing() && !this.yielded_once {
            this.yielded_once = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let mut protocol = this.protocol.borrow_mut();
        if let Some(error) = &protocol.closing_error {
            return Poll::Ready(Err(ConnectionError::eof_with(anyhow::anyhow!(error.to_string()))));
        }
        if !protocol.paused {
            return Poll::Ready(Ok(()));
        }
        protocol.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
