//! Adds drain/pause-writing to `ReadProtocol` (§4.3).

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;

use crate::error::ConnectionError;
use crate::flow_control::FlowControl;

use super::read::ReadProtocol;
use super::traits::AbstractTransport;

struct DrainWaiter {
    paused: bool,
    waker: Option<Waker>,
    closing_error: Option<Rc<anyhow::Error>>,
}

/// Read-write protocol state: the read half (`ReadProtocol`) plus write-side flow control.
/// Parameterized over the transport type `T` it forwards writes to. `T` carries its own
/// interior mutability, so it is held as a plain `Rc<T>`.
pub struct ReadWriteProtocol<F: FlowControl, T: AbstractTransport> {
    pub read: ReadProtocol<F>,
    transport: Option<Rc<T>>,
    drain: Rc<RefCell<DrainWaiter>>,
}

impl<F: FlowControl, T: AbstractTransport> ReadWriteProtocol<F, T> {
    pub fn new(read: ReadProtocol<F>) -> Self {
        Self {
            read,
            transport: None,
            drain: Rc::new(RefCell::new(DrainWaiter { paused: false, waker: None, closing_error: None })),
        }
    }

    pub fn attach_transport(&mut self, transport: Rc<T>) {
        self.transport = Some(transport);
    }

    pub fn write(&mut self, data: Bytes) {
        if let Some(transport) = &self.transport {
            transport.write(data);
        }
    }

    pub fn writelines(&mut self, lines: Vec<Bytes>) {
        if let Some(transport) = &self.transport {
            transport.writelines(lines);
        }
    }

    pub fn write_eof(&mut self) {
        if let Some(transport) = &self.transport {
            transport.write_eof();
        }
    }

    /// Invoked by the transport when the write buffer crosses the high-water mark.
    pub fn pause_writing(&mut self) {
        self.drain.borrow_mut().paused = true;
    }

    /// Invoked by the transport when the write buffer drains to the low-water mark.
    pub fn resume_writing(&mut self) {
        let mut drain = self.drain.borrow_mut();
        drain.paused = false;
        if let Some(waker) = drain.waker.take() {
            waker.wake();
        }
    }

    /// Invoked when the connection is lost, so an in-flight `drain` fails instead of
    /// hanging forever.
    pub fn note_connection_lost(&mut self, error: Option<anyhow::Error>) {
        let mut drain = self.drain.borrow_mut();
        drain.closing_error = error.map(Rc::new);
        drain.paused = false;
        if let Some(waker) = drain.waker.take() {
            waker.wake();
        }
    }

    /// Blocks until the write buffer is drained. If the transport is already closing,
    /// yields once first so `connection_lost` has a chance to fire (§4.3).
    pub fn drain(&self) -> Drain {
        let closing = self.transport.as_ref().is_some_and(|t| t.is_closing());
        Drain { drain: self.drain.clone(), yielded_once: !closing }
    }
}

pub struct Drain {
    drain: Rc<RefCell<DrainWaiter>>,
    yielded_once: bool,
}

impl Future for Drain {
    type Output = Result<(), ConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.yielded_once {
            this.yielded_once = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let mut drain = this.drain.borrow_mut();
        if let Some(error) = &drain.closing_error {
            return Poll::Ready(Err(ConnectionError::eof_with(anyhow::anyhow!(error.to_string()))));
        }
        if !drain.paused {
            return Poll::Ready(Ok(()));
        }
        drain.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extra_info::ExtraInfo;
    use crate::flow_control::NoopFlowControl;

    struct FakeTransport {
        extra: ExtraInfo,
        closing: bool,
        written: RefCell<Vec<Bytes>>,
    }

    impl AbstractTransport for FakeTransport {
        fn get_extra_info(&self) -> &ExtraInfo {
            &self.extra
        }
        fn is_closing(&self) -> bool {
            self.closing
        }
        fn write(&self, data: Bytes) {
            self.written.borrow_mut().push(data);
        }
    }

    #[tokio::test]
    async fn drain_completes_immediately_when_not_paused() {
        let read = ReadProtocol::new(NoopFlowControl::default(), 131072);
        let mut rw = ReadWriteProtocol::<NoopFlowControl, FakeTransport>::new(read);
        let transport = Rc::new(FakeTransport { extra: ExtraInfo::new(), closing: false, written: RefCell::new(vec![]) });
        rw.attach_transport(transport);
        rw.drain().await.unwrap();
    }

    #[tokio::test]
    async fn drain_blocks_until_resume_writing() {
        let read = ReadProtocol::new(NoopFlowControl::default(), 131072);
        let mut rw = ReadWriteProtocol::<NoopFlowControl, FakeTransport>::new(read);
        let transport = Rc::new(FakeTransport { extra: ExtraInfo::new(), closing: false, written: RefCell::new(vec![]) });
        rw.attach_transport(transport);
        rw.pause_writing();

        let drain = rw.drain();
        tokio::pin!(drain);
        assert!(futures_util::poll!(&mut drain).is_pending());
        rw.resume_writing();
        drain.await.unwrap();
    }
}
