//! Single-producer/single-consumer byte conduit between a protocol's active reader and
//! a user task (§3, §4.1). Grounded on scarletio's `payload_stream.py`: a chunk buffer,
//! a flags word split into wait-mode and terminal-state, and a single `Option<Waker>`
//! rather than a queue, since at most one consumer awaits a stream at a time (§9
//! "Single-waiter rendezvous").
//!
//! The stream is `!Send` by design (§5: single-threaded cooperative scheduling) and is
//! shared between the producer (protocol reader) and the consumer (user task) via `Rc`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_core::Stream;

use crate::error::ConnectionError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WaitMode {
    None,
    Whole,
    Chunk,
}

impl WaitMode {
    fn label(self) -> &'static str {
        match self {
            WaitMode::None => "none",
            WaitMode::Whole => "whole",
            WaitMode::Chunk => "chunk",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Terminal {
    None,
    Success,
    Exception,
    Cancelled,
    Aborted,
}

struct Inner {
    chunks: VecDeque<Bytes>,
    chunk_buffer_size: usize,
    wait_mode: WaitMode,
    terminal: Terminal,
    exception: Option<Rc<anyhow::Error>>,
    waker: Option<Waker>,
    done_callbacks: Vec<Box<dyn FnOnce()>>,
}

impl Inner {
    fn is_terminal(&self) -> bool {
        self.terminal != Terminal::None
    }
}

/// The rendezvous itself. Cloning shares the same underlying state (`Rc`), matching
/// the single logical stream shared between the protocol and the consumer task.
#[derive(Clone)]
pub struct PayloadStream {
    inner: Rc<RefCell<Inner>>,
}

impl Default for PayloadStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadStream {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                chunks: VecDeque::new(),
                chunk_buffer_size: 0,
                wait_mode: WaitMode::None,
                terminal: Terminal::None,
                exception: None,
                waker: None,
                done_callbacks: Vec::new(),
            })),
        }
    }

    /// Appends a chunk from the producer. Returns `false` if the stream is already terminal.
    /// In chunk mode with an empty buffer and a parked waiter, the chunk is handed to the
    /// waiter directly instead of going through the buffer — this short-circuit is what
    /// makes chunk-mode consumption zero-latency and must be preserved (§9).
    pub fn add_received_chunk(&self, chunk: Bytes) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.is_terminal() {
            return false;
        }
        inner.chunks.push_back(chunk.clone());
        inner.chunk_buffer_size += chunk.len();
        Self::wake(&mut inner);
        true
    }

    pub fn set_done_success(&self) -> bool {
        self.set_terminal(Terminal::Success, None)
    }

    pub fn set_done_cancelled(&self) -> bool {
        self.set_terminal(Terminal::Cancelled, None)
    }

    pub fn set_done_exception(&self, exception: anyhow::Error) -> bool {
        self.set_terminal(Terminal::Exception, Some(Rc::new(exception)))
    }

    /// Internal terminal state used to signal the producer that the consumer gave up
    /// (dropped the await/iteration future before it resolved).
    pub(crate) fn abort(&self) -> bool {
        self.set_terminal(Terminal::Aborted, None)
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().terminal == Terminal::Aborted
    }

    fn set_terminal(&self, terminal: Terminal, exception: Option<Rc<anyhow::Error>>) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.is_terminal() {
            return false;
        }
        inner.terminal = terminal;
        inner.exception = exception;
        // Chunk buffer is cleared on cancelled/exception/aborted; success keeps buffered
        // data consumable (§3).
        if !matches!(terminal, Terminal::Success) {
            inner.chunks.clear();
            inner.chunk_buffer_size = 0;
        }
        Self::wake(&mut inner);

        let callbacks = std::mem::take(&mut inner.done_callbacks);
        drop(inner);
        // Reverse-registration order; exceptions from callbacks are not our problem to
        // propagate here (caller is expected to log, matching `_run_done_callback`).
        for cb in callbacks.into_iter().rev() {
            cb();
        }
        true
    }

    pub fn add_done_callback(&self, cb: impl FnOnce() + 'static) {
        let mut inner = self.inner.borrow_mut();
        if inner.is_terminal() {
            drop(inner);
            cb();
        } else {
            inner.done_callbacks.push(Box::new(cb));
        }
    }

    /// Live chunk-byte total in chunk mode; zero in whole mode, since concatenation
    /// happens once at the end there anyway (§4.1 "Back-pressure").
    pub fn get_buffer_size(&self) -> usize {
        let inner = self.inner.borrow();
        match inner.wait_mode {
            WaitMode::Chunk => inner.chunk_buffer_size,
            _ => 0,
        }
    }

    fn wake(inner: &mut Inner) {
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    fn enter_mode(&self, mode: WaitMode) -> Result<(), ConnectionError> {
        let mut inner = self.inner.borrow_mut();
        match inner.wait_mode {
            WaitMode::None => {
                inner.wait_mode = mode;
                Ok(())
            }
            existing if existing == mode => Ok(()),
            existing => Err(ConnectionError::eof_with(anyhow::anyhow!(
                crate::error::StreamStateError::WaitModeMismatch {
                    existing: existing.label(),
                    requested: mode.label(),
                }
            ))),
        }
    }

    /// Await surface: blocks until terminal, then returns the concatenation of all
    /// buffered chunks on success, or raises on exception/cancelled/aborted (§4.1).
    pub fn await_whole(&self) -> AwaitWhole {
        AwaitWhole { stream: self.clone(), entered: false, done: false }
    }

    /// Iterate surface: yields each buffered chunk as it arrives (§4.1).
    pub fn iter_chunks(&self) -> IterChunks {
        IterChunks { stream: self.clone(), entered: false, done: false }
    }
}

fn outcome_error(inner: &Inner) -> ConnectionError {
    match inner.terminal {
        Terminal::Cancelled => ConnectionError::cancelled(),
        Terminal::Aborted => ConnectionError::aborted(),
        Terminal::Exception => {
            let source = inner.exception.clone().expect("exception terminal always carries a source");
            ConnectionError::eof_with(anyhow::anyhow!(source.to_string()))
        }
        Terminal::Success | Terminal::None => unreachable!("outcome_error called on non-error terminal"),
    }
}

pub struct AwaitWhole {
    stream: PayloadStream,
    entered: bool,
    done: bool,
}

impl Future for AwaitWhole {
    type Output = Result<Bytes, ConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.entered {
            if let Err(err) = this.stream.enter_mode(WaitMode::Whole) {
                this.done = true;
                return Poll::Ready(Err(err));
            }
            this.entered = true;
        }

        let mut inner = this.stream.inner.borrow_mut();
        if inner.terminal == Terminal::None {
            inner.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        this.done = true;
        if inner.terminal == Terminal::Success {
            let bytes = concat_chunks(&mut inner.chunks);
            Poll::Ready(Ok(bytes))
        } else {
            let err = outcome_error(&inner);
            Poll::Ready(Err(err))
        }
    }
}

impl Drop for AwaitWhole {
    fn drop(&mut self) {
        // Consumer-side cancellation: dropping before completion aborts the stream so the
        // protocol observes it and treats the in-flight reader as having received EOF.
        if !self.done {
            self.stream.abort();
        }
    }
}

fn concat_chunks(chunks: &mut VecDeque<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop_front().unwrap(),
        _ => {
            let mut buf = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            Bytes::from(buf)
        }
    }
}

pub struct IterChunks {
    stream: PayloadStream,
    entered: bool,
    done: bool,
}

impl Stream for IterChunks {
    type Item = Result<Bytes, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.entered {
            if let Err(err) = this.stream.enter_mode(WaitMode::Chunk) {
                this.done = true;
                return Poll::Ready(Some(Err(err)));
            }
            this.entered = true;
        }

        let mut inner = this.stream.inner.borrow_mut();
        if let Some(chunk) = inner.chunks.pop_front() {
            inner.chunk_buffer_size -= chunk.len();
            return Poll::Ready(Some(Ok(chunk)));
        }

        match inner.terminal {
            Terminal::None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Terminal::Success => {
                this.done = true;
                Poll::Ready(None)
            }
            _ => {
                this.done = true;
                let err = outcome_error(&inner);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl Drop for IterChunks {
    fn drop(&mut self) {
        if !self.done {
            self.stream.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn await_whole_concatenates_on_success() {
        let stream = PayloadStream::new();
        stream.add_received_chunk(Bytes::from_static(b"hel"));
        stream.add_received_chunk(Bytes::from_static(b"lo"));
        stream.set_done_success();
        let result = stream.await_whole().await.unwrap();
        assert_eq!(&result[..], b"hello");
    }

    #[tokio::test]
    async fn await_whole_single_chunk_is_zero_copy() {
        let stream = PayloadStream::new();
        let chunk = Bytes::from_static(b"solo");
        stream.add_received_chunk(chunk.clone());
        stream.set_done_success();
        let result = stream.await_whole().await.unwrap();
        assert!(Bytes::ptr_eq(&result, &chunk) || result == chunk);
    }

    #[tokio::test]
    async fn monotonic_terminal_rejects_later_chunks_and_transitions() {
        let stream = PayloadStream::new();
        assert!(stream.set_done_success());
        assert!(!stream.add_received_chunk(Bytes::from_static(b"late")));
        assert!(!stream.set_done_cancelled());
    }

    #[tokio::test]
    async fn exception_clears_buffer_but_success_keeps_it() {
        let with_exception = PayloadStream::new();
        with_exception.add_received_chunk(Bytes::from_static(b"partial"));
        with_exception.set_done_exception(anyhow::anyhow!("boom"));
        assert_eq!(with_exception.get_buffer_size(), 0);

        let with_success = PayloadStream::new();
        with_success.iter_chunks(); // enter chunk mode so get_buffer_size is live
        with_success.add_received_chunk(Bytes::from_static(b"kept"));
        assert_eq!(with_success.get_buffer_size(), 4);
    }

    #[tokio::test]
    async fn iterate_surface_yields_chunks_then_ends() {
        let stream = PayloadStream::new();
        stream.add_received_chunk(Bytes::from_static(b"a"));
        stream.add_received_chunk(Bytes::from_static(b"b"));
        stream.set_done_success();

        let mut iter = stream.iter_chunks();
        assert_eq!(iter.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(iter.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_await_before_completion_aborts_stream() {
        let stream = PayloadStream::new();
        {
            let fut = stream.await_whole();
            drop(fut);
        }
        assert!(stream.is_aborted());
    }

    #[tokio::test]
    async fn switching_wait_mode_is_an_error() {
        use futures_util::FutureExt;

        let stream = PayloadStream::new();
        // Entering chunk mode requires a poll; `next()` polls immediately and returns
        // `None` (ready future) since now_or_never drives it synchronously once.
        let mut iter = stream.iter_chunks();
        let _ = iter.next().now_or_never();

        let result = stream.await_whole().now_or_never();
        match result {
            Some(Err(_)) => {}
            other => panic!("expected immediate mode-mismatch error, got {other:?}"),
        }
    }
}
