//! Generator-based incremental reader (§4.2), re-expressed as an explicit state machine
//! per §9: each reader variant is a tagged enum plus a `step` that consumes some prefix
//! of the next available chunk and either asks for more or completes the attached
//! `PayloadStream`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;

use crate::error::{ConnectionError, StreamStateError};
use crate::flow_control::FlowControl;
use crate::payload_stream::PayloadStream;

use super::boundary_scan::BoundaryScan;

enum ReaderKind {
    /// `read()` — stream to EOF.
    ToEof,
    /// `read(n)` (`exact = false`, stops early on EOF) and `read_exactly(n)`
    /// (`exact = true`, EOF before `remaining == 0` is an error).
    Bytes { remaining: usize, exact: bool },
    /// `read_until(boundary)`.
    Until(BoundaryScan),
    /// `read_once()` — one kernel chunk, or empty bytes on EOF.
    Once { delivered: bool },
}

struct ActiveReader {
    stream: PayloadStream,
    kind: ReaderKind,
}

impl ActiveReader {
    /// Consumes a prefix of `chunk[offset..]`, forwarding confirmed bytes to the stream.
    /// Returns the new offset within `chunk` and whether the reader is now finished.
    fn step(&mut self, chunk: &Bytes, offset: usize) -> (usize, bool) {
        match &mut self.kind {
            ReaderKind::ToEof => {
                if offset < chunk.len() {
                    self.stream.add_received_chunk(chunk.slice(offset..));
                }
                (chunk.len(), false)
            }
            ReaderKind::Bytes { remaining, .. } => {
                let available = chunk.len() - offset;
                let take = (*remaining).min(available);
                if take > 0 {
                    self.stream.add_received_chunk(chunk.slice(offset..offset + take));
                    *remaining -= take;
                }
                let finished = *remaining == 0;
                if finished {
                    self.stream.set_done_success();
                }
                (offset + take, finished)
            }
            ReaderKind::Once { delivered } => {
                self.stream.add_received_chunk(chunk.slice(offset..));
                *delivered = true;
                self.stream.set_done_success();
                (chunk.len(), true)
            }
            ReaderKind::Until(scan) => {
                let outcome = scan.feed(&chunk[offset..]);
                if !outcome.released.is_empty() {
                    self.stream.add_received_chunk(Bytes::from(outcome.released));
                }
                match outcome.matched_at {
                    Some(consumed) => {
                        self.stream.set_done_success();
                        (offset + consumed, true)
                    }
                    None => (chunk.len(), false),
                }
            }
        }
    }

    /// Resolves the reader against synthetic EOF (§4.2 "EOF").
    fn finish_on_eof(self) {
        match self.kind {
            ReaderKind::ToEof | ReaderKind::Once { .. } => {
                self.stream.set_done_success();
            }
            ReaderKind::Bytes { exact: false, .. } => {
                self.stream.set_done_success();
            }
            ReaderKind::Bytes { exact: true, .. } => {
                self.stream.set_done_exception(ConnectionError::eof().into());
            }
            ReaderKind::Until(_) => {
                self.stream.set_done_exception(ConnectionError::eof().into());
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
struct StickyFatalError(String);

/// The read half of a protocol: chunk deque, partial-consumption offset, and at most one
/// active reader (§3 "ReadProtocol").
pub struct ReadProtocol<F: FlowControl> {
    deque: VecDeque<Bytes>,
    offset: usize,
    at_eof: bool,
    paused_reading: bool,
    fatal_exception: Option<Rc<String>>,
    active_reader: Option<ActiveReader>,
    flow_control: F,
    pause_threshold: usize,
}

impl<F: FlowControl> ReadProtocol<F> {
    pub fn new(flow_control: F, pause_threshold: usize) -> Self {
        Self {
            deque: VecDeque::new(),
            offset: 0,
            at_eof: false,
            paused_reading: false,
            fatal_exception: None,
            active_reader: None,
            flow_control,
            pause_threshold,
        }
    }

    pub fn is_at_eof(&self) -> bool {
        self.at_eof
    }

    fn outstanding_bytes(&self) -> usize {
        let mut total: usize = self
            .deque
            .iter()
            .enumerate()
            .map(|(i, chunk)| if i == 0 { chunk.len() - self.offset } else { chunk.len() })
            .sum();
        if let Some(reader) = &self.active_reader {
            total += reader.stream.get_buffer_size();
        }
        total
    }

    fn attach(&mut self, kind: ReaderKind) -> Result<PayloadStream, StreamStateError> {
        if self.active_reader.is_some() {
            return Err(StreamStateError::ReaderAlreadyActive);
        }
        let stream = PayloadStream::new();
        if let Some(message) = &self.fatal_exception {
            stream.set_done_exception(StickyFatalError(message.as_ref().clone()).into());
            return Ok(stream);
        }
        self.active_reader = Some(ActiveReader { stream: stream.clone(), kind });
        self.pump();
        if self.at_eof {
            if let Some(reader) = self.active_reader.take() {
                reader.finish_on_eof();
            }
        }
        Ok(stream)
    }

    pub fn read(&mut self) -> Result<PayloadStream, StreamStateError> {
        self.attach(ReaderKind::ToEof)
    }

    pub fn read_n(&mut self, n: usize) -> Result<PayloadStream, StreamStateError> {
        self.attach(ReaderKind::Bytes { remaining: n, exact: false })
    }

    pub fn read_exactly(&mut self, n: usize) -> Result<PayloadStream, StreamStateError> {
        self.attach(ReaderKind::Bytes { remaining: n, exact: true })
    }

    pub fn read_until(&mut self, boundary: Vec<u8>) -> Result<PayloadStream, StreamStateError> {
        self.attach(ReaderKind::Until(BoundaryScan::new(boundary)))
    }

    pub fn read_once(&mut self) -> Result<PayloadStream, StreamStateError> {
        self.attach(ReaderKind::Once { delivered: false })
    }

    /// Drives the active reader against whatever is already queued.
    fn pump(&mut self) {
        loop {
            let Some(reader) = self.active_reader.as_ref() else { break };
            if reader.stream.is_aborted() {
                self.active_reader = None;
                break;
            }
            let Some(chunk) = self.deque.front().cloned() else { break };
            if self.offset >= chunk.len() {
                self.deque.pop_front();
                self.offset = 0;
                continue;
            }

            let reader = self.active_reader.as_mut().unwrap();
            let (new_offset, finished) = reader.step(&chunk, self.offset);
            self.offset = new_offset;
            if self.offset >= chunk.len() {
                self.deque.pop_front();
                self.offset = 0;
            }
            if finished {
                self.active_reader = None;
                break;
            }
        }
    }

    /// Feeds newly received bytes in (transport read-path callback). Never called with
    /// empty `data` (that case is EOF, signalled via `eof_received`).
    pub fn data_received(&mut self, data: Bytes) {
        if self.fatal_exception.is_some() {
            return;
        }
        self.deque.push_back(data);
        self.pump();

        if !self.paused_reading && self.outstanding_bytes() > self.pause_threshold {
            self.paused_reading = self.flow_control.pause_reading();
        }
    }

    /// Called by a consumer after draining chunks, so back-pressure releases promptly
    /// (§4.1 "the iterator must call `resume_reading` ... after each pop").
    pub fn maybe_resume_reading(&mut self) {
        if self.paused_reading && self.outstanding_bytes() <= self.pause_threshold {
            self.paused_reading = !self.flow_control.resume_reading();
        }
    }

    /// Returns the abstract contract's "should the transport close" flag: this generic
    /// read protocol keeps the write side usable after a clean peer EOF, so it returns
    /// `true` to signal the transport should not close outright (only read-only
    /// subprocess pipe protocols deviate — see `subprocess::protocols`).
    pub fn eof_received(&mut self) -> bool {
        self.at_eof = true;
        if let Some(reader) = self.active_reader.take() {
            reader.finish_on_eof();
        }
        true
    }

    /// Sticky fatal exception (§4.2 "Fatal exception"): aborts the active reader and
    /// fails all subsequent read calls immediately.
    pub fn set_exception(&mut self, exception: impl std::fmt::Display) {
        let message = exception.to_string();
        self.fatal_exception = Some(Rc::new(message.clone()));
        if let Some(reader) = self.active_reader.take() {
            reader.stream.set_done_exception(StickyFatalError(message).into());
        }
    }
}

/// Wraps `PayloadStream`'s chunk iterator so that each pop also triggers
/// `ReadProtocol::maybe_resume_reading`, as the spec requires of the iterate surface.
pub struct ResumingChunks<F: FlowControl + 'static> {
    inner: crate::payload_stream::IterChunks,
    protocol: Rc<RefCell<ReadProtocol<F>>>,
}

impl<F: FlowControl + 'static> ResumingChunks<F> {
    pub fn new(inner: crate::payload_stream::IterChunks, protocol: Rc<RefCell<ReadProtocol<F>>>) -> Self {
        Self { inner, protocol }
    }
}

impl<F: FlowControl + 'static> Stream for ResumingChunks<F> {
    type Item = Result<Bytes, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let inner = Pin::new(&mut this.inner);
        let result = inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(_))) = &result {
            this.protocol.borrow_mut().maybe_resume_reading();
        }
        result
    }
}
