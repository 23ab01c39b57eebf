//! Unix pipe transport layers (§4.6): one half-duplex transport for a read fd
//! (`UnixReadPipeTransport`) and one for a write fd (`UnixWritePipeTransport`), for wiring a
//! FIFO, a socket fd, or (read side only) a char device up to the protocol contract.
//!
//! Grounded on `unix_pipe_transport_layer.py`: both sides fstat the fd and refuse anything
//! that isn't a FIFO, a socket, or (read side) a character device, then flip it
//! non-blocking by hand rather than trusting the caller to have done it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use crate::config::Config;
use crate::extra_info::{self, ExtraInfo};
use crate::protocol::{AbstractProtocol, AbstractTransport};

use super::erase_protocol;

fn validate_pipe_fd(fd: RawFd) -> io::Result<()> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mode = stat.st_mode & libc::S_IFMT;
    if mode == libc::S_IFIFO || mode == libc::S_IFSOCK || mode == libc::S_IFCHR {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix pipe transport requires a FIFO, socket, or character device fd",
        ))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

struct ReadInner {
    closing: bool,
    connection_lost_called: bool,
}

/// The read half of a pipe. `eof_received`'s return value is deliberately not inspected on
/// close (see `SPEC_FULL.md` §9 "Open questions": the source never checked it either, and
/// changing that now could silently alter shutdown ordering for existing protocols).
pub struct UnixReadPipeTransport {
    fd: AsyncFd<File>,
    protocol: Rc<RefCell<dyn AbstractProtocol>>,
    inner: RefCell<ReadInner>,
    extra: ExtraInfo,
    recv_size: usize,
}

impl UnixReadPipeTransport {
    pub fn spawn<P: AbstractProtocol + 'static>(
        file: File,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<UnixReadPipeTransport>> {
        validate_pipe_fd(file.as_raw_fd())?;
        set_nonblocking(file.as_raw_fd())?;

        let mut extra = ExtraInfo::new();
        extra.set(extra_info::EXTRA_INFO_NAME_PIPE, file.as_raw_fd());

        let fd = AsyncFd::new(file)?;
        let transport = Rc::new(UnixReadPipeTransport {
            fd,
            protocol: erase_protocol(protocol),
            inner: RefCell::new(ReadInner { closing: false, connection_lost_called: false }),
            extra,
            recv_size: config.recv_size_pipe,
        });

        let driven = transport.clone();
        tokio::task::spawn_local(async move {
            let handle: Rc<dyn AbstractTransport> = driven.clone();
            driven.protocol.borrow_mut().connection_made(handle);
            // "Skip ready cycle": the first readiness notification after construction is
            // consumed here without reading, giving the caller one tick to finish wiring
            // up the protocol before data can arrive.
            tokio::task::yield_now().await;
            driven.run().await;
        });

        Ok(transport)
    }

    async fn run(self: Rc<Self>) {
        let mut recv_buf = vec![0u8; self.recv_size];
        loop {
            if self.inner.borrow().closing {
                break;
            }
            match self.fd.readable().await {
                Ok(mut guard) => match guard.try_io(|fd| fd.get_ref().read(&mut recv_buf)) {
                    Ok(Ok(0)) => {
                        // Return value intentionally ignored; see the struct doc comment.
                        let _ = self.protocol.borrow_mut().eof_received();
                        break;
                    }
                    Ok(Ok(n)) => {
                        self.protocol.borrow_mut().data_received(Bytes::copy_from_slice(&recv_buf[..n]));
                    }
                    Ok(Err(error)) => {
                        self.finish(Some(error.into()));
                        return;
                    }
                    Err(_would_block) => {}
                },
                Err(error) => {
                    self.finish(Some(error.into()));
                    return;
                }
            }
        }
        self.finish(None);
    }

    fn finish(&self, error: Option<anyhow::Error>) {
        let mut inner = self.inner.borrow_mut();
        if inner.connection_lost_called {
            return;
        }
        inner.connection_lost_called = true;
        drop(inner);
        self.protocol.borrow_mut().connection_lost(error);
    }
}

impl AbstractTransport for UnixReadPipeTransport {
    fn get_extra_info(&self) -> &ExtraInfo {
        &self.extra
    }

    fn is_closing(&self) -> bool {
        self.inner.borrow().closing
    }

    fn close(&self) {
        self.inner.borrow_mut().closing = true;
    }

    fn abort(&self) {
        self.inner.borrow_mut().closing = true;
    }

    fn pause_reading(&self) -> bool {
        // The driver loop always awaits readability; pausing a pipe read side isn't
        // meaningful the way it is for a buffered socket transport (§4.6 only documents
        // water marks for the write side).
        false
    }
}

struct WriteInner {
    write_buffer: VecDeque<Bytes>,
    closing: bool,
    aborted: bool,
    connection_lost_called: bool,
    low_water: usize,
    high_water: usize,
    write_paused: bool,
}

impl WriteInner {
    fn buffered(&self) -> usize {
        self.write_buffer.iter().map(Bytes::len).sum()
    }
}

/// The write half of a pipe. Mirrors the source's "any readability on the write fd means
/// the peer went away" detection: pipes have no separate read channel on this fd, so a
/// readable write-end can only mean the peer closed its end.
pub struct UnixWritePipeTransport {
    fd: AsyncFd<File>,
    protocol: Rc<RefCell<dyn AbstractProtocol>>,
    inner: RefCell<WriteInner>,
    extra: ExtraInfo,
    watch_for_peer_close: bool,
    wake: Notify,
}

impl UnixWritePipeTransport {
    pub fn spawn<P: AbstractProtocol + 'static>(
        file: File,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<UnixWritePipeTransport>> {
        validate_pipe_fd(file.as_raw_fd())?;
        set_nonblocking(file.as_raw_fd())?;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        unsafe { libc::fstat(file.as_raw_fd(), &mut stat) };
        let mode = stat.st_mode & libc::S_IFMT;
        let watch_for_peer_close = mode == libc::S_IFIFO || mode == libc::S_IFSOCK;

        let mut extra = ExtraInfo::new();
        extra.set(extra_info::EXTRA_INFO_NAME_PIPE, file.as_raw_fd());

        let fd = AsyncFd::new(file)?;
        let transport = Rc::new(UnixWritePipeTransport {
            fd,
            protocol: erase_protocol(protocol),
            inner: RefCell::new(WriteInner {
                write_buffer: VecDeque::new(),
                closing: false,
                aborted: false,
                connection_lost_called: false,
                low_water: config.low_water,
                high_water: config.high_water,
                write_paused: false,
            }),
            extra,
            watch_for_peer_close,
            wake: Notify::new(),
        });

        let driven = transport.clone();
        tokio::task::spawn_local(async move {
            let handle: Rc<dyn AbstractTransport> = driven.clone();
            driven.protocol.borrow_mut().connection_made(handle);
            driven.run().await;
        });

        Ok(transport)
    }

    async fn run(self: Rc<Self>) {
        loop {
            let (want_write, should_stop) = {
                let inner = self.inner.borrow();
                (
                    !inner.write_buffer.is_empty(),
                    inner.aborted || (inner.closing && inner.write_buffer.is_empty()),
                )
            };
            if should_stop {
                break;
            }

            tokio::select! {
                result = self.fd.readable(), if self.watch_for_peer_close => {
                    match result {
                        Ok(guard) => {
                            guard.clear_ready();
                            self.peer_closed();
                            break;
                        }
                        Err(error) => { self.finish(Some(error.into())); return; }
                    }
                }
                result = self.fd.writable(), if want_write => {
                    match result {
                        Ok(mut guard) => match guard.try_io(|fd| self.flush_ready(fd.get_ref())) {
                            Ok(Ok(())) => self.maybe_resume_writing(),
                            Ok(Err(error)) => { self.finish(Some(error.into())); return; }
                            Err(_would_block) => {}
                        },
                        Err(error) => { self.finish(Some(error.into())); return; }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
        self.finish(None);
    }

    fn flush_ready(&self, mut sock: &File) -> io::Result<()> {
        loop {
            let front = { self.inner.borrow().write_buffer.front().cloned() };
            let Some(front) = front else { return Ok(()) };
            let written = sock.write(&front)?;
            let mut inner = self.inner.borrow_mut();
            match inner.write_buffer.front_mut() {
                Some(buf) if written >= buf.len() => {
                    inner.write_buffer.pop_front();
                }
                Some(buf) => {
                    *buf = buf.slice(written..);
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Peer closed its read end. A non-empty write buffer means bytes were lost in
    /// flight: that surfaces as a broken-pipe error rather than a clean close.
    fn peer_closed(&self) {
        let had_buffered = !self.inner.borrow().write_buffer.is_empty();
        self.inner.borrow_mut().aborted = true;
        if had_buffered {
            self.finish(Some(io::Error::from(io::ErrorKind::BrokenPipe).into()));
        } else {
            self.finish(None);
        }
    }

    fn maybe_pause_writing(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.write_paused && inner.buffered() > inner.high_water {
            inner.write_paused = true;
            drop(inner);
            self.protocol.borrow_mut().pause_writing();
        }
    }

    fn maybe_resume_writing(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.write_paused && inner.buffered() <= inner.low_water {
            inner.write_paused = false;
            drop(inner);
            self.protocol.borrow_mut().resume_writing();
        }
    }

    fn finish(&self, error: Option<anyhow::Error>) {
        let mut inner = self.inner.borrow_mut();
        if inner.connection_lost_called {
            return;
        }
        inner.connection_lost_called = true;
        inner.aborted = true;
        drop(inner);
        self.protocol.borrow_mut().connection_lost(error);
    }
}

impl AbstractTransport for UnixWritePipeTransport {
    fn get_extra_info(&self) -> &ExtraInfo {
        &self.extra
    }

    fn is_closing(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closing || inner.aborted
    }

    fn close(&self) {
        self.inner.borrow_mut().closing = true;
        self.wake.notify_one();
    }

    fn abort(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.aborted = true;
        inner.write_buffer.clear();
        drop(inner);
        self.wake.notify_one();
    }

    fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.aborted || inner.closing {
            return;
        }
        if !inner.write_buffer.is_empty() {
            inner.write_buffer.push_back(data);
            drop(inner);
            self.maybe_pause_writing();
            self.wake.notify_one();
            return;
        }
        drop(inner);

        let mut sock = self.fd.get_ref();
        match sock.write(&data) {
            Ok(n) if n >= data.len() => {}
            Ok(n) => self.inner.borrow_mut().write_buffer.push_back(data.slice(n..)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                self.inner.borrow_mut().write_buffer.push_back(data);
            }
            Err(_) => self.inner.borrow_mut().aborted = true,
        }
        self.maybe_pause_writing();
    }

    /// Pipes have no half-close, so "writing EOF" just means closing the fd once the
    /// buffer drains.
    fn write_eof(&self) {
        self.close();
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn get_write_buffer_size(&self) -> usize {
        self.inner.borrow().buffered()
    }

    fn get_write_buffer_limits(&self) -> (usize, usize) {
        let inner = self.inner.borrow();
        (inner.low_water, inner.high_water)
    }

    fn set_write_buffer_limits(&self, low: Option<usize>, high: Option<usize>) {
        if let Ok((low, high)) = crate::config::resolve_water_marks(low, high) {
            let mut inner = self.inner.borrow_mut();
            inner.low_water = low;
            inner.high_water = high;
        }
        self.maybe_pause_writing();
        self.maybe_resume_writing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingProtocol {
        received: Vec<u8>,
        eof_calls: usize,
        lost: bool,
    }

    impl AbstractProtocol for RecordingProtocol {
        fn data_received(&mut self, data: Bytes) {
            self.received.extend_from_slice(&data);
        }
        fn eof_received(&mut self) -> bool {
            self.eof_calls += 1;
            false
        }
        fn connection_lost(&mut self, _exception: Option<anyhow::Error>) {
            self.lost = true;
        }
    }

    fn pipe_files() -> (File, File) {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::FromRawFd;
        unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reads_bytes_and_detects_eof_on_writer_drop() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (read_file, mut write_file) = pipe_files();
                let protocol = Rc::new(RefCell::new(RecordingProtocol::default()));
                let _transport = UnixReadPipeTransport::spawn(read_file, protocol.clone(), Config::default()).unwrap();

                write_file.write_all(b"hi").unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                assert_eq!(protocol.borrow().received, b"hi");

                drop(write_file);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                assert_eq!(protocol.borrow().eof_calls, 1);
                assert!(protocol.borrow().lost);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn detects_peer_close_on_write_side() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (read_file, write_file) = pipe_files();
                let protocol = Rc::new(RefCell::new(RecordingProtocol::default()));
                let _transport =
                    UnixWritePipeTransport::spawn(write_file, protocol.clone(), Config::default()).unwrap();

                drop(read_file);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                assert!(protocol.borrow().lost);
            })
            .await;
    }
}
