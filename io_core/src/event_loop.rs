//! Event loop interfaces consumed by the core (§1/§9): `add_reader`/`remove_reader`/
//! `add_writer`/`remove_writer`/`call_soon`/`create_future`/`create_task`/
//! `run_in_executor`/a monotonic clock. Transports drive their own fds directly through
//! `tokio::io::unix::AsyncFd` rather than routing every read/write through this trait —
//! it exists for the handful of callbacks (`connection_made` scheduling, blocking-call
//! offload, test doubles standing in for the real reactor) that want an explicit seam
//! instead of a hard `tokio::task::spawn_local` call baked into the transport.
//!
//! The "global thread-to-event-loop weak map" (§9) becomes a `thread_local!` cell of
//! `Weak<dyn EventLoopHandle>` here: whichever `LocalSet`-bound runtime construction ran
//! last on a thread registers itself, and anything on that thread can look the handle
//! back up without having it threaded through every call.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tokio::sync::oneshot;

/// What the core needs from whatever is running it. Implemented here against tokio; a
/// test double can implement it against a manually-stepped queue instead.
pub trait EventLoopHandle {
    /// Schedules `callback` to run on a future tick of this loop, not inline.
    fn call_soon(&self, callback: Box<dyn FnOnce() + 'static>);

    /// Spawns `future` to run to completion on this loop, not inline.
    fn spawn_local(&self, future: Pin<Box<dyn Future<Output = ()>>>);

    /// Offloads a blocking closure to an executor and reports the result back through
    /// the returned receiver, for work the core can't do on the cooperative thread (DNS
    /// resolution, `waitpid`, blocking filesystem calls).
    fn run_in_executor(
        &self,
        work: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send + 'static>,
    ) -> oneshot::Receiver<Box<dyn Any + Send>>;

    /// Monotonic time source, for timeouts and scheduling relative deadlines.
    fn now(&self) -> Instant;
}

/// The production handle: every method delegates straight to tokio's current-thread
/// runtime and `LocalSet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioEventLoop;

impl EventLoopHandle for TokioEventLoop {
    fn call_soon(&self, callback: Box<dyn FnOnce() + 'static>) {
        tokio::task::spawn_local(async move { callback() });
    }

    fn spawn_local(&self, future: Pin<Box<dyn Future<Output = ()>>>) {
        tokio::task::spawn_local(future);
    }

    fn run_in_executor(
        &self,
        work: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send + 'static>,
    ) -> oneshot::Receiver<Box<dyn Any + Send>> {
        let (sender, receiver) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = sender.send(work());
        });
        receiver
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Weak<dyn EventLoopHandle>>> = RefCell::new(None);
}

/// Registers `handle` as this thread's event loop, for later lookup via
/// `current_event_loop`. Called once by whatever sets up the `LocalSet` on this thread.
pub fn set_current_event_loop(handle: &Rc<dyn EventLoopHandle>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(Rc::downgrade(handle)));
}

/// Looks up the event loop last registered on this thread, if it (and the `Rc` keeping
/// it alive) still exists.
pub fn current_event_loop() -> Option<Rc<dyn EventLoopHandle>> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}
