//! Subprocess plumbing (§5): spawns a child with piped stdin/stdout/stderr, wiring each
//! pipe fd through the same `UnixReadPipeTransport`/`UnixWritePipeTransport` machinery
//! used for any other pipe, rather than going through `tokio::process`'s own reactor
//! integration — this crate already owns a pipe-readiness driver, so a second one would
//! just double-register the same fds.

pub mod protocols;
pub mod writer;

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::{Command, Stdio};
use std::rc::Rc;

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::Notify;

use crate::config::Config;
use crate::error::IoCoreError;
use crate::transport::unix_pipe::{UnixReadPipeTransport, UnixWritePipeTransport};

pub use protocols::{SubprocessDrain, SubprocessReadPipeProtocol, SubprocessWriteProtocol};
pub use writer::SubprocessWriter;

/// A spawned child process with its three standard pipes wired into the cooperative
/// runtime. Exit status is observed via a blocking-pool `wait()`, since `waitpid` has no
/// non-blocking readiness notification of its own on this fd-free syscall surface.
pub struct AsyncSubprocess {
    pid: u32,
    argv: Vec<String>,
    pub stdin: RefCell<Option<SubprocessWriter>>,
    stdout_protocol: Rc<RefCell<SubprocessReadPipeProtocol>>,
    stderr_protocol: Rc<RefCell<SubprocessReadPipeProtocol>>,
    exit_status: RefCell<Option<std::process::ExitStatus>>,
    exit_notify: Notify,
}

impl AsyncSubprocess {
    /// Spawns `command` with piped stdio and starts driving its pipes. `command`'s own
    /// stdin/stdout/stderr settings are overwritten with `Stdio::piped()`.
    pub fn spawn(mut command: Command) -> io::Result<Rc<AsyncSubprocess>> {
        let argv = std::iter::once(command.get_program().to_string_lossy().into_owned())
            .chain(command.get_args().map(|arg| arg.to_string_lossy().into_owned()))
            .collect();

        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let pid = child.id();

        let stdin_file = child.stdin.take().map(|pipe| unsafe { File::from_raw_fd(pipe.into_raw_fd()) });
        let stdout_file = unsafe { File::from_raw_fd(child.stdout.take().expect("piped stdout").into_raw_fd()) };
        let stderr_file = unsafe { File::from_raw_fd(child.stderr.take().expect("piped stderr").into_raw_fd()) };

        let config = Config::default();

        let stdin = match stdin_file {
            Some(file) => {
                let write_protocol = Rc::new(RefCell::new(SubprocessWriteProtocol::default()));
                let transport = UnixWritePipeTransport::spawn(file, write_protocol.clone(), config.clone())?;
                Some(SubprocessWriter::new(write_protocol, transport))
            }
            None => None,
        };

        let stdout_protocol = Rc::new(RefCell::new(SubprocessReadPipeProtocol::new(config.read_pause_threshold)));
        UnixReadPipeTransport::spawn(stdout_file, stdout_protocol.clone(), config.clone())?;

        let stderr_protocol = Rc::new(RefCell::new(SubprocessReadPipeProtocol::new(config.read_pause_threshold)));
        UnixReadPipeTransport::spawn(stderr_file, stderr_protocol.clone(), config.clone())?;

        let subprocess = Rc::new(AsyncSubprocess {
            pid,
            argv,
            stdin: RefCell::new(stdin),
            stdout_protocol,
            stderr_protocol,
            exit_status: RefCell::new(None),
            exit_notify: Notify::new(),
        });

        let watched = subprocess.clone();
        tokio::task::spawn_local(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            if let Ok(Ok(status)) = status {
                *watched.exit_status.borrow_mut() = Some(status);
            }
            watched.exit_notify.notify_waiters();
        });

        Ok(subprocess)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn send_signal(&self, signal: Signal) -> nix::Result<()> {
        signal::kill(Pid::from_raw(self.pid as i32), signal)
    }

    pub fn terminate(&self) -> nix::Result<()> {
        self.send_signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> nix::Result<()> {
        self.send_signal(Signal::SIGKILL)
    }

    pub fn exit_status(&self) -> Option<std::process::ExitStatus> {
        *self.exit_status.borrow()
    }

    pub async fn wait(&self) -> std::process::ExitStatus {
        loop {
            if let Some(status) = *self.exit_status.borrow() {
                return status;
            }
            self.exit_notify.notified().await;
        }
    }

    /// Waits for exit, failing with `IoCoreError::SubprocessTimeout` (carrying `argv` for
    /// the caller's diagnostics) if `timeout` elapses first.
    pub async fn wait_with_timeout(
        &self,
        argv: Vec<String>,
        timeout: std::time::Duration,
    ) -> Result<std::process::ExitStatus, IoCoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| IoCoreError::SubprocessTimeout { argv })
    }

    pub fn stdout_read(&self) -> Result<crate::payload_stream::PayloadStream, crate::error::StreamStateError> {
        self.stdout_protocol.borrow_mut().read.read()
    }

    pub fn stderr_read(&self) -> Result<crate::payload_stream::PayloadStream, crate::error::StreamStateError> {
        self.stderr_protocol.borrow_mut().read.read()
    }

    /// Writes `input` to stdin (if open) and half-closes it, drains stdout and stderr to
    /// completion, all three running concurrently rather than sequentially — a child that
    /// fills its stderr pipe while stdin is still being fed, or before stdout is read,
    /// must not deadlock against this call. If `timeout` elapses first, all three helpers
    /// are dropped (abandoning them, same as cancelling an awaited payload stream or
    /// drain-waiter) and `IoCoreError::SubprocessTimeout` carries this child's argv. The
    /// one-shot convenience entry point analogous to `subprocess.Popen.communicate`.
    pub async fn communicate(
        &self,
        input: Option<Bytes>,
        timeout: Option<std::time::Duration>,
    ) -> Result<(Bytes, Bytes), IoCoreError> {
        let stdin = self.stdin.borrow_mut().take();

        let feed_stdin = async {
            if let Some(stdin) = stdin {
                if let Some(data) = input {
                    stdin.write(data);
                }
                stdin.write_eof();
                let _ = stdin.drain().await;
            }
        };
        let drain_stdout = async { self.stdout_read()?.await_whole().await.map_err(IoCoreError::from) };
        let drain_stderr = async { self.stderr_read()?.await_whole().await.map_err(IoCoreError::from) };

        let communicate = async {
            let (_, stdout, stderr) = tokio::join!(feed_stdin, drain_stdout, drain_stderr);
            Ok::<_, IoCoreError>((stdout?, stderr?))
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, communicate)
                .await
                .map_err(|_| IoCoreError::SubprocessTimeout { argv: self.argv.clone() })?,
            None => communicate.await,
        }
    }
}
