//! A single pseudo-terminal and the process attached to it
//!
//! Blocking PTY I/O runs on dedicated threads: one writer per session fed
//! by a bounded queue, one reader per [`PtySession::output`] call, and one
//! thread parked in `wait()` that publishes the child's exit. Async code
//! only ever awaits channels.
//!
//! Readers poll their descriptor with a timeout so they notice `close()` or
//! a dropped [`PtyOutput`] even while a background job keeps the slave side
//! open.

use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use portable_pty::{native_pty_system, ChildKiller, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

use rt_core::SessionError;
use rt_protocol::TerminalSize;

use super::launch::SpawnOptions;

/// Bytes requested per PTY read
const READ_BUFFER_SIZE: usize = 4096;

/// Output chunks buffered between the reader thread and the session task.
///
/// When full, the reader thread blocks, which in turn blocks the child on
/// its next write. Only this session is slowed down.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Input chunks buffered ahead of the writer thread
const INPUT_CHANNEL_CAPACITY: usize = 256;

/// Longest a reader waits for output before checking whether to stop
#[cfg(unix)]
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code, if `wait()` succeeded
    pub code: Option<u32>,
}

/// One pseudo-terminal pair plus the child bound to its slave side
pub struct PtySession {
    /// Process ID of the child (also its process group ID)
    pid: Option<u32>,
    /// Master side; `None` once closed
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Queue into the writer thread; `None` once closed
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Kills the child without needing the `Child` handle
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    /// Set by the wait thread when the child exits
    exit: watch::Receiver<Option<ChildExit>>,
    /// Set by the first `close()`; readers stop once they see it
    closed: Arc<AtomicBool>,
    /// Upper bound on queueing input
    io_timeout: Duration,
}

impl PtySession {
    /// Allocate a PTY and launch the configured command on its slave side
    ///
    /// Local echo is turned off on the master; the remote client renders
    /// its own echo. The child leads a new session and process group.
    pub fn open(options: &SpawnOptions, io_timeout: Duration) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.size.rows,
                cols: options.size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        disable_echo(&*pair.master);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::PtyAllocation(format!("failed to take writer: {}", e)))?;

        let mut child = pair
            .slave
            .spawn_command(options.command())
            .map_err(|e| SessionError::Spawn {
                command: options.describe(),
                reason: e.to_string(),
            })?;

        // Only the child may hold the slave open, or EOF never arrives
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        tracing::info!("Spawned '{}' with PID {:?}", options.describe(), pid);

        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_thread(format!("pty-wait-{}", pid.unwrap_or(0)), move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    tracing::warn!("Failed to wait for PID {:?}: {}", pid, e);
                    None
                }
            };
            tracing::debug!("PID {:?} exited with code {:?}", pid, code);
            let _ = exit_tx.send(Some(ChildExit { code }));
        })?;

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        spawn_thread(format!("pty-write-{}", pid.unwrap_or(0)), move || {
            run_writer(writer, input_rx)
        })?;

        Ok(Self {
            pid,
            master: Mutex::new(Some(pair.master)),
            input: Mutex::new(Some(input_tx)),
            killer: Mutex::new(Some(killer)),
            exit: exit_rx,
            closed: Arc::new(AtomicBool::new(false)),
            io_timeout,
        })
    }

    /// Process ID of the child
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Exit information, once the child has exited
    pub fn exit_status(&self) -> Option<ChildExit> {
        *self.exit.borrow()
    }

    /// Wait for the child to exit
    pub async fn wait_exit(&self) -> Option<ChildExit> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        match result {
            Ok(status) => *status,
            Err(_) => None,
        }
    }

    /// Queue raw bytes for the terminal
    ///
    /// Fails with [`SessionError::Closed`] once the handle is closed, the
    /// child has exited, or the writer hit an I/O error.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.exit_status().is_some() {
            return Err(SessionError::Closed);
        }

        let input = lock(&self.input).clone().ok_or(SessionError::Closed)?;

        input
            .send_timeout(data.to_vec(), self.io_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    SessionError::WriteTimeout(self.io_timeout)
                }
                mpsc::error::SendTimeoutError::Closed(_) => SessionError::Closed,
            })
    }

    /// Set the window size
    ///
    /// Resizing a torn-down terminal is expected during teardown races; it
    /// is logged and otherwise ignored.
    pub fn resize(&self, size: TerminalSize) {
        let master = lock(&self.master);
        let Some(master) = master.as_ref() else {
            tracing::debug!("Ignoring resize of closed terminal (PID {:?})", self.pid);
            return;
        };

        tracing::debug!("Resizing PID {:?} to {}x{}", self.pid, size.cols, size.rows);

        if let Err(e) = master.resize(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            tracing::warn!("Failed to resize PTY for PID {:?}: {}", self.pid, e);
        }
    }

    /// Current window size, as reported by the PTY
    pub fn size(&self) -> Option<TerminalSize> {
        let master = lock(&self.master);
        let size = master.as_ref()?.get_size().ok()?;
        Some(TerminalSize::new(size.cols, size.rows))
    }

    /// Start reading terminal output
    ///
    /// Each call opens an independent reader; the returned stream ends at
    /// EOF, when the terminal is gone (EIO after the child exits), or once
    /// the session is closed. Dropping the stream stops the reader and
    /// releases its descriptor.
    pub fn output(&self) -> Result<PtyOutput, SessionError> {
        let reader = {
            let master = lock(&self.master);
            PtyReader::open(&**master.as_ref().ok_or(SessionError::Closed)?)?
        };

        let pid = self.pid;
        let closed = self.closed.clone();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        spawn_thread(format!("pty-read-{}", pid.unwrap_or(0)), move || {
            run_reader(reader, tx, closed, pid)
        })?;

        Ok(PtyOutput { rx })
    }

    /// Tear the terminal down
    ///
    /// Idempotent: only the first call does anything. Closes the master,
    /// sends SIGHUP and SIGTERM to the child's process group, waits up to
    /// `grace` and then kills whatever is left.
    pub async fn close(&self, grace: Duration) -> Option<ChildExit> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.exit_status();
        }

        lock(&self.input).take();
        lock(&self.master).take();

        if self.exit_status().is_none() {
            self.signal(Signal::Terminate);

            if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
                tracing::warn!(
                    "PID {:?} still running {:?} after hangup, killing",
                    self.pid,
                    grace
                );
                self.signal(Signal::Kill);
                if let Some(mut killer) = lock(&self.killer).take() {
                    if let Err(e) = killer.kill() {
                        tracing::debug!("Kill of PID {:?} failed: {}", self.pid, e);
                    }
                }
                let _ = tokio::time::timeout(grace, self.wait_exit()).await;
            }
        }

        lock(&self.killer).take();
        self.exit_status()
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        // Interactive shells ignore SIGTERM but exit on hangup
        let signals: &[libc::c_int] = match signal {
            Signal::Terminate => &[libc::SIGHUP, libc::SIGTERM],
            Signal::Kill => &[libc::SIGKILL],
        };

        for &signo in signals {
            // The child called setsid(), so its PID is also its process group ID
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), signo) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!("Failed to signal process group {}: {}", pid, err);
                }
                return;
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) {
        if let Some(killer) = lock(&self.killer).as_mut() {
            let _ = killer.kill();
        }
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .field("exit", &self.exit_status())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Stream of output chunks from one reader
#[derive(Debug)]
pub struct PtyOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for PtyOutput {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Private handle on the master side for one reader thread
#[cfg(unix)]
struct PtyReader {
    file: std::fs::File,
}

#[cfg(unix)]
impl PtyReader {
    fn open(master: &(dyn MasterPty + Send)) -> Result<Self, SessionError> {
        use std::os::fd::{FromRawFd, OwnedFd};

        let fd = master
            .as_raw_fd()
            .ok_or_else(|| SessionError::PtyAllocation("PTY master has no descriptor".to_string()))?;

        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(SessionError::PtyAllocation(format!(
                "failed to duplicate PTY master: {}",
                std::io::Error::last_os_error()
            )));
        }

        let owned = unsafe { OwnedFd::from_raw_fd(dup) };
        Ok(Self {
            file: std::fs::File::from(owned),
        })
    }

    /// Wait up to `timeout` for the descriptor to become readable
    ///
    /// Hangup and error conditions count as readable; the following read
    /// reports them.
    fn wait_readable(&self, timeout: Duration) -> std::io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        match unsafe { libc::poll(&mut pollfd, 1, millis) } {
            rc if rc < 0 => Err(std::io::Error::last_os_error()),
            0 => Ok(false),
            _ if pollfd.revents & libc::POLLNVAL != 0 => Err(std::io::Error::from_raw_os_error(libc::EBADF)),
            _ => Ok(true),
        }
    }
}

#[cfg(unix)]
impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(not(unix))]
struct PtyReader {
    inner: Box<dyn Read + Send>,
}

#[cfg(not(unix))]
impl PtyReader {
    fn open(master: &(dyn MasterPty + Send)) -> Result<Self, SessionError> {
        let inner = master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyAllocation(format!("failed to clone reader: {}", e)))?;
        Ok(Self { inner })
    }

    fn wait_readable(&self, _timeout: Duration) -> std::io::Result<bool> {
        Ok(true)
    }
}

#[cfg(not(unix))]
impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

fn run_reader(
    mut reader: PtyReader,
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    pid: Option<u32>,
) {
    #[cfg(unix)]
    let poll_interval = READ_POLL_INTERVAL;
    #[cfg(not(unix))]
    let poll_interval = Duration::ZERO;

    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        if closed.load(Ordering::SeqCst) || tx.is_closed() {
            tracing::debug!("PTY reader for PID {:?} stopping", pid);
            break;
        }

        match reader.wait_readable(poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("PTY poll failed for PID {:?}: {}", pid, e);
                break;
            }
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                tracing::debug!("PTY reader EOF for PID {:?}", pid);
                break;
            }
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    tracing::debug!("PTY output receiver dropped for PID {:?}", pid);
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up terminal
                tracing::debug!("PTY reader closed for PID {:?}: {}", pid, e);
                break;
            }
        }
    }
}

fn run_writer(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
            tracing::warn!("Failed to write to PTY: {}", e);
            break;
        }
    }
}

fn spawn_thread<F>(name: String, f: F) -> Result<(), SessionError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(|e| SessionError::PtyAllocation(format!("failed to start I/O thread: {}", e)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turn off local echo; the remote client renders its own.
#[cfg(unix)]
fn disable_echo(master: &(dyn MasterPty + Send)) {
    let Some(fd) = master.as_raw_fd() else {
        return;
    };

    unsafe {
        let mut attrs: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut attrs) != 0 {
            tracing::warn!(
                "tcgetattr on PTY master failed: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        attrs.c_lflag &= !libc::ECHO;
        if libc::tcsetattr(fd, libc::TCSANOW, &attrs) != 0 {
            tracing::warn!(
                "tcsetattr on PTY master failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn disable_echo(_master: &(dyn MasterPty + Send)) {}
