use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// How long to wait for pipe readers after the child is gone. A grandchild
// that escaped the process group can hold a pipe open indefinitely.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(5);
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(500);

/// Shared flag that forces a running child to be killed.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    /// A stream went past the capture limit and was cut short.
    pub truncated: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Blocking child-process runner with a hard deadline. The child is started
/// in its own process group so that timeout or cancellation takes down
/// everything it spawned. Termination is forced and nothing is rolled back.
#[derive(Debug, Clone)]
pub struct BoundedCommand {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    capture_limit: Option<usize>,
    timeout: Duration,
}

impl BoundedCommand {
    pub fn new(program: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            capture_limit: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Keep at most `bytes` of each stream; the rest is read and discarded.
    pub fn capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = Some(bytes);
        self
    }

    /// Runs to completion, deadline or cancellation. Spawn failures are
    /// returned as I/O errors so callers can tell a missing program from a
    /// permission problem.
    pub fn run(&self, cancel: &CancelHandle) -> io::Result<ProcessOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let started = Instant::now();
        let mut child = command.spawn()?;
        debug!(pid = child.id(), program = ?self.program, "Spawned child process");

        if let (Some(input), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                // The child may exit without reading; a broken pipe is fine
                let _ = pipe.write_all(&input);
            });
        }

        let stdout_rx = drain(child.stdout.take(), self.capture_limit);
        let stderr_rx = drain(child.stderr.take(), self.capture_limit);

        let deadline = started + self.timeout;
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break ProcessExit::Exited(status.code()),
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child);
                    return Err(e);
                }
            }

            if cancel.is_cancelled() {
                warn!(pid = child.id(), "Cancellation requested, killing child process");
                terminate(&mut child);
                break ProcessExit::Cancelled;
            }

            if Instant::now() >= deadline {
                warn!(pid = child.id(), timeout_secs = self.timeout.as_secs(), "Child process timed out");
                terminate(&mut child);
                break ProcessExit::TimedOut;
            }

            thread::sleep(POLL_INTERVAL);
        };

        let grace = match exit {
            ProcessExit::Exited(_) => DRAIN_AFTER_EXIT,
            _ => DRAIN_AFTER_KILL,
        };

        let stdout = stdout_rx.recv_timeout(grace).unwrap_or_default();
        let stderr = stderr_rx.recv_timeout(grace).unwrap_or_default();
        if stdout.truncated || stderr.truncated {
            debug!(limit = ?self.capture_limit, "Child output exceeded the capture limit");
        }

        Ok(ProcessOutput {
            exit,
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            truncated: stdout.truncated || stderr.truncated,
            elapsed: started.elapsed(),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>, limit: Option<usize>) -> mpsc::Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut captured = Captured::default();
            match limit {
                Some(limit) => {
                    let _ = (&mut pipe).take(limit as u64).read_to_end(&mut captured.bytes);
                    // Keep the pipe empty so the child never blocks on a full buffer
                    if let Ok(discarded) = io::copy(&mut pipe, &mut io::sink()) {
                        captured.truncated = discarded > 0;
                    }
                }
                None => {
                    let _ = pipe.read_to_end(&mut captured.bytes);
                }
            }
            let _ = tx.send(captured);
        });
    }
    rx
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own group (process_group(0)), so its pid is the pgid
        let pgid = child.id() as libc::pid_t;
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }

    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &child.id().to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}
