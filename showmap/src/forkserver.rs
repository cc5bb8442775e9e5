//! Harness side of the AFL fork server handshake.
//!
//! The target is started with the read end of the control pipe on [`FORKSRV_FD`] and the
//! write end of the status pipe on `FORKSRV_FD + 1`. Its instrumentation forks off the actual
//! workload once it sees our "go" token and answers with a hello, the pid of the workload and
//! finally the wait status of the workload. Every message is [`HANDSHAKE_TOKEN_LEN`] bytes.

use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use log::debug;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::fcntl::OFlag;
use nix::unistd::{dup2, execvp, fork, pipe2, ForkResult, Pid};

use crate::config::{FORKSRV_FD, HANDSHAKE_TOKEN_LEN};
use crate::error::Error;

/// How the workload of a single run ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    /// Neither exited nor killed, e.g. a stopped process
    Other,
}

impl ExitOutcome {
    /// Decodes a POSIX wait status.
    pub fn from_wait_status(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            ExitOutcome::Signaled(libc::WTERMSIG(status))
        } else if libc::WIFEXITED(status) {
            ExitOutcome::Exited(libc::WEXITSTATUS(status))
        } else {
            ExitOutcome::Other
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitOutcome::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with code {}", code),
            ExitOutcome::Signaled(signal) => match Signal::try_from(*signal) {
                Ok(name) => write!(f, "killed by signal {} ({})", signal, name),
                Err(_) => write!(f, "killed by signal {}", signal),
            },
            ExitOutcome::Other => write!(f, "ended with an unknown status"),
        }
    }
}

/// What the fork server reported about the single run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutionResult {
    pub child_pid: Pid,
    /// Raw wait status as sent by the fork server
    pub status: i32,
    pub outcome: ExitOutcome,
}

impl ExecutionResult {
    pub fn new(child_pid: Pid, status: i32) -> Self {
        Self {
            child_pid,
            status,
            outcome: ExitOutcome::from_wait_status(status),
        }
    }
}

/// Starts an instrumented program and lets its fork server execute it exactly once.
///
/// There is no deadline: a target that never answers blocks [`ForkServerClient::run`].
#[derive(Debug, Clone, Default)]
pub struct ForkServerClient {
    sink_output: bool,
}

impl ForkServerClient {
    pub fn new(sink_output: bool) -> Self {
        Self { sink_output }
    }

    pub fn run(&self, program: &OsStr, args: &[OsString]) -> Result<ExecutionResult, Error> {
        let argv = build_argv(program, args)?;

        let sink = if self.sink_output {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/dev/null")
                    .map_err(|err| Error::IO(format!("cannot open /dev/null: {err}")))?,
            )
        } else {
            None
        };

        let [ctl_read, ctl_write, st_read, st_write] = handshake_pipes()?;

        // Nothing between fork and exec may allocate
        let exec_failure = format!("Unable to execute '{}': ", program.to_string_lossy());

        // Anything still buffered would otherwise be written twice
        io::stdout().flush()?;
        io::stderr().flush()?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                exec_target(&argv, &exec_failure, sink, [ctl_read, ctl_write, st_read, st_write]);
            }
            Ok(ForkResult::Parent { child }) => {
                drop(ctl_read);
                drop(st_write);
                drop(sink);

                debug!("Started fork server {}", child);

                let mut server = ForkServer {
                    pid: child,
                    control: File::from(ctl_write),
                    status: File::from(st_read),
                };
                server.handshake()
            }
            Err(err) => Err(Error::IO(format!("fork() failed: {err}"))),
        }
    }
}

/// Control and status pipe as `[ctl_read, ctl_write, st_read, st_write]`.
///
/// Close-on-exec, so no other child ever inherits them. `dup2` clears the flag again on the
/// descriptors the target gets.
fn handshake_pipes() -> Result<[OwnedFd; 4], Error> {
    let (ctl_read, ctl_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (st_read, st_write) = pipe2(OFlag::O_CLOEXEC)?;
    Ok([ctl_read, ctl_write, st_read, st_write])
}

fn build_argv(program: &OsStr, args: &[OsString]) -> Result<Vec<CString>, Error> {
    std::iter::once(program)
        .chain(args.iter().map(OsString::as_os_str))
        .map(|arg| {
            CString::new(arg.as_bytes()).map_err(|_| {
                Error::Config(format!("argument {:?} contains a nul byte", arg))
            })
        })
        .collect()
}

/// Runs in the forked child. Never returns and never runs destructors of the parent's state.
///
/// Only async-signal-safe calls: other threads of the harness may hold locks at fork time.
fn exec_target(
    argv: &[CString],
    exec_failure: &str,
    sink: Option<File>,
    pipes: [OwnedFd; 4],
) -> ! {
    if let Some(sink) = sink {
        let fd = sink.as_raw_fd();
        if dup2(fd, libc::STDOUT_FILENO).is_err() || dup2(fd, libc::STDERR_FILENO).is_err() {
            child_fatal(&[b"dup2() failed\n".as_slice()]);
        }
    }

    let [ctl_read, ctl_write, st_read, st_write] = pipes;

    if dup2(ctl_read.as_raw_fd(), FORKSRV_FD).is_err()
        || dup2(st_write.as_raw_fd(), FORKSRV_FD + 1).is_err()
    {
        child_fatal(&[b"dup2() failed\n".as_slice()]);
    }

    drop(ctl_read);
    drop(ctl_write);
    drop(st_read);
    drop(st_write);

    // The harness ignores SIGPIPE, the target should not inherit that
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }

    let err = match execvp(&argv[0], argv) {
        Err(err) => err,
        Ok(never) => match never {},
    };

    child_fatal(&[exec_failure.as_bytes(), err.desc().as_bytes(), b"\n".as_slice()]);
}

fn child_fatal(message: &[&[u8]]) -> ! {
    for part in message {
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    unsafe { libc::_exit(1) }
}

/// The running fork server. Killed and reaped when dropped.
struct ForkServer {
    pid: Pid,
    control: File,
    status: File,
}

impl ForkServer {
    fn handshake(&mut self) -> Result<ExecutionResult, Error> {
        // The fork server either exited or never installed its loop if this fails
        self.control
            .write_all(&[0u8; HANDSHAKE_TOKEN_LEN])
            .map_err(|err| Error::Protocol(format!("failed to wake up the fork server: {err}")))?;

        self.read_token("hello")?;

        let child_pid = i32::from_ne_bytes(self.read_token("child pid")?);
        if child_pid <= 0 {
            return Err(Error::Protocol(format!(
                "fork server reported invalid pid {child_pid}"
            )));
        }
        debug!("Fork server {} started child {}", self.pid, child_pid);

        let status = i32::from_ne_bytes(self.read_token("exit status")?);

        Ok(ExecutionResult::new(Pid::from_raw(child_pid), status))
    }

    fn read_token(&mut self, what: &str) -> Result<[u8; HANDSHAKE_TOKEN_LEN], Error> {
        let mut token = [0u8; HANDSHAKE_TOKEN_LEN];
        self.status
            .read_exact(&mut token)
            .map_err(|err| Error::Protocol(format!("failed to read {what}: {err}")))?;
        Ok(token)
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        // It would die on the next read of the control pipe anyway, don't leave a zombie
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn decodes_wait_status() {
        assert_eq!(ExitOutcome::from_wait_status(0), ExitOutcome::Exited(0));
        assert_eq!(ExitOutcome::from_wait_status(3 << 8), ExitOutcome::Exited(3));
        assert_eq!(ExitOutcome::from_wait_status(11), ExitOutcome::Signaled(11));
        assert_eq!(ExitOutcome::from_wait_status(11).signal(), Some(11));
        assert_eq!(ExitOutcome::from_wait_status(0).signal(), None);
        // stopped by SIGSTOP
        assert_eq!(ExitOutcome::from_wait_status(0x137f), ExitOutcome::Other);
    }

    #[test_log::test]
    fn names_known_signals() {
        assert_eq!(
            ExitOutcome::Signaled(11).to_string(),
            "killed by signal 11 (SIGSEGV)"
        );
        assert_eq!(ExitOutcome::Exited(2).to_string(), "exited with code 2");
    }

    #[test_log::test]
    fn handshake_pipes_are_not_inherited_by_other_children() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        for fd in handshake_pipes().unwrap() {
            let flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test_log::test]
    fn uninstrumented_program_fails_handshake() {
        let result = ForkServerClient::new(true).run(OsStr::new("true"), &[]);
        assert!(matches!(result, Err(Error::Protocol(_))), "{result:?}");
    }

    #[test_log::test]
    fn missing_program_fails_handshake() {
        let result = ForkServerClient::new(true).run(OsStr::new("/nonexistent/showmap-target"), &[]);
        assert!(matches!(result, Err(Error::Protocol(_))), "{result:?}");
    }

    #[test_log::test]
    fn rejects_arguments_with_nul_bytes() {
        let args = [OsString::from("a\0b")];
        let result = ForkServerClient::default().run(OsStr::new("true"), &args);
        assert!(matches!(result, Err(Error::Config(_))), "{result:?}");
    }
}
