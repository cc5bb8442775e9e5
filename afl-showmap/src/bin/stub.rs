//! Stand-in for an AFL-instrumented program.
//!
//! It attaches the coverage map published by the harness, runs the target side of the fork
//! server handshake on the well-known descriptors and records the tuples given on the command
//! line. Every argument is one directive:
//!
//! - `<index>:<count>` records `count` hits of tuple `index`
//! - `signal=<n>` kills the workload with signal `n` after recording
//! - `exit=<n>` exits the workload with code `n`
//! - `no-forkserver` behaves like an uninstrumented program
//! - `bogus-pid` reports pid 0 for the workload
//! - `messages=<n>` hangs up after sending `n` status messages
//! - `hang=<secs>` keeps the workload alive for `secs` seconds after recording

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::FromRawFd;
use std::process::ExitCode;
use std::time::Duration;
use std::{env, ptr, slice, thread};

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{raise, signal, SigHandler, Signal};
use nix::unistd::{fork, ForkResult};
use showmap::config::{FORKSRV_FD, HANDSHAKE_TOKEN_LEN, MAP_SIZE, MAP_SIZE_ENV_VAR, SHM_ENV_VAR};

#[derive(Debug)]
struct Plan {
    hits: Vec<(usize, u8)>,
    signal: Option<Signal>,
    exit_code: u8,
    forkserver: bool,
    bogus_pid: bool,
    messages: usize,
    hang: Option<Duration>,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            hits: Vec::new(),
            signal: None,
            exit_code: 0,
            forkserver: true,
            bogus_pid: false,
            messages: 3,
            hang: None,
        }
    }
}

impl Plan {
    fn parse<I: Iterator<Item = String>>(args: I) -> Result<Self, String> {
        let mut plan = Plan::default();

        for arg in args {
            if let Some(signal) = arg.strip_prefix("signal=") {
                let signal = signal.parse::<i32>().map_err(|err| err.to_string())?;
                plan.signal = Some(Signal::try_from(signal).map_err(|err| err.to_string())?);
            } else if let Some(code) = arg.strip_prefix("exit=") {
                plan.exit_code = code.parse().map_err(|_| format!("invalid exit code {code}"))?;
            } else if let Some(messages) = arg.strip_prefix("messages=") {
                plan.messages = messages
                    .parse()
                    .map_err(|_| format!("invalid message count {messages}"))?;
            } else if let Some(secs) = arg.strip_prefix("hang=") {
                let secs = secs.parse().map_err(|_| format!("invalid duration {secs}"))?;
                plan.hang = Some(Duration::from_secs(secs));
            } else if arg == "no-forkserver" {
                plan.forkserver = false;
            } else if arg == "bogus-pid" {
                plan.bogus_pid = true;
            } else if let Some((index, count)) = arg.split_once(':') {
                let index = index.parse().map_err(|_| format!("invalid index {index}"))?;
                let count = count.parse().map_err(|_| format!("invalid count {count}"))?;
                plan.hits.push((index, count));
            } else {
                return Err(format!("unknown directive {arg:?}"));
            }
        }

        Ok(plan)
    }
}

/// Write end of the status pipe which goes silent after a fixed number of messages.
struct StatusPipe {
    file: File,
    remaining: usize,
}

impl StatusPipe {
    fn send(&mut self, token: [u8; HANDSHAKE_TOKEN_LEN]) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.file.write_all(&token).is_ok()
    }
}

/// Returns `None` in the forked workload and the exit code of the fork server otherwise.
fn serve(plan: &Plan) -> Option<ExitCode> {
    // Not started by the harness, run the workload directly
    if fcntl(FORKSRV_FD, FcntlArg::F_GETFD).is_err()
        || fcntl(FORKSRV_FD + 1, FcntlArg::F_GETFD).is_err()
    {
        return None;
    }

    let mut control = unsafe { File::from_raw_fd(FORKSRV_FD) };
    let mut status = StatusPipe {
        file: unsafe { File::from_raw_fd(FORKSRV_FD + 1) },
        remaining: plan.messages,
    };

    if !status.send([0u8; HANDSHAKE_TOKEN_LEN]) {
        return Some(ExitCode::SUCCESS);
    }

    loop {
        let mut go = [0u8; HANDSHAKE_TOKEN_LEN];
        if control.read_exact(&mut go).is_err() {
            return Some(ExitCode::SUCCESS);
        }

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Closes both descriptors, the workload must not see them
                return None;
            }
            Ok(ForkResult::Parent { child }) => {
                let pid = if plan.bogus_pid { 0 } else { child.as_raw() };
                if !status.send(pid.to_ne_bytes()) {
                    return Some(ExitCode::SUCCESS);
                }

                let mut wait_status = 0;
                if unsafe { libc::waitpid(child.as_raw(), &mut wait_status, 0) } < 0 {
                    return Some(ExitCode::FAILURE);
                }

                if !status.send(wait_status.to_ne_bytes()) {
                    return Some(ExitCode::SUCCESS);
                }
            }
            Err(err) => {
                eprintln!("showmap-stub: fork() failed: {err}");
                return Some(ExitCode::FAILURE);
            }
        }
    }
}

fn attach_map() -> Option<&'static mut [u8]> {
    let shm_id = env::var(SHM_ENV_VAR).ok()?.parse::<i32>().ok()?;
    let size = env::var(MAP_SIZE_ENV_VAR)
        .ok()
        .and_then(|size| size.parse::<usize>().ok())
        .unwrap_or(MAP_SIZE);

    let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
    if addr as isize == -1 {
        return None;
    }

    Some(unsafe { slice::from_raw_parts_mut(addr.cast::<u8>(), size) })
}

fn workload(plan: &Plan) -> ExitCode {
    println!("showmap-stub: workload running");

    match attach_map() {
        Some(map) => {
            for (index, count) in &plan.hits {
                match map.get_mut(*index) {
                    Some(slot) => *slot = *count,
                    None => eprintln!("showmap-stub: tuple {index} is outside the map"),
                }
            }
        }
        None if !plan.hits.is_empty() => eprintln!("showmap-stub: no coverage map attached"),
        None => {}
    }

    let _ = io::stdout().flush();

    if let Some(hang) = plan.hang {
        thread::sleep(hang);
    }

    if let Some(sig) = plan.signal {
        // The runtime may have installed its own handler, e.g. for SIGSEGV
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
        let _ = raise(sig);
    }

    ExitCode::from(plan.exit_code)
}

fn main() -> ExitCode {
    let plan = match Plan::parse(env::args().skip(1)) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("showmap-stub: {err}");
            return ExitCode::from(2);
        }
    };

    if plan.forkserver {
        if let Some(code) = serve(&plan) {
            return code;
        }
    }

    workload(&plan)
}
