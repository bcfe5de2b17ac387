//! Child reaping for the agent.
//!
//! The agent sets itself as child subreaper, so container processes created
//! detached by the runtime re-parent to it on exit. One dedicated thread
//! owns every `waitpid`: statuses for registered pids resolve their waiters,
//! stray descendants are reaped and logged. Nothing else in the process may
//! call `waitpid`.

use std::collections::HashMap;
use std::sync::OnceLock;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::oneshot;

struct ReaperState {
    /// Exit codes reaped before anyone registered interest.
    pending: HashMap<i32, i32>,
    waiters: HashMap<i32, oneshot::Sender<i32>>,
}

/// Serializes all child waiting through one thread.
pub struct Reaper {
    state: Mutex<ReaperState>,
}

static REAPER: OnceLock<Reaper> = OnceLock::new();

impl Reaper {
    pub fn global() -> &'static Reaper {
        REAPER.get_or_init(|| Reaper {
            state: Mutex::new(ReaperState {
                pending: HashMap::new(),
                waiters: HashMap::new(),
            }),
        })
    }

    /// Start the wait loop. Call once at agent startup, after becoming a
    /// subreaper and before spawning any children.
    pub fn start(&'static self) {
        std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || self.run())
            .expect("spawn reaper thread");
    }

    fn run(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => self.dispatch(pid.as_raw(), code),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.dispatch(pid.as_raw(), 128 + signal as i32)
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    // No children right now; poll again shortly.
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    tracing::error!(error = %e, "waitpid failed in reaper loop");
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
        }
    }

    /// Route one reaped status to its waiter, or buffer it.
    pub fn dispatch(&self, pid: i32, exit_code: i32) {
        let waiter = {
            let mut state = self.state.lock();
            match state.waiters.remove(&pid) {
                Some(tx) => Some(tx),
                None => {
                    state.pending.insert(pid, exit_code);
                    None
                }
            }
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(exit_code);
            }
            None => {
                tracing::debug!(pid, exit_code, "reaped child with no waiter yet");
            }
        }
    }

    /// Register interest in a pid's exit. Must be called by whoever spawned
    /// (or adopted) the pid; a status reaped before registration is
    /// delivered immediately.
    pub fn wait(&self, pid: i32) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if let Some(code) = state.pending.remove(&pid) {
            let _ = tx.send(code);
        } else {
            state.waiters.insert(pid, tx);
        }
        rx
    }
}

/// Run a command to completion through the reaper, capturing stdout.
///
/// Anything in this process that spawns a child must wait for it this way;
/// calling `wait` on the child directly races the reaper thread.
pub async fn run_reaped(mut cmd: std::process::Command) -> gcs_shared::GcsResult<(i32, String)> {
    use gcs_shared::GcsError;
    use std::io::Read;

    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());
    let mut child = cmd
        .spawn()
        .map_err(|e| GcsError::io(format!("spawn {:?}", cmd.get_program()), e))?;
    let status_rx = Reaper::global().wait(child.id() as i32);

    let stdout = match child.stdout.take() {
        Some(mut out) => tokio::task::spawn_blocking(move || {
            let mut buf = String::new();
            let _ = out.read_to_string(&mut buf);
            buf
        })
        .await
        .map_err(|e| GcsError::Unexpected(format!("stdout reader task: {}", e)))?,
        None => String::new(),
    };
    let status = status_rx
        .await
        .map_err(|_| GcsError::Unexpected("reaper dropped child exit".to_string()))?;
    Ok((status, stdout))
}

/// Convert a raw wait status (as returned by the kernel) into the exit code
/// convention the host expects: the code itself, or 128 + signal.
pub fn exit_code_from_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_reaper() -> Reaper {
        Reaper {
            state: Mutex::new(ReaperState {
                pending: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    #[tokio::test]
    async fn test_wait_then_dispatch() {
        let reaper = new_reaper();
        let rx = reaper.wait(1234);
        reaper.dispatch(1234, 7);
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dispatch_before_wait_is_buffered() {
        let reaper = new_reaper();
        reaper.dispatch(99, 137);
        let rx = reaper.wait(99);
        assert_eq!(rx.await.unwrap(), 137);
    }

    #[tokio::test]
    async fn test_waiters_are_per_pid() {
        let reaper = new_reaper();
        let rx_a = reaper.wait(1);
        let rx_b = reaper.wait(2);
        reaper.dispatch(2, 0);
        reaper.dispatch(1, 1);
        assert_eq!(rx_a.await.unwrap(), 1);
        assert_eq!(rx_b.await.unwrap(), 0);
    }

    #[test]
    fn test_exit_code_from_status() {
        // Exited with code 3: status 0x0300.
        assert_eq!(exit_code_from_status(0x0300), 3);
        // Killed by SIGKILL (9): status 0x0009.
        assert_eq!(exit_code_from_status(9), 137);
    }
}
