//! Per-process bookkeeping: exit broadcast, relay lifetime, done signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use gcs_shared::protocol::INFINITE_WAIT_TIMEOUT;
use gcs_shared::{GcsError, GcsResult};

use crate::constants;
use crate::stdio::StdioRelay;

/// What a process is to its container, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The first process; its lifetime is the container's lifetime.
    Init,
    /// A subsequent process inside an existing container.
    Exec,
    /// Runs in the uVM root, outside any container.
    External,
}

/// A process the agent is responsible for: pid, stdio relay, and exit
/// fan-out. The exit code is observed exactly once (by the watcher task that
/// owns the [`watch::Sender`]) and broadcast idempotently to any number of
/// waiters.
#[derive(Debug)]
pub struct ManagedProcess {
    pub pid: u32,
    pub kind: ProcessKind,
    relay: tokio::sync::Mutex<Option<StdioRelay>>,
    exit_rx: watch::Receiver<Option<i32>>,
    done: Notify,
}

impl ManagedProcess {
    /// Returns the process and the exit sender its watcher task resolves.
    pub fn new(
        pid: u32,
        kind: ProcessKind,
        relay: Option<StdioRelay>,
    ) -> (Arc<ManagedProcess>, watch::Sender<Option<i32>>) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let process = Arc::new(ManagedProcess {
            pid,
            kind,
            relay: tokio::sync::Mutex::new(relay),
            exit_rx,
            done: Notify::new(),
        });
        (process, exit_tx)
    }

    /// Wait for the copiers to finish moving bytes. Called by the watcher
    /// before it publishes the exit code, which is what guarantees output
    /// written before exit is delivered before the wait response.
    pub async fn drain_relay(&self) {
        if let Some(relay) = self.relay.lock().await.as_mut() {
            relay.wait().await;
        }
    }

    /// Wait for the exit code with a millisecond timeout.
    /// [`INFINITE_WAIT_TIMEOUT`] disables the timeout; zero checks without
    /// blocking. A timeout does not cancel the underlying wait.
    pub async fn wait_exit(&self, timeout_ms: u32) -> GcsResult<i32> {
        let mut rx = self.exit_rx.clone();
        if timeout_ms == INFINITE_WAIT_TIMEOUT {
            let code = rx
                .wait_for(|v| v.is_some())
                .await
                .map_err(|_| GcsError::Unexpected("exit watcher dropped".to_string()))?;
            return Ok(code.expect("guarded by wait_for"));
        }
        if timeout_ms == 0 {
            return match *rx.borrow() {
                Some(code) => Ok(code),
                None => Err(GcsError::Timeout),
            };
        }
        let result = match tokio::time::timeout(
            Duration::from_millis(u64::from(timeout_ms)),
            rx.wait_for(|v| v.is_some()),
        )
        .await
        {
            Ok(Ok(code)) => Ok(code.expect("guarded by wait_for")),
            Ok(Err(_)) => Err(GcsError::Unexpected("exit watcher dropped".to_string())),
            Err(_) => Err(GcsError::Timeout),
        };
        result
    }

    /// The exit code, if the process has already exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Host acknowledgement that stdio has been drained; releases the relay.
    /// The permit is stored, so signalling before the release task starts
    /// waiting still unblocks it.
    pub fn signal_done(&self) {
        self.done.notify_one();
    }

    /// Hold the relay open until the host signals done or the bounded
    /// timeout passes, then close it. Runs once, from the watcher task.
    pub async fn release_relay_after_done(&self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(constants::STDIO_DONE_TIMEOUT_SECS),
            self.done.notified(),
        )
        .await;
        // Dropping the relay closes its remaining descriptors; closure is
        // idempotent because the slot empties.
        self.relay.lock().await.take();
    }

    /// Resize the process's terminal; errors without one.
    pub async fn resize_console(&self, rows: u16, cols: u16) -> GcsResult<()> {
        match self.relay.lock().await.as_ref() {
            Some(relay) => relay.resize(rows, cols),
            None => Err(GcsError::InvalidArgument(
                "process has no terminal".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_process() -> (Arc<ManagedProcess>, watch::Sender<Option<i32>>) {
        ManagedProcess::new(100, ProcessKind::Exec, None)
    }

    #[tokio::test]
    async fn test_exit_broadcast_to_many_waiters() {
        let (p, tx) = bare_process();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.wait_exit(INFINITE_WAIT_TIMEOUT).await })
            })
            .collect();
        tx.send(Some(42)).unwrap();
        for w in waiters {
            assert_eq!(w.await.unwrap().unwrap(), 42);
        }
        // Late waiters see the same code.
        assert_eq!(p.wait_exit(INFINITE_WAIT_TIMEOUT).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_blocks() {
        let (p, tx) = bare_process();
        assert!(matches!(p.wait_exit(0).await, Err(GcsError::Timeout)));
        tx.send(Some(0)).unwrap();
        assert_eq!(p.wait_exit(0).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_timeout_expires() {
        let (p, _tx) = bare_process();
        let err = p.wait_exit(1000).await.unwrap_err();
        assert!(matches!(err, GcsError::Timeout));
        // The sender is still alive: the timeout cancelled nothing.
        assert!(p.exit_code().is_none());
    }

    #[tokio::test]
    async fn test_done_releases_relay_immediately() {
        let (p, _tx) = bare_process();
        p.signal_done();
        // With the done signal already latched, release returns right away.
        tokio::time::timeout(Duration::from_secs(1), p.release_relay_after_done())
            .await
            .expect("release should not wait for the timeout");
    }

    #[tokio::test]
    async fn test_resize_without_relay_errors() {
        let (p, _tx) = bare_process();
        assert!(p.resize_console(24, 80).await.is_err());
    }
}
