//! Polymorphic OCI runtime driver.
//!
//! [`Runtime`] is the seam between the host object model and the external
//! runtime binary; [`runc::RuncRuntime`] is the production implementation
//! and tests substitute mocks. [`reaper`] owns `waitpid` for the whole
//! process.

pub mod reaper;
pub mod runc;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use gcs_shared::{GcsError, GcsResult};

use crate::stdio::GuestIo;

/// Which guest-side stdio endpoints to materialize for a new process.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioRequest {
    /// Allocate a PTY and hand back its master instead of pipes.
    pub terminal: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioRequest {
    pub fn from_relay_settings(
        terminal: bool,
        settings: &gcs_shared::messages::StdioRelaySettings,
    ) -> StdioRequest {
        StdioRequest {
            terminal,
            stdin: settings.stdin.is_some(),
            stdout: settings.stdout.is_some(),
            stderr: settings.stderr.is_some(),
        }
    }
}

/// A process materialized by the runtime: its pid and the guest side of its
/// stdio, ready to be joined to host connections by a relay.
pub struct ProcessHandle {
    pub pid: u32,
    pub io: GuestIo,
}

/// Extra knobs for the create path that come from the OCI document.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub stdio: StdioRequest,
    /// The init process's working directory, materialized best-effort under
    /// `rootfs/` before the runtime runs.
    pub working_dir: Option<String>,
}

/// Container state as reported by the runtime binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    pub id: String,
    #[serde(default)]
    pub pid: u32,
    pub status: String,
    #[serde(default)]
    pub bundle: String,
}

/// Driver for an external OCI runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// `create`: materialize the container and its init process, paused at
    /// the start barrier. The handle carries the init pid.
    async fn create(
        &self,
        id: &str,
        bundle: &Path,
        options: CreateOptions,
    ) -> GcsResult<ProcessHandle>;

    /// `start`: unblock the init process.
    async fn start(&self, id: &str) -> GcsResult<()>;

    /// `exec`: run an additional process inside the container's namespaces.
    async fn exec(
        &self,
        id: &str,
        process: &oci_spec::runtime::Process,
        stdio: StdioRequest,
    ) -> GcsResult<ProcessHandle>;

    /// `kill`: SIGTERM and SIGKILL fan out to every process in the
    /// container; other signals target only init.
    async fn kill(&self, id: &str, signal: i32) -> GcsResult<()>;

    async fn delete(&self, id: &str) -> GcsResult<()>;

    async fn pause(&self, id: &str) -> GcsResult<()>;

    async fn resume(&self, id: &str) -> GcsResult<()>;

    async fn state(&self, id: &str) -> GcsResult<ContainerState>;

    async fn list(&self) -> GcsResult<Vec<ContainerState>>;

    /// Pids of every process currently in the container.
    async fn ps(&self, id: &str) -> GcsResult<Vec<u32>>;

    /// `update`: replace the container's resource limits.
    async fn update(&self, id: &str, resources: &serde_json::Value) -> GcsResult<()>;
}

/// One line of the runtime's `--log-format json` output.
#[derive(Debug, Deserialize)]
pub(crate) struct LogEntry {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub msg: String,
}

/// The last message at error level or higher, if any.
pub(crate) fn last_error_in_log(contents: &str) -> Option<String> {
    let mut last = None;
    for line in contents.lines() {
        if let Ok(entry) = serde_json::from_str::<LogEntry>(line) {
            if matches!(entry.level.as_str(), "error" | "fatal" | "panic") {
                last = Some(entry.msg);
            }
        }
    }
    last
}

/// Map a runtime error message onto the wire taxonomy by substring, the way
/// the host expects. Unmatched messages stay generic runtime errors.
pub fn classify_runtime_error(msg: &str, id: &str) -> GcsError {
    if msg.contains("does not exist")
        || msg.contains("process already finished")
        || msg.contains("container not running")
    {
        GcsError::ContainerNotFound(id.to_string())
    } else if msg.contains("container with id exists") || msg.contains("already exists") {
        GcsError::ContainerAlreadyExists(id.to_string())
    } else if msg.contains("invalid id format") {
        GcsError::InvalidArgument(format!("invalid container id {:?}", id))
    } else if msg.contains("that is not stopped") {
        GcsError::ContainerNotStopped(id.to_string())
    } else {
        GcsError::Runtime(msg.to_string())
    }
}

/// Test doubles shared by the host and bridge test suites.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::stdio::{GuestIo, StdioConnections, StdioDialer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Runtime stub handing out sequential pids; every operation succeeds.
    pub(crate) struct FakeRuntime {
        next_pid: AtomicU32,
    }

    impl FakeRuntime {
        pub(crate) fn new(first_pid: u32) -> Arc<FakeRuntime> {
            Arc::new(FakeRuntime {
                next_pid: AtomicU32::new(first_pid),
            })
        }

        fn handle(&self) -> ProcessHandle {
            ProcessHandle {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                io: GuestIo::Pipes {
                    stdin: None,
                    stdout: None,
                    stderr: None,
                },
            }
        }
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn create(
            &self,
            _id: &str,
            _bundle: &Path,
            _options: CreateOptions,
        ) -> GcsResult<ProcessHandle> {
            Ok(self.handle())
        }

        async fn start(&self, _id: &str) -> GcsResult<()> {
            Ok(())
        }

        async fn exec(
            &self,
            _id: &str,
            _process: &oci_spec::runtime::Process,
            _stdio: StdioRequest,
        ) -> GcsResult<ProcessHandle> {
            Ok(self.handle())
        }

        async fn kill(&self, _id: &str, _signal: i32) -> GcsResult<()> {
            Ok(())
        }

        async fn delete(&self, _id: &str) -> GcsResult<()> {
            Ok(())
        }

        async fn pause(&self, _id: &str) -> GcsResult<()> {
            Ok(())
        }

        async fn resume(&self, _id: &str) -> GcsResult<()> {
            Ok(())
        }

        async fn state(&self, id: &str) -> GcsResult<ContainerState> {
            Ok(ContainerState {
                id: id.to_string(),
                pid: 1,
                status: "running".to_string(),
                bundle: "/b".to_string(),
            })
        }

        async fn list(&self) -> GcsResult<Vec<ContainerState>> {
            Ok(Vec::new())
        }

        async fn ps(&self, _id: &str) -> GcsResult<Vec<u32>> {
            Ok(vec![1])
        }

        async fn update(&self, _id: &str, _resources: &serde_json::Value) -> GcsResult<()> {
            Ok(())
        }
    }

    /// Dialer that never opens a connection.
    pub(crate) struct NullDialer;

    #[async_trait]
    impl StdioDialer for NullDialer {
        async fn connect(
            &self,
            _settings: &gcs_shared::messages::StdioRelaySettings,
        ) -> GcsResult<StdioConnections> {
            Ok(StdioConnections::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcs_shared::errors::{
        HR_INVALID_ARGUMENT, HR_SYSTEM_ALREADY_EXISTS, HR_SYSTEM_NOT_FOUND, HR_SYSTEM_NOT_STOPPED,
        HR_UNEXPECTED,
    };

    #[test]
    fn test_last_error_in_log_picks_last() {
        let log = concat!(
            r#"{"level":"warning","msg":"early warning"}"#,
            "\n",
            r#"{"level":"error","msg":"first error"}"#,
            "\n",
            "not json at all\n",
            r#"{"level":"error","msg":"second error"}"#,
            "\n",
            r#"{"level":"info","msg":"trailing info"}"#,
            "\n",
        );
        assert_eq!(last_error_in_log(log).as_deref(), Some("second error"));
    }

    #[test]
    fn test_last_error_in_log_none_for_clean_log() {
        let log = r#"{"level":"info","msg":"all fine"}"#;
        assert!(last_error_in_log(log).is_none());
    }

    #[test]
    fn test_classification_table() {
        let cases: &[(&str, i32)] = &[
            ("container \"c9\" does not exist", HR_SYSTEM_NOT_FOUND),
            ("container with id exists: c9", HR_SYSTEM_ALREADY_EXISTS),
            ("rootfs already exists", HR_SYSTEM_ALREADY_EXISTS),
            ("invalid id format: ../c9", HR_INVALID_ARGUMENT),
            (
                "cannot delete container c9 that is not stopped: running",
                HR_SYSTEM_NOT_STOPPED,
            ),
            ("process already finished", HR_SYSTEM_NOT_FOUND),
            ("container not running", HR_SYSTEM_NOT_FOUND),
            ("some novel explosion", HR_UNEXPECTED),
        ];
        for (msg, hr) in cases {
            assert_eq!(
                classify_runtime_error(msg, "c9").hresult(),
                *hr,
                "msg: {}",
                msg
            );
        }
    }

    #[test]
    fn test_stdio_request_from_relay_settings() {
        let settings = gcs_shared::messages::StdioRelaySettings {
            stdin: Some(0x2000),
            stdout: None,
            stderr: Some(0x2002),
        };
        let req = StdioRequest::from_relay_settings(false, &settings);
        assert!(req.stdin && !req.stdout && req.stderr);
        assert!(!req.terminal);
    }
}
