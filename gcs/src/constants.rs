//! Centralized paths, ports, and tuning values for the agent.
//!
//! The host controls nothing here directly; these are the guest-side
//! locations the filesystem contract in the protocol documentation names.

/// Per-container runtime state: `/var/run/gcsrunc/<id>/initpid` and
/// `/var/run/gcsrunc/<id>/<pid>/` per process.
pub const RUNTIME_STATE_DIR: &str = "/var/run/gcsrunc";

/// Per-container runtime logs: `/run/gcs/c/<id>/runc.log`.
pub const CONTAINER_LOG_DIR: &str = "/run/gcs/c";

/// Log file for runtime invocations not tied to a container.
pub const GLOBAL_RUNTIME_LOG: &str = "/run/gcs/c/global-runc.log";

/// The external OCI runtime binary.
pub const RUNTIME_BINARY: &str = "runc";

/// v1 memory cgroup mount point.
pub const CGROUP_MEMORY_ROOT: &str = "/sys/fs/cgroup/memory";

/// Cgroup for the agent and host processes (no limit).
pub const CGROUP_GCS: &str = "gcs";

/// Cgroup for container workloads (hard limited).
pub const CGROUP_CONTAINERS: &str = "containers";

/// Memory held back from the containers cgroup for orchestration.
pub const DEFAULT_MEMORY_RESERVE_BYTES: u64 = 75 * 1024 * 1024;

/// Threshold on the gcs cgroup that triggers a warning notification.
pub const GCS_MEMORY_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Seconds the bridge waits for a blocked reader after a shutdown request.
pub const BRIDGE_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Seconds a relay stays open after process exit waiting for the host to
/// acknowledge it has drained stdio.
pub const STDIO_DONE_TIMEOUT_SECS: u64 = 5;
