//! v1 memory cgroup controller.
//!
//! At startup the agent owns the uVM's memory accounting: hierarchy
//! accounting is enabled on the root before any child exists, a `gcs` group
//! (no limit) holds the agent and host processes, and a `containers` group
//! holds workloads under a hard limit of total RAM minus a reserve. An
//! eventfd per group watches the 50 MiB threshold on `gcs` and OOM events on
//! `containers`; both publish warning notifications and keep running.
//!
//! The controller operates on a configurable root so tests can point it at a
//! scratch directory and drive the eventfds by hand.

use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::eventfd::{EfdFlags, EventFd};
use tokio::sync::mpsc;

use gcs_shared::messages::{ContainerNotification, MessageBase, NotificationType};
use gcs_shared::{GcsError, GcsResult};

use crate::constants;

/// Tuning for the memory split.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Mount point of the v1 memory controller.
    pub root: PathBuf,
    /// Bytes held back from the containers limit for orchestration.
    pub reserve_bytes: u64,
    /// Threshold on the gcs group that triggers a warning.
    pub gcs_threshold_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            root: PathBuf::from(constants::CGROUP_MEMORY_ROOT),
            reserve_bytes: constants::DEFAULT_MEMORY_RESERVE_BYTES,
            gcs_threshold_bytes: constants::GCS_MEMORY_THRESHOLD_BYTES,
        }
    }
}

/// Snapshot of a group's memory counters, attached to notifications.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MemorySnapshot {
    pub usage_bytes: u64,
    pub max_usage_bytes: u64,
    pub limit_bytes: u64,
    pub swap_usage_bytes: u64,
    /// Events observed on this group since setup.
    pub count: u64,
}

pub struct CgroupController {
    gcs_path: PathBuf,
    containers_path: PathBuf,
    /// Duplicates of the event fds, used to wake the loops at teardown.
    wakers: Vec<OwnedFd>,
    threads: Vec<std::thread::JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl CgroupController {
    /// Build the hierarchy and start both event loops. Failures here are
    /// fatal to the agent.
    pub fn setup(
        config: &MemoryConfig,
        total_ram_bytes: u64,
        notify: mpsc::Sender<ContainerNotification>,
    ) -> GcsResult<CgroupController> {
        // Hierarchical accounting must be on before any child group exists.
        write_value(&config.root.join("memory.use_hierarchy"), "1")?;

        let gcs_path = config.root.join(constants::CGROUP_GCS);
        let containers_path = config.root.join(constants::CGROUP_CONTAINERS);
        std::fs::create_dir_all(&gcs_path)
            .map_err(|e| GcsError::io(format!("create {}", gcs_path.display()), e))?;
        std::fs::create_dir_all(&containers_path)
            .map_err(|e| GcsError::io(format!("create {}", containers_path.display()), e))?;

        let limit = total_ram_bytes.saturating_sub(config.reserve_bytes);
        write_value(
            &containers_path.join("memory.limit_in_bytes"),
            &limit.to_string(),
        )?;
        write_value(
            &gcs_path.join("cgroup.procs"),
            &std::process::id().to_string(),
        )?;
        tracing::info!(
            total_ram_bytes,
            containers_limit_bytes = limit,
            "memory cgroups configured"
        );

        let mut controller = CgroupController {
            gcs_path: gcs_path.clone(),
            containers_path: containers_path.clone(),
            wakers: Vec::new(),
            threads: Vec::new(),
            stopping: Arc::new(AtomicBool::new(false)),
        };

        let gcs_efd = register_threshold(&gcs_path, config.gcs_threshold_bytes)?;
        controller.spawn_watch(
            gcs_path,
            gcs_efd,
            NotificationType::MemoryWarning,
            notify.clone(),
        )?;

        let oom_efd = register_oom(&containers_path)?;
        controller.spawn_watch(containers_path, oom_efd, NotificationType::Oom, notify)?;

        Ok(controller)
    }

    fn spawn_watch(
        &mut self,
        cgroup: PathBuf,
        efd: EventFd,
        kind: NotificationType,
        notify: mpsc::Sender<ContainerNotification>,
    ) -> GcsResult<()> {
        // The kernel holds its own reference from the event_control write;
        // these duplicates serve the watch loop and the teardown waker.
        let efd: OwnedFd = efd
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| GcsError::io("duplicate eventfd", e))?;
        let waker = efd
            .try_clone()
            .map_err(|e| GcsError::io("duplicate eventfd", e))?;
        self.wakers.push(waker);
        let stopping = self.stopping.clone();
        let thread = std::thread::Builder::new()
            .name(format!("memwatch-{:?}", kind))
            .spawn(move || watch_loop(&cgroup, efd, kind, notify, stopping))
            .map_err(|e| GcsError::io("spawn memory watch thread", e))?;
        self.threads.push(thread);
        Ok(())
    }

    /// Remove both groups and stop the event loops.
    pub fn teardown(mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_dir(&self.containers_path);
        let _ = std::fs::remove_dir(&self.gcs_path);
        // Wake the loops so they observe the teardown and exit.
        for waker in &self.wakers {
            let _ = nix::unistd::write(waker.as_fd(), &1u64.to_ne_bytes());
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    pub fn containers_path(&self) -> &Path {
        &self.containers_path
    }
}

/// One blocking loop per eventfd: read 8 bytes, check the group still
/// exists, coalesce bursts for a second, then publish a snapshot.
fn watch_loop(
    cgroup: &Path,
    efd: OwnedFd,
    kind: NotificationType,
    notify: mpsc::Sender<ContainerNotification>,
    stopping: Arc<AtomicBool>,
) {
    let mut count = 0u64;
    loop {
        let mut buf = [0u8; 8];
        match nix::unistd::read(efd.as_fd(), &mut buf) {
            Ok(8) => {}
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(cgroup = %cgroup.display(), error = %e, "eventfd read failed");
                return;
            }
        }

        // A missing event_control (or an explicit teardown) means the group
        // is going away; leave quietly rather than report a phantom event.
        if stopping.load(Ordering::SeqCst) || !cgroup.join("cgroup.event_control").exists() {
            return;
        }

        // Bursts of threshold crossings collapse into one report.
        std::thread::sleep(Duration::from_secs(1));

        count += 1;
        let snapshot = read_snapshot(cgroup, count);
        tracing::warn!(
            cgroup = %cgroup.display(),
            usage = snapshot.usage_bytes,
            max_usage = snapshot.max_usage_bytes,
            limit = snapshot.limit_bytes,
            swap_usage = snapshot.swap_usage_bytes,
            count,
            "memory event"
        );
        let notification = ContainerNotification {
            base: MessageBase {
                activity_id: uuid::Uuid::new_v4().to_string(),
                container_id: String::new(),
                span_context: None,
            },
            notification_type: kind,
            operation: cgroup.display().to_string(),
            result: 0,
            result_info: serde_json::to_value(snapshot).ok(),
        };
        if notify.blocking_send(notification).is_err() {
            return; // bridge is gone
        }
    }
}

fn read_snapshot(cgroup: &Path, count: u64) -> MemorySnapshot {
    MemorySnapshot {
        usage_bytes: read_counter(&cgroup.join("memory.usage_in_bytes")),
        max_usage_bytes: read_counter(&cgroup.join("memory.max_usage_in_bytes")),
        limit_bytes: read_counter(&cgroup.join("memory.limit_in_bytes")),
        swap_usage_bytes: read_counter(&cgroup.join("memory.memsw.usage_in_bytes")),
        count,
    }
}

fn read_counter(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn write_value(path: &Path, value: &str) -> GcsResult<()> {
    std::fs::write(path, value)
        .map_err(|e| GcsError::io(format!("write {} to {}", value, path.display()), e))
}

/// Register a usage threshold eventfd on a group.
fn register_threshold(cgroup: &Path, threshold_bytes: u64) -> GcsResult<EventFd> {
    let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
        .map_err(|e| GcsError::io("create eventfd", e.into()))?;
    let usage = std::fs::File::open(cgroup.join("memory.usage_in_bytes"))
        .map_err(|e| GcsError::io("open memory.usage_in_bytes", e))?;
    let line = format!(
        "{} {} {}",
        fd_number(&efd),
        fd_number(&usage),
        threshold_bytes
    );
    write_value(&cgroup.join("cgroup.event_control"), &line)?;
    Ok(efd)
}

/// Register an OOM eventfd on a group.
fn register_oom(cgroup: &Path) -> GcsResult<EventFd> {
    let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
        .map_err(|e| GcsError::io("create eventfd", e.into()))?;
    let oom = std::fs::File::open(cgroup.join("memory.oom_control"))
        .map_err(|e| GcsError::io("open memory.oom_control", e))?;
    let line = format!("{} {}", fd_number(&efd), fd_number(&oom));
    write_value(&cgroup.join("cgroup.event_control"), &line)?;
    Ok(efd)
}

fn fd_number<F: AsFd>(f: &F) -> i32 {
    use std::os::fd::AsRawFd;
    f.as_fd().as_raw_fd()
}

/// Total physical memory from `/proc/meminfo`.
pub fn total_ram_bytes() -> GcsResult<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .map_err(|e| GcsError::io("read /proc/meminfo", e))?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .map_err(|_| GcsError::Unexpected(format!("malformed MemTotal line {:?}", line)))?;
            return Ok(kb * 1024);
        }
    }
    Err(GcsError::Unexpected(
        "MemTotal missing from /proc/meminfo".to_string(),
    ))
}
