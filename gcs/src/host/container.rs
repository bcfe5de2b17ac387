//! Per-container state machine and process table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use gcs_shared::{GcsError, GcsResult};

use super::process::ManagedProcess;

/// Lifecycle: created → running → stopped. Deletion is the container's
/// removal from the registry, not a status of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
}

#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub bundle_path: PathBuf,
    /// Whether the container has its own pid namespace. Immutable after
    /// create: it decides who vacates the cgroup when init dies.
    pub owns_pid_namespace: bool,
    status: Mutex<ContainerStatus>,
    init: Mutex<Option<Arc<ManagedProcess>>>,
    execs: Mutex<HashMap<u32, Arc<ManagedProcess>>>,
    /// Set when a kill or shutdown was delivered through the agent; decides
    /// whether init's death reports as forced or unexpected.
    kill_sent: AtomicBool,
}

impl Container {
    pub fn new(id: String, bundle_path: PathBuf, owns_pid_namespace: bool) -> Arc<Container> {
        Arc::new(Container {
            id,
            bundle_path,
            owns_pid_namespace,
            status: Mutex::new(ContainerStatus::Created),
            init: Mutex::new(None),
            execs: Mutex::new(HashMap::new()),
            kill_sent: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock() = status;
    }

    /// The container is running iff its init process is alive.
    pub fn is_running(&self) -> bool {
        self.status() == ContainerStatus::Running
    }

    /// Install the init process. Exactly one init per container.
    pub fn set_init(&self, process: Arc<ManagedProcess>) -> GcsResult<()> {
        let mut init = self.init.lock();
        if init.is_some() {
            return Err(GcsError::ContainerAlreadyExists(format!(
                "{} already has an init process",
                self.id
            )));
        }
        *init = Some(process);
        Ok(())
    }

    pub fn init_process(&self) -> Option<Arc<ManagedProcess>> {
        self.init.lock().clone()
    }

    pub fn add_exec(&self, process: Arc<ManagedProcess>) {
        self.execs.lock().insert(process.pid, process);
    }

    /// Find a process by pid, init included.
    pub fn process(&self, pid: u32) -> Option<Arc<ManagedProcess>> {
        if let Some(init) = self.init.lock().as_ref() {
            if init.pid == pid {
                return Some(init.clone());
            }
        }
        self.execs.lock().get(&pid).cloned()
    }

    /// Snapshot of exec processes, for iteration without holding the lock.
    pub fn exec_processes(&self) -> Vec<Arc<ManagedProcess>> {
        self.execs.lock().values().cloned().collect()
    }

    pub fn mark_kill_sent(&self) {
        self.kill_sent.store(true, Ordering::SeqCst);
    }

    pub fn kill_was_sent(&self) -> bool {
        self.kill_sent.load(Ordering::SeqCst)
    }
}

/// Derive pid-namespace ownership from the OCI document: no pid namespace
/// entry or a pathed one means the namespace is shared; an entry with no
/// path means the runtime creates one owned by this container.
pub fn owns_pid_namespace(spec: &oci_spec::runtime::Spec) -> bool {
    let Some(linux) = spec.linux().as_ref() else {
        return false;
    };
    let Some(namespaces) = linux.namespaces().as_ref() else {
        return false;
    };
    namespaces.iter().any(|ns| {
        matches!(ns.typ(), oci_spec::runtime::LinuxNamespaceType::Pid)
            && ns.path().as_ref().map_or(true, |p| p.as_os_str().is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::process::ProcessKind;
    use oci_spec::runtime::{
        LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, SpecBuilder,
    };

    fn spec_with_pid_ns(path: Option<&str>) -> oci_spec::runtime::Spec {
        let mut ns = LinuxNamespaceBuilder::default().typ(LinuxNamespaceType::Pid);
        if let Some(p) = path {
            ns = ns.path(p);
        }
        SpecBuilder::default()
            .linux(
                LinuxBuilder::default()
                    .namespaces(vec![ns.build().unwrap()])
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_owns_pid_namespace_when_entry_has_no_path() {
        assert!(owns_pid_namespace(&spec_with_pid_ns(None)));
    }

    #[test]
    fn test_shares_pid_namespace_when_pathed() {
        assert!(!owns_pid_namespace(&spec_with_pid_ns(Some(
            "/proc/1/ns/pid"
        ))));
    }

    #[test]
    fn test_shares_pid_namespace_when_absent() {
        let spec = SpecBuilder::default()
            .linux(LinuxBuilder::default().build().unwrap())
            .build()
            .unwrap();
        assert!(!owns_pid_namespace(&spec));
    }

    #[test]
    fn test_exactly_one_init() {
        let c = Container::new("c1".into(), PathBuf::from("/b"), true);
        let (p1, _tx1) = ManagedProcess::new(10, ProcessKind::Init, None);
        let (p2, _tx2) = ManagedProcess::new(11, ProcessKind::Init, None);
        c.set_init(p1).unwrap();
        assert!(c.set_init(p2).is_err());
    }

    #[test]
    fn test_process_lookup_covers_init_and_execs() {
        let c = Container::new("c1".into(), PathBuf::from("/b"), true);
        let (init, _tx) = ManagedProcess::new(10, ProcessKind::Init, None);
        let (exec, _tx2) = ManagedProcess::new(20, ProcessKind::Exec, None);
        c.set_init(init).unwrap();
        c.add_exec(exec);

        assert_eq!(c.process(10).unwrap().pid, 10);
        assert_eq!(c.process(20).unwrap().pid, 20);
        assert!(c.process(30).is_none());
    }

    #[test]
    fn test_status_transitions() {
        let c = Container::new("c1".into(), PathBuf::from("/b"), false);
        assert_eq!(c.status(), ContainerStatus::Created);
        assert!(!c.is_running());
        c.set_status(ContainerStatus::Running);
        assert!(c.is_running());
        c.set_status(ContainerStatus::Stopped);
        assert!(!c.is_running());
    }
}
