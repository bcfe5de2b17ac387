//! Host object model: the registry of containers and processes the bridge
//! operates on.
//!
//! Containers are arena-held behind the id-keyed registry; everything
//! publishes notifications by id rather than back-pointer, which keeps the
//! host ↔ container references acyclic.

pub mod container;
pub mod process;

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use gcs_shared::messages::{
    ContainerNotification, ContainerProperties, HostedContainerSettings, MessageBase,
    ModifyRequestType, ModifyResourceType, ModifySettingsRequest, MountSettings,
    NotificationType, ProcessDetails, ProcessParameters, PropertyQuery, PropertyType,
    SchemaVersion, StdioRelaySettings, UVM_CONTAINER_ID,
};
use gcs_shared::{GcsError, GcsResult};

use crate::overlay;
use crate::runtime::reaper::Reaper;
use crate::runtime::{CreateOptions, ProcessHandle, Runtime, StdioRequest};
use crate::stdio::{GuestIo, StdioDialer, StdioRelay};

use container::{owns_pid_namespace, Container, ContainerStatus};
use process::{ManagedProcess, ProcessKind};

/// Global registry and operation surface. Owned by the bridge for the
/// lifetime of the agent.
pub struct Host {
    runtime: Arc<dyn Runtime>,
    dialer: Arc<dyn StdioDialer>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    external_processes: Mutex<HashMap<u32, Arc<ManagedProcess>>>,
    /// Network namespaces by id, mapped to their bind paths.
    netns: Mutex<HashMap<String, String>>,
    notify: mpsc::Sender<ContainerNotification>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    /// `cgroup.procs` file external processes are attached to.
    gcs_cgroup_procs: Mutex<Option<PathBuf>>,
}

impl Host {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        dialer: Arc<dyn StdioDialer>,
        notify: mpsc::Sender<ContainerNotification>,
    ) -> Arc<Host> {
        let (quit_tx, quit_rx) = watch::channel(false);
        Arc::new(Host {
            runtime,
            dialer,
            containers: Mutex::new(HashMap::new()),
            external_processes: Mutex::new(HashMap::new()),
            netns: Mutex::new(HashMap::new()),
            notify,
            quit_tx,
            quit_rx,
            gcs_cgroup_procs: Mutex::new(None),
        })
    }

    /// Where external processes get attached; set once cgroups are up.
    pub fn set_gcs_cgroup_procs(&self, path: PathBuf) {
        *self.gcs_cgroup_procs.lock() = Some(path);
    }

    /// Observed by the bridge; flips when a uVM shutdown is accepted.
    pub fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit_rx.clone()
    }

    /// Registry lookup with the taxonomy the host expects.
    pub fn get_created_container(&self, id: &str) -> GcsResult<Arc<Container>> {
        self.containers
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GcsError::ContainerNotFound(id.to_string()))
    }

    // ====================
    // Container lifecycle
    // ====================

    /// Create: validate settings, write the OCI document, delegate to the
    /// runtime, register, and start the exit watcher. Returns the init pid.
    pub async fn create_container(
        &self,
        activity_id: &str,
        id: &str,
        config_json: &str,
    ) -> GcsResult<u32> {
        if id == UVM_CONTAINER_ID {
            return Err(GcsError::InvalidArgument(
                "cannot create a container with the uVM id".to_string(),
            ));
        }
        let settings: HostedContainerSettings = serde_json::from_str(config_json)
            .map_err(|e| GcsError::json("container settings", e))?;
        if !settings.schema_version.supports(SchemaVersion::V2_1) {
            return Err(GcsError::InvalidArgument(format!(
                "unsupported settings schema version {}.{}",
                settings.schema_version.major, settings.schema_version.minor
            )));
        }

        // Id uniqueness is enforced at registration time; reserve the slot
        // before the slow work so concurrent creates cannot race past it.
        let bundle = PathBuf::from(&settings.oci_bundle_path);
        let spec = settings.oci_specification;
        let owns_pid_ns = owns_pid_namespace(&spec);
        let container = Container::new(id.to_string(), bundle.clone(), owns_pid_ns);
        {
            let mut containers = self.containers.lock();
            if containers.contains_key(id) {
                return Err(GcsError::ContainerAlreadyExists(id.to_string()));
            }
            containers.insert(id.to_string(), container.clone());
        }

        match self
            .create_registered(activity_id, &container, bundle, spec, settings.stdio_relay_settings)
            .await
        {
            Ok(pid) => Ok(pid),
            Err(e) => {
                self.containers.lock().remove(id);
                Err(e)
            }
        }
    }

    async fn create_registered(
        &self,
        activity_id: &str,
        container: &Arc<Container>,
        bundle: PathBuf,
        spec: oci_spec::runtime::Spec,
        stdio_settings: StdioRelaySettings,
    ) -> GcsResult<u32> {
        std::fs::create_dir_all(&bundle)
            .map_err(|e| GcsError::io(format!("create bundle {}", bundle.display()), e))?;
        let config = serde_json::to_vec(&spec)
            .map_err(|e| GcsError::json("serialize OCI document", e))?;
        std::fs::write(bundle.join("config.json"), config)
            .map_err(|e| GcsError::io("write config.json", e))?;

        let terminal = spec
            .process()
            .as_ref()
            .map(|p| p.terminal().unwrap_or(false))
            .unwrap_or(false);
        let working_dir = spec
            .process()
            .as_ref()
            .map(|p| p.cwd().display().to_string());

        let conns = self.dialer.connect(&stdio_settings).await?;
        let options = CreateOptions {
            stdio: StdioRequest::from_relay_settings(terminal, &stdio_settings),
            working_dir,
        };
        let handle = self.runtime.create(&container.id, &bundle, options).await?;

        let exit_signal = Reaper::global().wait(handle.pid as i32);
        let relay = StdioRelay::start(conns, handle.io)?;
        let (init, exit_tx) = ManagedProcess::new(handle.pid, ProcessKind::Init, Some(relay));
        container.set_init(init.clone())?;

        self.spawn_init_watcher(activity_id.to_string(), container.clone(), init, exit_tx, exit_signal);
        Ok(handle.pid)
    }

    /// The watcher that turns the init exit into the container's terminal
    /// notification. Any notification published earlier rides the same
    /// channel, so ordering is preserved.
    fn spawn_init_watcher(
        &self,
        activity_id: String,
        container: Arc<Container>,
        init: Arc<ManagedProcess>,
        exit_tx: watch::Sender<Option<i32>>,
        exit_signal: tokio::sync::oneshot::Receiver<i32>,
    ) {
        let runtime = self.runtime.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let code = exit_signal.await.unwrap_or(-1);
            tracing::info!(container_id = %container.id, code, "init process exited");

            // Without a private pid namespace nothing guarantees the device
            // cgroup empties when init dies, so sweep the survivors; with
            // one, the kernel kills the namespace for us.
            if !container.owns_pid_namespace {
                if let Err(e) = runtime.kill(&container.id, libc::SIGKILL).await {
                    if !matches!(e, GcsError::ContainerNotFound(_)) {
                        tracing::warn!(container_id = %container.id, error = %e, "post-exit sweep failed");
                    }
                }
            }
            for exec in container.exec_processes() {
                let _ = exec
                    .wait_exit(gcs_shared::protocol::INFINITE_WAIT_TIMEOUT)
                    .await;
            }
            init.drain_relay().await;
            let _ = exit_tx.send(Some(code));
            container.set_status(ContainerStatus::Stopped);

            let notification_type = if code == 0 {
                NotificationType::GracefulExit
            } else if container.kill_was_sent() {
                NotificationType::ForcedExit
            } else {
                NotificationType::UnexpectedExit
            };
            let _ = notify
                .send(ContainerNotification {
                    base: MessageBase {
                        activity_id,
                        container_id: container.id.clone(),
                        span_context: None,
                    },
                    notification_type,
                    operation: "wait".to_string(),
                    result: code,
                    result_info: None,
                })
                .await;

            init.release_relay_after_done().await;
        });
    }

    /// Start: a logical no-op. The init process was materialized at create
    /// time and is released by the first execute against the container, so
    /// this only validates the target and acknowledges.
    pub async fn start_container(&self, id: &str) -> GcsResult<()> {
        let container = self.get_created_container(id)?;
        match container.status() {
            ContainerStatus::Created | ContainerStatus::Running => Ok(()),
            ContainerStatus::Stopped => Err(GcsError::ContainerAlreadyStopped(id.to_string())),
        }
    }

    // ====================
    // Processes
    // ====================

    /// Execute: host process, init start, or exec, multiplexed on the same
    /// request shape.
    pub async fn execute_process(
        &self,
        container_id: &str,
        params_json: &str,
        stdio_settings: StdioRelaySettings,
    ) -> GcsResult<u32> {
        let params: ProcessParameters = serde_json::from_str(params_json)
            .map_err(|e| GcsError::json("process parameters", e))?;

        if container_id == UVM_CONTAINER_ID || params.is_external {
            return self.run_external_process(params, stdio_settings).await;
        }

        let container = self.get_created_container(container_id)?;
        match container.status() {
            ContainerStatus::Created => {
                // First exec of a created container: its process already
                // exists as the runtime's create product; start releases it.
                let init = container.init_process().ok_or_else(|| {
                    GcsError::Unexpected(format!("container {} has no init", container_id))
                })?;
                self.runtime.start(container_id).await?;
                container.set_status(ContainerStatus::Running);
                Ok(init.pid)
            }
            ContainerStatus::Running => {
                self.exec_in_container(&container, params, stdio_settings)
                    .await
            }
            ContainerStatus::Stopped => {
                Err(GcsError::ContainerAlreadyStopped(container_id.to_string()))
            }
        }
    }

    async fn exec_in_container(
        &self,
        container: &Arc<Container>,
        params: ProcessParameters,
        stdio_settings: StdioRelaySettings,
    ) -> GcsResult<u32> {
        let process_doc = match params.oci_process {
            Some(p) => p,
            None => build_oci_process(&params)?,
        };
        let terminal = process_doc.terminal().unwrap_or(false);
        let conns = self.dialer.connect(&stdio_settings).await?;
        let request = StdioRequest::from_relay_settings(terminal, &stdio_settings);

        let handle = self
            .runtime
            .exec(&container.id, &process_doc, request)
            .await?;
        let exit_signal = Reaper::global().wait(handle.pid as i32);
        let relay = StdioRelay::start(conns, handle.io)?;
        let (proc, exit_tx) = ManagedProcess::new(handle.pid, ProcessKind::Exec, Some(relay));
        container.add_exec(proc.clone());

        tokio::spawn(async move {
            let code = exit_signal.await.unwrap_or(-1);
            proc.drain_relay().await;
            let _ = exit_tx.send(Some(code));
            proc.release_relay_after_done().await;
        });
        Ok(handle.pid)
    }

    /// Host process: runs in the uVM root under the gcs cgroup, surviving
    /// container teardown.
    async fn run_external_process(
        &self,
        params: ProcessParameters,
        stdio_settings: StdioRelaySettings,
    ) -> GcsResult<u32> {
        if params.command_args.is_empty() {
            return Err(GcsError::InvalidArgument(
                "external process requires command arguments".to_string(),
            ));
        }
        let conns = self.dialer.connect(&stdio_settings).await?;
        let handle = spawn_external(&params, &stdio_settings)?;
        let exit_signal = Reaper::global().wait(handle.pid as i32);

        if let Some(procs) = self.gcs_cgroup_procs.lock().clone() {
            if let Err(e) = std::fs::write(&procs, handle.pid.to_string()) {
                tracing::warn!(pid = handle.pid, error = %e, "could not attach process to gcs cgroup");
            }
        }

        let relay = StdioRelay::start(conns, handle.io)?;
        let (proc, exit_tx) = ManagedProcess::new(handle.pid, ProcessKind::External, Some(relay));
        self.external_processes
            .lock()
            .insert(handle.pid, proc.clone());

        tokio::spawn(async move {
            let code = exit_signal.await.unwrap_or(-1);
            proc.drain_relay().await;
            let _ = exit_tx.send(Some(code));
            proc.release_relay_after_done().await;
        });
        Ok(handle.pid)
    }

    /// Locate any process the agent knows: container init/exec or external.
    pub fn find_process(&self, container_id: &str, pid: u32) -> GcsResult<Arc<ManagedProcess>> {
        if container_id == UVM_CONTAINER_ID {
            return self
                .external_processes
                .lock()
                .get(&pid)
                .cloned()
                .ok_or_else(|| {
                    GcsError::InvalidArgument(format!("process {} not found", pid))
                });
        }
        let container = self.get_created_container(container_id)?;
        container
            .process(pid)
            .ok_or_else(|| GcsError::InvalidArgument(format!("process {} not found", pid)))
    }

    /// Wait for a process exit; the exit code broadcasts identically to
    /// every waiter. The caller signals done after responding.
    pub async fn wait_process(
        &self,
        container_id: &str,
        pid: u32,
        timeout_ms: u32,
    ) -> GcsResult<(Arc<ManagedProcess>, i32)> {
        let process = self.find_process(container_id, pid)?;
        let code = process.wait_exit(timeout_ms).await?;
        Ok((process, code))
    }

    /// Deliver a signal. Zero remaps to SIGKILL; init signals route through
    /// the runtime so terminal ones fan out to the whole container.
    pub async fn signal_process(
        &self,
        container_id: &str,
        pid: u32,
        signal: i32,
    ) -> GcsResult<()> {
        let signal = if signal == 0 { libc::SIGKILL } else { signal };
        if !(1..=libc::SIGRTMAX()).contains(&signal) {
            return Err(GcsError::InvalidArgument("invalid signal".to_string()));
        }

        if container_id != UVM_CONTAINER_ID {
            let container = self.get_created_container(container_id)?;
            if let Some(init) = container.init_process() {
                if init.pid == pid {
                    if signal == libc::SIGTERM || signal == libc::SIGKILL {
                        container.mark_kill_sent();
                    }
                    return self.runtime.kill(container_id, signal).await;
                }
            }
            // Exec processes are signalled directly.
            let process = container
                .process(pid)
                .ok_or_else(|| GcsError::InvalidArgument(format!("process {} not found", pid)))?;
            return send_signal(process.pid, signal);
        }

        let process = self.find_process(container_id, pid)?;
        send_signal(process.pid, signal)
    }

    /// Shutdown: the uVM sentinel arms the bridge quit signal; containers
    /// get SIGTERM (graceful) or SIGKILL (forced).
    pub async fn shutdown(&self, container_id: &str, force: bool) -> GcsResult<()> {
        if container_id == UVM_CONTAINER_ID {
            let _ = self.quit_tx.send(true);
            return Ok(());
        }
        let container = self.get_created_container(container_id)?;
        container.mark_kill_sent();
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        self.runtime.kill(container_id, signal).await
    }

    // ====================
    // Introspection & settings
    // ====================

    pub async fn get_properties(
        &self,
        container_id: &str,
        query: &str,
    ) -> GcsResult<ContainerProperties> {
        if container_id == UVM_CONTAINER_ID {
            return Err(GcsError::InvalidArgument(
                "property queries do not apply to the uVM".to_string(),
            ));
        }
        self.get_created_container(container_id)?;

        let query: PropertyQuery = if query.trim().is_empty() {
            PropertyQuery::default()
        } else {
            serde_json::from_str(query).map_err(|e| GcsError::json("property query", e))?
        };
        let wanted: &[PropertyType] = if query.property_types.is_empty() {
            &[PropertyType::ProcessList]
        } else {
            &query.property_types
        };

        let mut properties = ContainerProperties::default();
        for property in wanted {
            match property {
                PropertyType::ProcessList => {
                    let pids = self.runtime.ps(container_id).await?;
                    properties.process_list = Some(
                        pids.into_iter()
                            .map(|process_id| ProcessDetails { process_id })
                            .collect(),
                    );
                }
                PropertyType::Statistics => {
                    let state = self.runtime.state(container_id).await?;
                    properties.statistics = Some(serde_json::json!({
                        "status": state.status,
                        "pid": state.pid,
                        "bundle": state.bundle,
                    }));
                }
            }
        }
        Ok(properties)
    }

    pub async fn resize_console(
        &self,
        container_id: &str,
        pid: u32,
        height: u16,
        width: u16,
    ) -> GcsResult<()> {
        let process = self.find_process(container_id, pid)?;
        process.resize_console(height, width).await
    }

    /// Mount-class modifications map onto overlay assembly; network
    /// modifications are not reachable on this uVM type.
    pub async fn modify_settings(&self, request: &ModifySettingsRequest) -> GcsResult<()> {
        match request.resource_type {
            ModifyResourceType::Mount => {
                let settings: MountSettings = serde_json::from_value(request.settings.clone())
                    .map_err(|e| GcsError::json("mount settings", e))?;
                match request.request_type {
                    ModifyRequestType::Add => {
                        let target = PathBuf::from(&settings.mount_path);
                        let upper = settings.upper_path.as_ref().map(PathBuf::from);
                        let work = settings.work_path.as_ref().map(PathBuf::from);
                        overlay::mount_overlay(
                            &settings.lower_paths,
                            upper.as_deref(),
                            work.as_deref(),
                            &target,
                            settings.read_only,
                        )
                    }
                    ModifyRequestType::Remove => {
                        overlay::unmount(std::path::Path::new(&settings.mount_path))
                    }
                }
            }
            ModifyResourceType::NetworkModifyRequest => Err(GcsError::NotImplemented(
                "network modification".to_string(),
            )),
        }
    }

    /// Delete: runtime delete, then unconditional removal from the registry
    /// so a second delete reports the container as missing.
    pub async fn delete_container_state(&self, id: &str) -> GcsResult<()> {
        self.get_created_container(id)?;
        let result = self.runtime.delete(id).await;
        self.containers.lock().remove(id);
        result
    }

    /// Track a network namespace by id.
    pub fn add_network_namespace(&self, id: String, path: String) {
        self.netns.lock().insert(id, path);
    }

    pub fn network_namespace(&self, id: &str) -> Option<String> {
        self.netns.lock().get(id).cloned()
    }

    /// Diagnostic summary surfaced by DumpStacks.
    pub fn dump_state(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let containers = self.containers.lock();
        let _ = writeln!(out, "containers: {}", containers.len());
        for (id, c) in containers.iter() {
            let _ = writeln!(
                out,
                "  {} status={:?} init={:?} execs={}",
                id,
                c.status(),
                c.init_process().map(|p| p.pid),
                c.exec_processes().len(),
            );
        }
        let externals = self.external_processes.lock();
        let _ = writeln!(out, "external processes: {}", externals.len());
        for pid in externals.keys() {
            let _ = writeln!(out, "  pid {}", pid);
        }
        out
    }
}

/// Deliver a signal to a single pid. Raw `kill` rather than the typed
/// wrapper so realtime signal numbers pass through unchanged.
fn send_signal(pid: u32, signal: i32) -> GcsResult<()> {
    // SAFETY: plain syscall; no memory is shared with the kernel.
    let rc = unsafe { libc::kill(pid as i32, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(GcsError::ContainerNotFound(format!("process {}", pid))),
        Some(libc::EINVAL) => Err(GcsError::InvalidArgument("invalid signal".to_string())),
        _ => Err(GcsError::io("deliver signal", err)),
    }
}

/// Build the OCI process document for an exec that arrived as bare
/// command/environment parameters.
fn build_oci_process(params: &ProcessParameters) -> GcsResult<oci_spec::runtime::Process> {
    if params.command_args.is_empty() {
        return Err(GcsError::InvalidArgument(
            "exec requires command arguments".to_string(),
        ));
    }
    let mut env: Vec<String> = params
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();
    let cwd = if params.working_directory.is_empty() {
        "/".to_string()
    } else {
        params.working_directory.clone()
    };
    oci_spec::runtime::ProcessBuilder::default()
        .args(params.command_args.clone())
        .env(env)
        .cwd(cwd)
        .terminal(params.emulate_console)
        .build()
        .map_err(|e| GcsError::InvalidArgument(format!("invalid process document: {}", e)))
}

/// Spawn a host process with the requested stdio endpoints.
fn spawn_external(
    params: &ProcessParameters,
    stdio_settings: &StdioRelaySettings,
) -> GcsResult<ProcessHandle> {
    use std::os::unix::process::CommandExt;

    let mut cmd = std::process::Command::new(&params.command_args[0]);
    cmd.args(&params.command_args[1..]);
    cmd.env_clear().envs(&params.environment);
    if !params.working_directory.is_empty() {
        cmd.current_dir(&params.working_directory);
    }

    let io;
    if params.emulate_console {
        let pty = nix::pty::openpty(None::<&nix::pty::Winsize>, None::<&nix::sys::termios::Termios>)
            .map_err(|e| GcsError::io("open pty", e.into()))?;
        let slave: OwnedFd = pty.slave;
        let dup = |fd: &OwnedFd| fd.try_clone().map_err(|e| GcsError::io("dup pty slave", e));
        cmd.stdin(Stdio::from(dup(&slave)?));
        cmd.stdout(Stdio::from(dup(&slave)?));
        cmd.stderr(Stdio::from(slave));
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        io = GuestIo::Tty { master: pty.master };
    } else {
        let mut stdin = None;
        let mut stdout = None;
        let mut stderr = None;
        if stdio_settings.stdin.is_some() {
            let (r, w) = crate::stdio::os_pipe()?;
            cmd.stdin(Stdio::from(r));
            stdin = Some(w);
        } else {
            cmd.stdin(Stdio::null());
        }
        if stdio_settings.stdout.is_some() {
            let (r, w) = crate::stdio::os_pipe()?;
            cmd.stdout(Stdio::from(w));
            stdout = Some(r);
        } else {
            cmd.stdout(Stdio::null());
        }
        if stdio_settings.stderr.is_some() {
            let (r, w) = crate::stdio::os_pipe()?;
            cmd.stderr(Stdio::from(w));
            stderr = Some(r);
        } else {
            cmd.stderr(Stdio::null());
        }
        io = GuestIo::Pipes {
            stdin,
            stdout,
            stderr,
        };
    }

    let child = cmd
        .spawn()
        .map_err(|e| GcsError::io(format!("spawn {:?}", params.command_args[0]), e))?;
    tracing::info!(pid = child.id(), command = %params.command_args[0], "external process started");
    Ok(ProcessHandle {
        pid: child.id(),
        io,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{FakeRuntime, NullDialer};
    use gcs_shared::errors::{HR_INVALID_ARGUMENT, HR_SYSTEM_ALREADY_EXISTS, HR_SYSTEM_NOT_FOUND};

    fn test_host(first_pid: u32) -> Arc<Host> {
        let (notify_tx, _notify_rx) = mpsc::channel(16);
        Host::new(FakeRuntime::new(first_pid), Arc::new(NullDialer), notify_tx)
    }

    fn settings_json(bundle: &std::path::Path) -> String {
        let settings = HostedContainerSettings {
            schema_version: SchemaVersion { major: 2, minor: 1 },
            oci_bundle_path: bundle.display().to_string(),
            oci_specification: oci_spec::runtime::Spec::default(),
            stdio_relay_settings: StdioRelaySettings::default(),
        };
        serde_json::to_string(&settings).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_missing_container_uses_not_found_taxonomy() {
        let host = test_host(20000);
        let err = host.get_created_container("nope").unwrap_err();
        assert_eq!(err.hresult(), HR_SYSTEM_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_rejects_uvm_sentinel_id() {
        let host = test_host(20100);
        let dir = tempfile::tempdir().unwrap();
        let err = host
            .create_container("a", UVM_CONTAINER_ID, &settings_json(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HR_INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_create_rejects_pre_21_schema() {
        let host = test_host(20200);
        let dir = tempfile::tempdir().unwrap();
        let mut v: serde_json::Value =
            serde_json::from_str(&settings_json(dir.path())).unwrap();
        v["schema_version"] = serde_json::json!({"major": 2, "minor": 0});
        let err = host
            .create_container("a", "c1", &v.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HR_INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_create_enforces_id_uniqueness() {
        let host = test_host(20300);
        let dir = tempfile::tempdir().unwrap();
        host.create_container("a", "c1", &settings_json(dir.path()))
            .await
            .unwrap();
        let err = host
            .create_container("a", "c1", &settings_json(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HR_SYSTEM_ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn test_create_writes_oci_document() {
        let host = test_host(20400);
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        host.create_container("a", "c1", &settings_json(&bundle))
            .await
            .unwrap();
        let config = std::fs::read_to_string(bundle.join("config.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert!(doc.get("ociVersion").is_some());
    }

    #[tokio::test]
    async fn test_external_process_requires_command() {
        let host = test_host(20500);
        let params = ProcessParameters {
            is_external: true,
            ..Default::default()
        };
        let err = host
            .execute_process(
                UVM_CONTAINER_ID,
                &serde_json::to_string(&params).unwrap(),
                StdioRelaySettings::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HR_INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_network_namespace_registry() {
        let host = test_host(20600);
        host.add_network_namespace("ns-1".into(), "/var/run/netns/ns-1".into());
        assert_eq!(
            host.network_namespace("ns-1").as_deref(),
            Some("/var/run/netns/ns-1")
        );
        assert!(host.network_namespace("ns-2").is_none());
    }

    #[test]
    fn test_build_oci_process_defaults_and_env_order() {
        let mut params = ProcessParameters {
            command_args: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        params.environment.insert("B".into(), "2".into());
        params.environment.insert("A".into(), "1".into());

        let doc = build_oci_process(&params).unwrap();
        assert_eq!(doc.cwd().as_path(), std::path::Path::new("/"));
        assert_eq!(
            doc.env().as_ref().unwrap(),
            &vec!["A=1".to_string(), "B=2".to_string()]
        );
        assert_eq!(doc.terminal(), Some(false));
    }

    #[test]
    fn test_build_oci_process_requires_args() {
        let params = ProcessParameters::default();
        assert!(build_oci_process(&params).is_err());
    }
}
