//! Driver for the external `runc` binary.
//!
//! Every operation invokes the binary with a per-container JSON log
//! (`--log <path> --log-format json`); on failure the log's last
//! error-level entry is classified into the wire taxonomy. Containers run
//! detached, so their processes re-parent to the agent (a child subreaper)
//! and are reaped through [`super::reaper`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

use gcs_shared::{GcsError, GcsResult};

use super::reaper::Reaper;
use super::{
    classify_runtime_error, last_error_in_log, ContainerState, CreateOptions, ProcessHandle,
    Runtime, StdioRequest,
};
use crate::constants;
use crate::stdio::{os_pipe, GuestIo};

/// Milliseconds to wait for the runtime to connect the console socket.
const CONSOLE_ACCEPT_TIMEOUT_MS: u16 = 10_000;

pub struct RuncRuntime {
    binary: PathBuf,
    /// Per-container state: `<state_dir>/<id>/initpid`, `<state_dir>/<id>/<pid>/`.
    state_dir: PathBuf,
    /// Per-container logs: `<log_dir>/<id>/runc.log`.
    log_dir: PathBuf,
    /// The binary is exclusive per container id; concurrent operations on
    /// one container serialize here.
    invocation_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for RuncRuntime {
    fn default() -> Self {
        Self::with_paths(
            PathBuf::from(constants::RUNTIME_BINARY),
            PathBuf::from(constants::RUNTIME_STATE_DIR),
            PathBuf::from(constants::CONTAINER_LOG_DIR),
        )
    }
}

impl RuncRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override every path; used by tests.
    pub fn with_paths(binary: PathBuf, state_dir: PathBuf, log_dir: PathBuf) -> Self {
        RuncRuntime {
            binary,
            state_dir,
            log_dir,
            invocation_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn invocation_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.invocation_locks
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(id)
    }

    fn container_log(&self, id: &str) -> GcsResult<PathBuf> {
        let dir = self.log_dir.join(id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| GcsError::io(format!("create log dir {}", dir.display()), e))?;
        Ok(dir.join("runc.log"))
    }

    fn global_log(&self) -> GcsResult<PathBuf> {
        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| GcsError::io(format!("create log dir {}", self.log_dir.display()), e))?;
        Ok(self.log_dir.join("global-runc.log"))
    }

    /// Invoke the binary and wait for it through the reaper. Returns captured
    /// stdout when `capture` is set; classifies failures from the log.
    async fn run(
        &self,
        id: &str,
        log: &Path,
        args: Vec<String>,
        stdio: [Stdio; 3],
        stdin_payload: Option<Vec<u8>>,
        capture: bool,
    ) -> GcsResult<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--log")
            .arg(log)
            .arg("--log-format")
            .arg("json")
            .args(&args);
        let [child_in, child_out, child_err] = stdio;
        if stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(child_in);
        }
        if capture {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(child_out);
        }
        cmd.stderr(child_err);

        tracing::debug!(runtime = %self.binary.display(), ?args, "invoking runtime");
        let mut child = cmd
            .spawn()
            .map_err(|e| GcsError::io(format!("spawn {}", self.binary.display()), e))?;
        let status_rx = Reaper::global().wait(child.id() as i32);

        if let Some(payload) = stdin_payload {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            tokio::task::spawn_blocking(move || {
                let _ = stdin.write_all(&payload);
            })
            .await
            .map_err(|e| GcsError::Unexpected(format!("stdin writer task: {}", e)))?;
        }

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
            .map_err(|_| GcsError::Unexpected("reaper dropped runtime exit".to_string()))?;
        if status != 0 {
            return Err(self.error_from_log(id, log, status));
        }
        Ok(stdout)
    }

    fn error_from_log(&self, id: &str, log: &Path, status: i32) -> GcsError {
        let contents = std::fs::read_to_string(log).unwrap_or_default();
        match last_error_in_log(&contents) {
            Some(msg) => {
                tracing::debug!(container_id = %id, %msg, "runtime reported error");
                classify_runtime_error(&msg, id)
            }
            None => GcsError::Runtime(format!(
                "runtime exited with status {} and no log entry",
                status
            )),
        }
    }

    /// Create the guest-side stdio endpoints and the matching `Stdio` trio
    /// to hand the runtime invocation.
    fn prepare_stdio(
        &self,
        socket_dir: &Path,
        request: StdioRequest,
    ) -> GcsResult<(StdioSetup, [Stdio; 3])> {
        if request.terminal {
            let socket_path = socket_dir.join("console.sock");
            let listener = UnixListener::bind(&socket_path).map_err(|e| {
                GcsError::io(format!("bind console socket {}", socket_path.display()), e)
            })?;
            return Ok((
                StdioSetup::Console {
                    listener,
                    socket_path,
                },
                [Stdio::null(), Stdio::null(), Stdio::null()],
            ));
        }

        let mut kept = GuestIo::Pipes {
            stdin: None,
            stdout: None,
            stderr: None,
        };
        let GuestIo::Pipes {
            stdin,
            stdout,
            stderr,
        } = &mut kept
        else {
            unreachable!()
        };
        let mut child: [Stdio; 3] = [Stdio::null(), Stdio::null(), Stdio::null()];
        if request.stdin {
            let (r, w) = os_pipe()?;
            child[0] = Stdio::from(r);
            *stdin = Some(w);
        }
        if request.stdout {
            let (r, w) = os_pipe()?;
            child[1] = Stdio::from(w);
            *stdout = Some(r);
        }
        if request.stderr {
            let (r, w) = os_pipe()?;
            child[2] = Stdio::from(w);
            *stderr = Some(r);
        }
        Ok((StdioSetup::Pipes(kept), child))
    }

    /// Resolve the prepared stdio into the final guest io, accepting the
    /// console connection when a terminal was requested.
    async fn finish_stdio(&self, setup: StdioSetup) -> GcsResult<GuestIo> {
        match setup {
            StdioSetup::Pipes(io) => Ok(io),
            StdioSetup::Console { listener, .. } => {
                let master =
                    tokio::task::spawn_blocking(move || receive_console_master(listener))
                        .await
                        .map_err(|e| GcsError::Unexpected(format!("console task: {}", e)))??;
                Ok(GuestIo::Tty { master })
            }
        }
    }

    /// Move the per-process temp directory to its pid-named home.
    fn commit_process_dir(&self, id: &str, tmp: tempfile::TempDir, pid: u32) -> GcsResult<PathBuf> {
        let target = self.container_dir(id).join(pid.to_string());
        let kept = tmp.into_path();
        std::fs::rename(&kept, &target).map_err(|e| {
            GcsError::io(
                format!("rename {} to {}", kept.display(), target.display()),
                e,
            )
        })?;
        Ok(target)
    }
}

enum StdioSetup {
    Pipes(GuestIo),
    Console {
        listener: UnixListener,
        socket_path: PathBuf,
    },
}

impl StdioSetup {
    fn console_arg(&self) -> Option<&Path> {
        match self {
            StdioSetup::Console { socket_path, .. } => Some(socket_path),
            StdioSetup::Pipes(_) => None,
        }
    }
}

/// Accept the runtime's console connection and receive the PTY master via
/// SCM_RIGHTS.
fn receive_console_master(listener: UnixListener) -> GcsResult<OwnedFd> {
    let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
    let n = poll(&mut fds, PollTimeout::from(CONSOLE_ACCEPT_TIMEOUT_MS))
        .map_err(|e| GcsError::io("poll console socket", e.into()))?;
    if n == 0 {
        return Err(GcsError::Timeout);
    }
    let (stream, _) = listener
        .accept()
        .map_err(|e| GcsError::io("accept console socket", e))?;

    let mut data = [0u8; 256];
    let mut iov = [std::io::IoSliceMut::new(&mut data)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(|e| GcsError::io("receive console master", e.into()))?;
    for cmsg in msg
        .cmsgs()
        .map_err(|e| GcsError::io("parse console control message", e.into()))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: SCM_RIGHTS installed a fresh fd we now own.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(GcsError::Unexpected(
        "console socket carried no file descriptor".to_string(),
    ))
}

#[async_trait]
impl Runtime for RuncRuntime {
    async fn create(
        &self,
        id: &str,
        bundle: &Path,
        options: CreateOptions,
    ) -> GcsResult<ProcessHandle> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;

        // Children of the runtime must re-parent to us, not to pid 1.
        nix::sys::prctl::set_child_subreaper(true)
            .map_err(|e| GcsError::io("set child subreaper", e.into()))?;

        // Materialize the working directory inside the rootfs; the runtime
        // refuses to start a process whose cwd is missing. Best effort: the
        // rootfs may be read-only with the directory already present.
        if let Some(cwd) = &options.working_dir {
            let path = bundle.join("rootfs").join(cwd.trim_start_matches('/'));
            if let Err(e) = std::fs::create_dir_all(&path) {
                tracing::debug!(path = %path.display(), error = %e, "could not materialize cwd");
            }
        }

        let container_dir = self.container_dir(id);
        std::fs::create_dir_all(&container_dir)
            .map_err(|e| GcsError::io(format!("create {}", container_dir.display()), e))?;
        let tmp = tempfile::Builder::new()
            .prefix("proc-")
            .tempdir_in(&container_dir)
            .map_err(|e| GcsError::io("create process temp dir", e))?;
        let pid_file = tmp.path().join("pid");

        let (setup, child_stdio) = self.prepare_stdio(tmp.path(), options.stdio)?;
        let mut args = vec![
            "create".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
            "--pid-file".to_string(),
            pid_file.display().to_string(),
        ];
        if let Some(socket) = setup.console_arg() {
            args.push("--console-socket".to_string());
            args.push(socket.display().to_string());
        }
        args.push(id.to_string());

        let log = self.container_log(id)?;
        self.run(id, &log, args, child_stdio, None, false).await?;
        let io = self.finish_stdio(setup).await?;

        let pid = read_pid_file(&pid_file)?;
        self.commit_process_dir(id, tmp, pid)?;
        std::fs::write(container_dir.join("initpid"), pid.to_string())
            .map_err(|e| GcsError::io("write initpid", e))?;

        tracing::info!(container_id = %id, pid, "container created");
        Ok(ProcessHandle { pid, io })
    }

    async fn start(&self, id: &str) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        self.run(
            id,
            &log,
            vec!["start".to_string(), id.to_string()],
            null_stdio(),
            None,
            false,
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        process: &oci_spec::runtime::Process,
        stdio: StdioRequest,
    ) -> GcsResult<ProcessHandle> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;

        let container_dir = self.container_dir(id);
        std::fs::create_dir_all(&container_dir)
            .map_err(|e| GcsError::io(format!("create {}", container_dir.display()), e))?;
        let tmp = tempfile::Builder::new()
            .prefix("proc-")
            .tempdir_in(&container_dir)
            .map_err(|e| GcsError::io("create process temp dir", e))?;
        let pid_file = tmp.path().join("pid");
        let process_file = tmp.path().join("process.json");
        let doc = serde_json::to_vec(process)
            .map_err(|e| GcsError::json("serialize process document", e))?;
        std::fs::write(&process_file, doc)
            .map_err(|e| GcsError::io("write process document", e))?;

        let (setup, child_stdio) = self.prepare_stdio(tmp.path(), stdio)?;
        let mut args = vec![
            "exec".to_string(),
            "-d".to_string(),
            "--process".to_string(),
            process_file.display().to_string(),
            "--pid-file".to_string(),
            pid_file.display().to_string(),
        ];
        if let Some(socket) = setup.console_arg() {
            args.push("--console-socket".to_string());
            args.push(socket.display().to_string());
        }
        args.push(id.to_string());

        let log = self.container_log(id)?;
        self.run(id, &log, args, child_stdio, None, false).await?;
        let io = self.finish_stdio(setup).await?;

        let pid = read_pid_file(&pid_file)?;
        self.commit_process_dir(id, tmp, pid)?;

        tracing::info!(container_id = %id, pid, "process executed in container");
        Ok(ProcessHandle { pid, io })
    }

    async fn kill(&self, id: &str, signal: i32) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;

        let mut args = vec!["kill".to_string()];
        // Terminal signals must vacate the whole cgroup, not just init.
        if signal == libc::SIGTERM || signal == libc::SIGKILL {
            args.push("--all".to_string());
        }
        args.push(id.to_string());
        args.push(signal.to_string());

        let log = self.container_log(id)?;
        self.run(id, &log, args, null_stdio(), None, false).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        self.run(
            id,
            &log,
            vec!["delete".to_string(), id.to_string()],
            null_stdio(),
            None,
            false,
        )
        .await?;
        let _ = std::fs::remove_dir_all(self.container_dir(id));
        self.invocation_locks.lock().remove(id);
        Ok(())
    }

    async fn pause(&self, id: &str) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        self.run(
            id,
            &log,
            vec!["pause".to_string(), id.to_string()],
            null_stdio(),
            None,
            false,
        )
        .await?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        self.run(
            id,
            &log,
            vec!["resume".to_string(), id.to_string()],
            null_stdio(),
            None,
            false,
        )
        .await?;
        Ok(())
    }

    async fn state(&self, id: &str) -> GcsResult<ContainerState> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        let out = self
            .run(
                id,
                &log,
                vec!["state".to_string(), id.to_string()],
                null_stdio(),
                None,
                true,
            )
            .await?;
        serde_json::from_str(&out).map_err(|e| GcsError::json("parse container state", e))
    }

    async fn list(&self) -> GcsResult<Vec<ContainerState>> {
        let log = self.global_log()?;
        let out = self
            .run(
                "",
                &log,
                vec!["list".to_string(), "-f".to_string(), "json".to_string()],
                null_stdio(),
                None,
                true,
            )
            .await?;
        if out.trim().is_empty() || out.trim() == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(&out).map_err(|e| GcsError::json("parse container list", e))
    }

    async fn ps(&self, id: &str) -> GcsResult<Vec<u32>> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;
        let log = self.container_log(id)?;
        let out = self
            .run(
                id,
                &log,
                vec![
                    "ps".to_string(),
                    "-f".to_string(),
                    "json".to_string(),
                    id.to_string(),
                ],
                null_stdio(),
                None,
                true,
            )
            .await?;
        serde_json::from_str(&out).map_err(|e| GcsError::json("parse process list", e))
    }

    async fn update(&self, id: &str, resources: &serde_json::Value) -> GcsResult<()> {
        let lock = self.invocation_lock(id);
        let _guard = lock.lock().await;

        let payload = serde_json::to_vec(resources)
            .map_err(|e| GcsError::json("serialize resources", e))?;
        let log = self.container_log(id)?;
        self.run(
            id,
            &log,
            vec![
                "update".to_string(),
                "--resources".to_string(),
                "-".to_string(),
                id.to_string(),
            ],
            null_stdio(),
            Some(payload),
            false,
        )
        .await?;
        Ok(())
    }
}

fn null_stdio() -> [Stdio; 3] {
    [Stdio::null(), Stdio::null(), Stdio::null()]
}

fn read_pid_file(path: &Path) -> GcsResult<u32> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| GcsError::io(format!("read pid file {}", path.display()), e))?;
    text.trim()
        .parse()
        .map_err(|_| GcsError::Unexpected(format!("malformed pid file contents {:?}", text)))
}
