//! Stdio relays: move bytes between host vsock connections and a process's
//! terminal master or stdin/stdout/stderr pipes.
//!
//! Each stream gets one copier task. Copiers finish on EOF from either side:
//! a host hang-up on stdin half-closes the guest side (the container sees
//! EOF), and process exit drains the remaining output to the host before the
//! host-side connection is shut down. [`StdioRelay::wait`] blocks until
//! every copier is done, which is what orders "output delivered" before
//! "exit published".

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;

use gcs_shared::{GcsError, GcsResult};

/// Any full-duplex byte stream to the host. Production code passes vsock
/// streams; tests pass in-memory duplexes.
pub trait HostStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> HostStream for T {}

/// Host connections for one process; any subset may be absent.
#[derive(Default)]
pub struct StdioConnections {
    pub stdin: Option<Box<dyn HostStream>>,
    pub stdout: Option<Box<dyn HostStream>>,
    pub stderr: Option<Box<dyn HostStream>>,
}

/// How host stdio connections are established. The production dialer opens
/// vsock connections to the ports in the relay settings; tests substitute
/// in-memory duplexes.
#[async_trait::async_trait]
pub trait StdioDialer: Send + Sync {
    async fn connect(
        &self,
        settings: &gcs_shared::messages::StdioRelaySettings,
    ) -> GcsResult<StdioConnections>;
}

/// Dials the host over vsock, one connection per present port.
pub struct VsockDialer;

#[cfg(target_os = "linux")]
#[async_trait::async_trait]
impl StdioDialer for VsockDialer {
    async fn connect(
        &self,
        settings: &gcs_shared::messages::StdioRelaySettings,
    ) -> GcsResult<StdioConnections> {
        let mut conns = StdioConnections::default();
        if let Some(port) = settings.stdin {
            conns.stdin = Some(Box::new(crate::transport::dial(port).await?));
        }
        if let Some(port) = settings.stdout {
            conns.stdout = Some(Box::new(crate::transport::dial(port).await?));
        }
        if let Some(port) = settings.stderr {
            conns.stderr = Some(Box::new(crate::transport::dial(port).await?));
        }
        Ok(conns)
    }
}

/// The guest side of a process's stdio.
pub enum GuestIo {
    /// PTY master shared by stdin and stdout; stderr is absent by contract.
    Tty { master: OwnedFd },
    /// Independent pipes: our write end of the child's stdin and read ends
    /// of its stdout/stderr.
    Pipes {
        stdin: Option<OwnedFd>,
        stdout: Option<OwnedFd>,
        stderr: Option<OwnedFd>,
    },
}

/// Nonblocking `AsyncRead`/`AsyncWrite` over a raw pipe or PTY fd.
pub struct GuestFd {
    inner: AsyncFd<OwnedFd>,
}

impl GuestFd {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(GuestFd {
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl AsyncRead for GuestFd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_fd(), unfilled).map_err(io::Error::from)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // A closed PTY slave surfaces as EIO on the master; that is
                // the terminal's EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for GuestFd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                nix::unistd::write(inner.get_ref().as_fd(), data).map_err(io::Error::from)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Running relay for one process. Owns the copier tasks and, for terminals,
/// a duplicate of the master for resize requests.
#[derive(Debug)]
pub struct StdioRelay {
    tasks: Vec<JoinHandle<()>>,
    tty: Option<OwnedFd>,
}

impl StdioRelay {
    /// Wire host connections to the guest side and start copying.
    pub fn start(conns: StdioConnections, io: GuestIo) -> GcsResult<StdioRelay> {
        let mut tasks = Vec::new();
        let mut tty = None;

        match io {
            GuestIo::Tty { master } => {
                let resize_fd = master
                    .try_clone()
                    .map_err(|e| GcsError::io("duplicate pty master", e))?;
                tty = Some(resize_fd);
                // stdin and stdout share the master; duplicate so each
                // copier owns its handle.
                if let Some(host_in) = conns.stdin {
                    let writer = GuestFd::new(
                        master
                            .try_clone()
                            .map_err(|e| GcsError::io("duplicate pty master", e))?,
                    )
                    .map_err(|e| GcsError::io("pty master nonblocking", e))?;
                    tasks.push(tokio::spawn(copy_host_to_guest(host_in, writer)));
                }
                if let Some(host_out) = conns.stdout {
                    let reader = GuestFd::new(master)
                        .map_err(|e| GcsError::io("pty master nonblocking", e))?;
                    tasks.push(tokio::spawn(copy_guest_to_host(reader, host_out)));
                }
            }
            GuestIo::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                if let (Some(host_in), Some(pipe)) = (conns.stdin, stdin) {
                    let writer =
                        GuestFd::new(pipe).map_err(|e| GcsError::io("stdin pipe nonblocking", e))?;
                    tasks.push(tokio::spawn(copy_host_to_guest(host_in, writer)));
                }
                if let (Some(host_out), Some(pipe)) = (conns.stdout, stdout) {
                    let reader = GuestFd::new(pipe)
                        .map_err(|e| GcsError::io("stdout pipe nonblocking", e))?;
                    tasks.push(tokio::spawn(copy_guest_to_host(reader, host_out)));
                }
                if let (Some(host_err), Some(pipe)) = (conns.stderr, stderr) {
                    let reader = GuestFd::new(pipe)
                        .map_err(|e| GcsError::io("stderr pipe nonblocking", e))?;
                    tasks.push(tokio::spawn(copy_guest_to_host(reader, host_err)));
                }
            }
        }

        Ok(StdioRelay { tasks, tty })
    }

    /// Wait for every copier to finish. Idempotent; later calls return
    /// immediately.
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Resize the process's terminal. Errors if the process has no tty.
    pub fn resize(&self, rows: u16, cols: u16) -> GcsResult<()> {
        let Some(fd) = &self.tty else {
            return Err(GcsError::InvalidArgument(
                "process has no terminal".to_string(),
            ));
        };
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is a valid PTY master for the lifetime of self; the
        // winsize struct outlives the call.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(GcsError::io(
                "resize terminal",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

/// Host → guest: copy until the host hangs up, then drop the guest handle.
/// For a pipe that closes the child's stdin write end (the container sees
/// EOF); for the PTY only this duplicate of the master is released.
async fn copy_host_to_guest(mut host: Box<dyn HostStream>, mut guest: GuestFd) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        match host.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if guest.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Guest → host: copy until the process side EOFs, then shut down the host
/// write half so the host observes end-of-stream.
async fn copy_guest_to_host(mut guest: GuestFd, mut host: Box<dyn HostStream>) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        match guest.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if host.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = host.shutdown().await;
}

/// Create a unidirectional pipe, returning `(read end, write end)`.
pub fn os_pipe() -> GcsResult<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe().map_err(|e| GcsError::io("create pipe", e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        os_pipe().unwrap()
    }

    #[tokio::test]
    async fn test_guest_output_reaches_host_then_eof() {
        let (host_side, agent_side) = duplex(1024);
        let (read_end, write_end) = pipe_pair();

        let conns = StdioConnections {
            stdout: Some(Box::new(agent_side)),
            ..Default::default()
        };
        let io = GuestIo::Pipes {
            stdin: None,
            stdout: Some(read_end),
            stderr: None,
        };
        let mut relay = StdioRelay::start(conns, io).unwrap();

        // "Process" writes then closes its stdout.
        nix::unistd::write(write_end.as_fd(), b"hello").unwrap();
        drop(write_end);

        relay.wait().await;

        let mut host = host_side;
        let mut out = Vec::new();
        host.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_host_stdin_eof_closes_pipe() {
        let (host_side, agent_side) = duplex(1024);
        let (read_end, write_end) = pipe_pair();

        let conns = StdioConnections {
            stdin: Some(Box::new(agent_side)),
            ..Default::default()
        };
        let io = GuestIo::Pipes {
            stdin: Some(write_end),
            stdout: None,
            stderr: None,
        };
        let mut relay = StdioRelay::start(conns, io).unwrap();

        // Host sends bytes then hangs up.
        let mut host = host_side;
        host.write_all(b"input").await.unwrap();
        drop(host);

        relay.wait().await;

        // The child's stdin read end sees the data then EOF.
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(read_end.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"input");
        assert_eq!(nix::unistd::read(read_end.as_fd(), &mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_are_independent() {
        let (host_out, agent_out) = duplex(1024);
        let (host_err, agent_err) = duplex(1024);
        let (out_r, out_w) = pipe_pair();
        let (err_r, err_w) = pipe_pair();

        let conns = StdioConnections {
            stdin: None,
            stdout: Some(Box::new(agent_out)),
            stderr: Some(Box::new(agent_err)),
        };
        let io = GuestIo::Pipes {
            stdin: None,
            stdout: Some(out_r),
            stderr: Some(err_r),
        };
        let mut relay = StdioRelay::start(conns, io).unwrap();

        nix::unistd::write(out_w.as_fd(), b"to-stdout").unwrap();
        nix::unistd::write(err_w.as_fd(), b"to-stderr").unwrap();
        drop(out_w);
        drop(err_w);
        relay.wait().await;

        let mut buf = Vec::new();
        let mut host_out = host_out;
        host_out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"to-stdout");

        let mut buf = Vec::new();
        let mut host_err = host_err;
        host_err.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"to-stderr");
    }

    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let (_host, agent) = duplex(64);
        let (read_end, write_end) = pipe_pair();
        let conns = StdioConnections {
            stdout: Some(Box::new(agent)),
            ..Default::default()
        };
        let io = GuestIo::Pipes {
            stdin: None,
            stdout: Some(read_end),
            stderr: None,
        };
        let mut relay = StdioRelay::start(conns, io).unwrap();
        drop(write_end);
        relay.wait().await;
        relay.wait().await; // no tasks left; returns immediately
    }

    #[tokio::test]
    async fn test_resize_without_tty_errors() {
        let relay = StdioRelay {
            tasks: Vec::new(),
            tty: None,
        };
        let err = relay.resize(24, 80).unwrap_err();
        assert!(err.to_string().contains("no terminal"));
    }
}
