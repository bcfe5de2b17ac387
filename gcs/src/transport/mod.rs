//! Vsock transport: dial host-side ports and accept stdio connections.
//!
//! There is no framing at this layer. A peer hanging up surfaces as a clean
//! end-of-stream on read and broken-pipe on the next write; callers treat
//! both as expected terminal conditions, not I/O failures.

use std::time::Duration;

use gcs_shared::{GcsError, GcsResult};

/// Dial attempts before giving up on a transiently unreachable port.
pub const DIAL_ATTEMPTS: u32 = 10;
/// Pause between dial attempts.
pub const DIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether a dial error is worth retrying: the host side may not have its
/// listener up yet, which surfaces as a connection timeout.
pub fn is_transient_dial_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::ConnectionRefused
    ) || err.raw_os_error() == Some(libc::ETIMEDOUT)
}

#[cfg(target_os = "linux")]
pub use linux::{dial, listen};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use tokio_vsock::{VsockAddr, VsockListener, VsockStream, VMADDR_CID_ANY, VMADDR_CID_HOST};

    /// Connect to the host on `port`, retrying transient timeouts with a
    /// short backoff. Other errors propagate immediately.
    pub async fn dial(port: u32) -> GcsResult<VsockStream> {
        let addr = VsockAddr::new(VMADDR_CID_HOST, port);
        let mut last_err = None;
        for attempt in 1..=DIAL_ATTEMPTS {
            match VsockStream::connect(addr).await {
                Ok(stream) => {
                    if attempt > 1 {
                        tracing::debug!(port, attempt, "vsock dial succeeded after retry");
                    }
                    return Ok(stream);
                }
                Err(e) if is_transient_dial_error(&e) => {
                    tracing::debug!(port, attempt, error = %e, "vsock dial timed out, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
                Err(e) => return Err(GcsError::io(format!("vsock dial port {:#x}", port), e)),
            }
        }
        Err(GcsError::io(
            format!("vsock dial port {:#x} after {} attempts", port, DIAL_ATTEMPTS),
            last_err.unwrap_or_else(|| std::io::ErrorKind::TimedOut.into()),
        ))
    }

    /// Listen on `port` for a single host-initiated connection.
    pub async fn listen(port: u32) -> GcsResult<VsockListener> {
        VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))
            .map_err(|e| GcsError::io(format!("vsock listen port {:#x}", port), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = std::io::Error::from_raw_os_error(libc::ETIMEDOUT);
        assert!(is_transient_dial_error(&err));
        let err = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert!(is_transient_dial_error(&err));
    }

    #[test]
    fn test_hard_errors_are_not_transient() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!is_transient_dial_error(&err));
        let err = std::io::Error::from_raw_os_error(libc::EADDRNOTAVAIL);
        assert!(!is_transient_dial_error(&err));
    }
}
