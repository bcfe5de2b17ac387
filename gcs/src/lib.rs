//! Guest compute service: the in-VM agent a host orchestrator drives over a
//! vsock bridge to create, run, signal, and tear down OCI containers inside
//! a utility VM.
//!
//! Module map, roughly host-facing to kernel-facing:
//!
//! - [`bridge`]: framed request/response protocol and dispatch
//! - [`host`]: container registry, process lifecycles, notifications
//! - [`runtime`]: external OCI runtime driver and child reaping
//! - [`stdio`]: relays between host vsock connections and process stdio
//! - [`cgroup`]: memory hierarchy, thresholds, OOM events
//! - [`overlay`]: overlayfs assembly and kernel module installation
//! - [`transport`]: vsock dial/listen plumbing

pub mod bridge;
pub mod cgroup;
pub mod constants;
pub mod host;
pub mod overlay;
pub mod runtime;
pub mod stdio;
pub mod transport;
