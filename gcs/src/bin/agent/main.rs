//! Guest compute service agent binary.
//!
//! Brings up the in-VM side of the bridge: child reaping, the memory cgroup
//! hierarchy, and the framed protocol loop over vsock (or the inherited
//! stdin/stdout when `--use-inouterr` is given).

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gcs::bridge;
use gcs::cgroup::{self, CgroupController, MemoryConfig};
use gcs::host::Host;
use gcs::runtime::reaper::Reaper;
use gcs::runtime::runc::RuncRuntime;
use gcs::stdio::VsockDialer;
use gcs_shared::protocol::COMMAND_PORT;
use gcs_shared::{GcsError, GcsResult};

use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Guest compute service agent for utility VMs")]
struct AgentArgs {
    /// Use the inherited stdin/stdout as the bridge transport instead of
    /// listening on the vsock command port.
    #[arg(long)]
    use_inouterr: bool,

    /// Vsock port the host connects the bridge on.
    #[arg(long, default_value_t = COMMAND_PORT)]
    port: u32,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> GcsResult<()> {
    let args = AgentArgs::parse();
    init_logging(&args.log_level);

    // All child reaping funnels through one thread, armed before anything
    // can fork.
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| GcsError::io("set child subreaper", e.into()))?;
    Reaper::global().start();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| GcsError::io("build async runtime", e))?;
    runtime.block_on(run(args))
}

async fn run(args: AgentArgs) -> GcsResult<()> {
    let (notify_tx, notify_rx) = tokio::sync::mpsc::channel(64);

    let total_ram = cgroup::total_ram_bytes()?;
    let controller =
        CgroupController::setup(&MemoryConfig::default(), total_ram, notify_tx.clone())?;

    let host = Host::new(
        Arc::new(RuncRuntime::new()),
        Arc::new(VsockDialer),
        notify_tx,
    );
    host.set_gcs_cgroup_procs(
        std::path::Path::new(gcs::constants::CGROUP_MEMORY_ROOT)
            .join(gcs::constants::CGROUP_GCS)
            .join("cgroup.procs"),
    );

    tracing::info!(
        use_inouterr = args.use_inouterr,
        port = format_args!("{:#x}", args.port),
        "guest compute service starting"
    );

    let result = if args.use_inouterr {
        bridge::serve(host, tokio::io::stdin(), tokio::io::stdout(), notify_rx).await
    } else {
        serve_vsock(host, args.port, notify_rx).await
    };

    controller.teardown();
    tracing::info!("guest compute service exiting");
    result
}

#[cfg(target_os = "linux")]
async fn serve_vsock(
    host: Arc<Host>,
    port: u32,
    notify_rx: tokio::sync::mpsc::Receiver<gcs_shared::messages::ContainerNotification>,
) -> GcsResult<()> {
    let listener = gcs::transport::listen(port).await?;
    let (stream, addr) = listener
        .accept()
        .await
        .map_err(|e| GcsError::io("accept bridge connection", e))?;
    tracing::info!(cid = addr.cid(), "host connected to bridge");
    let (read_half, write_half) = stream.into_split();
    bridge::serve(host, read_half, write_half, notify_rx).await
}

#[cfg(not(target_os = "linux"))]
async fn serve_vsock(
    _host: Arc<Host>,
    _port: u32,
    _notify_rx: tokio::sync::mpsc::Receiver<gcs_shared::messages::ContainerNotification>,
) -> GcsResult<()> {
    Err(GcsError::NotImplemented(
        "vsock transport is linux-only; use --use-inouterr".to_string(),
    ))
}
