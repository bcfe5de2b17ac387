//! The bridge: framed request/response channel between host and guest.
//!
//! One reader task pulls frames off the transport strictly in order; every
//! request is dispatched on its own task; a single writer task serializes
//! `(header, body)` pairs from a queue so response frames never interleave.
//! Notifications ride the same queue, which is what orders them before a
//! container's terminal notification and keeps publish non-blocking for the
//! caller.
//!
//! Shutdown: accepting `shutdown(uVM)` flips the quit signal. The response
//! is already in the writer queue by then; the reader stops issuing new
//! requests, queued responses flush, and a grace timer closes the transport
//! if draining stalls.

mod handlers;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::Instrument;

use gcs_shared::messages::{ContainerNotification, ErrorRecord, MessageBase, ResponseBase};
use gcs_shared::protocol::{
    self, read_frame, write_frame, MessageHeader, MessageType, PROTOCOL_VERSION_INVALID,
    RESPONSE_FLAG,
};
use gcs_shared::{GcsError, GcsResult};

use crate::constants;
use crate::host::Host;

/// One outbound frame: response or notification.
struct OutFrame {
    message_type: u32,
    id: u32,
    body: Vec<u8>,
}

/// Per-connection state shared by the reader and its handler tasks.
struct Session {
    host: Arc<Host>,
    version: AtomicU32,
    writer_tx: mpsc::Sender<OutFrame>,
}

/// Run the bridge over a connected transport until the host hangs up or a
/// uVM shutdown is accepted.
pub async fn serve<R, W>(
    host: Arc<Host>,
    reader: R,
    writer: W,
    mut notify_rx: mpsc::Receiver<ContainerNotification>,
) -> GcsResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (writer_tx, writer_rx) = mpsc::channel::<OutFrame>(64);
    let writer_task = tokio::spawn(write_loop(writer, writer_rx));

    // Notifications fan into the same writer queue; publish never blocks
    // the producer beyond the queue itself.
    let notify_tx = writer_tx.clone();
    let notify_task = tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            let body = match serde_json::to_vec(&notification) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(error = %e, "could not encode notification");
                    continue;
                }
            };
            let frame = OutFrame {
                message_type: MessageType::Notification as u32,
                id: 0,
                body,
            };
            if notify_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let session = Arc::new(Session {
        host: host.clone(),
        version: AtomicU32::new(PROTOCOL_VERSION_INVALID),
        writer_tx,
    });

    let result = read_loop(session, reader, host.quit_signal()).await;

    // Let in-flight handlers finish and the writer drain; force the issue
    // after the grace period.
    notify_task.abort();
    let grace = Duration::from_secs(constants::BRIDGE_SHUTDOWN_GRACE_SECS);
    if tokio::time::timeout(grace, writer_task).await.is_err() {
        tracing::warn!("bridge writer did not drain within the grace period");
    }
    result
}

async fn read_loop<R>(
    session: Arc<Session>,
    mut reader: R,
    mut quit: tokio::sync::watch::Receiver<bool>,
) -> GcsResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = quit.wait_for(|q| *q) => {
                tracing::info!("shutdown accepted, bridge stops reading");
                return Ok(());
            }
            frame = read_frame(&mut reader) => frame?,
        };
        let Some((header, body)) = frame else {
            tracing::info!("host closed the bridge connection");
            return Ok(());
        };

        let session = session.clone();
        tokio::spawn(async move {
            handle_frame(session, header, body).await;
        });
    }
}

/// Decode the host's hex-encoded remote trace context: 16 bytes of trace id
/// followed by 8 bytes of parent span id. Malformed contexts are dropped.
fn remote_span_context(hex_ctx: &str) -> Option<(String, String)> {
    let bytes = hex::decode(hex_ctx).ok()?;
    if bytes.len() < 24 {
        return None;
    }
    Some((hex::encode(&bytes[..16]), hex::encode(&bytes[16..24])))
}

async fn handle_frame(session: Arc<Session>, header: MessageHeader, body: Vec<u8>) {
    // Enough of the body to attribute errors, best effort.
    let base: MessageBase = serde_json::from_slice(&body).unwrap_or_default();
    let (trace_id, parent_span_id) = base
        .span_context
        .as_deref()
        .and_then(remote_span_context)
        .unzip();
    let span = tracing::info_span!(
        "request",
        message_type = format_args!("{:#x}", header.message_type),
        id = header.id,
        activity_id = %base.activity_id,
        container_id = %base.container_id,
        trace_id = trace_id.as_deref().unwrap_or(""),
        parent_span_id = parent_span_id.as_deref().unwrap_or(""),
    );

    let response = async {
        let version = session.version.load(Ordering::SeqCst);
        match MessageType::from_code(header.message_type) {
            Some(MessageType::NegotiateProtocol) if version == PROTOCOL_VERSION_INVALID => {
                negotiate(&session, &body)
            }
            Some(MessageType::Notification) | None => Err(GcsError::NotImplemented(format!(
                "message type {:#x}",
                header.message_type
            ))),
            Some(_) if version == PROTOCOL_VERSION_INVALID => Err(GcsError::NotImplemented(
                "protocol version not negotiated".to_string(),
            )),
            Some(msg) if version >= 4 => handlers::handle(&session.host, msg, &body).await,
            Some(msg) => Err(GcsError::NotImplemented(format!(
                "message type {:?} at protocol version {}",
                msg, version
            ))),
        }
    }
    .instrument(span.clone())
    .await;

    let body = match response {
        Ok(body) => body,
        Err(e) => {
            span.in_scope(|| tracing::warn!(error = %e, "request failed"));
            error_body(&base.activity_id, &e)
        }
    };
    let frame = OutFrame {
        message_type: header.message_type | RESPONSE_FLAG,
        id: header.id,
        body,
    };
    let _ = session.writer_tx.send(frame).await;
}

/// Protocol negotiation; the only handler reachable before a version is
/// chosen.
fn negotiate(session: &Session, body: &[u8]) -> GcsResult<Vec<u8>> {
    use gcs_shared::messages::{GuestCapabilities, NegotiateProtocolRequest, NegotiateProtocolResponse};

    let request: NegotiateProtocolRequest =
        serde_json::from_slice(body).map_err(|e| GcsError::json("negotiate request", e))?;
    if request.maximum_version < protocol::PROTOCOL_VERSION_MIN
        || request.minimum_version > protocol::PROTOCOL_VERSION_MAX
    {
        return Err(GcsError::UnsupportedProtocolVersion(request.maximum_version));
    }
    let version = protocol::negotiate_version(request.maximum_version)?;
    session.version.store(version, Ordering::SeqCst);
    tracing::info!(version, "protocol negotiated");

    let response = NegotiateProtocolResponse {
        base: ResponseBase::ok(request.base.activity_id),
        version,
        capabilities: GuestCapabilities::default(),
    };
    serde_json::to_vec(&response).map_err(|e| GcsError::json("negotiate response", e))
}

/// Build the failure body: hresult from the outermost error plus one
/// diagnostic record rooted in this module.
fn error_body(activity_id: &str, err: &GcsError) -> Vec<u8> {
    let hresult = err.hresult();
    let mut stack = Vec::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        stack.push(e.to_string());
        cur = e.source();
    }
    let response = ResponseBase {
        result: hresult,
        activity_id: activity_id.to_string(),
        error_message: Some(err.to_string()),
        error_records: vec![ErrorRecord {
            result: hresult,
            message: err.to_string(),
            module_name: "gcs".to_string(),
            stack_trace: Some(stack.join("\ncaused by: ")),
        }],
    };
    serde_json::to_vec(&response).unwrap_or_else(|_| {
        format!(
            r#"{{"result":{},"activity_id":"{}"}}"#,
            gcs_shared::errors::HR_UNEXPECTED,
            activity_id
        )
        .into_bytes()
    })
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<OutFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let header = MessageHeader::new(frame.message_type, frame.id, frame.body.len());
        if let Err(e) = write_frame(&mut writer, &header, &frame.body).await {
            tracing::error!(error = %e, "bridge write failed");
            return;
        }
    }
}
