//! Typed request handlers, one per message identifier.
//!
//! Each handler decodes its body, performs the host operation, and returns
//! the serialized response. Failures propagate to the bridge, which turns
//! them into an error response carrying the request's activity id.

use std::sync::Arc;

use gcs_shared::messages::*;
use gcs_shared::protocol::MessageType;
use gcs_shared::{GcsError, GcsResult};

use crate::host::Host;

pub(super) async fn handle(
    host: &Arc<Host>,
    message_type: MessageType,
    body: &[u8],
) -> GcsResult<Vec<u8>> {
    match message_type {
        MessageType::Create => create(host, body).await,
        MessageType::Start => start(host, body).await,
        MessageType::ShutdownGraceful => shutdown(host, body, false).await,
        MessageType::ShutdownForced => shutdown(host, body, true).await,
        MessageType::ExecuteProcess => execute_process(host, body).await,
        MessageType::WaitForProcess => wait_for_process(host, body).await,
        MessageType::SignalProcess => signal_process(host, body).await,
        MessageType::ResizeConsole => resize_console(host, body).await,
        MessageType::GetProperties => get_properties(host, body).await,
        MessageType::ModifySettings => modify_settings(host, body).await,
        MessageType::DumpStacks => dump_stacks(host, body).await,
        MessageType::DeleteContainerState => delete_container_state(host, body).await,
        MessageType::NegotiateProtocol | MessageType::Notification => Err(
            GcsError::NotImplemented(format!("message type {:?}", message_type)),
        ),
    }
}

fn decode<'a, T: serde::Deserialize<'a>>(body: &'a [u8], what: &str) -> GcsResult<T> {
    serde_json::from_slice(body).map_err(|e| GcsError::json(what, e))
}

fn encode<T: serde::Serialize>(response: &T) -> GcsResult<Vec<u8>> {
    serde_json::to_vec(response).map_err(|e| GcsError::json("encode response", e))
}

async fn create(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: CreateRequest = decode(body, "create request")?;
    let pid = host
        .create_container(
            &request.base.activity_id,
            &request.base.container_id,
            &request.container_config,
        )
        .await?;
    encode(&CreateResponse {
        base: ResponseBase::ok(request.base.activity_id),
        process_id: pid,
    })
}

async fn start(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: StartRequest = decode(body, "start request")?;
    host.start_container(&request.base.container_id).await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}

async fn shutdown(host: &Arc<Host>, body: &[u8], force: bool) -> GcsResult<Vec<u8>> {
    let request: ShutdownRequest = decode(body, "shutdown request")?;
    host.shutdown(&request.base.container_id, force).await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}

async fn execute_process(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: ExecuteProcessRequest = decode(body, "execute process request")?;
    let pid = host
        .execute_process(
            &request.base.container_id,
            &request.process_parameters,
            request.stdio_relay_settings,
        )
        .await?;
    encode(&ExecuteProcessResponse {
        base: ResponseBase::ok(request.base.activity_id),
        process_id: pid,
    })
}

async fn wait_for_process(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: WaitForProcessRequest = decode(body, "wait request")?;
    let (process, exit_code) = host
        .wait_process(
            &request.base.container_id,
            request.process_id,
            request.timeout_in_ms,
        )
        .await?;
    // The host has its answer; let the relay go once this response is on
    // the wire. The writer queue preserves the ordering.
    process.signal_done();
    encode(&WaitForProcessResponse {
        base: ResponseBase::ok(request.base.activity_id),
        exit_code,
    })
}

async fn signal_process(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: SignalProcessRequest = decode(body, "signal request")?;
    host.signal_process(
        &request.base.container_id,
        request.process_id,
        request.options.signal,
    )
    .await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}

async fn resize_console(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: ResizeConsoleRequest = decode(body, "resize request")?;
    host.resize_console(
        &request.base.container_id,
        request.process_id,
        request.height,
        request.width,
    )
    .await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}

async fn get_properties(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: GetPropertiesRequest = decode(body, "properties request")?;
    let properties = host
        .get_properties(&request.base.container_id, &request.query)
        .await?;
    encode(&GetPropertiesResponse {
        base: ResponseBase::ok(request.base.activity_id),
        properties,
    })
}

async fn modify_settings(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: ModifySettingsRequest = decode(body, "modify settings request")?;
    host.modify_settings(&request).await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}

async fn dump_stacks(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: DumpStacksRequest = decode(body, "dump stacks request")?;
    encode(&DumpStacksResponse {
        base: ResponseBase::ok(request.base.activity_id),
        guest_stacks: host.dump_state(),
    })
}

async fn delete_container_state(host: &Arc<Host>, body: &[u8]) -> GcsResult<Vec<u8>> {
    let request: DeleteContainerStateRequest = decode(body, "delete state request")?;
    host.delete_container_state(&request.base.container_id)
        .await?;
    encode(&ResponseBase::ok(request.base.activity_id))
}
