//! JSON bodies for every bridge request, response, and notification.
//!
//! Field names here are the wire contract. Every request body embeds
//! [`MessageBase`]; every response embeds [`ResponseBase`]. Response-specific
//! fields are flattened alongside the base.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Container id the host uses to address the uVM itself. Signal and shutdown
/// paths treat it as a sentinel rather than a registry key.
pub const UVM_CONTAINER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Fields present in every request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBase {
    pub activity_id: String,
    pub container_id: String,
    /// Hex-encoded remote trace context, when the host is propagating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_context: Option<String>,
}

/// One entry of a response's diagnostic stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub result: i32,
    pub message: String,
    pub module_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Fields present in every response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseBase {
    /// Hresult; zero on success.
    pub result: i32,
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_records: Vec<ErrorRecord>,
}

impl ResponseBase {
    pub fn ok(activity_id: impl Into<String>) -> Self {
        ResponseBase {
            result: 0,
            activity_id: activity_id.into(),
            error_message: None,
            error_records: Vec::new(),
        }
    }
}

// ====================
// Negotiation
// ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateProtocolRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub minimum_version: u32,
    pub maximum_version: u32,
}

/// Feature switches the guest advertises during negotiation. The host gates
/// request construction on these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestCapabilities {
    pub signal_process_supported: bool,
    pub dump_stacks_supported: bool,
    pub delete_container_state_supported: bool,
}

impl Default for GuestCapabilities {
    fn default() -> Self {
        GuestCapabilities {
            signal_process_supported: true,
            dump_stacks_supported: true,
            delete_container_state_supported: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateProtocolResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub version: u32,
    pub capabilities: GuestCapabilities,
}

// ====================
// Container lifecycle
// ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    /// Oldest settings schema the create path accepts.
    pub const V2_1: SchemaVersion = SchemaVersion { major: 2, minor: 1 };

    pub fn supports(&self, required: SchemaVersion) -> bool {
        (self.major, self.minor) >= (required.major, required.minor)
    }
}

/// Settings carried by a create request, schema-version tagged. The init
/// process is materialized at create time, so its stdio ports ride here;
/// start merely acknowledges, and the first execute against the container
/// releases init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedContainerSettings {
    pub schema_version: SchemaVersion,
    pub oci_bundle_path: String,
    pub oci_specification: oci_spec::runtime::Spec,
    #[serde(default)]
    pub stdio_relay_settings: StdioRelaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    /// JSON-encoded [`HostedContainerSettings`]; nested encoding keeps the
    /// outer body schema stable across settings revisions.
    pub container_config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    /// Pid of the init process the create materialized.
    pub process_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(flatten)]
    pub base: MessageBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(flatten)]
    pub base: MessageBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteContainerStateRequest {
    #[serde(flatten)]
    pub base: MessageBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPropertiesRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    /// Empty string or a JSON [`PropertyQuery`].
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyQuery {
    #[serde(default)]
    pub property_types: Vec<PropertyType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    ProcessList,
    Statistics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub process_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_list: Option<Vec<ProcessDetails>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPropertiesResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub properties: ContainerProperties,
}

// ====================
// Modify settings
// ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyResourceType {
    Mount,
    NetworkModifyRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyRequestType {
    Add,
    Remove,
}

/// Overlay assembly parameters for a `Mount` resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSettings {
    #[serde(default)]
    pub lower_paths: Vec<String>,
    #[serde(default)]
    pub upper_path: Option<String>,
    #[serde(default)]
    pub work_path: Option<String>,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifySettingsRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub resource_type: ModifyResourceType,
    pub request_type: ModifyRequestType,
    #[serde(default)]
    pub settings: serde_json::Value,
}

// ====================
// Processes
// ====================

/// Parameters for spawning an init, exec, or external process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessParameters {
    #[serde(default)]
    pub command_args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: String,
    /// Allocate a PTY and relay through its master instead of pipes.
    #[serde(default)]
    pub emulate_console: bool,
    /// Run in the uVM root rather than inside any container.
    #[serde(default)]
    pub is_external: bool,
    /// For exec into a running container: the full OCI process document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_process: Option<oci_spec::runtime::Process>,
}

/// Vsock ports the host listens on for each stdio stream. Absent streams are
/// not relayed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StdioRelaySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteProcessRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    /// JSON-encoded [`ProcessParameters`].
    pub process_parameters: String,
    #[serde(default)]
    pub stdio_relay_settings: StdioRelaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub process_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForProcessRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
    /// Milliseconds; [`crate::protocol::INFINITE_WAIT_TIMEOUT`] disables.
    pub timeout_in_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalProcessOptions {
    #[serde(default)]
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalProcessRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
    #[serde(default)]
    pub options: SignalProcessOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeConsoleRequest {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}

// ====================
// Diagnostics & notifications
// ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpStacksRequest {
    #[serde(flatten)]
    pub base: MessageBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpStacksResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub guest_stacks: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Init exited on its own with code zero.
    GracefulExit,
    /// Init was killed by a signal delivered through the agent.
    ForcedExit,
    /// Init vanished without a shutdown or signal request.
    UnexpectedExit,
    /// A cgroup memory threshold fired; informational, container continues.
    MemoryWarning,
    /// The containers cgroup OOM-killed something.
    Oom,
}

/// Unsolicited guest→host message. Terminal container notifications carry the
/// init exit code in `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerNotification {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub operation: String,
    pub result: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_info: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_base_flattens() {
        let req = WaitForProcessRequest {
            base: MessageBase {
                activity_id: "act-1".into(),
                container_id: "c1".into(),
                span_context: None,
            },
            process_id: 42,
            timeout_in_ms: 1000,
        };
        let v: serde_json::Value = serde_json::to_value(&req).unwrap();
        // Base fields sit at the top level, not nested under "base".
        assert_eq!(v["activity_id"], "act-1");
        assert_eq!(v["container_id"], "c1");
        assert_eq!(v["process_id"], 42);
        assert!(v.get("base").is_none());
    }

    #[test]
    fn test_minimal_request_body_decodes() {
        // Hosts are only required to send activity_id and container_id.
        let body = r#"{"activity_id":"a","container_id":"c"}"#;
        let req: StartRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.base.container_id, "c");
        assert!(req.base.span_context.is_none());
    }

    #[test]
    fn test_schema_version_ordering() {
        let v21 = SchemaVersion { major: 2, minor: 1 };
        let v20 = SchemaVersion { major: 2, minor: 0 };
        let v30 = SchemaVersion { major: 3, minor: 0 };
        assert!(v21.supports(SchemaVersion::V2_1));
        assert!(v30.supports(SchemaVersion::V2_1));
        assert!(!v20.supports(SchemaVersion::V2_1));
    }

    #[test]
    fn test_notification_type_field_name() {
        let n = ContainerNotification {
            base: MessageBase::default(),
            notification_type: NotificationType::GracefulExit,
            operation: String::new(),
            result: 0,
            result_info: None,
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "graceful_exit");
    }

    #[test]
    fn test_error_records_omitted_when_empty() {
        let resp = ResponseBase::ok("act");
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("error_records").is_none());
        assert_eq!(v["result"], 0);
    }
}
