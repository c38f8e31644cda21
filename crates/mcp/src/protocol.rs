// MCP protocol types and definitions (JSON-RPC 2.0 over stdio or HTTP)

use geoscope_core::{DispatchError, LogLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP revision spoken by this server
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names of the method table
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    /// Server → client log forwarding
    pub const NOTIFICATION_MESSAGE: &str = "notifications/message";

    /// Methods whose requests are tracked and can be cancelled by id
    pub fn is_cancellable(method: &str) -> bool {
        matches!(method, TOOLS_CALL | RESOURCES_READ)
    }
}

/// Correlation id of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn method_not_found(method: &str) -> Self {
        (&DispatchError::method_not_found(method)).into()
    }
}

impl From<&DispatchError> for JsonRpcError {
    fn from(err: &DispatchError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: err.data(),
        }
    }
}

impl From<DispatchError> for JsonRpcError {
    fn from(err: DispatchError) -> Self {
        (&err).into()
    }
}

/// Envelope that could not be turned into a request
#[derive(Debug)]
pub struct EnvelopeError {
    pub id: Option<RequestId>,
    pub error: DispatchError,
}

impl EnvelopeError {
    pub fn into_response(self) -> JsonRpcResponse {
        JsonRpcResponse::error(self.id, self.error.into())
    }
}

/// Parse one raw message into a request envelope
pub fn parse_envelope(raw: &str) -> Result<JsonRpcRequest, EnvelopeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| EnvelopeError {
        id: None,
        error: DispatchError::Parse(e.to_string()),
    })?;

    parse_envelope_value(value)
}

/// Validate an already-decoded message
pub fn parse_envelope_value(value: Value) -> Result<JsonRpcRequest, EnvelopeError> {
    let invalid = |id: Option<RequestId>, message: &str| EnvelopeError {
        id,
        error: DispatchError::InvalidRequest(message.to_string()),
    };

    let object = match &value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(invalid(None, "batch requests are not supported")),
        _ => return Err(invalid(None, "request must be a JSON object")),
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw.clone())
                .map_err(|_| invalid(None, "id must be a string or an integer"))?,
        ),
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid(id, "jsonrpc must be \"2.0\""));
    }
    if !object.get("method").is_some_and(Value::is_string) {
        return Err(invalid(id, "method must be a string"));
    }
    if let Some(params) = object.get("params") {
        if !(params.is_object() || params.is_array() || params.is_null()) {
            return Err(invalid(id, "params must be an object or an array"));
        }
    }

    serde_json::from_value(value).map_err(|e| EnvelopeError {
        id,
        error: DispatchError::InvalidRequest(e.to_string()),
    })
}

// MCP-specific protocol messages

/// Tool definition for MCP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// List tools response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
}

/// Call tool request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Call tool response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            ..Default::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::error(text)],
            is_error: Some(true),
            meta: None,
        }
    }

    /// Benign result for a request the client cancelled
    pub fn cancelled() -> Self {
        Self {
            content: vec![ToolContent::text("Request cancelled")],
            is_error: Some(true),
            meta: Some(serde_json::json!({ "cancelled": true })),
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "resource")]
    Resource { resource: ResourceContents },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Text {
            text: format!("Error: {}", text.into()),
        }
    }
}

/// Resource descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Prompt descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: ToolContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// `logging/setLevel` params. The level stays a raw string so an unknown
/// value can be reported back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    pub level: String,
}

/// `notifications/cancelled` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `notifications/message` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// Kind of object a completion request refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    #[serde(rename = "ref/resource")]
    Resource,
    #[serde(rename = "ref/prompt")]
    Prompt,
    #[serde(rename = "ref/tool")]
    Tool,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionArgument {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// `completion/complete` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteParams {
    #[serde(rename = "ref")]
    pub reference: CompletionReference,
    pub argument: CompletionArgument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResult {
    pub completion: CompletionValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionValues {
    pub values: Vec<String>,
    pub total: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub experimental: Value,
    #[serde(default)]
    pub sampling: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: Option<ListChangedCapability>,
    pub resources: Option<ListChangedCapability>,
    pub prompts: Option<ListChangedCapability>,
    pub logging: Option<Value>,
    pub completions: Option<Value>,
    #[serde(default)]
    pub experimental: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChangedCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoscope_core::ErrorKind;

    #[test]
    fn test_parse_request() {
        let request =
            parse_envelope(r#"{"jsonrpc":"2.0","id":7,"method":"ping","params":{}}"#).unwrap();

        assert_eq!(request.id, Some(RequestId::Number(7)));
        assert_eq!(request.method, "ping");
        assert!(!request.is_notification());
    }

    #[test]
    fn test_parse_notification() {
        let request = parse_envelope(
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":"abc"}}"#,
        )
        .unwrap();

        assert!(request.is_notification());
        let params: CancelledParams = serde_json::from_value(request.params.unwrap()).unwrap();
        assert_eq!(params.request_id, RequestId::from("abc"));
        assert_eq!(params.reason, None);
    }

    #[test]
    fn test_parse_error_for_malformed_json() {
        let err = parse_envelope("{not json").unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::ParseError);
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let err = parse_envelope(r#"{"jsonrpc":"1.0","id":"x","method":"ping"}"#).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.id, Some(RequestId::from("x")));

        let err = parse_envelope(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::InvalidRequest);

        let err = parse_envelope(r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_error_response_shape() {
        let response = JsonRpcResponse::error(
            Some(RequestId::Number(1)),
            JsonRpcError::method_not_found("unknown/x"),
        );
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["error"]["code"], -32601);
        assert_eq!(json["error"]["data"]["method"], "unknown/x");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_parse_error_response_has_null_id() {
        let response = parse_envelope("").unwrap_err().into_response();
        let json = serde_json::to_value(&response).unwrap();

        assert!(json["id"].is_null());
        assert_eq!(json["error"]["code"], -32700);
    }

    #[test]
    fn test_unknown_reference_kind() {
        let params: CompleteParams = serde_json::from_value(serde_json::json!({
            "ref": {"type": "ref/bogus", "name": "x"},
            "argument": {"name": "industry", "value": "fin"}
        }))
        .unwrap();
        assert_eq!(params.reference.kind, ReferenceKind::Unknown);
    }

    #[test]
    fn test_tool_result_serialization() {
        let result = CallToolResult::text("ok").with_meta(serde_json::json!({"cacheStatus": "stale"}));
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["_meta"]["cacheStatus"], "stale");
        assert!(json.get("isError").is_none());
    }
}
