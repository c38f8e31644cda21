// Per-request context handed to handlers

use crate::logging::ClientLogger;
use crate::protocol::RequestId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Caller identity attached by the transport before dispatch. The
/// dispatcher never interprets it; handlers may.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub subject: String,
    #[serde(default)]
    pub claims: serde_json::Value,
}

impl UserContext {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: serde_json::Value::Null,
        }
    }
}

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Option<RequestId>,
    /// Fires when the client cancels this request. Never fires for
    /// requests that were sent without an id.
    pub cancel: CancellationToken,
    pub user: Option<UserContext>,
    pub logger: ClientLogger,
}

impl RequestContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
