// JSON-RPC method table and per-request lifecycle

use crate::completion::{self, CompletionSources, Vocabulary};
use crate::context::{RequestContext, UserContext};
use crate::logging::{ClientLogger, NotificationSender};
use crate::prompts::PromptRegistry;
use crate::protocol::{
    methods, parse_envelope, CallToolParams, CallToolResult, CancelledParams, ClientInfo,
    CompleteParams, CompleteResult, GetPromptParams, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListChangedCapability, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult, RequestId,
    ServerCapabilities, ServerInfo, SetLevelParams, PROTOCOL_VERSION,
};
use crate::requests::{ActiveRequest, ActiveRequests, CancelOutcome};
use crate::resources::ResourceRegistry;
use crate::tools::ToolRegistry;
use futures::future::BoxFuture;
use geoscope_core::{DispatchError, DispatchResult, LevelChange, LogLevel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type HandlerFuture<'a> = BoxFuture<'a, DispatchResult<Value>>;

/// Entry of the method table
pub type Handler = for<'a> fn(&'a Dispatcher, Option<Value>, CallContext) -> HandlerFuture<'a>;

/// What the transport knows about one inbound message besides its params
#[derive(Debug, Default)]
pub struct CallContext {
    pub id: Option<RequestId>,
    pub user: Option<UserContext>,
    /// Set when the transport registered the request before handing it off
    active: Option<ActiveRequest>,
}

impl CallContext {
    pub fn new(id: Option<RequestId>) -> Self {
        Self {
            id,
            user: None,
            active: None,
        }
    }

    pub fn with_user(mut self, user: Option<UserContext>) -> Self {
        self.user = user;
        self
    }
}

/// Routes method invocations to handlers and owns everything that lives
/// for the duration of one client session: the in-flight request registry,
/// the log threshold and the handler registries.
pub struct Dispatcher {
    methods: HashMap<&'static str, Handler>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    vocabulary: Vocabulary,
    active: ActiveRequests,
    logger: ClientLogger,
    server_info: ServerInfo,
    session_id: Uuid,
    initialized: AtomicBool,
    client_info: Mutex<Option<ClientInfo>>,
}

impl Dispatcher {
    pub fn new(server_info: ServerInfo) -> Self {
        Self {
            methods: builtin_methods().into_iter().collect(),
            tools: ToolRegistry::new(),
            resources: ResourceRegistry::new(),
            prompts: PromptRegistry::new(),
            vocabulary: Vocabulary::default(),
            active: ActiveRequests::new(),
            logger: ClientLogger::default(),
            server_info,
            session_id: Uuid::new_v4(),
            initialized: AtomicBool::new(false),
            client_info: Mutex::new(None),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRegistry) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptRegistry) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_log_level(self, level: LogLevel) -> Self {
        self.logger.set_level(level);
        self
    }

    /// Add a method to the table. Names are unique; built-in methods
    /// cannot be replaced.
    pub fn register_method(&mut self, name: &'static str, handler: Handler) -> DispatchResult<()> {
        if self.methods.contains_key(name) {
            return Err(DispatchError::Internal(format!(
                "method '{}' is already registered",
                name
            )));
        }
        self.methods.insert(name, handler);
        Ok(())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Route one invocation. `id` is absent for notifications; only calls
    /// with an id can be cancelled.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        id: Option<RequestId>,
    ) -> DispatchResult<Value> {
        self.dispatch_with(method, params, CallContext::new(id)).await
    }

    pub async fn dispatch_with(
        &self,
        method: &str,
        params: Option<Value>,
        call: CallContext,
    ) -> DispatchResult<Value> {
        let handler = self
            .methods
            .get(method)
            .copied()
            .ok_or_else(|| DispatchError::method_not_found(method))?;

        tracing::debug!(method, request_id = ?call.id, "Dispatching");
        handler(self, params, call).await
    }

    /// Register a cancellable request up front. Transports that read ahead
    /// call this before spawning the handler so a cancellation that arrives
    /// right behind the request finds it in the registry.
    pub fn begin(&self, request: &JsonRpcRequest) -> DispatchResult<CallContext> {
        let mut call = CallContext::new(request.id.clone());
        if methods::is_cancellable(&request.method) {
            call.active = self.active.register_optional(request.id.as_ref())?;
        }
        Ok(call)
    }

    /// Dispatch a parsed envelope and build the response. Notifications
    /// yield `None` whatever the outcome.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        user: Option<UserContext>,
    ) -> Option<JsonRpcResponse> {
        let call = CallContext::new(request.id.clone()).with_user(user);
        self.handle_with(request, call).await
    }

    /// Like [`Dispatcher::handle`], with a context from [`Dispatcher::begin`]
    pub async fn handle_with(&self, request: JsonRpcRequest, call: CallContext) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let result = self.dispatch_with(&method, params, call).await;

        match (id, result) {
            (None, Ok(_)) => None,
            (None, Err(e)) => {
                tracing::warn!(method = %method, code = e.code(), "Notification failed: {}", e);
                None
            }
            (Some(id), Ok(value)) => Some(JsonRpcResponse::success(Some(id), value)),
            (Some(id), Err(e)) => {
                tracing::debug!(method = %method, request_id = %id, code = e.code(), "Request failed: {}", e);
                Some(JsonRpcResponse::error(Some(id), e.into()))
            }
        }
    }

    /// Parse and handle one raw message
    pub async fn handle_raw(&self, raw: &str, user: Option<UserContext>) -> Option<JsonRpcResponse> {
        match parse_envelope(raw) {
            Ok(request) => self.handle(request, user).await,
            Err(e) => {
                tracing::warn!(code = e.error.code(), "Rejected envelope: {}", e.error);
                Some(e.into_response())
            }
        }
    }

    /// Signal the handler running under `id`. Unknown ids are a no-op.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) -> CancelOutcome {
        self.active.cancel(id, reason)
    }

    /// Cancel every in-flight request, e.g. when the connection drops
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.active.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled in-flight requests");
        }
        cancelled
    }

    pub fn active_requests(&self) -> &ActiveRequests {
        &self.active
    }

    pub fn log_level(&self) -> LogLevel {
        self.logger.level()
    }

    pub fn set_log_level(&self, level: LogLevel) -> LevelChange {
        self.logger.set_level(level)
    }

    /// Emit through the level gate; returns whether the message passed
    pub fn log(&self, level: LogLevel, logger: &str, data: Value) -> bool {
        self.logger.log(level, logger, data)
    }

    pub fn logger(&self) -> &ClientLogger {
        &self.logger
    }

    /// Route `notifications/message` to the client through `sender`
    pub fn attach_notifier(&self, sender: NotificationSender) {
        self.logger.attach(sender);
    }

    pub fn detach_notifier(&self) {
        self.logger.detach();
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, call: &mut CallContext) -> DispatchResult<Option<ActiveRequest>> {
        match call.active.take() {
            Some(active) => Ok(Some(active)),
            None => self.active.register_optional(call.id.as_ref()),
        }
    }

    fn request_context(&self, call: CallContext, active: Option<&ActiveRequest>) -> RequestContext {
        RequestContext {
            request_id: call.id,
            cancel: active
                .map(ActiveRequest::token)
                .unwrap_or_else(CancellationToken::new),
            user: call.user,
            logger: self.logger.clone(),
        }
    }

    fn capabilities(&self) -> ServerCapabilities {
        let listed = || Some(ListChangedCapability { list_changed: false });
        ServerCapabilities {
            tools: listed(),
            resources: listed(),
            prompts: listed(),
            logging: Some(serde_json::json!({})),
            completions: Some(serde_json::json!({})),
            experimental: serde_json::json!({}),
        }
    }
}

fn builtin_methods() -> Vec<(&'static str, Handler)> {
    vec![
        (methods::INITIALIZE, handle_initialize as Handler),
        (methods::PING, handle_ping as Handler),
        (methods::TOOLS_LIST, handle_tools_list as Handler),
        (methods::TOOLS_CALL, handle_tools_call as Handler),
        (methods::RESOURCES_LIST, handle_resources_list as Handler),
        (methods::RESOURCES_READ, handle_resources_read as Handler),
        (methods::PROMPTS_LIST, handle_prompts_list as Handler),
        (methods::PROMPTS_GET, handle_prompts_get as Handler),
        (methods::LOGGING_SET_LEVEL, handle_set_level as Handler),
        (methods::COMPLETION_COMPLETE, handle_complete as Handler),
        (methods::NOTIFICATION_INITIALIZED, handle_initialized as Handler),
        (methods::NOTIFICATION_CANCELLED, handle_cancelled as Handler),
    ]
}

/// Missing params are treated as an empty object
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> DispatchResult<T> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| DispatchError::invalid_params(e.to_string()))
}

fn to_result<T: Serialize>(result: T) -> DispatchResult<Value> {
    serde_json::to_value(result)
        .map_err(|e| DispatchError::Internal(format!("Failed to encode result: {}", e)))
}

fn handle_initialize(d: &Dispatcher, params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: InitializeParams = parse_params(params)?;
        tracing::info!(
            session_id = %d.session_id,
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %params.protocol_version,
            "Client initializing"
        );

        *d.client_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(params.client_info);

        to_result(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: d.capabilities(),
            server_info: d.server_info.clone(),
        })
    })
}

fn handle_ping(_d: &Dispatcher, _params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move { Ok(serde_json::json!({})) })
}

fn handle_tools_list(d: &Dispatcher, _params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        to_result(ListToolsResult {
            tools: d.tools.list_schemas(),
        })
    })
}

fn handle_tools_call(d: &Dispatcher, params: Option<Value>, mut call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: CallToolParams = parse_params(params)?;
        let tool = d
            .tools
            .get(&params.name)
            .ok_or_else(|| DispatchError::ToolNotFound {
                name: params.name.clone(),
            })?;

        let active = d.track(&mut call)?;
        let ctx = d.request_context(call, active.as_ref());
        let cancel = ctx.cancel.clone();

        tracing::debug!(tool = %params.name, "Executing tool");
        let result = tool.execute(params.arguments, ctx).await;
        drop(active);

        if cancel.is_cancelled() {
            tracing::debug!(tool = %params.name, "Tool observed cancellation");
            return to_result(CallToolResult::cancelled());
        }

        match result {
            Ok(result) => to_result(result),
            Err(source) => Err(DispatchError::ToolExecution {
                name: params.name,
                source,
            }),
        }
    })
}

fn handle_resources_list(d: &Dispatcher, _params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        to_result(ListResourcesResult {
            resources: d.resources.list(),
        })
    })
}

fn handle_resources_read(d: &Dispatcher, params: Option<Value>, mut call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: ReadResourceParams = parse_params(params)?;
        let provider = d
            .resources
            .get(&params.uri)
            .ok_or_else(|| DispatchError::ResourceNotFound {
                uri: params.uri.clone(),
            })?;

        let active = d.track(&mut call)?;
        let ctx = d.request_context(call, active.as_ref());
        let cancel = ctx.cancel.clone();

        let result = provider.read(ctx).await;
        drop(active);

        if cancel.is_cancelled() {
            return to_result(ReadResourceResult {
                contents: vec![],
                meta: Some(serde_json::json!({ "cancelled": true })),
            });
        }

        match result {
            Ok(result) => to_result(result),
            Err(e) => Err(DispatchError::Internal(format!(
                "Failed to read resource {}: {:#}",
                params.uri, e
            ))),
        }
    })
}

fn handle_prompts_list(d: &Dispatcher, _params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        to_result(ListPromptsResult {
            prompts: d.prompts.list(),
        })
    })
}

fn handle_prompts_get(d: &Dispatcher, params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: GetPromptParams = parse_params(params)?;
        let prompt = d
            .prompts
            .get(&params.name)
            .ok_or_else(|| DispatchError::ResourceNotFound {
                uri: params.name.clone(),
            })?;

        to_result(prompt.render(&params.arguments)?)
    })
}

fn handle_set_level(d: &Dispatcher, params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: SetLevelParams = parse_params(params)?;
        let level: LogLevel = params.level.parse()?;
        let change = d.logger.set_level(level);
        tracing::info!(
            previous = %change.previous_level,
            current = %change.current_level,
            "Client log level changed"
        );
        to_result(change)
    })
}

fn handle_complete(d: &Dispatcher, params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: CompleteParams = parse_params(params)?;
        let resources = d.resources.uris();
        let prompts = d.prompts.names();
        let tools = d.tools.names();
        let sources = CompletionSources {
            resources: &resources,
            prompts: &prompts,
            tools: &tools,
            vocabulary: &d.vocabulary,
        };

        to_result(CompleteResult {
            completion: completion::complete(&params, &sources),
        })
    })
}

fn handle_initialized(d: &Dispatcher, _params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        d.initialized.store(true, Ordering::Release);
        tracing::info!(session_id = %d.session_id, "Session ready");
        Ok(Value::Null)
    })
}

fn handle_cancelled(d: &Dispatcher, params: Option<Value>, _call: CallContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params: CancelledParams = parse_params(params)?;
        d.cancel(&params.request_id, params.reason.as_deref());
        Ok(Value::Null)
    })
}
