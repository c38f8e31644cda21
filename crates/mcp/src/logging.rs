// Client-visible logging behind the level gate

use crate::protocol::{methods, JsonRpcRequest, LoggingMessageParams};
use geoscope_core::{LevelChange, LevelGate, LogLevel};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Channel the transport drains to push server-initiated notifications
pub type NotificationSender = mpsc::UnboundedSender<JsonRpcRequest>;

/// Emits log messages that pass the dispatcher's threshold to tracing and,
/// when a transport is attached, to the client as `notifications/message`.
#[derive(Clone)]
pub struct ClientLogger {
    gate: Arc<LevelGate>,
    sink: Arc<Mutex<Option<NotificationSender>>>,
}

impl ClientLogger {
    pub fn new(initial: LogLevel) -> Self {
        Self {
            gate: Arc::new(LevelGate::new(initial)),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.gate.current()
    }

    pub fn set_level(&self, level: LogLevel) -> LevelChange {
        self.gate.set(level)
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        self.gate.allows(level)
    }

    pub fn attach(&self, sender: NotificationSender) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub fn detach(&self) {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Returns whether the message passed the gate
    pub fn log(&self, level: LogLevel, logger: &str, data: Value) -> bool {
        if !self.gate.allows(level) {
            return false;
        }

        match level {
            LogLevel::Debug => tracing::debug!(logger, %data),
            LogLevel::Info => tracing::info!(logger, %data),
            LogLevel::Warn => tracing::warn!(logger, %data),
            LogLevel::Error => tracing::error!(logger, %data),
        }

        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sink.as_ref() {
            let params = LoggingMessageParams {
                level,
                logger: Some(logger.to_string()),
                data,
            };
            match serde_json::to_value(params) {
                Ok(params) => {
                    // A closed channel means the transport is gone
                    let _ = sender.send(JsonRpcRequest::notification(
                        methods::NOTIFICATION_MESSAGE,
                        params,
                    ));
                }
                Err(e) => tracing::warn!("Failed to encode log notification: {}", e),
            }
        }
        true
    }

    pub fn debug(&self, logger: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Debug, logger, Value::String(message.into()))
    }

    pub fn info(&self, logger: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Info, logger, Value::String(message.into()))
    }

    pub fn warn(&self, logger: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Warn, logger, Value::String(message.into()))
    }

    pub fn error(&self, logger: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Error, logger, Value::String(message.into()))
    }
}

impl Default for ClientLogger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}
