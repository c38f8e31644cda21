//! Client-controlled log verbosity.

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log severity, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    fn allowed_values() -> Vec<&'static str> {
        Self::ALL.iter().map(LogLevel::as_str).collect()
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| {
                let allowed = Self::allowed_values();
                DispatchError::InvalidParams {
                    message: format!(
                        "Invalid log level \"{}\". Allowed levels: {}",
                        s,
                        allowed.join(", ")
                    ),
                    data: Some(serde_json::json!({
                        "level": s,
                        "allowed": allowed,
                    })),
                }
            })
    }
}

/// Result of changing the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelChange {
    pub previous_level: LogLevel,
    pub current_level: LogLevel,
}

/// Threshold below which log messages are suppressed.
///
/// Owned by a single dispatcher; two gates never share state.
#[derive(Debug)]
pub struct LevelGate {
    current: AtomicU8,
}

impl LevelGate {
    pub fn new(initial: LogLevel) -> Self {
        Self {
            current: AtomicU8::new(initial.index()),
        }
    }

    pub fn current(&self) -> LogLevel {
        LogLevel::from_index(self.current.load(Ordering::Acquire))
    }

    /// Swap the threshold, returning the old and new values
    pub fn set(&self, level: LogLevel) -> LevelChange {
        let previous = self.current.swap(level.index(), Ordering::AcqRel);
        LevelChange {
            previous_level: LogLevel::from_index(previous),
            current_level: level,
        }
    }

    /// Whether a message at `level` passes the threshold
    pub fn allows(&self, level: LogLevel) -> bool {
        level.index() >= self.current.load(Ordering::Acquire)
    }
}

impl Default for LevelGate {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}
