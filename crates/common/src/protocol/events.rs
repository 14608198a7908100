// Event schema of the agent runtime's server-push stream, as routed to consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_INIT: &str = "init";
pub const EVENT_DELTA: &str = "delta";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_COMPLETE: &str = "complete";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_STOPPED: &str = "stopped";
/// Emitted by the router itself once the reconnect budget is exhausted.
pub const EVENT_DISCONNECTED: &str = "disconnected";

/// Known backend event kinds. Unrecognized names pass through as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Delta,
    Status,
    Complete,
    Error,
    Stopped,
    Disconnected,
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            EVENT_INIT => Self::Init,
            EVENT_DELTA => Self::Delta,
            EVENT_STATUS => Self::Status,
            EVENT_COMPLETE => Self::Complete,
            EVENT_ERROR => Self::Error,
            EVENT_STOPPED => Self::Stopped,
            EVENT_DISCONNECTED => Self::Disconnected,
            other => Self::Other(other.to_string()),
        }
    }

    /// `complete`, `error` and `stopped` end a generation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Stopped)
    }
}

/// Whether the runtime is currently producing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Generating,
    Idle,
}

/// One event as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEvent {
    /// Backend-assigned event id; `init` snapshots and router events may lack one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl RoutedEvent {
    pub fn new(id: Option<String>, event_name: impl Into<String>, payload: Value) -> Self {
        Self { id, event_name: event_name.into(), payload }
    }

    pub fn disconnected(reason: &str) -> Self {
        Self::new(None, EVENT_DISCONNECTED, serde_json::json!({ "reason": reason }))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.event_name)
    }

    /// Generation phase this event implies, if it implies one.
    ///
    /// `init` carries `generating: bool`, `status` carries
    /// `state: "generating" | "idle"`, terminal events imply idle.
    pub fn generation_phase(&self) -> Option<GenerationPhase> {
        match self.kind() {
            EventKind::Init => self.payload.get("generating").and_then(Value::as_bool).map(
                |generating| {
                    if generating {
                        GenerationPhase::Generating
                    } else {
                        GenerationPhase::Idle
                    }
                },
            ),
            EventKind::Status => match self.payload.get("state").and_then(Value::as_str) {
                Some("generating") => Some(GenerationPhase::Generating),
                Some("idle") => Some(GenerationPhase::Idle),
                _ => None,
            },
            kind if kind.is_terminal() => Some(GenerationPhase::Idle),
            _ => None,
        }
    }
}
