//! Agent-to-agent protocol envelopes: execute/stream requests, task
//! events, and the discovery card. Wire names follow the protocol's
//! camelCase convention.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One content part of a protocol message. Only text parts are consumed;
/// any other kind (data, file, ...) deserializes to `Other` and is skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// An inbound protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

fn default_role() -> String {
    "user".into()
}

impl TaskMessage {
    /// Concatenate every text part, skipping non-text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// An execute/stream call envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub message: TaskMessage,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Free-form metadata bag. `metadata.context` carries host context.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecuteRequest {
    /// Host-supplied context from the metadata bag, if any.
    pub fn host_context(&self) -> Option<String> {
        self.metadata
            .get("context")
            .and_then(|value| value.as_str())
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    }
}

/// A cancel call envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub task_id: String,
    #[serde(default)]
    pub context_id: Option<String>,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
    Canceled,
}

/// Events emitted while executing one task. Every request produces
/// exactly one event with `final: true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        task_id: String,
        context_id: String,
        state: TaskState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(rename = "final")]
        is_final: bool,
    },
    #[serde(rename_all = "camelCase")]
    ArtifactUpdate {
        task_id: String,
        context_id: String,
        name: String,
        text: String,
        last_chunk: bool,
    },
}

impl TaskEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, TaskEvent::StatusUpdate { is_final: true, .. })
    }

    pub fn context_id(&self) -> &str {
        match self {
            TaskEvent::StatusUpdate { context_id, .. } => context_id,
            TaskEvent::ArtifactUpdate { context_id, .. } => context_id,
        }
    }

    /// SSE event name for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            TaskEvent::StatusUpdate { .. } => "status_update",
            TaskEvent::ArtifactUpdate { .. } => "artifact_update",
        }
    }
}

/// The discovery card served at `/.well-known/agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub capabilities: AgentCapabilities,
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_request_parses_wire_shape() {
        let raw = json!({
            "message": {
                "role": "user",
                "parts": [
                    {"kind": "text", "text": "Hello "},
                    {"kind": "text", "text": "there"}
                ]
            },
            "contextId": "c1",
            "metadata": {"context": "the page body"}
        });

        let request: ExecuteRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.message.text(), "Hello there");
        assert_eq!(request.context_id.as_deref(), Some("c1"));
        assert!(request.task_id.is_none());
        assert_eq!(request.host_context().as_deref(), Some("the page body"));
    }

    #[test]
    fn non_text_parts_are_skipped_not_rejected() {
        let raw = json!({
            "message": {
                "role": "user",
                "parts": [
                    {"kind": "text", "text": "summarize "},
                    {"kind": "data", "data": {"foo": 1}},
                    {"kind": "file", "file": {"uri": "https://example.com/a.pdf"}},
                    {"kind": "text", "text": "this"}
                ]
            }
        });

        let request: ExecuteRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.message.parts.len(), 4);
        assert_eq!(request.message.text(), "summarize this");
    }

    #[test]
    fn blank_metadata_context_is_ignored() {
        let request: ExecuteRequest = serde_json::from_value(json!({
            "message": {"parts": [{"kind": "text", "text": "q"}]},
            "metadata": {"context": "   "}
        }))
        .unwrap();
        assert!(request.host_context().is_none());
    }

    #[test]
    fn cancel_request_context_id_is_optional() {
        let request: CancelRequest =
            serde_json::from_value(json!({"taskId": "t1"})).unwrap();
        assert_eq!(request.task_id, "t1");
        assert!(request.context_id.is_none());

        let request: CancelRequest =
            serde_json::from_value(json!({"taskId": "t1", "contextId": "c1"})).unwrap();
        assert_eq!(request.context_id.as_deref(), Some("c1"));
    }

    #[test]
    fn terminal_status_serializes_final_flag() {
        let event = TaskEvent::StatusUpdate {
            task_id: "t1".into(),
            context_id: "c1".into(),
            state: TaskState::Completed,
            message: None,
            is_final: true,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["final"], true);
        assert_eq!(value["state"], "completed");
        assert_eq!(value["taskId"], "t1");
        assert!(value.get("message").is_none());
        assert!(event.is_final());
    }
}
