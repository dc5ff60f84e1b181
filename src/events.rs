use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::message::{HistoryEntry, TablePayload};

/// Frames the client writes to the chat socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A new user question together with everything said so far
    ChatMessage {
        message: String,
        message_id: u64,
        conversation_history: Vec<HistoryEntry>,
    },
    /// Liveness probe
    Ping,
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(|e| ChatError::MalformedEvent(e.to_string()))
    }
}

/// Payload of a `complete` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// Events the backend streams back for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Next slice of assistant text
    Chunk { message_id: u64, content: String },
    /// The reply is finished
    Complete {
        message_id: u64,
        content: CompletePayload,
    },
    /// Tabular attachment for the reply
    Table {
        message_id: u64,
        content: TablePayload,
    },
    /// Explicit backend failure
    Error {
        #[serde(default)]
        message_id: Option<u64>,
        content: String,
    },
}

/// Tags the backend may send that carry nothing for the conversation.
const KEEPALIVE_TAGS: &[&str] = &["pong", "heartbeat"];

impl ServerEvent {
    /// Decode one inbound frame.
    ///
    /// `Ok(None)` means the frame was a keepalive reply and can be skipped.
    pub fn parse(text: &str) -> Result<Option<Self>, ChatError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ChatError::MalformedEvent(e.to_string()))?;

        if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
            if KEEPALIVE_TAGS.contains(&tag) {
                return Ok(None);
            }
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ChatError::MalformedEvent(e.to_string()))
    }

    pub fn message_id(&self) -> Option<u64> {
        match self {
            ServerEvent::Chunk { message_id, .. }
            | ServerEvent::Complete { message_id, .. }
            | ServerEvent::Table { message_id, .. } => Some(*message_id),
            ServerEvent::Error { message_id, .. } => *message_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Chunk { .. } => "chunk",
            ServerEvent::Complete { .. } => "complete",
            ServerEvent::Table { .. } => "table",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Notifications for whatever presents the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The assistant started or stopped "thinking"
    TypingChanged(bool),
    /// A message was created or changed
    MessageUpdated(u64),
    /// Something the user should see immediately
    Notification { title: String, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn ping_serializes_to_bare_tag() {
        assert_eq!(ClientFrame::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn chat_message_carries_history() {
        let frame = ClientFrame::ChatMessage {
            message: "Hello".into(),
            message_id: 3,
            conversation_history: vec![HistoryEntry {
                role: "assistant".into(),
                content: "Welcome".into(),
                timestamp: "2024-01-01T00:00:00.000Z".into(),
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat_message",
                "message": "Hello",
                "message_id": 3,
                "conversation_history": [
                    {"role": "assistant", "content": "Welcome", "timestamp": "2024-01-01T00:00:00.000Z"}
                ]
            })
        );
    }

    #[test]
    fn parses_each_inbound_kind() {
        let chunk = ServerEvent::parse(r#"{"type":"chunk","message_id":3,"content":"Hi"}"#).unwrap();
        assert_eq!(
            chunk,
            Some(ServerEvent::Chunk { message_id: 3, content: "Hi".into() })
        );

        let complete = ServerEvent::parse(
            r#"{"type":"complete","message_id":3,"content":{"question_id":"q1","completed":true}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            complete,
            ServerEvent::Complete {
                message_id: 3,
                content: CompletePayload { question_id: Some("q1".into()), completed: true },
            }
        );

        let table = ServerEvent::parse(
            r#"{"type":"table","message_id":3,"content":{"id":"t1","data":[{"a":1}]}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(table.kind(), "table");
        assert_eq!(table.message_id(), Some(3));

        let error = ServerEvent::parse(r#"{"type":"error","content":"overloaded"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(error, ServerEvent::Error { message_id: None, content: "overloaded".into() });
    }

    #[test]
    fn keepalive_frames_are_skipped() {
        assert_eq!(ServerEvent::parse(r#"{"type":"pong"}"#).unwrap(), None);
    }

    #[test]
    fn unknown_tags_and_bad_json_are_malformed() {
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"mystery","message_id":1}"#),
            Err(ChatError::MalformedEvent(_))
        ));
        assert!(matches!(ServerEvent::parse("not json"), Err(ChatError::MalformedEvent(_))));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"chunk","content":"no id"}"#),
            Err(ChatError::MalformedEvent(_))
        ));
    }
}
