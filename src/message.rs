use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Conversation role as understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation tag carried alongside the role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Bot,
}

/// Completion metadata echoed by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub question_id: Option<String>,
    pub completed: bool,
}

/// Structured table attached to an assistant reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePayload {
    pub id: String,
    pub data: serde_json::Value,
}

/// A single entry in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TablePayload>>,
}

impl Message {
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        Self::new(id, Role::User, MessageKind::User, text)
    }

    pub fn assistant(id: u64, text: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, MessageKind::Bot, text)
    }

    fn new(id: u64, role: Role, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            kind,
            timestamp: Utc::now(),
            error: false,
            metadata: None,
            tables: None,
        }
    }

    /// Append streamed content
    pub fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Flag this message as failed and replace its text
    pub fn mark_error(&mut self, reason: &str) {
        self.error = true;
        self.text = format!("Error: {}", reason);
    }

    pub fn push_table(&mut self, table: TablePayload) {
        self.tables.get_or_insert_with(Vec::new).push(table);
    }

    pub fn table_count(&self) -> usize {
        self.tables.as_ref().map_or(0, Vec::len)
    }

    /// History triple sent to the backend with each new question
    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role.as_str().to_string(),
            content: self.text.clone(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Prior conversation turn as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// Hands out strictly increasing message identifiers for one session.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    /// The first reserved id is 1.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn reserve(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Reserve the user id and the reply id of one turn together.
    pub fn reserve_turn(&mut self) -> (u64, u64) {
        let user = self.reserve();
        let reply = self.reserve();
        (user, reply)
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_are_consecutive_and_increasing() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.reserve(), 1);
        let (user, reply) = ids.reserve_turn();
        assert_eq!((user, reply), (2, 3));
        let (next_user, next_reply) = ids.reserve_turn();
        assert!(next_user > reply);
        assert!(next_reply > next_user);
    }

    #[test]
    fn tables_accumulate_in_arrival_order() {
        let mut msg = Message::assistant(4, "");
        assert_eq!(msg.table_count(), 0);
        msg.push_table(TablePayload { id: "a".into(), data: serde_json::json!([1]) });
        msg.push_table(TablePayload { id: "b".into(), data: serde_json::json!([2]) });
        let ids: Vec<_> = msg.tables.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn history_entry_uses_wire_role_names() {
        let entry = Message::user(2, "Hello").to_history_entry();
        assert_eq!(entry.role, "user");
        assert_eq!(entry.content, "Hello");
        assert!(entry.timestamp.ends_with('Z'));
    }

    #[test]
    fn mark_error_overwrites_text() {
        let mut msg = Message::user(2, "Hello");
        msg.mark_error("Connection timeout");
        assert!(msg.error);
        assert_eq!(msg.text, "Error: Connection timeout");
    }
}
