//! Conversation messages and their lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::Timestamp;

/// Author role of a message, as sent to the completion endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Instructions framing the conversation.
    System,
    /// Prompt written by the user.
    User,
    /// Model answer.
    Assistant,
    /// Tool output fed back to the model.
    Tool,
}

impl MessageRole {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err("invalid message role"),
        }
    }
}

impl Display for MessageRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Finished normally.
    #[default]
    Complete,
    /// A run is still writing into it.
    Streaming,
    /// The run failed; partial content may remain.
    Error,
    /// The user stopped the run.
    Aborted,
}

impl MessageStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    /// `true` once the message will no longer be mutated by a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// A single message of one model's conversation inside a session.
///
/// Messages without a `run_index` are shared by every run of the model;
/// messages carrying one belong to exactly that run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Model whose conversation holds the message.
    pub model_id: String,
    /// Author role.
    pub role: MessageRole,
    /// Visible answer or prompt text.
    #[serde(default)]
    pub content: String,
    /// Reasoning text streamed by reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Thinking text streamed separately from reasoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Identifiers of stored image assets, in display order.
    #[serde(default)]
    pub image_ids: Vec<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// Arrival of the first visible output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_at: Option<Timestamp>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: MessageStatus,
    /// Failure description for `Error` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based run index, `None` for messages shared by all runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u32>,
}

impl Message {
    /// Creates a finished message with the given role and text.
    #[must_use]
    pub fn new(
        session_id: Uuid,
        model_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        run_index: Option<u32>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            model_id: model_id.into(),
            role,
            content: content.into(),
            reasoning: None,
            thinking: None,
            image_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            first_token_at: None,
            completed_at: None,
            status: MessageStatus::Complete,
            error: None,
            run_index,
        }
    }

    /// Creates the empty assistant placeholder a run streams into.
    #[must_use]
    pub fn streaming_placeholder(
        session_id: Uuid,
        model_id: impl Into<String>,
        run_index: Option<u32>,
    ) -> Self {
        let mut message = Self::new(session_id, model_id, MessageRole::Assistant, "", run_index);
        message.status = MessageStatus::Streaming;
        message
    }

    /// Whether this message is part of the conversation seen by `run_index`.
    #[must_use]
    pub fn visible_to_run(&self, run_index: Option<u32>) -> bool {
        match self.run_index {
            None => true,
            Some(own) => run_index == Some(own),
        }
    }

    /// `true` when the message carries neither text, reasoning, thinking nor images.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.reasoning.as_deref().is_none_or(str::is_empty)
            && self.thinking.as_deref().is_none_or(str::is_empty)
            && self.image_ids.is_empty()
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_placeholder_is_empty_assistant() {
        let session_id = Uuid::new_v4();
        let message = Message::streaming_placeholder(session_id, "openai/gpt-4o", Some(2));

        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.status, MessageStatus::Streaming);
        assert_eq!(message.run_index, Some(2));
        assert!(message.is_empty());
        assert!(!message.status.is_terminal());
    }

    #[test]
    fn test_visibility_respects_run_isolation() {
        let session_id = Uuid::new_v4();
        let shared = Message::new(session_id, "m", MessageRole::User, "hi", None);
        let run_one = Message::new(session_id, "m", MessageRole::Assistant, "a", Some(1));

        assert!(shared.visible_to_run(None));
        assert!(shared.visible_to_run(Some(3)));
        assert!(run_one.visible_to_run(Some(1)));
        assert!(!run_one.visible_to_run(Some(2)));
        assert!(!run_one.visible_to_run(None));
    }

    #[test]
    fn test_message_serialization_skips_absent_fields() {
        let message = Message::new(Uuid::nil(), "m", MessageRole::User, "hello", None);
        let json = serde_json::to_string(&message).unwrap();

        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"status\":\"complete\""));
        assert!(!json.contains("run_index"));
        assert!(!json.contains("reasoning"));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(MessageRole::try_from("tool"), Ok(MessageRole::Tool));
        assert!(MessageRole::try_from("robot").is_err());
    }
}
