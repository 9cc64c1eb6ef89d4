//! Typed message envelopes exchanged with the orchestrator and architect
//!
//! Inbound: `Story`, `Answer`, `Result`, `Shutdown`. Outbound: `Question`
//! and `Request` (approval and merge requests, distinguished by approval
//! type and metadata tag). Every envelope carries the sender, recipient,
//! and a correlation id that ties replies back to in-flight effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Envelope type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Story,
    Answer,
    Result,
    Shutdown,
    Question,
    Request,
}

/// A message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub from: String,
    pub to: String,
    pub correlation_id: Uuid,
    pub payload: Payload,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub sent_at: DateTime<Utc>,
}

/// Metadata key carrying the story id on `Story` envelopes
pub const META_STORY_ID: &str = "story_id";

/// Metadata key tagging merge requests on outbound `Request` envelopes
pub const META_REQUEST_KIND: &str = "request_kind";

impl Envelope {
    fn new(msg_type: MessageType, from: &str, to: &str, payload: Payload) -> Self {
        Self {
            msg_type,
            from: from.to_string(),
            to: to.to_string(),
            correlation_id: Uuid::new_v4(),
            payload,
            metadata: BTreeMap::new(),
            sent_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Build a story envelope. `story_id` is required metadata.
    pub fn story(from: &str, to: &str, spec: StorySpec) -> Self {
        let story_id = spec.story_id.clone();
        Self::new(MessageType::Story, from, to, Payload::Story(spec))
            .with_metadata(META_STORY_ID, story_id)
    }

    pub fn answer(from: &str, to: &str, correlation_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(
            MessageType::Answer,
            from,
            to,
            Payload::Answer { text: text.into() },
        )
        .with_correlation(correlation_id)
    }

    pub fn result(from: &str, to: &str, correlation_id: Uuid, result: ReviewResult) -> Self {
        Self::new(MessageType::Result, from, to, Payload::Result(result))
            .with_correlation(correlation_id)
    }

    pub fn shutdown(from: &str, to: &str) -> Self {
        Self::new(MessageType::Shutdown, from, to, Payload::Shutdown)
    }

    pub fn question(from: &str, to: &str, correlation_id: Uuid, question: QuestionPayload) -> Self {
        Self::new(MessageType::Question, from, to, Payload::Question(question))
            .with_correlation(correlation_id)
    }

    pub fn approval_request(
        from: &str,
        to: &str,
        correlation_id: Uuid,
        approval_type: ApprovalType,
        content: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageType::Request,
            from,
            to,
            Payload::Request {
                approval_type,
                content,
            },
        )
        .with_correlation(correlation_id)
        .with_metadata(META_REQUEST_KIND, "approval")
    }

    pub fn merge_request(
        from: &str,
        to: &str,
        correlation_id: Uuid,
        story_id: impl Into<String>,
        workspace_path: impl Into<String>,
    ) -> Self {
        Self::new(
            MessageType::Request,
            from,
            to,
            Payload::Merge {
                story_id: story_id.into(),
                workspace_path: workspace_path.into(),
            },
        )
        .with_correlation(correlation_id)
        .with_metadata(META_REQUEST_KIND, "merge")
    }

    /// Extract the validated story spec from a `Story` envelope
    pub fn story_spec(&self) -> Result<&StorySpec, EnvelopeError> {
        let Payload::Story(spec) = &self.payload else {
            return Err(EnvelopeError::PayloadMismatch {
                expected: "story",
                got: self.msg_type,
            });
        };
        match self.metadata.get(META_STORY_ID) {
            Some(id) if *id == spec.story_id => Ok(spec),
            Some(_) | None => Err(EnvelopeError::MissingStoryId),
        }
    }
}

/// Envelope validation errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("expected {expected} payload, got {got:?} envelope")]
    PayloadMismatch {
        expected: &'static str,
        got: MessageType,
    },
    #[error("story envelope missing or inconsistent story_id metadata")]
    MissingStoryId,
}

/// Envelope payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Story(StorySpec),
    Answer {
        text: String,
    },
    Result(ReviewResult),
    Shutdown,
    Question(QuestionPayload),
    Request {
        approval_type: ApprovalType,
        content: serde_json::Value,
    },
    Merge {
        story_id: String,
        workspace_path: String,
    },
}

/// A unit of development work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySpec {
    pub story_id: String,
    pub task_content: String,
    pub story_type: StoryType,
}

/// Story flavor, which selects the testing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryType {
    #[default]
    App,
    Devops,
}

/// Question sent to the architect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub question: String,
    pub context: String,
    #[serde(default)]
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// Verdict carried by a `Result` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
}

impl ReviewResult {
    pub fn approved() -> Self {
        Self {
            status: ApprovalStatus::Approved,
            feedback: None,
            conflict_info: None,
            merge_commit: None,
        }
    }

    pub fn needs_changes(feedback: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::NeedsChanges,
            feedback: Some(feedback.into()),
            conflict_info: None,
            merge_commit: None,
        }
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::Rejected,
            feedback: Some(feedback.into()),
            conflict_info: None,
            merge_commit: None,
        }
    }
}

/// Review verdict. Unknown statuses fail deserialization, which the
/// workflow treats as an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    NeedsChanges,
    Rejected,
}

/// What an outbound approval request asks the architect to judge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Plan,
    Completion,
    BudgetReview,
    Code,
}
