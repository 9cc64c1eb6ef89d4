//! Conversation context feeding the LLM
//!
//! An ordered log of role-tagged messages with provenance tags that drive
//! the prompt-cache strategy: static content (system prompt, the last
//! system-provenance history message) is marked cacheable, dynamic content
//! never is. Enforces the log invariants: no empty messages, no two
//! consecutive assistant messages, and assistant messages only ever come
//! from a real LLM reply.

use crate::llm::{ContentBlock, LlmMessage, LlmRequest, MessageRole, SystemContent, ToolDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    Tool,
    Architect,
    System,
}

/// Where a message came from. `System` provenance is treated as static
/// content for caching purposes; everything else is dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    System,
    User,
    Llm,
    Tool,
    Architect,
}

/// One entry in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub blocks: Vec<ContentBlock>,
    pub provenance: Provenance,
}

impl ChatMessage {
    fn is_empty(&self) -> bool {
        self.blocks.iter().all(ContentBlock::is_empty)
    }

    /// Concatenated text content (tool blocks excluded)
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Context log errors
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("refusing to append an empty {0:?} message")]
    EmptyMessage(ChatRole),
    #[error("two consecutive assistant messages")]
    ConsecutiveAssistant,
    #[error("context serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Ordered conversation log with a user-side coalescing buffer
#[derive(Debug, Default)]
pub struct ContextManager {
    template: String,
    messages: Vec<ChatMessage>,
    user_buffer: Vec<String>,
}

impl ContextManager {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            messages: Vec::new(),
            user_buffer: Vec::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.user_buffer.is_empty()
    }

    /// Switch templates, clearing history only when the template actually
    /// changes. Re-entering a state with the same template keeps context.
    pub fn reset_for_template(&mut self, template: &str) {
        if self.template != template {
            self.template = template.to_string();
            self.messages.clear();
            self.user_buffer.clear();
        }
    }

    fn append(&mut self, message: ChatMessage) -> Result<(), ContextError> {
        if message.is_empty() {
            return Err(ContextError::EmptyMessage(message.role));
        }
        if message.role == ChatRole::Assistant
            && self
                .messages
                .last()
                .is_some_and(|m| m.role == ChatRole::Assistant)
        {
            return Err(ContextError::ConsecutiveAssistant);
        }
        self.messages.push(message);
        Ok(())
    }

    /// Append the assistant reply. Only the tool loop calls this, and only
    /// with content that came back from the LLM.
    pub fn append_assistant(&mut self, blocks: Vec<ContentBlock>) -> Result<(), ContextError> {
        self.append(ChatMessage {
            role: ChatRole::Assistant,
            blocks,
            provenance: Provenance::Llm,
        })
    }

    pub fn append_user(
        &mut self,
        text: impl Into<String>,
        provenance: Provenance,
    ) -> Result<(), ContextError> {
        self.append(ChatMessage {
            role: ChatRole::User,
            blocks: vec![ContentBlock::text(text)],
            provenance,
        })
    }

    /// Architect feedback lands as a user-role message with architect
    /// provenance so reviews read as instructions to the model.
    pub fn append_feedback(&mut self, text: impl Into<String>) -> Result<(), ContextError> {
        self.append_user(text, Provenance::Architect)
    }

    /// A message spoken by the architect itself
    pub fn append_architect(&mut self, text: impl Into<String>) -> Result<(), ContextError> {
        self.append(ChatMessage {
            role: ChatRole::Architect,
            blocks: vec![ContentBlock::text(text)],
            provenance: Provenance::Architect,
        })
    }

    /// Static context (task briefing, knowledge pack); cacheable.
    pub fn append_system(&mut self, text: impl Into<String>) -> Result<(), ContextError> {
        self.append(ChatMessage {
            role: ChatRole::System,
            blocks: vec![ContentBlock::text(text)],
            provenance: Provenance::System,
        })
    }

    pub fn append_tool_result(
        &mut self,
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Result<(), ContextError> {
        self.append(ChatMessage {
            role: ChatRole::Tool,
            blocks: vec![ContentBlock::tool_result(tool_use_id, content, is_error)],
            provenance: Provenance::Tool,
        })
    }

    // ==================== User buffer ====================

    /// Queue user-side text to be coalesced before the next LLM call
    pub fn buffer_user(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.user_buffer.push(text);
        }
    }

    /// Coalesce any buffered user text into a single message
    pub fn flush_user_buffer(&mut self) -> Result<(), ContextError> {
        if self.user_buffer.is_empty() {
            return Ok(());
        }
        let merged = self.user_buffer.join("\n\n");
        self.user_buffer.clear();
        self.append_user(merged, Provenance::User)
    }

    // ==================== LLM request assembly ====================

    /// Build the wire request: cached system prompt, history with the last
    /// system-provenance message marked cacheable, and an uncached
    /// critical-reminders tail.
    pub fn build_request(
        &self,
        system_prompt: &str,
        tools: Vec<ToolDefinition>,
        reminders: &str,
        max_tokens: Option<u32>,
    ) -> LlmRequest {
        let last_static = self
            .messages
            .iter()
            .rposition(|m| m.provenance == Provenance::System);

        let mut wire: Vec<LlmMessage> = Vec::new();
        for (index, message) in self.messages.iter().enumerate() {
            let role = match message.role {
                ChatRole::Assistant => MessageRole::Assistant,
                _ => MessageRole::User,
            };
            let cache = last_static == Some(index);

            match wire.last_mut() {
                // Merge runs of same-role messages so the wire alternates
                Some(prev) if prev.role == role => {
                    prev.content.extend(message.blocks.iter().cloned());
                    prev.cache |= cache;
                }
                _ => {
                    let mut msg = LlmMessage::new(role, message.blocks.clone());
                    msg.cache = cache;
                    wire.push(msg);
                }
            }
        }

        if !reminders.trim().is_empty() {
            let reminder_block = ContentBlock::text(reminders);
            match wire.last_mut() {
                Some(prev) if prev.role == MessageRole::User => {
                    prev.content.push(reminder_block);
                }
                _ => wire.push(LlmMessage::new(MessageRole::User, vec![reminder_block])),
            }
        }

        LlmRequest {
            system: vec![SystemContent::cached(system_prompt)],
            messages: wire,
            tools,
            max_tokens,
        }
    }

    // ==================== Serialization ====================

    pub fn serialize(&self) -> Result<String, ContextError> {
        let record = ContextSnapshot {
            template: self.template.clone(),
            messages: self.messages.clone(),
        };
        Ok(serde_json::to_string(&record)?)
    }

    /// Restore a log, re-validating the append invariants
    pub fn deserialize(raw: &str) -> Result<Self, ContextError> {
        let snapshot: ContextSnapshot = serde_json::from_str(raw)?;
        let mut ctx = ContextManager::new(snapshot.template);
        for message in snapshot.messages {
            ctx.append(message)?;
        }
        Ok(ctx)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextSnapshot {
    template: String,
    messages: Vec<ChatMessage>,
}
