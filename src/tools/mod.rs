//! Tools invokable by the LLM
//!
//! Concrete development tools (shell, editing, search) are supplied by the
//! embedding application; this module owns the trait they implement, the
//! registry the loop executes against, and the protocol tools every loop
//! carries (`ask_question`, `todos_add`, `submit_plan`, `done`).

mod protocol;

pub use protocol::{
    extract_plan, extract_todos, AskQuestionTool, DoneTool, SubmitPlanTool, TodoCompleteTool,
    TodosAddTool, TOOL_ASK_QUESTION, TOOL_DONE, TOOL_SUBMIT_PLAN, TOOL_TODOS_ADD,
    TOOL_TODO_COMPLETE,
};

use crate::message::QuestionPayload;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Out-of-band event surfaced by a general tool: the loop suspends and the
/// enclosing state handler routes on it.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEffect {
    Question(QuestionPayload),
    AddTodos(Vec<String>),
    CompleteTodo,
}

/// Result from tool execution
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    /// Set when the tool asks the loop to suspend and surface an event
    pub effect: Option<ProcessEffect>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            effect: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: ProcessEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with cancellation support
    async fn run(&self, input: Value, cancel: CancellationToken) -> ToolOutput;
}

/// Collection of tools available to a loop
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Get all tool definitions for the LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name; `None` when the tool is unknown
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, cancel).await);
            }
        }
        None
    }
}
