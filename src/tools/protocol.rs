//! Protocol tools shared by every loop
//!
//! `ask_question` and `todos_add` are general tools that surface a
//! `ProcessEffect`; `submit_plan` and `done` are terminal tools whose
//! invocation the loop intercepts, so their `run` bodies only matter as a
//! fallback.

use super::{ProcessEffect, Tool, ToolOutput};
use crate::message::{QuestionPayload, Urgency};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub const TOOL_ASK_QUESTION: &str = "ask_question";
pub const TOOL_TODOS_ADD: &str = "todos_add";
pub const TOOL_TODO_COMPLETE: &str = "todo_complete";
pub const TOOL_SUBMIT_PLAN: &str = "submit_plan";
pub const TOOL_DONE: &str = "done";

// ============================================================================
// ask_question
// ============================================================================

/// Forward a question to the architect and suspend the loop
pub struct AskQuestionTool;

#[derive(Debug, Deserialize)]
struct AskQuestionInput {
    question: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    urgency: Urgency,
}

#[async_trait]
impl Tool for AskQuestionTool {
    fn name(&self) -> &str {
        TOOL_ASK_QUESTION
    }

    fn description(&self) -> String {
        "Ask the architect a blocking question when you cannot proceed without a decision. \
         The workflow pauses until the architect answers."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question that blocks progress"
                },
                "context": {
                    "type": "string",
                    "description": "Relevant context the architect needs to answer"
                },
                "urgency": {
                    "type": "string",
                    "enum": ["low", "normal", "high"]
                }
            }
        })
    }

    async fn run(&self, input: Value, _cancel: CancellationToken) -> ToolOutput {
        match serde_json::from_value::<AskQuestionInput>(input) {
            Ok(parsed) if parsed.question.trim().is_empty() => {
                ToolOutput::error("question must not be empty")
            }
            Ok(parsed) => ToolOutput::success("question forwarded to the architect")
                .with_effect(ProcessEffect::Question(QuestionPayload {
                    question: parsed.question,
                    context: parsed.context,
                    urgency: parsed.urgency,
                })),
            Err(e) => ToolOutput::error(format!("invalid input: {e}")),
        }
    }
}

// ============================================================================
// todos_add
// ============================================================================

/// Record work items. Terminal in the todo-collection loop; a
/// `ProcessEffect` during coding (mid-story additions).
pub struct TodosAddTool;

#[derive(Debug, Deserialize)]
struct TodosAddInput {
    todos: Vec<String>,
}

#[async_trait]
impl Tool for TodosAddTool {
    fn name(&self) -> &str {
        TOOL_TODOS_ADD
    }

    fn description(&self) -> String {
        "Add work items to the todo list. Each item is one atomic, verifiable task."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Ordered task descriptions"
                }
            }
        })
    }

    async fn run(&self, input: Value, _cancel: CancellationToken) -> ToolOutput {
        match extract_todos(&input) {
            Ok(todos) => {
                let count = todos.len();
                ToolOutput::success(format!("recorded {count} todo(s)"))
                    .with_effect(ProcessEffect::AddTodos(todos))
            }
            Err(e) => ToolOutput::error(e),
        }
    }
}

// ============================================================================
// todo_complete
// ============================================================================

/// Mark the current todo finished. The handler owns the list, so the tool
/// only surfaces the event.
pub struct TodoCompleteTool;

#[async_trait]
impl Tool for TodoCompleteTool {
    fn name(&self) -> &str {
        TOOL_TODO_COMPLETE
    }

    fn description(&self) -> String {
        "Mark the current todo item complete after its change is implemented and verified."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "note": {
                    "type": "string",
                    "description": "Optional note on how the item was finished"
                }
            }
        })
    }

    async fn run(&self, _input: Value, _cancel: CancellationToken) -> ToolOutput {
        ToolOutput::success("todo marked complete").with_effect(ProcessEffect::CompleteTodo)
    }
}

// ============================================================================
// submit_plan (terminal)
// ============================================================================

/// Terminal tool for the planning loop
pub struct SubmitPlanTool;

#[async_trait]
impl Tool for SubmitPlanTool {
    fn name(&self) -> &str {
        TOOL_SUBMIT_PLAN
    }

    fn description(&self) -> String {
        "Submit the finished implementation plan for architect review. \
         Call exactly once, when the plan is complete."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["plan"],
            "properties": {
                "plan": {
                    "type": "string",
                    "description": "The full implementation plan, in markdown"
                }
            }
        })
    }

    async fn run(&self, input: Value, _cancel: CancellationToken) -> ToolOutput {
        match extract_plan(&input) {
            Ok(_) => ToolOutput::success("plan recorded"),
            Err(e) => ToolOutput::error(e),
        }
    }
}

// ============================================================================
// done (terminal)
// ============================================================================

/// Terminal tool for the coding loop. The loop validates the todo list
/// before honoring it.
pub struct DoneTool;

#[async_trait]
impl Tool for DoneTool {
    fn name(&self) -> &str {
        TOOL_DONE
    }

    fn description(&self) -> String {
        "Signal that every todo is complete and the story is ready for testing. \
         Fails while any todo is still open."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "One-paragraph summary of what was implemented"
                }
            }
        })
    }

    async fn run(&self, _input: Value, _cancel: CancellationToken) -> ToolOutput {
        ToolOutput::success("completion recorded")
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Pull the plan text out of a `submit_plan` invocation
pub fn extract_plan(input: &Value) -> Result<String, String> {
    match input.get("plan").and_then(Value::as_str) {
        Some(plan) if !plan.trim().is_empty() => Ok(plan.to_string()),
        Some(_) => Err("plan must not be empty".to_string()),
        None => Err("missing required field: plan".to_string()),
    }
}

/// Pull the task descriptions out of a `todos_add` invocation
pub fn extract_todos(input: &Value) -> Result<Vec<String>, String> {
    let Some(raw) = input.get("todos").and_then(Value::as_array) else {
        return Err("missing required field: todos".to_string());
    };
    let todos: Vec<String> = raw
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if todos.len() != raw.len() || todos.is_empty() {
        return Err("todos must be a non-empty array of non-empty strings".to_string());
    }
    Ok(todos)
}
