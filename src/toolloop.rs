//! The iteration-budgeted LLM tool-calling loop
//!
//! One invocation drives the LLM until a terminal tool fires, a general
//! tool surfaces a `ProcessEffect`, the budget runs out, or the model
//! misbehaves. The loop owns the iteration counters; handlers persist them.

use crate::context::ContextManager;
use crate::llm::{complete_with_retry, LlmClient, LlmError};
use crate::tools::{ProcessEffect, ToolRegistry};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Iteration accounting for one workflow state. `count` survives loop
/// invocations (persisted in state data) so budgets accrue across
/// re-entries until a budget review resets them.
#[derive(Debug, Clone, Copy)]
pub struct IterationBudget {
    pub count: u32,
    pub soft_limit: u32,
    pub hard_limit: u32,
}

impl IterationBudget {
    pub fn new(soft_limit: u32, hard_limit: u32) -> Self {
        Self {
            count: 0,
            soft_limit,
            hard_limit,
        }
    }

    pub fn resume(count: u32, soft_limit: u32, hard_limit: u32) -> Self {
        Self {
            count,
            soft_limit,
            hard_limit,
        }
    }
}

/// Per-invocation loop configuration
pub struct LoopSetup<'a> {
    /// Identifies the running agent and state in log lines
    pub agent_key: &'a str,
    pub system_prompt: &'a str,
    /// Critical-reminders tail, appended uncached to every request
    pub reminders: &'a str,
    /// The one tool whose invocation ends the loop with an outcome
    pub terminal_tool: &'a str,
    /// Validates and extracts the terminal invocation's structured result.
    /// An `Err` is injected into context as a failed tool result and the
    /// loop continues.
    pub terminal_hook: TerminalHook<'a>,
    /// Absolute cap on iterations in this invocation
    pub max_iterations: u32,
    /// Tool output is truncated to this many characters before it enters
    /// the conversation
    pub tool_output_limit: usize,
    pub max_tokens: Option<u32>,
    /// After a granted empty-response budget review, a single further
    /// empty reply fails the loop instead of getting guidance.
    pub fail_fast_on_empty: bool,
}

pub type TerminalHook<'a> = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync + 'a>;

/// How a loop invocation ended
#[derive(Debug)]
pub enum LoopOutcome {
    /// The terminal tool fired and extraction succeeded
    Terminal { value: Value },
    /// A general tool suspended the loop for the handler to route
    Effect(ProcessEffect),
    /// The hard budget was reached; the handler escalates to budget review
    IterationLimit { count: u32 },
    /// Two consecutive replies with neither text nor tool calls
    NoToolTwice,
    /// The per-invocation safety cap was hit without a terminal signal
    MaxIterations,
    /// Completion failed after retries; the handler classifies
    LlmFailed(LlmError),
    /// The terminal invocation was structurally unusable
    Extraction(String),
    /// The enclosing context was cancelled
    Cancelled,
}

/// Truncate collaborator/tool output to the configured budget before it
/// enters the conversation
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated at {limit} characters]", &output[..end])
}

/// Run the loop until an outcome is produced.
#[allow(clippy::too_many_lines)] // The iteration policy reads best in one place
pub async fn run_loop(
    llm: &dyn LlmClient,
    tools: &ToolRegistry,
    ctx: &mut ContextManager,
    budget: &mut IterationBudget,
    setup: &LoopSetup<'_>,
    cancel: &CancellationToken,
) -> LoopOutcome {
    let mut iterations_this_run = 0u32;
    let mut consecutive_empty = 0u32;

    loop {
        if cancel.is_cancelled() {
            return LoopOutcome::Cancelled;
        }
        if budget.count >= budget.hard_limit {
            tracing::warn!(
                agent = setup.agent_key,
                count = budget.count,
                "iteration budget exhausted"
            );
            return LoopOutcome::IterationLimit {
                count: budget.count,
            };
        }
        if iterations_this_run >= setup.max_iterations {
            return LoopOutcome::MaxIterations;
        }
        if budget.count == budget.soft_limit {
            ctx.buffer_user(format!(
                "You have used {} of {} allotted iterations. Focus on finishing: \
                 call {} when the work is complete.",
                budget.count, budget.hard_limit, setup.terminal_tool
            ));
        }

        if let Err(e) = ctx.flush_user_buffer() {
            return LoopOutcome::Extraction(format!("context append failed: {e}"));
        }

        let request = ctx.build_request(
            setup.system_prompt,
            tools.definitions(),
            setup.reminders,
            setup.max_tokens,
        );

        let response = tokio::select! {
            () = cancel.cancelled() => return LoopOutcome::Cancelled,
            result = complete_with_retry(llm, &request) => match result {
                Ok(response) => response,
                Err(e) => return LoopOutcome::LlmFailed(e),
            },
        };

        budget.count += 1;
        iterations_this_run += 1;

        // Empty replies never become assistant messages; the two-tier
        // policy injects guidance once, then fails the loop.
        if response.is_empty() {
            consecutive_empty += 1;
            tracing::warn!(
                agent = setup.agent_key,
                streak = consecutive_empty,
                "LLM returned an empty response"
            );
            if consecutive_empty >= 2 || setup.fail_fast_on_empty {
                return LoopOutcome::NoToolTwice;
            }
            ctx.buffer_user(format!(
                "Your last reply was empty. Continue with the work: call {} when \
                 finished, or {} if you are blocked.",
                setup.terminal_tool,
                crate::tools::TOOL_ASK_QUESTION
            ));
            continue;
        }
        consecutive_empty = 0;

        if let Err(e) = ctx.append_assistant(response.content.clone()) {
            return LoopOutcome::Extraction(format!("context append failed: {e}"));
        }

        // Execute every call (side effects are preserved even alongside a
        // terminal call), then route: terminal beats effects beats continue.
        let mut terminal_value: Option<Value> = None;
        let mut effects: Vec<ProcessEffect> = Vec::new();

        for (id, name, input) in response.tool_uses() {
            if name == setup.terminal_tool {
                if !input.is_object() {
                    return LoopOutcome::Extraction(format!(
                        "terminal tool {name} invoked with non-object input"
                    ));
                }
                match (setup.terminal_hook)(input) {
                    Ok(value) => {
                        if let Err(e) = ctx.append_tool_result(id, "accepted", false) {
                            return LoopOutcome::Extraction(format!(
                                "context append failed: {e}"
                            ));
                        }
                        if terminal_value.is_none() {
                            terminal_value = Some(value);
                        }
                    }
                    Err(message) => {
                        tracing::debug!(
                            agent = setup.agent_key,
                            tool = name,
                            %message,
                            "terminal tool rejected"
                        );
                        if let Err(e) = ctx.append_tool_result(id, &message, true) {
                            return LoopOutcome::Extraction(format!(
                                "context append failed: {e}"
                            ));
                        }
                    }
                }
                continue;
            }

            let output = tools.execute(name, input.clone(), cancel.clone()).await;
            let (content, is_error, effect) = match output {
                Some(out) => (truncate_output(&out.output, setup.tool_output_limit), !out.success, out.effect),
                None => (format!("Unknown tool: {name}"), true, None),
            };
            if let Err(e) = ctx.append_tool_result(id, &content, is_error) {
                return LoopOutcome::Extraction(format!("context append failed: {e}"));
            }
            if let Some(effect) = effect {
                effects.push(effect);
            }
        }

        if let Some(value) = terminal_value {
            return LoopOutcome::Terminal { value };
        }
        if let Some(effect) = effects.pop() {
            if !effects.is_empty() {
                tracing::warn!(
                    agent = setup.agent_key,
                    dropped = effects.len(),
                    "multiple process effects in one iteration; keeping the last"
                );
            }
            return LoopOutcome::Effect(effect);
        }
    }
}
