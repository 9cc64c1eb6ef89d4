//! Per-state workflow handlers
//!
//! Each handler runs one step in its state and returns the transition (or
//! completion) for the kernel to validate and commit. Handlers are linear:
//! asynchronous exchanges with the architect go through
//! `execute_pending_effect`, which re-sends the persisted request after a
//! restart and blocks for the correlated reply.

use super::{AgentError, CoderAgent, SandboxMode, Step};
use crate::effects::{Effect, EffectError, EffectReply};
use crate::message::{ApprovalStatus, ApprovalType, MessageType, QuestionPayload, StoryType};
use crate::persist::{extract_terms, KnowledgePack};
use crate::toolloop::{run_loop, truncate_output, IterationBudget, LoopOutcome, LoopSetup};
use crate::tools::{
    extract_plan, extract_todos, ProcessEffect, TodosAddTool, TOOL_DONE, TOOL_SUBMIT_PLAN,
    TOOL_TODOS_ADD,
};
use crate::workflow::{
    BudgetReason, CoderState, DataKey, PendingApproval, PendingMerge, PendingQuestion, TodoList,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const PLANNING_TEMPLATE: &str = "planning";
const CODING_TEMPLATE: &str = "coding";

const PLANNING_PROMPT: &str = "\
You are a software developer planning one story of work. Study the story \
and the workspace, then produce a concrete implementation plan. You have \
read-only access to the checkout. Submit the finished plan with \
submit_plan; ask the architect with ask_question if a decision blocks you.";

const CODING_PROMPT: &str = "\
You are a software developer implementing an approved plan, one todo at a \
time. Make the changes in the workspace, verify them, and mark each item \
with todo_complete. Record newly discovered work with todos_add. When \
every todo is complete, call done.";

const PLANNING_REMINDERS: &str = "\
Submit exactly one plan with submit_plan. Do not start implementing.";

const CODING_REMINDERS: &str = "\
Work the todo list in order. done fails while any todo is open.";

impl CoderAgent {
    // ==================== WAITING ====================

    pub(super) async fn handle_waiting(&mut self) -> Result<Step, AgentError> {
        let envelope = tokio::select! {
            () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            received = self.story_rx.recv() => {
                received.ok_or(AgentError::ChannelClosed)?
            }
        };

        match envelope.msg_type {
            MessageType::Shutdown => {
                tracing::info!(agent_id = %self.config.agent_id, "shutdown requested");
                Ok(Step::finish())
            }
            MessageType::Story => {
                let spec = envelope
                    .story_spec()
                    .map_err(|e| AgentError::Invariant(e.to_string()))?;
                tracing::info!(
                    agent_id = %self.config.agent_id,
                    story_id = %spec.story_id,
                    story_type = ?spec.story_type,
                    "story received"
                );
                self.data.set(DataKey::StoryId, &spec.story_id);
                self.data.set(DataKey::TaskContent, &spec.task_content);
                self.data.set(DataKey::StoryType, &spec.story_type);
                Ok(Step::advance(CoderState::Setup))
            }
            other => Err(AgentError::Invariant(format!(
                "unexpected {other:?} envelope on the story channel"
            ))),
        }
    }

    // ==================== SETUP ====================

    pub(super) async fn handle_setup(&mut self) -> Result<Step, AgentError> {
        let story_id: String = self.data.get_required(DataKey::StoryId)?;
        let story_type: StoryType = self.data.get_required(DataKey::StoryType)?;

        // Clean scratch space from any previous story
        let work_dir = self.config.work_dir.clone();
        match tokio::fs::remove_dir_all(&work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::Workspace(format!("cleaning work dir: {e}"))),
        }
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| AgentError::Workspace(format!("creating work dir: {e}")))?;

        let checkout = self
            .workspace
            .prepare(&story_id, &work_dir)
            .await
            .map_err(AgentError::Workspace)?;
        self.data
            .set(DataKey::WorkspacePath, &checkout.display().to_string());

        // Planning runs against a read-only environment
        let container = self
            .sandbox
            .start(&checkout, SandboxMode::ReadOnly)
            .await
            .map_err(AgentError::Sandbox)?;
        self.data.set(DataKey::ContainerName, &container);

        // Devops stories work on the container configuration itself, so
        // they test through the infra check and promote the config after
        // merge.
        if story_type == StoryType::Devops {
            self.data.set_flag(DataKey::ContainerModified, true);
        }

        Ok(Step::advance(CoderState::Planning))
    }

    // ==================== PLANNING ====================

    pub(super) async fn handle_planning(&mut self) -> Result<Step, AgentError> {
        let task: String = self.data.get_required(DataKey::TaskContent)?;

        if self.context.template() != PLANNING_TEMPLATE {
            self.context.reset_for_template(PLANNING_TEMPLATE);
            self.context
                .append_system(format!("Story briefing:\n\n{task}"))?;
            self.seed_knowledge(&task).await?;
            self.context.buffer_user(
                "Study the story and the workspace, then submit an implementation plan.",
            );
        }

        let key = format!("{}:{}", self.config.agent_id, self.state);
        let setup = LoopSetup {
            agent_key: &key,
            system_prompt: PLANNING_PROMPT,
            reminders: PLANNING_REMINDERS,
            terminal_tool: TOOL_SUBMIT_PLAN,
            terminal_hook: Box::new(|input| extract_plan(input).map(Value::String)),
            max_iterations: self.config.max_loop_iterations,
            tool_output_limit: self.config.tool_output_limit,
            max_tokens: self.config.max_tokens,
            fail_fast_on_empty: self.data.flag(DataKey::EmptyResponseRetried),
        };
        let mut budget = self
            .config
            .planning_limits
            .resume(self.data.counter(DataKey::PlanningIterations));
        let llm = self.llm.clone();
        let tools = self.planning_tools.clone();
        let outcome = run_loop(
            &*llm,
            &tools,
            &mut self.context,
            &mut budget,
            &setup,
            &self.cancel,
        )
        .await;
        self.data
            .set_counter(DataKey::PlanningIterations, budget.count);

        match outcome {
            LoopOutcome::Terminal { value } => {
                let plan = value
                    .as_str()
                    .ok_or_else(|| AgentError::Invariant("submit_plan produced no text".into()))?
                    .to_string();
                self.data.set(DataKey::Plan, &plan);
                Ok(Step::advance(CoderState::PlanReview))
            }
            LoopOutcome::Effect(ProcessEffect::Question(payload)) => {
                self.queue_question(payload, CoderState::Planning)
            }
            LoopOutcome::Effect(effect) => Err(AgentError::Invariant(format!(
                "unexpected process effect during planning: {effect:?}"
            ))),
            failure => self.escalate_loop_failure(failure, CoderState::Planning),
        }
    }

    /// First visit only: pull an optional knowledge pack keyed by terms
    /// from the task content. Lookup failures are not fatal.
    async fn seed_knowledge(&mut self, task: &str) -> Result<(), AgentError> {
        if let Some(pack) = self.data.get::<KnowledgePack>(DataKey::KnowledgePack)? {
            self.context
                .append_system(format!("Background knowledge:\n\n{}", pack.content))?;
            return Ok(());
        }
        let terms = extract_terms(task);
        if terms.is_empty() {
            return Ok(());
        }
        match self
            .persist
            .knowledge(terms, self.config.knowledge_deadline)
            .await
        {
            Ok(Some(pack)) => {
                self.data.set(DataKey::KnowledgePack, &pack);
                self.context
                    .append_system(format!("Background knowledge:\n\n{}", pack.content))?;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.config.agent_id,
                    error = %e,
                    "knowledge lookup failed; planning without it"
                );
            }
        }
        Ok(())
    }

    // ==================== PLAN_REVIEW ====================

    pub(super) async fn handle_plan_review(&mut self) -> Result<Step, AgentError> {
        let pending = match self.data.pending_approval()? {
            Some(pending) => pending,
            None => {
                let plan: String = self.data.get_required(DataKey::Plan)?;
                let pending = PendingApproval {
                    correlation_id: Uuid::new_v4(),
                    approval_type: ApprovalType::Plan,
                    content: json!({
                        "story_id": self.story_id(),
                        "plan": plan,
                    }),
                    origin: None,
                    reason: None,
                };
                self.data.set_pending_approval(&pending)?;
                self.persist_snapshot().await?;
                pending
            }
        };

        let reply = self
            .execute_pending_effect(&Effect::from(&pending), true)
            .await?;
        let EffectReply::Review(result) = reply else {
            return Err(AgentError::Invariant(
                "answer payload for an approval effect".into(),
            ));
        };
        self.data.clear_pending_approval();

        match (pending.approval_type, result.status) {
            (ApprovalType::Plan, ApprovalStatus::Approved) => {
                let todos = self.collect_todos().await?;
                self.data.set_todo_list(&todos);

                // The coding loop needs write access; reconfiguration is
                // destroy-and-recreate and must succeed first.
                let container: String = self.data.get_required(DataKey::ContainerName)?;
                let workspace: String = self.data.get_required(DataKey::WorkspacePath)?;
                let container = self
                    .sandbox
                    .reconfigure(&container, Path::new(&workspace), SandboxMode::ReadWrite)
                    .await
                    .map_err(AgentError::Sandbox)?;
                self.data.set(DataKey::ContainerName, &container);

                Ok(Step::advance(CoderState::Coding))
            }
            (ApprovalType::Plan, ApprovalStatus::NeedsChanges | ApprovalStatus::Rejected) => {
                let feedback = result
                    .feedback
                    .unwrap_or_else(|| "The plan needs revision.".to_string());
                self.context.append_feedback(format!("Plan review: {feedback}"))?;
                // A new plan gets a fresh budget
                self.data.set_counter(DataKey::PlanningIterations, 0);
                Ok(Step::advance(CoderState::Planning))
            }
            (ApprovalType::Completion, ApprovalStatus::Approved) => {
                Ok(Step::advance(CoderState::Done))
            }
            (ApprovalType::Completion, ApprovalStatus::NeedsChanges) => {
                let feedback = result
                    .feedback
                    .unwrap_or_else(|| "The work is not complete.".to_string());
                self.context
                    .append_feedback(format!("Completion review: {feedback}"))?;
                Ok(Step::advance(CoderState::Coding))
            }
            (ApprovalType::Completion, ApprovalStatus::Rejected) => Err(AgentError::Rejected {
                what: "completion",
                feedback: result.feedback.unwrap_or_default(),
            }),
            (other, _) => Err(AgentError::Invariant(format!(
                "approval type {other:?} has no business in plan review"
            ))),
        }
    }

    /// One-shot todo-collection loop, retried once on failure
    async fn collect_todos(&mut self) -> Result<TodoList, AgentError> {
        let attempts = self.config.todo_collection_retries + 1;
        let tools = self.planning_tools.clone().with(Arc::new(TodosAddTool));
        let key = format!("{}:todo-collection", self.config.agent_id);

        for attempt in 1..=attempts {
            self.context.buffer_user(
                "The plan is approved. Break it into an ordered list of atomic todo \
                 items and record them with a single todos_add call.",
            );
            let setup = LoopSetup {
                agent_key: &key,
                system_prompt: PLANNING_PROMPT,
                reminders: "Record the todo list with one todos_add call.",
                terminal_tool: TOOL_TODOS_ADD,
                terminal_hook: Box::new(|input| extract_todos(input).map(|t| json!(t))),
                max_iterations: 4,
                tool_output_limit: self.config.tool_output_limit,
                max_tokens: self.config.max_tokens,
                fail_fast_on_empty: false,
            };
            let mut budget = IterationBudget::new(3, 4);
            let llm = self.llm.clone();
            let outcome = run_loop(
                &*llm,
                &tools,
                &mut self.context,
                &mut budget,
                &setup,
                &self.cancel,
            )
            .await;

            match outcome {
                LoopOutcome::Terminal { value } => {
                    let descriptions: Vec<String> = serde_json::from_value(value)
                        .map_err(|e| AgentError::Llm(format!("todos_add payload: {e}")))?;
                    return Ok(TodoList::from_descriptions(descriptions));
                }
                LoopOutcome::Cancelled => return Err(AgentError::Cancelled),
                LoopOutcome::LlmFailed(e) if e.is_transient() => {
                    return Err(AgentError::Suspend(e.to_string()));
                }
                failure => {
                    tracing::warn!(
                        agent_id = %self.config.agent_id,
                        attempt,
                        outcome = ?failure,
                        "todo collection attempt failed"
                    );
                }
            }
        }
        Err(AgentError::Llm(format!(
            "todo collection failed after {attempts} attempt(s)"
        )))
    }

    // ==================== CODING ====================

    pub(super) async fn handle_coding(&mut self) -> Result<Step, AgentError> {
        if self.context.template() != CODING_TEMPLATE {
            let task: String = self.data.get_required(DataKey::TaskContent)?;
            let plan: String = self.data.get_required(DataKey::Plan)?;
            let todos = self.data.todo_list()?;
            self.context.reset_for_template(CODING_TEMPLATE);
            self.context.append_system(format!(
                "Story briefing:\n\n{task}\n\nApproved plan:\n\n{plan}"
            ))?;
            self.context.buffer_user(format!(
                "Implement the plan. Todo list:\n{}",
                todos.render()
            ));
        }

        // Mid-story todo events keep the handler in CODING; only real
        // outcomes leave this loop.
        loop {
            let todos = self.data.todo_list()?;
            let key = format!("{}:{}", self.config.agent_id, self.state);
            let setup = LoopSetup {
                agent_key: &key,
                system_prompt: CODING_PROMPT,
                reminders: CODING_REMINDERS,
                terminal_tool: TOOL_DONE,
                terminal_hook: Box::new(move |input| {
                    if todos.all_completed() {
                        Ok(input.clone())
                    } else {
                        let open = todos.len() - todos.completed_count();
                        Err(format!(
                            "{open} todo(s) are still open:\n{}",
                            todos.render()
                        ))
                    }
                }),
                max_iterations: self.config.max_loop_iterations,
                tool_output_limit: self.config.tool_output_limit,
                max_tokens: self.config.max_tokens,
                fail_fast_on_empty: self.data.flag(DataKey::EmptyResponseRetried),
            };
            let mut budget = self
                .config
                .coding_limits
                .resume(self.data.counter(DataKey::CodingIterations));
            let llm = self.llm.clone();
            let tools = self.coding_tools.clone();
            let outcome = run_loop(
                &*llm,
                &tools,
                &mut self.context,
                &mut budget,
                &setup,
                &self.cancel,
            )
            .await;
            self.data
                .set_counter(DataKey::CodingIterations, budget.count);

            match outcome {
                LoopOutcome::Terminal { .. } => return Ok(Step::advance(CoderState::Testing)),
                LoopOutcome::Effect(ProcessEffect::Question(payload)) => {
                    return self.queue_question(payload, CoderState::Coding);
                }
                LoopOutcome::Effect(ProcessEffect::AddTodos(items)) => {
                    let mut todos = self.data.todo_list()?;
                    for item in items {
                        todos.add(item);
                    }
                    self.data.set_todo_list(&todos);
                }
                LoopOutcome::Effect(ProcessEffect::CompleteTodo) => {
                    let mut todos = self.data.todo_list()?;
                    if !todos.complete_current() {
                        tracing::warn!(
                            agent_id = %self.config.agent_id,
                            "todo_complete with no open todo"
                        );
                    }
                    self.data.set_todo_list(&todos);
                }
                failure => return self.escalate_loop_failure(failure, CoderState::Coding),
            }
        }
    }

    // ==================== TESTING ====================

    pub(super) async fn handle_testing(&mut self) -> Result<Step, AgentError> {
        // Armed at setup for devops stories; also covers any story whose
        // work touched the container configuration.
        let report = if self.data.flag(DataKey::ContainerModified) {
            let container: String = self.data.get_required(DataKey::ContainerName)?;
            self.sandbox
                .run_infra_check(&container)
                .await
                .map_err(AgentError::Sandbox)?
        } else {
            let workspace: String = self.data.get_required(DataKey::WorkspacePath)?;
            self.build
                .run_tests(Path::new(&workspace))
                .await
                .map_err(AgentError::Build)?
        };

        if report.passed {
            tracing::info!(
                agent_id = %self.config.agent_id,
                story_id = %self.story_id(),
                "tests passed"
            );
            return Ok(Step::advance(CoderState::CodeReview));
        }

        let output = truncate_output(&report.output, self.config.tool_output_limit);
        self.context.buffer_user(format!(
            "Tests failed:\n```\n{output}\n```\nFix the failures, re-open the affected \
             todos with todos_add if needed, and call done when everything passes."
        ));
        Ok(Step::advance(CoderState::Coding))
    }

    // ==================== CODE_REVIEW ====================

    pub(super) async fn handle_code_review(&mut self) -> Result<Step, AgentError> {
        let pending = match self.data.pending_approval()? {
            Some(pending) => pending,
            None => {
                let plan: String = self.data.get_required(DataKey::Plan)?;
                let todos = self.data.todo_list()?;
                let workspace: String = self.data.get_required(DataKey::WorkspacePath)?;
                let pending = PendingApproval {
                    correlation_id: Uuid::new_v4(),
                    approval_type: ApprovalType::Code,
                    content: json!({
                        "story_id": self.story_id(),
                        "plan": plan,
                        "todos": todos.render(),
                        "workspace_path": workspace,
                    }),
                    origin: None,
                    reason: None,
                };
                self.data.set_pending_approval(&pending)?;
                self.persist_snapshot().await?;
                pending
            }
        };

        let reply = self
            .execute_pending_effect(&Effect::from(&pending), true)
            .await?;
        let EffectReply::Review(result) = reply else {
            return Err(AgentError::Invariant(
                "answer payload for an approval effect".into(),
            ));
        };
        self.data.clear_pending_approval();

        match result.status {
            ApprovalStatus::Approved => {
                // Issue the merge request; AWAIT_MERGE collects the result
                let workspace: String = self.data.get_required(DataKey::WorkspacePath)?;
                let merge = PendingMerge {
                    correlation_id: Uuid::new_v4(),
                    story_id: self.story_id(),
                    workspace_path: workspace,
                };
                self.data.set_pending_merge(&merge)?;
                self.persist_snapshot().await?;
                self.effects
                    .begin(&Effect::from(&merge))
                    .await
                    .map_err(|e| map_effect_error(e, false))?;
                Ok(Step::advance(CoderState::AwaitMerge))
            }
            ApprovalStatus::NeedsChanges => {
                let feedback = result
                    .feedback
                    .unwrap_or_else(|| "The changes need another pass.".to_string());
                self.context
                    .append_feedback(format!("Code review: {feedback}"))?;
                Ok(Step::advance(CoderState::Coding))
            }
            ApprovalStatus::Rejected => Err(AgentError::Rejected {
                what: "code",
                feedback: result.feedback.unwrap_or_default(),
            }),
        }
    }

    // ==================== AWAIT_MERGE ====================

    pub(super) async fn handle_await_merge(&mut self) -> Result<Step, AgentError> {
        let pending = self.data.pending_merge()?.ok_or_else(|| {
            AgentError::Invariant("AWAIT_MERGE entered without a pending merge".into())
        })?;

        let reply = self
            .execute_pending_effect(&Effect::from(&pending), false)
            .await?;
        let EffectReply::Review(result) = reply else {
            return Err(AgentError::Invariant(
                "answer payload for a merge effect".into(),
            ));
        };
        self.data.set(DataKey::MergeResult, &result);

        match result.status {
            ApprovalStatus::Approved => {
                self.data.clear_pending_merge();

                // Post-merge side effects: container config promotion and
                // a knowledge reindex of the merged story.
                if self.data.flag(DataKey::ContainerModified) {
                    let container: String = self.data.get_required(DataKey::ContainerName)?;
                    let image = self
                        .sandbox
                        .promote_config(&container)
                        .await
                        .map_err(AgentError::Sandbox)?;
                    self.data.set(DataKey::ContainerImage, &image);
                }
                if let Err(e) = self.persist.reindex(&self.story_id()).await {
                    tracing::warn!(
                        agent_id = %self.config.agent_id,
                        error = %e,
                        "reindex request failed"
                    );
                }
                Ok(Step::advance(CoderState::Done))
            }
            ApprovalStatus::NeedsChanges => {
                self.data.clear_pending_merge();
                let detail = result
                    .conflict_info
                    .or(result.feedback)
                    .unwrap_or_else(|| "unspecified merge issue".to_string());
                let mut todos = self.data.todo_list()?;
                todos.add(format!("Address merge issue: {detail}"));
                self.data.set_todo_list(&todos);
                self.context
                    .append_architect(format!("The merge needs changes: {detail}"))?;
                Ok(Step::advance(CoderState::Coding))
            }
            ApprovalStatus::Rejected => Err(AgentError::Rejected {
                what: "merge",
                feedback: result.feedback.unwrap_or_default(),
            }),
        }
    }

    // ==================== BUDGET_REVIEW ====================

    pub(super) async fn handle_budget_review(&mut self) -> Result<Step, AgentError> {
        let pending = self.data.pending_approval()?.ok_or_else(|| {
            AgentError::Invariant("BUDGET_REVIEW entered without a pending approval".into())
        })?;
        if pending.approval_type != ApprovalType::BudgetReview {
            return Err(AgentError::Invariant(format!(
                "approval type {:?} has no business in budget review",
                pending.approval_type
            )));
        }
        let origin = pending
            .origin
            .ok_or_else(|| AgentError::Invariant("budget review without an origin".into()))?;
        let reason = pending
            .reason
            .ok_or_else(|| AgentError::Invariant("budget review without a reason".into()))?;

        let reply = self
            .execute_pending_effect(&Effect::from(&pending), true)
            .await?;
        let EffectReply::Review(result) = reply else {
            return Err(AgentError::Invariant(
                "answer payload for an approval effect".into(),
            ));
        };
        self.data.clear_pending_approval();
        self.data.remove(DataKey::Origin);

        match result.status {
            ApprovalStatus::Approved => {
                match origin {
                    CoderState::Planning => {
                        self.data.set_counter(DataKey::PlanningIterations, 0);
                    }
                    CoderState::Coding => {
                        self.data.set_counter(DataKey::CodingIterations, 0);
                    }
                    other => {
                        return Err(AgentError::Invariant(format!(
                            "budget review origin {other} is not a loop state"
                        )));
                    }
                }
                if reason == BudgetReason::EmptyResponse {
                    self.data.set_flag(DataKey::EmptyResponseRetried, true);
                }
                if let Some(feedback) = result.feedback {
                    self.context
                        .append_feedback(format!("Budget review: {feedback}"))?;
                }
                Ok(Step::advance(origin))
            }
            ApprovalStatus::NeedsChanges => {
                // The architect wants a different approach: replan
                let feedback = result
                    .feedback
                    .unwrap_or_else(|| "Rework the approach.".to_string());
                self.context
                    .append_feedback(format!("Budget review: {feedback}"))?;
                self.data.set_counter(DataKey::PlanningIterations, 0);
                Ok(Step::advance(CoderState::Planning))
            }
            ApprovalStatus::Rejected => Err(AgentError::Rejected {
                what: "budget extension",
                feedback: result.feedback.unwrap_or_default(),
            }),
        }
    }

    // ==================== QUESTION ====================

    pub(super) async fn handle_question(&mut self) -> Result<Step, AgentError> {
        let pending = self.data.pending_question()?.ok_or_else(|| {
            AgentError::Invariant("QUESTION entered without a pending question".into())
        })?;

        let reply = self
            .execute_pending_effect(&Effect::from(&pending), false)
            .await?;
        let EffectReply::Answer { text } = reply else {
            return Err(AgentError::Invariant(
                "review payload for a question effect".into(),
            ));
        };

        self.context.append_feedback(format!(
            "Question: {}\n\nArchitect's answer: {text}",
            pending.payload.question
        ))?;
        self.data.clear_pending_question();
        self.data.remove(DataKey::Origin);
        Ok(Step::advance(pending.origin))
    }

    // ==================== Shared helpers ====================

    /// Stash a question from the loop and move to QUESTION
    fn queue_question(
        &mut self,
        payload: QuestionPayload,
        origin: CoderState,
    ) -> Result<Step, AgentError> {
        let pending = PendingQuestion {
            correlation_id: Uuid::new_v4(),
            payload,
            origin,
        };
        self.data.set_pending_question(&pending)?;
        self.data.set(DataKey::Origin, &origin);
        Ok(Step::advance(CoderState::Question))
    }

    /// Stash a budget-review submission and move to BUDGET_REVIEW
    fn queue_budget_review(
        &mut self,
        origin: CoderState,
        reason: BudgetReason,
    ) -> Result<Step, AgentError> {
        let counter_key = if origin == CoderState::Planning {
            DataKey::PlanningIterations
        } else {
            DataKey::CodingIterations
        };
        let pending = PendingApproval {
            correlation_id: Uuid::new_v4(),
            approval_type: ApprovalType::BudgetReview,
            content: json!({
                "story_id": self.story_id(),
                "origin": origin,
                "reason": reason,
                "iterations_used": self.data.counter(counter_key),
            }),
            origin: Some(origin),
            reason: Some(reason),
        };
        self.data.set_pending_approval(&pending)?;
        self.data.set(DataKey::Origin, &origin);
        Ok(Step::advance(CoderState::BudgetReview))
    }

    /// Route a failed loop outcome: budget and empty-response escalations
    /// go to BUDGET_REVIEW, transient service loss suspends, the rest kill
    /// the story.
    fn escalate_loop_failure(
        &mut self,
        outcome: LoopOutcome,
        origin: CoderState,
    ) -> Result<Step, AgentError> {
        match outcome {
            LoopOutcome::IterationLimit { count } => {
                self.queue_budget_review(origin, BudgetReason::IterationLimit { count })
            }
            LoopOutcome::NoToolTwice => {
                if self.data.flag(DataKey::EmptyResponseRetried) {
                    Err(AgentError::Llm(
                        "LLM kept returning empty responses after a granted budget review"
                            .to_string(),
                    ))
                } else {
                    self.queue_budget_review(origin, BudgetReason::EmptyResponse)
                }
            }
            LoopOutcome::MaxIterations => Err(AgentError::Llm(format!(
                "loop exceeded the absolute iteration cap in {origin}"
            ))),
            LoopOutcome::LlmFailed(e) if e.is_transient() => {
                Err(AgentError::Suspend(e.to_string()))
            }
            LoopOutcome::LlmFailed(e) => Err(AgentError::Llm(e.to_string())),
            LoopOutcome::Extraction(message) => Err(AgentError::Llm(message)),
            LoopOutcome::Cancelled => Err(AgentError::Cancelled),
            LoopOutcome::Terminal { .. } | LoopOutcome::Effect(_) => Err(AgentError::Invariant(
                "routable outcome passed to escalate_loop_failure".to_string(),
            )),
        }
    }

    /// Send the pending effect's request if it is not already in flight
    /// (fresh entry or post-restart re-send) and block for the reply.
    async fn execute_pending_effect(
        &mut self,
        effect: &Effect,
        timeout_fatal: bool,
    ) -> Result<EffectReply, AgentError> {
        match self.effects.in_flight() {
            None => {
                self.effects
                    .begin(effect)
                    .await
                    .map_err(|e| map_effect_error(e, timeout_fatal))?;
            }
            Some((correlation_id, _)) if correlation_id == effect.correlation_id() => {}
            Some((correlation_id, kind)) => {
                return Err(AgentError::Invariant(format!(
                    "in-flight {kind:?} effect {correlation_id} does not match pending {}",
                    effect.correlation_id()
                )));
            }
        }
        self.effects
            .wait(&mut self.reply_rx, self.config.effect_deadline, &self.cancel)
            .await
            .map_err(|e| map_effect_error(e, timeout_fatal))
    }
}

/// Classify an effect failure. Deadline expiry is fatal for approvals and
/// transient (suspend) for questions and merges; protocol violations are
/// always invariant errors.
fn map_effect_error(e: EffectError, timeout_fatal: bool) -> AgentError {
    match e {
        EffectError::Cancelled => AgentError::Cancelled,
        EffectError::Timeout(_) if timeout_fatal => AgentError::Effect(e.to_string()),
        EffectError::Timeout(_) => AgentError::Suspend(e.to_string()),
        EffectError::ReplyChannelClosed | EffectError::OutboundClosed => {
            AgentError::Suspend(e.to_string())
        }
        EffectError::AlreadyInFlight(_)
        | EffectError::NotInFlight
        | EffectError::CorrelationMismatch { .. }
        | EffectError::PayloadMismatch { .. } => AgentError::Invariant(e.to_string()),
    }
}
