//! The coder agent kernel
//!
//! Owns the workflow state and its data, validates transitions against the
//! static table, persists after every step, and drives the per-state
//! handlers until a terminal state is reached.

mod handlers;
mod resume;
mod traits;

#[cfg(test)]
pub mod testing;

pub use traits::{BuildBackend, Sandbox, SandboxMode, TestReport, Workspace};

use crate::config::AgentConfig;
use crate::context::{ContextError, ContextManager};
use crate::effects::EffectRuntime;
use crate::llm::LlmClient;
use crate::message::Envelope;
use crate::persist::{ContextRecord, CoderRecord, PersistError, PersistHandle};
use crate::tools::{
    AskQuestionTool, DoneTool, SubmitPlanTool, TodoCompleteTool, TodosAddTool, ToolRegistry,
};
use crate::workflow::{
    validate_transition, CoderState, DataKey, InvalidTransition, StateData, StateDataError,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Context-record type under which the conversation log is persisted
pub const CONTEXT_TYPE: &str = "coder";

/// Agent-level errors. A handler returning one of these triggers the
/// implicit transition to `ERROR`, except `Suspend`, which ends the run
/// with the persisted state untouched so a later resume can re-enter.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("story channel closed")]
    ChannelClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("service unavailable: {0}")]
    Suspend(String),
    #[error("workspace failure: {0}")]
    Workspace(String),
    #[error("sandbox failure: {0}")]
    Sandbox(String),
    #[error("build failure: {0}")]
    Build(String),
    #[error("llm failure: {0}")]
    Llm(String),
    #[error("architect rejected {what}: {feedback}")]
    Rejected { what: &'static str, feedback: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("persistence failure: {0}")]
    Persist(#[from] PersistError),
    #[error("effect failed: {0}")]
    Effect(String),
}

impl AgentError {
    /// Suspension leaves the workflow resumable instead of failing it
    pub fn is_suspend(&self) -> bool {
        matches!(self, AgentError::Suspend(_))
    }
}

impl From<StateDataError> for AgentError {
    fn from(e: StateDataError) -> Self {
        AgentError::Invariant(e.to_string())
    }
}

impl From<ContextError> for AgentError {
    fn from(e: ContextError) -> Self {
        AgentError::Invariant(e.to_string())
    }
}

impl From<InvalidTransition> for AgentError {
    fn from(e: InvalidTransition) -> Self {
        AgentError::Invariant(e.to_string())
    }
}

/// What a handler tells the kernel to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub next: Option<CoderState>,
    pub done: bool,
}

impl Step {
    /// Transition to `next` and keep stepping
    pub fn advance(next: CoderState) -> Self {
        Self {
            next: Some(next),
            done: false,
        }
    }

    /// Stay in the current state (only terminal handlers and shutdown)
    pub fn finish() -> Self {
        Self {
            next: None,
            done: true,
        }
    }
}

/// External collaborators handed to the agent at construction
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub workspace: Arc<dyn Workspace>,
    pub sandbox: Arc<dyn Sandbox>,
    pub build: Arc<dyn BuildBackend>,
    pub persist: PersistHandle,
}

/// Channel endpoints wiring the agent to the orchestrator and architect
pub struct AgentChannels {
    pub story_rx: mpsc::Receiver<Envelope>,
    pub reply_rx: mpsc::Receiver<Envelope>,
    pub outbound_tx: mpsc::Sender<Envelope>,
}

/// One LLM-backed coder working a single story at a time
pub struct CoderAgent {
    config: AgentConfig,
    state: CoderState,
    data: StateData,
    context: ContextManager,
    effects: EffectRuntime,
    story_rx: mpsc::Receiver<Envelope>,
    reply_rx: mpsc::Receiver<Envelope>,
    llm: Arc<dyn LlmClient>,
    planning_tools: ToolRegistry,
    coding_tools: ToolRegistry,
    workspace: Arc<dyn Workspace>,
    sandbox: Arc<dyn Sandbox>,
    build: Arc<dyn BuildBackend>,
    persist: PersistHandle,
    cancel: CancellationToken,
    history: Vec<CoderState>,
}

impl CoderAgent {
    /// Build a fresh agent in `WAITING`. The supplied registries carry the
    /// concrete development tools; the protocol tools are added here.
    pub fn new(
        config: AgentConfig,
        collaborators: Collaborators,
        channels: AgentChannels,
        planning_tools: ToolRegistry,
        coding_tools: ToolRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let effects = EffectRuntime::new(
            config.agent_id.clone(),
            config.architect_id.clone(),
            channels.outbound_tx,
        );
        let planning_tools = planning_tools
            .with(Arc::new(AskQuestionTool))
            .with(Arc::new(SubmitPlanTool));
        let coding_tools = coding_tools
            .with(Arc::new(AskQuestionTool))
            .with(Arc::new(TodosAddTool))
            .with(Arc::new(TodoCompleteTool))
            .with(Arc::new(DoneTool));

        Self {
            state: CoderState::Waiting,
            data: StateData::new(),
            context: ContextManager::new(""),
            effects,
            story_rx: channels.story_rx,
            reply_rx: channels.reply_rx,
            llm: collaborators.llm,
            planning_tools,
            coding_tools,
            workspace: collaborators.workspace,
            sandbox: collaborators.sandbox,
            build: collaborators.build,
            persist: collaborators.persist,
            cancel,
            history: vec![CoderState::Waiting],
            config,
        }
    }

    pub fn state(&self) -> CoderState {
        self.state
    }

    pub fn data(&self) -> &StateData {
        &self.data
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    /// Every state the agent has been in, in order
    pub fn history(&self) -> &[CoderState] {
        &self.history
    }

    /// Install a state without transition validation. Resume-only.
    pub(crate) fn force_state(&mut self, state: CoderState) {
        self.state = state;
        self.history.push(state);
    }

    fn story_id(&self) -> String {
        self.data
            .get::<String>(DataKey::StoryId)
            .ok()
            .flatten()
            .unwrap_or_else(|| "-".to_string())
    }

    /// Drive the workflow until a terminal state or a suspension
    pub async fn run(mut self) -> Result<CoderState, AgentError> {
        tracing::info!(agent_id = %self.config.agent_id, "coder agent started");
        loop {
            match self.step().await {
                Ok(true) => {
                    return Ok(self.state);
                }
                Ok(false) => {}
                Err(e) if e.is_suspend() => {
                    tracing::warn!(
                        agent_id = %self.config.agent_id,
                        story_id = %self.story_id(),
                        state = %self.state,
                        error = %e,
                        "suspending workflow for later resume"
                    );
                    return Err(e);
                }
                Err(e) => {
                    // Implicit transition to ERROR: deliberately unvalidated
                    // so a failing handler can never wedge the workflow.
                    self.data.set(DataKey::ErrorMessage, &e.to_string());
                    self.force_state(CoderState::Error);
                    if let Err(persist_err) = self.persist_snapshot().await {
                        tracing::error!(
                            agent_id = %self.config.agent_id,
                            error = %persist_err,
                            "failed to persist error state"
                        );
                    }
                }
            }
        }
    }

    /// Dispatch one step to the current state's handler, validate and
    /// commit any transition, and persist the result.
    pub async fn step(&mut self) -> Result<bool, AgentError> {
        let current = self.state;
        let step = match current {
            CoderState::Waiting => self.handle_waiting().await?,
            CoderState::Setup => self.handle_setup().await?,
            CoderState::Planning => self.handle_planning().await?,
            CoderState::PlanReview => self.handle_plan_review().await?,
            CoderState::Coding => self.handle_coding().await?,
            CoderState::Testing => self.handle_testing().await?,
            CoderState::CodeReview => self.handle_code_review().await?,
            CoderState::AwaitMerge => self.handle_await_merge().await?,
            CoderState::BudgetReview => self.handle_budget_review().await?,
            CoderState::Question => self.handle_question().await?,
            CoderState::Done | CoderState::Error => self.handle_terminal(),
        };

        if let Some(next) = step.next {
            if next != current {
                validate_transition(current, next)?;
                tracing::info!(
                    agent_id = %self.config.agent_id,
                    story_id = %self.story_id(),
                    from = %current,
                    to = %next,
                    "transition"
                );
                self.state = next;
                self.history.push(next);
            }
        }

        self.persist_snapshot().await?;
        Ok(step.done)
    }

    /// Persist the current state, state data, and conversation context.
    /// Writes flow through the ordered persistence channel; terminal
    /// states wait for the store acknowledgement.
    pub(crate) async fn persist_snapshot(&self) -> Result<(), AgentError> {
        let record = CoderRecord {
            session_id: self.config.session_id.clone(),
            agent_id: self.config.agent_id.clone(),
            state: self.state,
            data: self.data.clone(),
            updated_at: Utc::now(),
        };
        if self.state.is_terminal() {
            self.persist.save_coder_synced(record).await?;
        } else {
            self.persist.save_coder(record).await?;
        }

        let payload = self.context.serialize()?;
        self.persist
            .save_context(ContextRecord {
                session_id: self.config.session_id.clone(),
                agent_id: self.config.agent_id.clone(),
                context_type: CONTEXT_TYPE.to_string(),
                payload,
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Terminal states log exactly once and stop the step loop
    fn handle_terminal(&mut self) -> Step {
        if !self.data.flag(DataKey::DoneLogged) {
            let reason = self
                .data
                .get::<String>(DataKey::ErrorMessage)
                .ok()
                .flatten();
            match self.state {
                CoderState::Error => tracing::error!(
                    agent_id = %self.config.agent_id,
                    story_id = %self.story_id(),
                    final_state = %self.state,
                    reason = reason.as_deref().unwrap_or("-"),
                    "story failed"
                ),
                _ => tracing::info!(
                    agent_id = %self.config.agent_id,
                    story_id = %self.story_id(),
                    final_state = %self.state,
                    "story finished"
                ),
            }
            self.data.set_flag(DataKey::DoneLogged, true);
        }
        Step::finish()
    }
}
