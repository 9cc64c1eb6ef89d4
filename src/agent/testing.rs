//! Mock collaborators and end-to-end workflow tests
//!
//! The mocks script every asynchronous boundary: queued LLM responses, an
//! architect task that replies in order, stubbed workspace/sandbox/build
//! collaborators, and the in-memory store behind the persistence worker.

use super::{AgentChannels, CoderAgent, Collaborators, SandboxMode, TestReport};
use crate::config::AgentConfig;
use crate::llm::{LlmClient, LlmError, LlmRequest, LlmResponse};
use crate::message::{Envelope, ReviewResult};
use crate::persist::{MemoryStore, PersistHandle};
use crate::tools::ToolRegistry;
use crate::workflow::CoderState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Mock LLM client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlm {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unreachable("no scripted response queued")))
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

// ============================================================================
// Scripted architect
// ============================================================================

/// One scripted reply, sent for the next outbound request in order
pub enum ArchitectReply {
    Answer(String),
    Review(ReviewResult),
}

/// Spawn an architect task that answers outbound requests in script order
/// and returns every envelope it received.
pub fn spawn_architect(
    mut outbound_rx: mpsc::Receiver<Envelope>,
    reply_tx: mpsc::Sender<Envelope>,
    script: Vec<ArchitectReply>,
) -> JoinHandle<Vec<Envelope>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        let mut script = script.into_iter();
        while let Some(envelope) = outbound_rx.recv().await {
            let correlation_id = envelope.correlation_id;
            let from = envelope.to.clone();
            let to = envelope.from.clone();
            received.push(envelope);
            let Some(reply) = script.next() else {
                continue;
            };
            let out = match reply {
                ArchitectReply::Answer(text) => Envelope::answer(&from, &to, correlation_id, text),
                ArchitectReply::Review(result) => {
                    Envelope::result(&from, &to, correlation_id, result)
                }
            };
            if reply_tx.send(out).await.is_err() {
                break;
            }
        }
        received
    })
}

// ============================================================================
// Stub collaborators
// ============================================================================

/// Workspace stub that creates a checkout directory under the work dir
#[derive(Default)]
pub struct StubWorkspace {
    pub fail: bool,
    pub prepared: Mutex<Vec<String>>,
}

#[async_trait]
impl super::Workspace for StubWorkspace {
    async fn prepare(&self, story_id: &str, work_dir: &Path) -> Result<PathBuf, String> {
        if self.fail {
            return Err("clone failed: no such remote".to_string());
        }
        self.prepared.lock().unwrap().push(story_id.to_string());
        let checkout = work_dir.join("checkout");
        tokio::fs::create_dir_all(&checkout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(checkout)
    }
}

/// Sandbox stub that records every mode change
#[derive(Default)]
pub struct StubSandbox {
    pub modes: Mutex<Vec<SandboxMode>>,
    pub infra_reports: Mutex<VecDeque<TestReport>>,
    pub infra_checks: Mutex<u32>,
    pub promoted: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl StubSandbox {
    pub fn queue_infra_report(&self, report: TestReport) {
        self.infra_reports.lock().unwrap().push_back(report);
    }
}

#[async_trait]
impl super::Sandbox for StubSandbox {
    async fn start(&self, _workspace: &Path, mode: SandboxMode) -> Result<String, String> {
        self.modes.lock().unwrap().push(mode);
        Ok("jm-box-ro".to_string())
    }

    async fn reconfigure(
        &self,
        _container: &str,
        _workspace: &Path,
        mode: SandboxMode,
    ) -> Result<String, String> {
        self.modes.lock().unwrap().push(mode);
        Ok("jm-box-rw".to_string())
    }

    async fn run_infra_check(&self, _container: &str) -> Result<TestReport, String> {
        *self.infra_checks.lock().unwrap() += 1;
        Ok(self
            .infra_reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TestReport::passed("infra ok")))
    }

    async fn promote_config(&self, container: &str) -> Result<String, String> {
        self.promoted.lock().unwrap().push(container.to_string());
        Ok(format!("registry/{container}:promoted"))
    }

    async fn stop(&self, _container: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Build backend with queued reports (defaults to passing)
#[derive(Default)]
pub struct QueuedBuild {
    pub reports: Mutex<VecDeque<TestReport>>,
    pub runs: Mutex<u32>,
}

impl QueuedBuild {
    pub fn queue_report(&self, report: TestReport) {
        self.reports.lock().unwrap().push_back(report);
    }
}

#[async_trait]
impl super::BuildBackend for QueuedBuild {
    async fn run_tests(&self, _workspace: &Path) -> Result<TestReport, String> {
        *self.runs.lock().unwrap() += 1;
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TestReport::passed("all tests passed")))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::new("sess", "coder-1");
    config.work_dir = std::env::temp_dir().join(format!("journeyman-test-{}", Uuid::new_v4()));
    config
}

/// Everything a workflow test needs, pre-wired
pub struct Harness {
    pub agent: CoderAgent,
    pub llm: Arc<MockLlm>,
    pub workspace: Arc<StubWorkspace>,
    pub sandbox: Arc<StubSandbox>,
    pub build: Arc<QueuedBuild>,
    pub store: Arc<MemoryStore>,
    pub persist: PersistHandle,
    pub story_tx: mpsc::Sender<Envelope>,
    pub reply_tx: mpsc::Sender<Envelope>,
    pub outbound_rx: mpsc::Receiver<Envelope>,
}

pub fn harness() -> Harness {
    harness_with_config(test_config())
}

pub fn harness_with_config(config: AgentConfig) -> Harness {
    let llm = Arc::new(MockLlm::new());
    let workspace = Arc::new(StubWorkspace::default());
    let sandbox = Arc::new(StubSandbox::default());
    let build = Arc::new(QueuedBuild::default());
    let store = Arc::new(MemoryStore::new());
    let persist = crate::persist::spawn(store.clone());

    let (story_tx, story_rx) = mpsc::channel(8);
    let (reply_tx, reply_rx) = mpsc::channel(8);
    let (outbound_tx, outbound_rx) = mpsc::channel(8);

    let agent = CoderAgent::new(
        config,
        Collaborators {
            llm: llm.clone(),
            workspace: workspace.clone(),
            sandbox: sandbox.clone(),
            build: build.clone(),
            persist: persist.clone(),
        },
        AgentChannels {
            story_rx,
            reply_rx,
            outbound_tx,
        },
        ToolRegistry::new(),
        ToolRegistry::new(),
        CancellationToken::new(),
    );

    Harness {
        agent,
        llm,
        workspace,
        sandbox,
        build,
        store,
        persist,
        story_tx,
        reply_tx,
        outbound_rx,
    }
}

/// Step the agent until it reaches `target` (checked after each step)
pub async fn step_until(agent: &mut CoderAgent, target: CoderState, max_steps: usize) {
    for _ in 0..max_steps {
        if agent.state() == target {
            return;
        }
        let done = agent.step().await.expect("step failed");
        if agent.state() == target {
            return;
        }
        assert!(
            !done,
            "agent finished in {} before reaching {target}",
            agent.state()
        );
    }
    panic!("agent stuck in {} before reaching {target}", agent.state());
}

// ============================================================================
// Scripted response builders
// ============================================================================

use crate::llm::{ContentBlock, Usage};
use crate::tools::{
    TOOL_ASK_QUESTION, TOOL_DONE, TOOL_SUBMIT_PLAN, TOOL_TODOS_ADD, TOOL_TODO_COMPLETE,
};

fn tool_reply(name: &str, input: Value) -> LlmResponse {
    LlmResponse {
        content: vec![
            ContentBlock::text("working"),
            ContentBlock::tool_use(Uuid::new_v4().to_string(), name, input),
        ],
        end_turn: false,
        usage: Usage::default(),
    }
}

fn text_reply(text: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::text(text)],
        end_turn: true,
        usage: Usage::default(),
    }
}

fn empty_reply() -> LlmResponse {
    LlmResponse {
        content: vec![],
        end_turn: true,
        usage: Usage::default(),
    }
}

pub fn submit_plan(plan: &str) -> LlmResponse {
    tool_reply(TOOL_SUBMIT_PLAN, serde_json::json!({ "plan": plan }))
}

pub fn add_todos(todos: &[&str]) -> LlmResponse {
    tool_reply(TOOL_TODOS_ADD, serde_json::json!({ "todos": todos }))
}

pub fn complete_todo() -> LlmResponse {
    tool_reply(TOOL_TODO_COMPLETE, serde_json::json!({}))
}

pub fn done() -> LlmResponse {
    tool_reply(TOOL_DONE, serde_json::json!({ "summary": "implemented" }))
}

pub fn ask_question(question: &str) -> LlmResponse {
    tool_reply(
        TOOL_ASK_QUESTION,
        serde_json::json!({ "question": question }),
    )
}

// ============================================================================
// End-to-end workflow tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ChatRole, Provenance};
    use crate::message::{ApprovalStatus, ApprovalType, StorySpec, StoryType};
    use crate::workflow::{BudgetReason, DataKey, TodoList};
    use std::time::Duration;

    const RUN_TIMEOUT: Duration = Duration::from_secs(10);

    fn story(story_type: StoryType) -> Envelope {
        Envelope::story(
            "orchestrator",
            "coder-1",
            StorySpec {
                story_id: "s1".to_string(),
                task_content: "add /health endpoint".to_string(),
                story_type,
            },
        )
    }

    fn approved() -> ArchitectReply {
        ArchitectReply::Review(ReviewResult::approved())
    }

    #[tokio::test]
    async fn test_happy_path_app_story() {
        let h = harness();
        h.llm.queue(submit_plan("1. add route\n2. add test"));
        h.llm.queue(add_todos(&["implement handler", "write test"]));
        h.llm.queue(complete_todo());
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), approved(), approved()],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let final_state = tokio::time::timeout(RUN_TIMEOUT, h.agent.run())
            .await
            .expect("run timed out")
            .expect("run failed");
        assert_eq!(final_state, CoderState::Done);

        // The architect saw plan approval, code approval, then the merge
        let received = architect.await.unwrap();
        assert_eq!(received.len(), 3);

        let record = h
            .persist
            .load_coder("sess", "coder-1")
            .await
            .unwrap()
            .expect("record persisted");
        assert_eq!(record.state, CoderState::Done);
        assert!(!record
            .data
            .get::<String>(DataKey::Plan)
            .unwrap()
            .unwrap()
            .is_empty());
        let todos: TodoList = record.data.todo_list().unwrap();
        assert_eq!(todos.completed_count(), todos.len());
        let merge: ReviewResult = record
            .data
            .get(DataKey::MergeResult)
            .unwrap()
            .expect("merge result stored");
        assert_eq!(merge.status, ApprovalStatus::Approved);

        // Sandbox went read-only for planning, read-write for coding
        assert_eq!(
            *h.sandbox.modes.lock().unwrap(),
            vec![SandboxMode::ReadOnly, SandboxMode::ReadWrite]
        );

        // The merged story was queued for knowledge reindexing
        assert_eq!(h.store.reindexed_stories(), vec!["s1".to_string()]);

        // App stories leave the container config alone
        assert!(h.sandbox.promoted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_transition_sequence() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["only item"]));
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), approved(), approved()],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        for _ in 0..32 {
            if agent.step().await.unwrap() {
                break;
            }
        }

        assert_eq!(
            agent.history(),
            &[
                CoderState::Waiting,
                CoderState::Setup,
                CoderState::Planning,
                CoderState::PlanReview,
                CoderState::Coding,
                CoderState::Testing,
                CoderState::CodeReview,
                CoderState::AwaitMerge,
                CoderState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_revision_feedback_and_counter_reset() {
        let h = harness();
        h.llm.queue(submit_plan("first draft"));

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![ArchitectReply::Review(ReviewResult::needs_changes(
                "use router X",
            ))],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::PlanReview, 8).await;
        // The review round-trip happens in this step
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Planning);

        assert_eq!(agent.data().counter(DataKey::PlanningIterations), 0);
        let feedback = agent
            .context()
            .messages()
            .iter()
            .find(|m| m.text().contains("use router X"))
            .expect("feedback in context");
        assert_eq!(feedback.role, ChatRole::User);
        assert_eq!(feedback.provenance, Provenance::Architect);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_approved_resets_counter() {
        let mut config = test_config();
        config.coding_limits.soft = 1;
        config.coding_limits.hard = 2;
        let h = harness_with_config(config);

        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(text_reply("thinking"));
        h.llm.queue(text_reply("still thinking"));

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), approved()],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::BudgetReview, 12).await;
        let pending = agent.data().pending_approval().unwrap().unwrap();
        assert_eq!(pending.approval_type, ApprovalType::BudgetReview);
        assert_eq!(pending.origin, Some(CoderState::Coding));
        assert!(matches!(
            pending.reason,
            Some(BudgetReason::IterationLimit { count: 2 })
        ));

        // Architect grants the extension: back to CODING with a fresh budget
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Coding);
        assert_eq!(agent.data().counter(DataKey::CodingIterations), 0);
        assert_eq!(agent.data().pending_effect_count(), 0);
    }

    #[tokio::test]
    async fn test_budget_needs_changes_pivots_to_planning() {
        let mut config = test_config();
        config.coding_limits.soft = 1;
        config.coding_limits.hard = 2;
        let h = harness_with_config(config);

        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(text_reply("thinking"));
        h.llm.queue(text_reply("still thinking"));

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![
                approved(),
                ArchitectReply::Review(ReviewResult::needs_changes("replan with smaller steps")),
            ],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::BudgetReview, 12).await;
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Planning);
        assert!(agent
            .context()
            .messages()
            .iter()
            .any(|m| m.text().contains("replan with smaller steps")));
    }

    #[tokio::test]
    async fn test_budget_rejected_ends_in_error() {
        let mut config = test_config();
        config.coding_limits.soft = 1;
        config.coding_limits.hard = 2;
        let h = harness_with_config(config);

        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(text_reply("thinking"));
        h.llm.queue(text_reply("still thinking"));

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![
                approved(),
                ArchitectReply::Review(ReviewResult::rejected("story abandoned")),
            ],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let final_state = tokio::time::timeout(RUN_TIMEOUT, h.agent.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, CoderState::Error);

        let record = h
            .persist
            .load_coder("sess", "coder-1")
            .await
            .unwrap()
            .unwrap();
        let reason: String = record
            .data
            .get(DataKey::ErrorMessage)
            .unwrap()
            .expect("error recorded");
        assert!(reason.contains("rejected"));
    }

    #[tokio::test]
    async fn test_question_during_coding_round_trip() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(ask_question("which auth lib?"));

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), ArchitectReply::Answer("use library X".into())],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::Question, 12).await;
        let pending = agent.data().pending_question().unwrap().unwrap();
        assert_eq!(pending.origin, CoderState::Coding);
        assert_eq!(pending.payload.question, "which auth lib?");

        // The answer routes back to the origin state
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Coding);
        assert_eq!(agent.data().pending_effect_count(), 0);
        let qa = agent
            .context()
            .messages()
            .iter()
            .find(|m| m.text().contains("use library X"))
            .expect("answer in context");
        assert!(qa.text().contains("which auth lib?"));
    }

    #[tokio::test]
    async fn test_merge_conflict_adds_todo_and_returns_to_coding() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![
                approved(),
                approved(),
                ArchitectReply::Review(ReviewResult {
                    status: ApprovalStatus::NeedsChanges,
                    feedback: None,
                    conflict_info: Some("conflict in main.go".to_string()),
                    merge_commit: None,
                }),
            ],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::AwaitMerge, 16).await;
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Coding);

        let todos = agent.data().todo_list().unwrap();
        assert!(todos
            .items()
            .iter()
            .any(|t| t.description == "Address merge issue: conflict in main.go" && !t.completed));
        let notice = agent
            .context()
            .messages()
            .iter()
            .find(|m| m.text().contains("conflict in main.go"))
            .expect("architect message in context");
        assert_eq!(notice.role, ChatRole::Architect);
    }

    #[tokio::test]
    async fn test_empty_response_escalation_policy() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        // First empty: guidance injected, loop continues. Second: escalate.
        h.llm.queue(empty_reply());
        h.llm.queue(empty_reply());

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), approved()],
        );
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::BudgetReview, 12).await;
        let pending = agent.data().pending_approval().unwrap().unwrap();
        assert_eq!(pending.reason, Some(BudgetReason::EmptyResponse));
        assert_eq!(pending.origin, Some(CoderState::Coding));

        // Granted review returns to CODING and arms the fail-fast flag
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Coding);
        assert!(agent.data().flag(DataKey::EmptyResponseRetried));

        // A further empty response now kills the story
        h.llm.queue(empty_reply());
        let err = agent.step().await.unwrap_err();
        assert!(err.to_string().contains("empty responses"));
    }

    #[tokio::test]
    async fn test_mid_story_todo_addition_stays_in_coding() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["first"]));
        // Discovered work mid-story: the handler appends and keeps coding
        h.llm.queue(add_todos(&["second, found while coding"]));
        h.llm.queue(complete_todo());
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let _architect =
            spawn_architect(h.outbound_rx, h.reply_tx.clone(), vec![approved()]);
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::Testing, 12).await;

        let todos = agent.data().todo_list().unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos.all_completed());
        // No extra transitions happened for the mid-story addition
        assert_eq!(
            agent.history(),
            &[
                CoderState::Waiting,
                CoderState::Setup,
                CoderState::Planning,
                CoderState::PlanReview,
                CoderState::Coding,
                CoderState::Testing,
            ]
        );
    }

    #[tokio::test]
    async fn test_done_rejected_while_todos_open() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["first", "second"]));
        h.llm.queue(done()); // rejected: both todos open
        h.llm.queue(complete_todo());
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let _architect =
            spawn_architect(h.outbound_rx, h.reply_tx.clone(), vec![approved()]);
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::Testing, 12).await;

        assert!(agent
            .context()
            .messages()
            .iter()
            .any(|m| matches!(
                m.blocks.first(),
                Some(ContentBlock::ToolResult { is_error: true, content, .. })
                    if content.contains("still open")
            )));
    }

    #[tokio::test]
    async fn test_failing_tests_route_back_to_coding() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(complete_todo());
        h.llm.queue(done());
        h.build
            .queue_report(TestReport::failed("assertion failed: expected 200, got 500"));

        let _architect =
            spawn_architect(h.outbound_rx, h.reply_tx.clone(), vec![approved()]);
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        step_until(&mut agent, CoderState::Testing, 12).await;
        agent.step().await.unwrap();
        assert_eq!(agent.state(), CoderState::Coding);

        // The structured failure is buffered for the next loop iteration;
        // flush it to inspect.
        h.llm.queue(done());
        let _ = agent.step().await;
        assert!(agent
            .context()
            .messages()
            .iter()
            .any(|m| m.text().contains("expected 200, got 500")));
    }

    #[tokio::test]
    async fn test_devops_story_infra_check_and_config_promotion() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.llm.queue(add_todos(&["item"]));
        h.llm.queue(complete_todo());
        h.llm.queue(done());

        let _architect = spawn_architect(
            h.outbound_rx,
            h.reply_tx.clone(),
            vec![approved(), approved(), approved()],
        );
        h.story_tx.send(story(StoryType::Devops)).await.unwrap();

        let final_state = tokio::time::timeout(RUN_TIMEOUT, h.agent.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, CoderState::Done);

        // Devops stories test through the infra check, never the build
        assert_eq!(*h.sandbox.infra_checks.lock().unwrap(), 1);
        assert_eq!(*h.build.runs.lock().unwrap(), 0);

        // The approved merge promoted the container config
        assert_eq!(
            *h.sandbox.promoted.lock().unwrap(),
            vec!["jm-box-rw".to_string()]
        );
        let record = h
            .persist
            .load_coder("sess", "coder-1")
            .await
            .unwrap()
            .unwrap();
        assert!(record.data.flag(DataKey::ContainerModified));
        assert_eq!(
            record
                .data
                .get::<String>(DataKey::ContainerImage)
                .unwrap()
                .as_deref(),
            Some("registry/jm-box-rw:promoted")
        );
    }

    #[tokio::test]
    async fn test_workspace_failure_kills_story() {
        let h = harness();
        let workspace = Arc::new(StubWorkspace {
            fail: true,
            prepared: Mutex::new(Vec::new()),
        });
        let (story_tx, story_rx) = mpsc::channel(8);
        let (_reply_tx, reply_rx) = mpsc::channel(8);
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let agent = CoderAgent::new(
            test_config(),
            Collaborators {
                llm: h.llm.clone(),
                workspace,
                sandbox: h.sandbox.clone(),
                build: h.build.clone(),
                persist: h.persist.clone(),
            },
            AgentChannels {
                story_rx,
                reply_rx,
                outbound_tx,
            },
            ToolRegistry::new(),
            ToolRegistry::new(),
            CancellationToken::new(),
        );

        story_tx.send(story(StoryType::App)).await.unwrap();
        let final_state = tokio::time::timeout(RUN_TIMEOUT, agent.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, CoderState::Error);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting() {
        let h = harness();
        h.story_tx
            .send(Envelope::shutdown("orchestrator", "coder-1"))
            .await
            .unwrap();
        let final_state = tokio::time::timeout(RUN_TIMEOUT, h.agent.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state, CoderState::Waiting);
    }

    #[tokio::test]
    async fn test_persisted_state_tracks_memory_after_each_step() {
        let h = harness();
        h.llm.queue(submit_plan("plan"));
        h.story_tx.send(story(StoryType::App)).await.unwrap();

        let mut agent = h.agent;
        for _ in 0..3 {
            agent.step().await.unwrap();
            let record = h
                .persist
                .load_coder("sess", "coder-1")
                .await
                .unwrap()
                .expect("record persisted after step");
            assert_eq!(record.state, agent.state());
            assert_eq!(&record.data, agent.data());
        }
    }

    #[tokio::test]
    async fn test_knowledge_pack_seeded_on_first_planning_visit() {
        let store = Arc::new(MemoryStore::new().with_knowledge(
            "health",
            crate::persist::KnowledgePack {
                terms: vec!["health".to_string()],
                content: "probes live on :9090".to_string(),
            },
        ));
        let persist = crate::persist::spawn(store.clone());

        let llm = Arc::new(MockLlm::new());
        llm.queue(submit_plan("plan"));
        let (story_tx, story_rx) = mpsc::channel(8);
        let (_reply_tx, reply_rx) = mpsc::channel(8);
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let mut agent = CoderAgent::new(
            test_config(),
            Collaborators {
                llm: llm.clone(),
                workspace: Arc::new(StubWorkspace::default()),
                sandbox: Arc::new(StubSandbox::default()),
                build: Arc::new(QueuedBuild::default()),
                persist,
            },
            AgentChannels {
                story_rx,
                reply_rx,
                outbound_tx,
            },
            ToolRegistry::new(),
            ToolRegistry::new(),
            CancellationToken::new(),
        );

        story_tx.send(story(StoryType::App)).await.unwrap();
        step_until(&mut agent, CoderState::PlanReview, 8).await;

        assert!(agent
            .data()
            .get::<crate::persist::KnowledgePack>(DataKey::KnowledgePack)
            .unwrap()
            .is_some());
        assert!(agent
            .context()
            .messages()
            .iter()
            .any(|m| m.text().contains("probes live on :9090")));
    }
}
