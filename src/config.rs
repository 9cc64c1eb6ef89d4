//! Agent configuration
//!
//! Defaults tuned for one coder instance, overridable through
//! `JOURNEYMAN_*` environment variables.

use crate::toolloop::IterationBudget;
use std::path::PathBuf;
use std::time::Duration;

/// Soft/hard iteration limits for one workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub soft: u32,
    pub hard: u32,
}

impl BudgetLimits {
    pub fn budget(self) -> IterationBudget {
        IterationBudget::new(self.soft, self.hard)
    }

    pub fn resume(self, count: u32) -> IterationBudget {
        IterationBudget::resume(count, self.soft, self.hard)
    }
}

/// Configuration for one coder agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session_id: String,
    pub agent_id: String,
    pub architect_id: String,
    /// Scratch directory cleaned and recreated per story
    pub work_dir: PathBuf,
    pub planning_limits: BudgetLimits,
    pub coding_limits: BudgetLimits,
    /// Absolute cap on loop iterations in a single invocation
    pub max_loop_iterations: u32,
    /// Tool output truncation budget in characters
    pub tool_output_limit: usize,
    /// Retries for the one-shot todo-collection loop
    pub todo_collection_retries: u32,
    /// Deadline on architect effects
    pub effect_deadline: Duration,
    /// Deadline on synchronous knowledge retrieval
    pub knowledge_deadline: Duration,
    pub max_tokens: Option<u32>,
}

impl AgentConfig {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            session_id: session_id.into(),
            work_dir: PathBuf::from(format!("work/{agent_id}")),
            agent_id,
            architect_id: "architect".to_string(),
            planning_limits: BudgetLimits { soft: 8, hard: 12 },
            coding_limits: BudgetLimits { soft: 24, hard: 32 },
            max_loop_iterations: 50,
            tool_output_limit: 2_000,
            todo_collection_retries: 1,
            effect_deadline: Duration::from_secs(15 * 60),
            knowledge_deadline: Duration::from_secs(5),
            max_tokens: Some(8_192),
        }
    }

    /// Apply `JOURNEYMAN_*` environment overrides
    pub fn from_env(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(session_id, agent_id).with_lookup(|key| std::env::var(key).ok())
    }

    fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.parse().ok())
        }

        if let Some(dir) = lookup("JOURNEYMAN_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(soft) = parse(lookup("JOURNEYMAN_PLANNING_SOFT_LIMIT")) {
            self.planning_limits.soft = soft;
        }
        if let Some(hard) = parse(lookup("JOURNEYMAN_PLANNING_HARD_LIMIT")) {
            self.planning_limits.hard = hard;
        }
        if let Some(soft) = parse(lookup("JOURNEYMAN_CODING_SOFT_LIMIT")) {
            self.coding_limits.soft = soft;
        }
        if let Some(hard) = parse(lookup("JOURNEYMAN_CODING_HARD_LIMIT")) {
            self.coding_limits.hard = hard;
        }
        if let Some(limit) = parse(lookup("JOURNEYMAN_TOOL_OUTPUT_LIMIT")) {
            self.tool_output_limit = limit;
        }
        if let Some(retries) = parse(lookup("JOURNEYMAN_TODO_RETRIES")) {
            self.todo_collection_retries = retries;
        }
        if let Some(secs) = parse::<u64>(lookup("JOURNEYMAN_EFFECT_DEADLINE_SECS")) {
            self.effect_deadline = Duration::from_secs(secs);
        }
        self
    }
}
