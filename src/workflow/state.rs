//! Workflow states and the static transition table

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workflow state for one coder agent.
///
/// `Waiting` is initial; `Done` and `Error` are terminal for the agent
/// (the orchestrator may still move `Error` to `Done` during cleanup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoderState {
    #[default]
    Waiting,
    Setup,
    Planning,
    PlanReview,
    Coding,
    Testing,
    CodeReview,
    BudgetReview,
    AwaitMerge,
    Question,
    Done,
    Error,
}

impl CoderState {
    /// Every state, in declaration order
    pub const ALL: [CoderState; 12] = [
        CoderState::Waiting,
        CoderState::Setup,
        CoderState::Planning,
        CoderState::PlanReview,
        CoderState::Coding,
        CoderState::Testing,
        CoderState::CodeReview,
        CoderState::BudgetReview,
        CoderState::AwaitMerge,
        CoderState::Question,
        CoderState::Done,
        CoderState::Error,
    ];

    /// States at which the agent's step loop halts
    pub fn is_terminal(self) -> bool {
        matches!(self, CoderState::Done | CoderState::Error)
    }

    /// Allowed successors, the single source of truth for handler returns.
    ///
    /// `Error` is reachable from anywhere via the implicit error transition;
    /// that path bypasses this table deliberately (a failing handler must
    /// never wedge the workflow on a validation error).
    pub fn allowed_successors(self) -> &'static [CoderState] {
        use CoderState::{
            AwaitMerge, BudgetReview, CodeReview, Coding, Done, Error, PlanReview, Planning,
            Question, Setup, Testing, Waiting,
        };
        match self {
            Waiting => &[Setup],
            Setup => &[Planning, Error],
            Planning => &[PlanReview, Question, BudgetReview],
            PlanReview => &[Planning, Coding, Done, Error],
            Coding => &[Testing, Question, BudgetReview, Error],
            Testing => &[Coding, CodeReview],
            CodeReview => &[AwaitMerge, Coding, Error],
            AwaitMerge => &[Done, Coding],
            BudgetReview => &[Planning, Coding, Error],
            Question => &[Planning, Coding, Error],
            Error => &[Done],
            Done => &[],
        }
    }

    pub fn can_transition_to(self, next: CoderState) -> bool {
        self.allowed_successors().contains(&next)
    }
}

impl std::fmt::Display for CoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoderState::Waiting => "WAITING",
            CoderState::Setup => "SETUP",
            CoderState::Planning => "PLANNING",
            CoderState::PlanReview => "PLAN_REVIEW",
            CoderState::Coding => "CODING",
            CoderState::Testing => "TESTING",
            CoderState::CodeReview => "CODE_REVIEW",
            CoderState::BudgetReview => "BUDGET_REVIEW",
            CoderState::AwaitMerge => "AWAIT_MERGE",
            CoderState::Question => "QUESTION",
            CoderState::Done => "DONE",
            CoderState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A handler attempted a transition outside the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CoderState,
    pub to: CoderState,
}

pub fn validate_transition(from: CoderState, to: CoderState) -> Result<(), InvalidTransition> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}
