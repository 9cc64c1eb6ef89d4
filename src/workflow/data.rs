//! Typed state data carried across workflow transitions
//!
//! An ordered map from enumerated keys to JSON values. Every key the
//! workflow touches is declared in `DataKey`, which rules out collisions
//! between subsystems and keeps the persisted layout stable.

use crate::message::{ApprovalType, QuestionPayload};
use crate::workflow::CoderState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Enumerated state-data keys
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataKey {
    StoryId,
    TaskContent,
    StoryType,
    WorkspacePath,
    Plan,
    TodoList,
    CurrentTodoIndex,
    CodingIterations,
    PlanningIterations,
    PendingQuestion,
    PendingApproval,
    PendingMerge,
    MergeResult,
    Origin,
    EmptyResponseRetried,
    ContainerName,
    ContainerModified,
    ContainerImage,
    KnowledgePack,
    ErrorMessage,
    DoneLogged,
}

/// State-data access errors
#[derive(Debug, Error)]
pub enum StateDataError {
    #[error("missing required state key {0:?}")]
    Missing(DataKey),
    #[error("state key {key:?} failed to decode: {source}")]
    Decode {
        key: DataKey,
        source: serde_json::Error,
    },
    #[error("a pending {existing} effect is already set")]
    PendingConflict { existing: &'static str },
}

/// Ordered, serializable key/value state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateData(BTreeMap<DataKey, Value>);

impl StateData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: DataKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn set<T: Serialize>(&mut self, key: DataKey, value: &T) {
        let value = serde_json::to_value(value).expect("state values are plain data");
        self.0.insert(key, value);
    }

    pub fn remove(&mut self, key: DataKey) {
        self.0.remove(&key);
    }

    /// Fetch and decode an optional key
    pub fn get<T: DeserializeOwned>(&self, key: DataKey) -> Result<Option<T>, StateDataError> {
        match self.0.get(&key) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|source| StateDataError::Decode { key, source }),
        }
    }

    /// Fetch a key that must be present
    pub fn get_required<T: DeserializeOwned>(&self, key: DataKey) -> Result<T, StateDataError> {
        self.get(key)?.ok_or(StateDataError::Missing(key))
    }

    // ==================== Counters & flags ====================

    pub fn counter(&self, key: DataKey) -> u32 {
        self.get(key).ok().flatten().unwrap_or(0)
    }

    pub fn set_counter(&mut self, key: DataKey, value: u32) {
        self.set(key, &value);
    }

    pub fn flag(&self, key: DataKey) -> bool {
        self.get(key).ok().flatten().unwrap_or(false)
    }

    pub fn set_flag(&mut self, key: DataKey, value: bool) {
        self.set(key, &value);
    }

    // ==================== Pending effects ====================
    //
    // At most one of {pending_question, pending_approval, pending_merge}
    // may be set at any moment.

    fn pending_name(&self) -> Option<&'static str> {
        if self.contains(DataKey::PendingQuestion) {
            Some("question")
        } else if self.contains(DataKey::PendingApproval) {
            Some("approval")
        } else if self.contains(DataKey::PendingMerge) {
            Some("merge")
        } else {
            None
        }
    }

    pub fn pending_effect_count(&self) -> usize {
        [
            DataKey::PendingQuestion,
            DataKey::PendingApproval,
            DataKey::PendingMerge,
        ]
        .iter()
        .filter(|k| self.contains(**k))
        .count()
    }

    fn set_pending(
        &mut self,
        key: DataKey,
        value: &impl Serialize,
    ) -> Result<(), StateDataError> {
        if let Some(existing) = self.pending_name() {
            return Err(StateDataError::PendingConflict { existing });
        }
        self.set(key, value);
        Ok(())
    }

    pub fn set_pending_question(&mut self, q: &PendingQuestion) -> Result<(), StateDataError> {
        self.set_pending(DataKey::PendingQuestion, q)
    }

    pub fn set_pending_approval(&mut self, a: &PendingApproval) -> Result<(), StateDataError> {
        self.set_pending(DataKey::PendingApproval, a)
    }

    pub fn set_pending_merge(&mut self, m: &PendingMerge) -> Result<(), StateDataError> {
        self.set_pending(DataKey::PendingMerge, m)
    }

    pub fn pending_question(&self) -> Result<Option<PendingQuestion>, StateDataError> {
        self.get(DataKey::PendingQuestion)
    }

    pub fn pending_approval(&self) -> Result<Option<PendingApproval>, StateDataError> {
        self.get(DataKey::PendingApproval)
    }

    pub fn pending_merge(&self) -> Result<Option<PendingMerge>, StateDataError> {
        self.get(DataKey::PendingMerge)
    }

    pub fn clear_pending_question(&mut self) {
        self.remove(DataKey::PendingQuestion);
    }

    pub fn clear_pending_approval(&mut self) {
        self.remove(DataKey::PendingApproval);
    }

    pub fn clear_pending_merge(&mut self) {
        self.remove(DataKey::PendingMerge);
    }

    // ==================== Todo list ====================

    pub fn todo_list(&self) -> Result<TodoList, StateDataError> {
        Ok(self.get(DataKey::TodoList)?.unwrap_or_default())
    }

    /// Store the list and keep `current_todo_index` in step with it
    pub fn set_todo_list(&mut self, todos: &TodoList) {
        self.set(DataKey::TodoList, todos);
        let index = todos.current().map_or(todos.len(), |(i, _)| i);
        self.set(DataKey::CurrentTodoIndex, &index);
    }
}

// ============================================================================
// Todo list
// ============================================================================

/// One atomic work item from the approved plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// Ordered decomposition of an approved plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

impl TodoList {
    pub fn from_descriptions(descriptions: impl IntoIterator<Item = String>) -> Self {
        Self {
            items: descriptions
                .into_iter()
                .map(|description| TodoItem {
                    description,
                    completed: false,
                })
                .collect(),
        }
    }

    pub fn add(&mut self, description: impl Into<String>) {
        self.items.push(TodoItem {
            description: description.into(),
            completed: false,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    /// The first uncompleted item
    pub fn current(&self) -> Option<(usize, &TodoItem)> {
        self.items.iter().enumerate().find(|(_, t)| !t.completed)
    }

    /// Mark the current item completed; false when nothing is outstanding
    pub fn complete_current(&mut self) -> bool {
        if let Some((index, _)) = self.current() {
            self.items[index].completed = true;
            true
        } else {
            false
        }
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|t| t.completed).count()
    }

    /// An empty list counts as complete
    pub fn all_completed(&self) -> bool {
        self.items.iter().all(|t| t.completed)
    }

    /// Render for prompt injection
    pub fn render(&self) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mark = if t.completed { 'x' } else { ' ' };
                format!("{}. [{mark}] {}", i + 1, t.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Pending effect payloads
// ============================================================================

/// Why a budget review was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BudgetReason {
    IterationLimit { count: u32 },
    EmptyResponse,
}

/// Question awaiting an architect answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub correlation_id: Uuid,
    pub payload: QuestionPayload,
    pub origin: CoderState,
}

/// Approval submission awaiting an architect verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub correlation_id: Uuid,
    pub approval_type: ApprovalType,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<CoderState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BudgetReason>,
}

/// Merge request awaiting a merge result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMerge {
    pub correlation_id: Uuid,
    pub story_id: String,
    pub workspace_path: String,
}
