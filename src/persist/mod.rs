//! Persistence boundary
//!
//! Handlers never block on I/O for writes: every access goes through a
//! request channel to a serialization worker that owns the store. Writes
//! are fire-and-forget (channel order preserves transition order); reads
//! are synchronous with an explicit deadline.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::workflow::{CoderState, StateData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Records
// ============================================================================

/// Durable snapshot of one coder, keyed by `(session_id, agent_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderRecord {
    pub session_id: String,
    pub agent_id: String,
    pub state: CoderState,
    pub data: StateData,
    pub updated_at: DateTime<Utc>,
}

/// Serialized conversation history, keyed by
/// `(session_id, agent_id, context_type)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub session_id: String,
    pub agent_id: String,
    pub context_type: String,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

/// Background knowledge retrieved for a story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgePack {
    pub terms: Vec<String>,
    pub content: String,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable storage behind the persistence worker
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_coder(&self, record: &CoderRecord) -> Result<(), StoreError>;
    async fn get_coder(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<CoderRecord>, StoreError>;
    async fn put_context(&self, record: &ContextRecord) -> Result<(), StoreError>;
    async fn get_context(
        &self,
        session_id: &str,
        agent_id: &str,
        context_type: &str,
    ) -> Result<Option<ContextRecord>, StoreError>;
    async fn knowledge_lookup(&self, terms: &[String]) -> Result<Option<KnowledgePack>, StoreError>;
    async fn reindex(&self, story_id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Worker & handle
// ============================================================================

/// Requests accepted by the serialization worker
pub enum PersistRequest {
    SaveCoder {
        record: CoderRecord,
        ack: Option<oneshot::Sender<Result<(), StoreError>>>,
    },
    SaveContext {
        record: ContextRecord,
    },
    LoadCoder {
        session_id: String,
        agent_id: String,
        reply: oneshot::Sender<Result<Option<CoderRecord>, StoreError>>,
    },
    LoadContext {
        session_id: String,
        agent_id: String,
        context_type: String,
        reply: oneshot::Sender<Result<Option<ContextRecord>, StoreError>>,
    },
    Knowledge {
        terms: Vec<String>,
        reply: oneshot::Sender<Result<Option<KnowledgePack>, StoreError>>,
    },
    Reindex {
        story_id: String,
    },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistence worker unavailable")]
    WorkerGone,
    #[error("persistence read timed out")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Default deadline for synchronous reads
pub const READ_DEADLINE: Duration = Duration::from_secs(5);

/// Clonable handle onto the persistence worker
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistRequest>,
}

/// Spawn the serialization worker that owns the store
pub fn spawn(store: Arc<dyn Store>) -> PersistHandle {
    let (tx, mut rx) = mpsc::channel::<PersistRequest>(64);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                PersistRequest::SaveCoder { record, ack } => {
                    let result = store.put_coder(&record).await;
                    if let Err(e) = &result {
                        tracing::error!(
                            agent_id = %record.agent_id,
                            error = %e,
                            "failed to persist coder record"
                        );
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                PersistRequest::SaveContext { record } => {
                    if let Err(e) = store.put_context(&record).await {
                        tracing::error!(
                            agent_id = %record.agent_id,
                            error = %e,
                            "failed to persist context record"
                        );
                    }
                }
                PersistRequest::LoadCoder {
                    session_id,
                    agent_id,
                    reply,
                } => {
                    let _ = reply.send(store.get_coder(&session_id, &agent_id).await);
                }
                PersistRequest::LoadContext {
                    session_id,
                    agent_id,
                    context_type,
                    reply,
                } => {
                    let _ = reply.send(
                        store
                            .get_context(&session_id, &agent_id, &context_type)
                            .await,
                    );
                }
                PersistRequest::Knowledge { terms, reply } => {
                    let _ = reply.send(store.knowledge_lookup(&terms).await);
                }
                PersistRequest::Reindex { story_id } => {
                    if let Err(e) = store.reindex(&story_id).await {
                        tracing::warn!(%story_id, error = %e, "knowledge reindex failed");
                    }
                }
            }
        }
        tracing::debug!("persistence worker stopped");
    });
    PersistHandle { tx }
}

impl PersistHandle {
    /// Ordered, non-blocking write
    pub async fn save_coder(&self, record: CoderRecord) -> Result<(), PersistError> {
        self.tx
            .send(PersistRequest::SaveCoder { record, ack: None })
            .await
            .map_err(|_| PersistError::WorkerGone)
    }

    /// Write that waits for the store to acknowledge (terminal states, tests)
    pub async fn save_coder_synced(&self, record: CoderRecord) -> Result<(), PersistError> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::SaveCoder {
                record,
                ack: Some(ack),
            })
            .await
            .map_err(|_| PersistError::WorkerGone)?;
        ack_rx.await.map_err(|_| PersistError::WorkerGone)??;
        Ok(())
    }

    pub async fn save_context(&self, record: ContextRecord) -> Result<(), PersistError> {
        self.tx
            .send(PersistRequest::SaveContext { record })
            .await
            .map_err(|_| PersistError::WorkerGone)
    }

    pub async fn load_coder(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<CoderRecord>, PersistError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::LoadCoder {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| PersistError::WorkerGone)?;
        Ok(reply_rx.await.map_err(|_| PersistError::WorkerGone)??)
    }

    pub async fn load_context(
        &self,
        session_id: &str,
        agent_id: &str,
        context_type: &str,
    ) -> Result<Option<ContextRecord>, PersistError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::LoadContext {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                context_type: context_type.to_string(),
                reply,
            })
            .await
            .map_err(|_| PersistError::WorkerGone)?;
        Ok(reply_rx.await.map_err(|_| PersistError::WorkerGone)??)
    }

    /// Synchronous knowledge retrieval with a hard deadline
    pub async fn knowledge(
        &self,
        terms: Vec<String>,
        deadline: Duration,
    ) -> Result<Option<KnowledgePack>, PersistError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::Knowledge { terms, reply })
            .await
            .map_err(|_| PersistError::WorkerGone)?;
        match tokio::time::timeout(deadline, reply_rx).await {
            Err(_) => Err(PersistError::Timeout),
            Ok(Err(_)) => Err(PersistError::WorkerGone),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    /// Fire-and-forget reindex request
    pub async fn reindex(&self, story_id: &str) -> Result<(), PersistError> {
        self.tx
            .send(PersistRequest::Reindex {
                story_id: story_id.to_string(),
            })
            .await
            .map_err(|_| PersistError::WorkerGone)
    }
}

// ============================================================================
// Term extraction
// ============================================================================

const STOPWORDS: &[&str] = &[
    "about", "added", "after", "also", "been", "before", "being", "could", "does",
    "every", "from", "have", "implement", "into", "make", "must", "need", "needs", "should",
    "some", "support", "that", "their", "them", "then", "there", "they", "this", "user", "using",
    "when", "where", "which", "will", "with", "would",
];

static TERM_RE: OnceLock<Regex> = OnceLock::new();

/// Extract significant lookup terms from free-form task content
pub fn extract_terms(task_content: &str) -> Vec<String> {
    const MAX_TERMS: usize = 8;
    let re = TERM_RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_/-]{3,}").unwrap());
    let mut terms: Vec<String> = Vec::new();
    for found in re.find_iter(task_content) {
        let term = found.as_str().to_ascii_lowercase();
        if STOPWORDS.contains(&term.as_str()) || terms.contains(&term) {
            continue;
        }
        terms.push(term);
        if terms.len() == MAX_TERMS {
            break;
        }
    }
    terms
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory store for tests and embedded use
#[derive(Default)]
pub struct MemoryStore {
    coders: Mutex<HashMap<(String, String), CoderRecord>>,
    contexts: Mutex<HashMap<(String, String, String), ContextRecord>>,
    knowledge: Mutex<HashMap<String, KnowledgePack>>,
    reindexed: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a knowledge pack matched by `term`
    pub fn with_knowledge(self, term: &str, pack: KnowledgePack) -> Self {
        self.knowledge
            .lock()
            .unwrap()
            .insert(term.to_string(), pack);
        self
    }

    pub fn reindexed_stories(&self) -> Vec<String> {
        self.reindexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_coder(&self, record: &CoderRecord) -> Result<(), StoreError> {
        self.coders.lock().unwrap().insert(
            (record.session_id.clone(), record.agent_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_coder(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<CoderRecord>, StoreError> {
        Ok(self
            .coders
            .lock()
            .unwrap()
            .get(&(session_id.to_string(), agent_id.to_string()))
            .cloned())
    }

    async fn put_context(&self, record: &ContextRecord) -> Result<(), StoreError> {
        self.contexts.lock().unwrap().insert(
            (
                record.session_id.clone(),
                record.agent_id.clone(),
                record.context_type.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    async fn get_context(
        &self,
        session_id: &str,
        agent_id: &str,
        context_type: &str,
    ) -> Result<Option<ContextRecord>, StoreError> {
        Ok(self
            .contexts
            .lock()
            .unwrap()
            .get(&(
                session_id.to_string(),
                agent_id.to_string(),
                context_type.to_string(),
            ))
            .cloned())
    }

    async fn knowledge_lookup(&self, terms: &[String]) -> Result<Option<KnowledgePack>, StoreError> {
        let knowledge = self.knowledge.lock().unwrap();
        Ok(terms.iter().find_map(|term| knowledge.get(term).cloned()))
    }

    async fn reindex(&self, story_id: &str) -> Result<(), StoreError> {
        self.reindexed.lock().unwrap().push(story_id.to_string());
        Ok(())
    }
}
