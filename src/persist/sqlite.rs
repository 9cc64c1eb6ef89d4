//! Sqlite-backed store

use super::{ContextRecord, CoderRecord, KnowledgePack, Store, StoreError};
use crate::workflow::CoderState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS coders (
    session_id TEXT NOT NULL,
    agent_id   TEXT NOT NULL,
    state      TEXT NOT NULL,
    data       TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, agent_id)
);

CREATE TABLE IF NOT EXISTS agent_contexts (
    session_id   TEXT NOT NULL,
    agent_id     TEXT NOT NULL,
    context_type TEXT NOT NULL,
    payload      TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (session_id, agent_id, context_type)
);

CREATE TABLE IF NOT EXISTS knowledge (
    term    TEXT PRIMARY KEY,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reindex_log (
    story_id     TEXT NOT NULL,
    requested_at TEXT NOT NULL
);
";

/// Thread-safe sqlite handle
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Seed a knowledge entry (used by ingestion tooling and tests)
    pub fn put_knowledge(&self, term: &str, pack: &KnowledgePack) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO knowledge (term, content) VALUES (?1, ?2)",
            params![term, serde_json::to_string(pack)?],
        )?;
        Ok(())
    }
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_coder(&self, record: &CoderRecord) -> Result<(), StoreError> {
        let state = serde_json::to_string(&record.state)?;
        let data = serde_json::to_string(&record.data)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO coders (session_id, agent_id, state, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.agent_id,
                state,
                data,
                record.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn get_coder(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<CoderRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT state, data, updated_at FROM coders
                 WHERE session_id = ?1 AND agent_id = ?2",
                params![session_id, agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((state_raw, data_raw, updated_raw)) = row else {
            return Ok(None);
        };
        let state: CoderState = serde_json::from_str(&state_raw)?;
        let data = serde_json::from_str(&data_raw)?;
        Ok(Some(CoderRecord {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            state,
            data,
            updated_at: parse_datetime(&updated_raw),
        }))
    }

    async fn put_context(&self, record: &ContextRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO agent_contexts
                 (session_id, agent_id, context_type, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.agent_id,
                record.context_type,
                record.payload,
                record.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn get_context(
        &self,
        session_id: &str,
        agent_id: &str,
        context_type: &str,
    ) -> Result<Option<ContextRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT payload, updated_at FROM agent_contexts
                 WHERE session_id = ?1 AND agent_id = ?2 AND context_type = ?3",
                params![session_id, agent_id, context_type],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(payload, updated_raw)| ContextRecord {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            context_type: context_type.to_string(),
            payload,
            updated_at: parse_datetime(&updated_raw),
        }))
    }

    async fn knowledge_lookup(&self, terms: &[String]) -> Result<Option<KnowledgePack>, StoreError> {
        let conn = self.conn.lock().unwrap();
        for term in terms {
            let content = conn
                .query_row(
                    "SELECT content FROM knowledge WHERE term = ?1",
                    params![term],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(content) = content {
                return Ok(Some(serde_json::from_str(&content)?));
            }
        }
        Ok(None)
    }

    async fn reindex(&self, story_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO reindex_log (story_id, requested_at) VALUES (?1, ?2)",
            params![story_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
