//! Task persistence.
//!
//! One row per task; the full task serialized as a JSON snapshot, with the
//! status denormalized for filtering. SQLite via rusqlite, with the
//! connection behind a mutex and every call pushed through
//! `spawn_blocking` so the async pipeline never blocks on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::task::{Task, TaskStatus, TaskSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt task snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("storage worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One page of task summaries.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

/// SQLite-backed task store. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                snapshot    TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store mutex poisoned");
            f(&guard)
        })
        .await?
    }

    /// Insert or replace the task snapshot. Tasks are never deleted;
    /// terminal tasks stay for audit.
    pub async fn upsert(&self, task: &Task) -> Result<(), StoreError> {
        let id = task.id.to_string();
        let status = task.status.to_string();
        let snapshot = serde_json::to_string(task)?;
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     snapshot = excluded.snapshot,
                     updated_at = excluded.updated_at",
                params![id, status, snapshot, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let id = task_id.to_string();
        self.with_conn(move |conn| {
            let snapshot: Option<String> = conn
                .query_row("SELECT snapshot FROM tasks WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            match snapshot {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Page through task summaries, newest first.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<TaskSummary>, StoreError> {
        let per_page = per_page.clamp(1, 200);
        let page = page.max(1);
        let offset = (page as u64 - 1) * per_page as u64;
        let status_str = status.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let (total, snapshots): (u64, Vec<String>) = match &status_str {
                Some(s) => {
                    let total = conn.query_row(
                        "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                        [s],
                        |row| row.get(0),
                    )?;
                    let mut stmt = conn.prepare(
                        "SELECT snapshot FROM tasks WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![s, per_page, offset], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    (total, rows)
                }
                None => {
                    let total =
                        conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
                    let mut stmt = conn.prepare(
                        "SELECT snapshot FROM tasks
                         ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![per_page, offset], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    (total, rows)
                }
            };
            let items = snapshots
                .iter()
                .map(|json| serde_json::from_str::<Task>(json).map(|t| t.summary()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Page {
                items,
                page,
                per_page,
                total,
            })
        })
        .await
    }

    /// Full tasks parked at the approval gate, oldest first.
    pub async fn list_awaiting_approval(&self) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot FROM tasks WHERE status = 'awaiting_approval'
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str::<Task>(json).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Phase, QualityPreference, TaskConstraints};
    use std::collections::BTreeMap;

    fn task(topic: &str) -> Task {
        Task::new(
            topic.to_string(),
            TaskConstraints::default(),
            BTreeMap::new(),
            QualityPreference::Fast,
            2,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut t = task("solar balconies");
        t.transition(TaskStatus::Researching).unwrap();
        t.record_output(Phase::Research, "notes".into()).unwrap();

        store.upsert(&t).await.unwrap();
        let loaded = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded, t);

        // Snapshot is replaced, not duplicated.
        t.transition(TaskStatus::Outlining).unwrap();
        store.upsert(&t).await.unwrap();
        let page = store.list(None, 1, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].status, TaskStatus::Outlining);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = TaskStore::open_in_memory().unwrap();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = TaskStore::open_in_memory().unwrap();
        let pending = task("a");
        let mut researching = task("b");
        researching.transition(TaskStatus::Researching).unwrap();
        store.upsert(&pending).await.unwrap();
        store.upsert(&researching).await.unwrap();

        let page = store
            .list(Some(TaskStatus::Researching), 1, 50)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, researching.id);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let t = task("field notes");
        {
            let store = TaskStore::open(&path).unwrap();
            store.upsert(&t).await.unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        let loaded = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.topic, "field notes");
    }
}
