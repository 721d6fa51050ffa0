//! Snapshot records and their persistence.
//!
//! A `Snapshot` is immutable once saved. Two stores are provided:
//! an in-memory one (default, and for tests) and a SQLite one for
//! deployments that want snapshots to survive a restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use berth_id::SnapshotId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::machine::ProjectBinding;
use crate::provider::SnapshotRef;

/// Errors from snapshot store operations.
#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("snapshot {0} already exists")]
    Duplicate(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid snapshot record: {0}")]
    Invalid(String),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Captured machine state, restorable into a new machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub owner: String,
    pub workspace_id: String,
    /// Machine type of the source machine; selects the provider on restore.
    pub image_type: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub projects: Vec<ProjectBinding>,
    pub reference: SnapshotRef,
}

impl Snapshot {
    pub fn is_bound(&self, project: &ProjectBinding) -> bool {
        self.projects.contains(project)
    }
}

/// Criteria for [`SnapshotStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub owner: Option<String>,
    pub workspace_id: Option<String>,
    pub project: Option<ProjectBinding>,
}

impl SnapshotFilter {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn project(mut self, project: ProjectBinding) -> Self {
        self.project = Some(project);
        self
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.owner.as_deref().is_none_or(|o| o == snapshot.owner)
            && self
                .workspace_id
                .as_deref()
                .is_none_or(|w| w == snapshot.workspace_id)
            && self.project.as_ref().is_none_or(|p| snapshot.is_bound(p))
    }
}

/// Persistence for snapshot records.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError>;

    async fn get(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError>;

    /// Matching snapshots, oldest first.
    async fn list(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, SnapshotStoreError>;

    /// Delete a record, returning it.
    async fn remove(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&snapshot.id) {
            return Err(SnapshotStoreError::Duplicate(snapshot.id.to_string()));
        }
        snapshots.insert(snapshot.id, snapshot);
        Ok(())
    }

    async fn get(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError> {
        self.snapshots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotStoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        let mut matching: Vec<Snapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    async fn remove(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError> {
        self.snapshots
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SnapshotStoreError::NotFound(id.to_string()))
    }
}

const SELECT_COLUMNS: &str = "SELECT snapshot_id, owner, workspace_id, image_type, description, \
     created_at, projects, ref_type, ref_location FROM snapshots";

/// SQLite-backed store.
///
/// Queries run on the blocking pool. `created_at` is kept to the nanosecond.
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, SnapshotStoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, SnapshotStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SnapshotStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }

    fn init_schema(&self) -> Result<(), SnapshotStoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                image_type TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                projects TEXT NOT NULL,
                ref_type TEXT NOT NULL,
                ref_location TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_owner ON snapshots(owner, workspace_id);
            "#,
        )?;

        debug!("Snapshot store schema initialized");
        Ok(())
    }

    fn select_one(conn: &Connection, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError> {
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE snapshot_id = ?1"),
                params![id.to_string()],
                RawSnapshot::from_row,
            )
            .optional()?
            .ok_or_else(|| SnapshotStoreError::NotFound(id.to_string()))?;
        raw.decode()
    }
}

/// Row as stored, before validation.
struct RawSnapshot {
    id: String,
    owner: String,
    workspace_id: String,
    image_type: String,
    description: String,
    created_at: i64,
    projects: String,
    ref_type: String,
    ref_location: String,
}

impl RawSnapshot {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            workspace_id: row.get(2)?,
            image_type: row.get(3)?,
            description: row.get(4)?,
            created_at: row.get(5)?,
            projects: row.get(6)?,
            ref_type: row.get(7)?,
            ref_location: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Snapshot, SnapshotStoreError> {
        let id = SnapshotId::parse(&self.id)
            .map_err(|e| SnapshotStoreError::Invalid(format!("{}: {e}", self.id)))?;
        let created_at = DateTime::from_timestamp_nanos(self.created_at);

        Ok(Snapshot {
            id,
            owner: self.owner,
            workspace_id: self.workspace_id,
            image_type: self.image_type,
            description: self.description,
            created_at,
            projects: serde_json::from_str(&self.projects)?,
            reference: SnapshotRef {
                machine_type: self.ref_type,
                location: self.ref_location,
            },
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError> {
        let projects = serde_json::to_string(&snapshot.projects)?;
        let created_at = snapshot.created_at.timestamp_nanos_opt().ok_or_else(|| {
            SnapshotStoreError::Invalid(format!(
                "{}: timestamp {} out of range",
                snapshot.id, snapshot.created_at
            ))
        })?;

        let id = snapshot.id;
        let inserted = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    r#"
                    INSERT OR IGNORE INTO snapshots (snapshot_id, owner, workspace_id, image_type, description, created_at, projects, ref_type, ref_location)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                    params![
                        snapshot.id.to_string(),
                        snapshot.owner,
                        snapshot.workspace_id,
                        snapshot.image_type,
                        snapshot.description,
                        created_at,
                        projects,
                        snapshot.reference.machine_type,
                        snapshot.reference.location,
                    ],
                )?)
            })
            .await?;

        if inserted == 0 {
            return Err(SnapshotStoreError::Duplicate(id.to_string()));
        }
        debug!(snapshot_id = %id, "Snapshot saved");
        Ok(())
    }

    async fn get(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError> {
        let id = *id;
        self.with_conn(move |conn| Self::select_one(conn, &id)).await
    }

    async fn list(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        let owner = filter.owner.clone();
        let workspace_id = filter.workspace_id.clone();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE (?1 IS NULL OR owner = ?1) \
                     AND (?2 IS NULL OR workspace_id = ?2) ORDER BY created_at"
                ))?;
                let rows = stmt
                    .query_map(params![owner, workspace_id], RawSnapshot::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for raw in rows {
            let snapshot = raw.decode()?;
            if filter.matches(&snapshot) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn remove(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotStoreError> {
        let id = *id;
        let snapshot = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let snapshot = Self::select_one(&tx, &id)?;
                tx.execute(
                    "DELETE FROM snapshots WHERE snapshot_id = ?1",
                    params![id.to_string()],
                )?;
                tx.commit()?;
                Ok(snapshot)
            })
            .await?;

        debug!(snapshot_id = %id, "Snapshot removed");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use tempfile::TempDir;

    fn snapshot(owner: &str, workspace: &str, projects: &[&str], age_secs: i64) -> Snapshot {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Snapshot {
            id: SnapshotId::new(),
            owner: owner.to_string(),
            workspace_id: workspace.to_string(),
            image_type: "mock".to_string(),
            description: "nightly".to_string(),
            created_at: base - Duration::seconds(age_secs),
            projects: projects.iter().map(|p| ProjectBinding::new(*p)).collect(),
            reference: SnapshotRef {
                machine_type: "mock".to_string(),
                location: "mock://snapshots/0".to_string(),
            },
        }
    }

    fn in_memory() -> Box<dyn SnapshotStore> {
        Box::new(InMemorySnapshotStore::new())
    }

    fn sqlite() -> Box<dyn SnapshotStore> {
        Box::new(SqliteSnapshotStore::open_in_memory().unwrap())
    }

    #[rstest]
    #[case::in_memory(in_memory())]
    #[case::sqlite(sqlite())]
    #[tokio::test]
    async fn test_save_get_remove(#[case] store: Box<dyn SnapshotStore>) {
        let snap = snapshot("u1", "ws1", &["/a", "/b"], 0);
        store.save(snap.clone()).await.unwrap();

        assert_eq!(store.get(&snap.id).await.unwrap(), snap);
        assert!(matches!(
            store.save(snap.clone()).await,
            Err(SnapshotStoreError::Duplicate(_))
        ));

        assert_eq!(store.remove(&snap.id).await.unwrap(), snap);
        assert!(matches!(
            store.get(&snap.id).await,
            Err(SnapshotStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.remove(&snap.id).await,
            Err(SnapshotStoreError::NotFound(_))
        ));
    }

    #[rstest]
    #[case::in_memory(in_memory())]
    #[case::sqlite(sqlite())]
    #[tokio::test]
    async fn test_list_filters_and_orders(#[case] store: Box<dyn SnapshotStore>) {
        let newest = snapshot("u1", "ws1", &["/a"], 0);
        let oldest = snapshot("u1", "ws1", &[], 60);
        let other_ws = snapshot("u1", "ws2", &["/a"], 30);
        let other_owner = snapshot("u2", "ws1", &["/a"], 10);
        for s in [&newest, &oldest, &other_ws, &other_owner] {
            store.save(s.clone()).await.unwrap();
        }

        let all = store.list(&SnapshotFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![oldest.id, other_ws.id, other_owner.id, newest.id]);

        let mine = store
            .list(&SnapshotFilter::default().owner("u1").workspace("ws1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);

        let bound = store
            .list(
                &SnapshotFilter::default()
                    .owner("u1")
                    .project(ProjectBinding::new("/a")),
            )
            .await
            .unwrap();
        let ids: Vec<_> = bound.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![other_ws.id, newest.id]);
    }

    #[rstest]
    #[case::in_memory(in_memory())]
    #[case::sqlite(sqlite())]
    #[tokio::test]
    async fn test_created_at_keeps_full_precision(#[case] store: Box<dyn SnapshotStore>) {
        let mut snap = snapshot("u1", "ws1", &[], 0);
        snap.created_at = Utc::now();
        store.save(snap.clone()).await.unwrap();

        let stored = store.get(&snap.id).await.unwrap();
        assert_eq!(stored.created_at, snap.created_at);
        assert_eq!(stored, snap);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_concurrent_saves() {
        let store = Arc::new(SqliteSnapshotStore::open_in_memory().unwrap());

        let saves: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let snap = snapshot("u1", &format!("ws{}", i % 2), &[], i);
                tokio::spawn(async move { store.save(snap).await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let all = store.list(&SnapshotFilter::default()).await.unwrap();
        assert_eq!(all.len(), 16);
        let ws0 = store
            .list(&SnapshotFilter::default().workspace("ws0"))
            .await
            .unwrap();
        assert_eq!(ws0.len(), 8);
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshots.db");
        let snap = snapshot("u1", "ws1", &["/proj"], 0);

        {
            let store = SqliteSnapshotStore::open(&path).unwrap();
            store.save(snap.clone()).await.unwrap();
        }

        let store = SqliteSnapshotStore::open(&path).unwrap();
        assert_eq!(store.get(&snap.id).await.unwrap(), snap);
    }
}
