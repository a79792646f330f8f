//! `SQLite` manifest store.
//!
//! Sources keep authored specs here and publish whatever is newer than
//! the last published version. Agents keep received specs and the status
//! they report. Both answer resync requests from [`Lister::list`].

use crate::manifest::ManifestResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clustersync_core::{ListError, ListOptions, Lister};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const COLUMNS: &str =
    "id, cluster_name, version, spec, status, deleted_at, original_source, published_version";

/// `SQLite`-backed manifest store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn().execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS manifests (
                id TEXT NOT NULL,
                cluster_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'null',
                deleted_at TEXT,
                original_source TEXT,
                published_version INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (id, cluster_name)
            );

            CREATE INDEX IF NOT EXISTS idx_manifests_cluster ON manifests(cluster_name);

            CREATE TABLE IF NOT EXISTS manifest_tombstones (
                id TEXT NOT NULL,
                cluster_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (id, cluster_name)
            );
            ",
        )?;

        Ok(())
    }

    /// Author a spec. Bumps the version when the spec changed or the
    /// manifest was being deleted.
    ///
    /// Returns the current version.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn apply_spec(&self, id: &str, cluster_name: &str, spec: &Value) -> SqliteResult<i64> {
        let conn = self.conn();
        let raw = spec.to_string();
        let existing: Option<(i64, String, Option<String>)> = conn
            .query_row(
                "SELECT version, spec, deleted_at FROM manifests WHERE id = ?1 AND cluster_name = ?2",
                (id, cluster_name),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            Some((version, current, None)) if current == raw => Ok(version),
            Some((version, _, _)) => {
                conn.execute(
                    r"
                    UPDATE manifests
                    SET version = ?3, spec = ?4, deleted_at = NULL, updated_at = ?5
                    WHERE id = ?1 AND cluster_name = ?2
                    ",
                    (id, cluster_name, version + 1, &raw, now()),
                )?;
                Ok(version + 1)
            }
            None => {
                // a re-created manifest continues above its forgotten versions
                let floor: i64 = conn
                    .query_row(
                        "SELECT version FROM manifest_tombstones WHERE id = ?1 AND cluster_name = ?2",
                        (id, cluster_name),
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                let version = floor + 1;

                conn.execute(
                    r"
                    INSERT INTO manifests (id, cluster_name, version, spec, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ",
                    (id, cluster_name, version, &raw, now()),
                )?;
                conn.execute(
                    "DELETE FROM manifest_tombstones WHERE id = ?1 AND cluster_name = ?2",
                    (id, cluster_name),
                )?;
                Ok(version)
            }
        }
    }

    /// Request deletion of an authored manifest.
    ///
    /// Returns the new version, or `None` if the manifest is unknown or
    /// already being deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn mark_deleted(&self, id: &str, cluster_name: &str) -> SqliteResult<Option<i64>> {
        let conn = self.conn();
        let updated = conn.execute(
            r"
            UPDATE manifests
            SET version = version + 1, deleted_at = ?3, updated_at = ?4
            WHERE id = ?1 AND cluster_name = ?2 AND deleted_at IS NULL
            ",
            (id, cluster_name, Utc::now().to_rfc3339(), now()),
        )?;
        if updated == 0 {
            return Ok(None);
        }

        conn.query_row(
            "SELECT version FROM manifests WHERE id = ?1 AND cluster_name = ?2",
            (id, cluster_name),
            |row| row.get(0),
        )
        .optional()
    }

    /// Store a received manifest, keeping any reported status.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub fn upsert(&self, manifest: &ManifestResource) -> SqliteResult<()> {
        self.conn().execute(
            r"
            INSERT INTO manifests (id, cluster_name, version, spec, deleted_at, original_source, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (id, cluster_name) DO UPDATE SET
                version = excluded.version,
                spec = excluded.spec,
                deleted_at = excluded.deleted_at,
                original_source = excluded.original_source,
                updated_at = excluded.updated_at
            ",
            (
                &manifest.id,
                &manifest.cluster_name,
                manifest.version,
                manifest.spec.to_string(),
                manifest.deleted_at.map(|ts| ts.to_rfc3339()),
                &manifest.original_source,
                now(),
            ),
        )?;

        Ok(())
    }

    /// Record observed status.
    ///
    /// Returns `false` if the manifest is unknown.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub fn update_status(&self, id: &str, cluster_name: &str, status: &Value) -> SqliteResult<bool> {
        let updated = self.conn().execute(
            r"
            UPDATE manifests SET status = ?3, updated_at = ?4
            WHERE id = ?1 AND cluster_name = ?2
            ",
            (id, cluster_name, status.to_string(), now()),
        )?;

        Ok(updated > 0)
    }

    /// Remove a manifest.
    ///
    /// Returns `false` if it was not present.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn delete(&self, id: &str, cluster_name: &str) -> SqliteResult<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM manifests WHERE id = ?1 AND cluster_name = ?2",
            (id, cluster_name),
        )?;

        Ok(deleted > 0)
    }

    /// Remove an authored manifest whose deletion was confirmed, keeping
    /// its version as the floor for a later re-create.
    ///
    /// Returns `false` if it was not present.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn forget(&self, id: &str, cluster_name: &str, confirmed_version: i64) -> SqliteResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let version: Option<i64> = tx
            .query_row(
                "SELECT version FROM manifests WHERE id = ?1 AND cluster_name = ?2",
                (id, cluster_name),
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Ok(false);
        };

        tx.execute(
            r"
            INSERT INTO manifest_tombstones (id, cluster_name, version)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (id, cluster_name) DO UPDATE SET
                version = MAX(version, excluded.version)
            ",
            (id, cluster_name, version.max(confirmed_version)),
        )?;
        tx.execute(
            "DELETE FROM manifests WHERE id = ?1 AND cluster_name = ?2",
            (id, cluster_name),
        )?;
        tx.commit()?;

        Ok(true)
    }

    /// Get one manifest.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn get(&self, id: &str, cluster_name: &str) -> SqliteResult<Option<ManifestResource>> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM manifests WHERE id = ?1 AND cluster_name = ?2"),
                (id, cluster_name),
                manifest_from_row,
            )
            .optional()
    }

    /// List manifests in scope, ordered by cluster and id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn list(&self, options: &ListOptions) -> SqliteResult<Vec<ManifestResource>> {
        let conn = self.conn();
        match options.scope() {
            Some(cluster_name) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM manifests WHERE cluster_name = ?1 ORDER BY id"
                ))?;
                let rows = stmt
                    .query_map([cluster_name], manifest_from_row)?
                    .collect::<SqliteResult<Vec<_>>>()?;
                Ok(rows)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM manifests ORDER BY cluster_name, id"
                ))?;
                let rows = stmt
                    .query_map([], manifest_from_row)?
                    .collect::<SqliteResult<Vec<_>>>()?;
                Ok(rows)
            }
        }
    }

    /// Manifests whose version is newer than the last published one,
    /// paired with that published version.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn pending(&self) -> SqliteResult<Vec<(ManifestResource, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r"
            SELECT {COLUMNS} FROM manifests
            WHERE version > published_version
            ORDER BY updated_at ASC
            "
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((manifest_from_row(row)?, row.get(7)?)))?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record that `version` was published.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub fn mark_published(&self, id: &str, cluster_name: &str, version: i64) -> SqliteResult<()> {
        self.conn().execute(
            r"
            UPDATE manifests SET published_version = MAX(published_version, ?3)
            WHERE id = ?1 AND cluster_name = ?2
            ",
            (id, cluster_name, version),
        )?;

        Ok(())
    }
}

#[async_trait]
impl Lister<ManifestResource> for SqliteStore {
    async fn list(&self, options: &ListOptions) -> Result<Vec<ManifestResource>, ListError> {
        SqliteStore::list(self, options).map_err(|e| ListError(e.to_string()))
    }
}

fn manifest_from_row(row: &Row<'_>) -> SqliteResult<ManifestResource> {
    let deleted_at: Option<String> = row.get(5)?;
    let deleted_at = deleted_at
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(ManifestResource {
        id: row.get(0)?,
        cluster_name: row.get(1)?,
        version: row.get(2)?,
        spec: json_column(row, 3)?,
        status: json_column(row, 4)?,
        deleted_at,
        original_source: row.get(6)?,
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> SqliteResult<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_spec_versions() {
        let store = SqliteStore::in_memory().unwrap();

        assert_eq!(store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap(), 1);
        assert_eq!(store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap(), 1);
        assert_eq!(store.apply_spec("m1", "c1", &json!({"a": 2})).unwrap(), 2);

        let manifest = store.get("m1", "c1").unwrap().unwrap();
        assert_eq!(manifest.version, 2);
        assert_eq!(manifest.spec, json!({"a": 2}));
        assert_eq!(manifest.status, Value::Null);
    }

    #[test]
    fn delete_bumps_version_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.apply_spec("m1", "c1", &json!({})).unwrap();

        assert_eq!(store.mark_deleted("m1", "c1").unwrap(), Some(2));
        assert_eq!(store.mark_deleted("m1", "c1").unwrap(), None);
        assert!(store.get("m1", "c1").unwrap().unwrap().is_deleting());

        // re-applying revives it
        assert_eq!(store.apply_spec("m1", "c1", &json!({})).unwrap(), 3);
        assert!(!store.get("m1", "c1").unwrap().unwrap().is_deleting());
    }

    #[test]
    fn recreate_after_forget_continues_versions() {
        let store = SqliteStore::in_memory().unwrap();
        store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap();
        assert_eq!(store.mark_deleted("m1", "c1").unwrap(), Some(2));

        assert!(store.forget("m1", "c1", 2).unwrap());
        assert!(store.get("m1", "c1").unwrap().is_none());
        assert!(!store.forget("m1", "c1", 2).unwrap());

        assert_eq!(store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap(), 3);
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, 0);

        // the floor is consumed by the re-create
        store.mark_deleted("m1", "c1").unwrap();
        store.forget("m1", "c1", 4).unwrap();
        assert_eq!(store.apply_spec("m1", "c1", &json!({})).unwrap(), 5);

        // other manifests start from one
        assert_eq!(store.apply_spec("m2", "c1", &json!({})).unwrap(), 1);
    }

    #[test]
    fn pending_until_published() {
        let store = SqliteStore::in_memory().unwrap();
        store.apply_spec("m1", "c1", &json!({})).unwrap();
        store.apply_spec("m2", "c2", &json!({})).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|(_, published)| *published == 0));

        store.mark_published("m1", "c1", 1).unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.id, "m2");
    }

    #[test]
    fn upsert_keeps_status() {
        let store = SqliteStore::in_memory().unwrap();
        let mut manifest = ManifestResource::new("m1", "c1", 4, json!({"a": 1}));
        manifest.original_source = Some("hub1".to_string());
        store.upsert(&manifest).unwrap();
        assert!(store
            .update_status("m1", "c1", &json!({"phase": "Applied"}))
            .unwrap());

        manifest.version = 5;
        store.upsert(&manifest).unwrap();

        let stored = store.get("m1", "c1").unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.status, json!({"phase": "Applied"}));
        assert_eq!(stored.original_source.as_deref(), Some("hub1"));

        assert!(!store.update_status("missing", "c1", &json!({})).unwrap());
        assert!(store.delete("m1", "c1").unwrap());
        assert!(!store.delete("m1", "c1").unwrap());
    }

    #[tokio::test]
    async fn lister_scopes_by_cluster() {
        let store = SqliteStore::in_memory().unwrap();
        store.apply_spec("m1", "c1", &json!({})).unwrap();
        store.apply_spec("m2", "c1", &json!({})).unwrap();
        store.apply_spec("m3", "c2", &json!({})).unwrap();

        let c1 = Lister::list(&store, &ListOptions::cluster("c1")).await.unwrap();
        assert_eq!(c1.len(), 2);
        assert!(c1.iter().all(|m| m.cluster_name == "c1"));

        let all = Lister::list(&store, &ListOptions::all()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clustersync.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("m1", "c1").unwrap().unwrap().version, 1);
    }
}
