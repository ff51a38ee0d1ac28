//! # unimark-store
//!
//! `SQLite`-backed implementation of the `unimark-core` entity store.
//!
//! Entities live in a single `entities` table keyed by `(kind, name)`,
//! with properties serialized as one JSON object per row. WAL mode is
//! enabled so status reads proceed while shard workers write.
//! `SQLITE_BUSY`/`SQLITE_LOCKED` surface as transient errors, which the
//! engine retries with backoff; everything else is a hard backend
//! failure.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable for a shared connection.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::debug;
use unimark_core::store::Transaction;
use unimark_core::{Entity, EntityStore, Key, StoreError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Entity store backed by a single `SQLite` database.
///
/// The connection is shared behind a mutex; transactions run with
/// `BEGIN IMMEDIATE` so the write lock is taken up front and lock
/// contention surfaces as a retryable busy error instead of a deadlock
/// at commit.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sqlite)?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite)?;
        debug!(path = %path.display(), "entity store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory store, for tests and demos.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Path of the backing database file, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

impl EntityStore for SqliteStore {
    fn scan(
        &self,
        kind: &str,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT name, props FROM entities
                 WHERE kind = ?1
                   AND (?2 IS NULL OR name > ?2)
                   AND (?3 IS NULL OR name <= ?3)
                 ORDER BY name ASC
                 LIMIT ?4",
            )
            .map_err(map_sqlite)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![kind, after, until, limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(map_sqlite)?;

        let mut entities = Vec::new();
        for row in rows {
            let (name, props) = row.map_err(map_sqlite)?;
            entities.push(decode_row(kind, &name, &props)?);
        }
        Ok(entities)
    }

    fn sample_keys(&self, kind: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.lock_conn();
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE kind = ?1",
                params![kind],
                |row| row.get(0),
            )
            .map_err(map_sqlite)?;
        let total = usize::try_from(total).unwrap_or(0);

        let step = total / (count + 1);
        if step == 0 {
            // Domain smaller than the requested spread: every name is a
            // valid split point.
            let mut stmt = conn
                .prepare_cached(
                    "SELECT name FROM entities WHERE kind = ?1 ORDER BY name ASC",
                )
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(params![kind], |row| row.get::<_, String>(0))
                .map_err(map_sqlite)?;
            return rows.map(|r| r.map_err(map_sqlite)).collect();
        }

        let mut stmt = conn
            .prepare_cached(
                "SELECT name FROM entities WHERE kind = ?1
                 ORDER BY name ASC LIMIT 1 OFFSET ?2",
            )
            .map_err(map_sqlite)?;
        let mut names = Vec::with_capacity(count);
        for i in 1..=count {
            let offset = i64::try_from(i * step - 1).unwrap_or(i64::MAX);
            let name = stmt
                .query_row(params![kind, offset], |row| row.get::<_, String>(0))
                .optional()
                .map_err(map_sqlite)?;
            if let Some(name) = name {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare_cached("SELECT props FROM entities WHERE kind = ?1 AND name = ?2")
            .map_err(map_sqlite)?;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let props = stmt
                .query_row(params![key.kind, key.name], |row| row.get::<_, String>(0))
                .optional()
                .map_err(map_sqlite)?;
            found.push(match props {
                Some(props) => Some(decode_row(&key.kind, &key.name, &props)?),
                None => None,
            });
        }
        Ok(found)
    }

    fn put_many(&self, entities: &[Entity]) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO entities (kind, name, props) VALUES (?1, ?2, ?3)
                     ON CONFLICT (kind, name) DO UPDATE SET props = excluded.props",
                )
                .map_err(map_sqlite)?;
            for entity in entities {
                stmt.execute(params![
                    entity.key.kind,
                    entity.key.name,
                    encode_props(entity)?
                ])
                .map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM entities WHERE kind = ?1 AND name = ?2",
            params![key.kind, key.name],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    fn transact(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;
        {
            let mut handle = SqliteTransaction { tx: &tx };
            body(&mut handle)?;
        }
        tx.commit().map_err(map_sqlite)
    }
}

/// Read-modify-write handle over an open `BEGIN IMMEDIATE` transaction.
/// Reads go to the same connection, so they observe earlier staged
/// writes.
struct SqliteTransaction<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl Transaction for SqliteTransaction<'_> {
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError> {
        let props = self
            .tx
            .query_row(
                "SELECT props FROM entities WHERE kind = ?1 AND name = ?2",
                params![key.kind, key.name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(map_sqlite)?;
        props
            .map(|props| decode_row(&key.kind, &key.name, &props))
            .transpose()
    }

    fn put(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO entities (kind, name, props) VALUES (?1, ?2, ?3)
                 ON CONFLICT (kind, name) DO UPDATE SET props = excluded.props",
                params![entity.key.kind, entity.key.name, encode_props(&entity)?],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        self.tx
            .execute(
                "DELETE FROM entities WHERE kind = ?1 AND name = ?2",
                params![key.kind, key.name],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }
}

fn encode_props(entity: &Entity) -> Result<SqlValue, StoreError> {
    let map: serde_json::Map<String, serde_json::Value> =
        entity.props.clone().into_iter().collect();
    let json = serde_json::to_string(&serde_json::Value::Object(map)).map_err(StoreError::Codec)?;
    Ok(SqlValue::Text(json))
}

fn decode_row(kind: &str, name: &str, props: &str) -> Result<Entity, StoreError> {
    let value: serde_json::Value = serde_json::from_str(props).map_err(StoreError::Codec)?;
    let serde_json::Value::Object(map) = value else {
        return Err(StoreError::Backend(format!(
            "row {kind}/{name} holds non-object props"
        )));
    };
    Ok(Entity {
        key: Key::new(kind, name),
        props: map.into_iter().collect(),
    })
}

/// Busy and locked are retryable lock contention; anything else is a
/// hard failure.
fn map_sqlite(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn seeded(count: usize) -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        let entities: Vec<Entity> = (0..count)
            .map(|i| {
                Entity::new(Key::new("profile", format!("k{i:04}")))
                    .with("email", json!(format!("k{i:04}@example.com")))
            })
            .collect();
        store.put_many(&entities).unwrap();
        store
    }

    #[test]
    fn put_get_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let entity = Entity::new(Key::new("profile", "u1"))
            .with("email", json!("a@b.c"))
            .with("age", json!(41));
        store.put_many(std::slice::from_ref(&entity)).unwrap();

        let found = store.get_many(&[Key::new("profile", "u1")]).unwrap();
        assert_eq!(found[0].as_ref(), Some(&entity));
    }

    #[test]
    fn get_many_is_positionally_aligned() {
        let store = seeded(3);
        let found = store
            .get_many(&[
                Key::new("profile", "k0001"),
                Key::new("profile", "missing"),
                Key::new("profile", "k0002"),
            ])
            .unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
        assert!(found[2].is_some());
    }

    #[test]
    fn scan_bounds_are_exclusive_below_inclusive_above() {
        let store = seeded(10);
        let names: Vec<String> = store
            .scan("profile", Some("k0002"), Some("k0005"), 100)
            .unwrap()
            .into_iter()
            .map(|e| e.key.name)
            .collect();
        assert_eq!(names, ["k0003", "k0004", "k0005"]);
    }

    #[test]
    fn scan_respects_limit_and_order() {
        let store = seeded(10);
        let names: Vec<String> = store
            .scan("profile", None, None, 4)
            .unwrap()
            .into_iter()
            .map(|e| e.key.name)
            .collect();
        assert_eq!(names, ["k0000", "k0001", "k0002", "k0003"]);
    }

    #[test]
    fn scan_is_scoped_to_kind() {
        let store = seeded(2);
        store
            .put_many(&[Entity::new(Key::new("account", "k0000"))])
            .unwrap();
        assert_eq!(store.scan("profile", None, None, 100).unwrap().len(), 2);
        assert_eq!(store.scan("account", None, None, 100).unwrap().len(), 1);
    }

    #[test]
    fn sample_keys_spread_across_domain() {
        let store = seeded(100);
        let names = store.sample_keys("profile", 3).unwrap();
        assert_eq!(names, ["k0024", "k0049", "k0074"]);
    }

    #[test]
    fn sample_keys_small_domain_returns_everything() {
        let store = seeded(3);
        let names = store.sample_keys("profile", 9).unwrap();
        assert_eq!(names, ["k0000", "k0001", "k0002"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = seeded(1);
        let key = Key::new("profile", "k0000");
        store.delete(&key).unwrap();
        store.delete(&key).unwrap();
        assert!(store.get_many(&[key]).unwrap()[0].is_none());
    }

    #[test]
    fn transact_applies_atomically() {
        let store = seeded(1);
        let key = Key::new("profile", "k0000");

        store
            .transact(&mut |txn| {
                let mut entity = txn.get(&key)?.ok_or(StoreError::NotFound {
                    key: key.encode(),
                })?;
                entity.props.insert("email".to_string(), json!("new@example.com"));
                txn.put(entity)
            })
            .unwrap();

        let found = store.get_many(std::slice::from_ref(&key)).unwrap();
        assert_eq!(found[0].as_ref().unwrap().get_str("email"), Some("new@example.com"));
    }

    #[test]
    fn transact_error_rolls_back() {
        let store = seeded(1);
        let key = Key::new("profile", "k0000");

        let result = store.transact(&mut |txn| {
            txn.put(Entity::new(Key::new("profile", "staged")))?;
            txn.delete(&key)?;
            Err(StoreError::Backend("abort".to_string()))
        });
        assert!(result.is_err());

        // Neither the staged write nor the delete took effect.
        assert!(store.get_many(&[Key::new("profile", "staged")]).unwrap()[0].is_none());
        assert!(store.get_many(std::slice::from_ref(&key)).unwrap()[0].is_some());
    }

    #[test]
    fn transact_reads_observe_staged_writes() {
        let store = SqliteStore::in_memory().unwrap();
        let key = Key::new("profile", "u1");
        store
            .transact(&mut |txn| {
                txn.put(Entity::new(key.clone()).with("email", json!("x@y.z")))?;
                let reread = txn.get(&key)?;
                assert!(reread.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unimark.db");
        let name = Uuid::new_v4().to_string();

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put_many(&[Entity::new(Key::new("profile", name.clone()))])
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(store.get_many(&[Key::new("profile", name)]).unwrap()[0].is_some());
    }
}
