//! Key-value seam the relay persists through.
//!
//! The relay only ever needs get/put/delete on a handful of namespaces, plus an
//! atomic multi-key write for permission transitions. [`SqliteKv`] is the
//! production backend; [`MemoryKv`] keeps everything in a process-local map.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task;

use crate::database::Database;
use crate::error::StoreError;

/// Top-level key spaces. Every key inside a namespace is a host id.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Namespace {
    Credential,
    Mailbox,
    Allowed,
    Pending,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Mailbox => "mailbox",
            Self::Allowed => "allowed",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write inside a [`KvStore::write_batch`].
#[derive(Clone, Debug, PartialEq)]
pub enum KvWrite {
    Put {
        ns: Namespace,
        key: String,
        value: String,
    },
    Delete {
        ns: Namespace,
        key: String,
    },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, ns: Namespace, key: &str, value: String) -> Result<(), StoreError>;

    async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StoreError>;

    /// Apply all writes or none of them.
    async fn write_batch(&self, writes: Vec<KvWrite>) -> Result<(), StoreError>;
}

/// Read a JSON value, `None` when the key is absent.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    ns: Namespace,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match kv.get(ns, key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Build a `Put` carrying `value` as JSON text.
pub fn put_json<T: Serialize + ?Sized>(
    ns: Namespace,
    key: &str,
    value: &T,
) -> Result<KvWrite, StoreError> {
    Ok(KvWrite::Put {
        ns,
        key: key.to_owned(),
        value: serde_json::to_string(value)?,
    })
}

/// [`KvStore`] over the `kv` table of a [`Database`].
#[derive(Clone)]
pub struct SqliteKv {
    db: Database,
}

impl SqliteKv {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const UPSERT: &str = "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

const DELETE: &str = "DELETE FROM kv WHERE namespace = ?1 AND key = ?2";

impl SqliteKv {
    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Task(format!("store call: {e}")))?
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_owned();
        self.blocking(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                    rusqlite::params![ns.as_str(), key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn put(&self, ns: Namespace, key: &str, value: String) -> Result<(), StoreError> {
        let key = key.to_owned();
        let now = Utc::now().to_rfc3339();
        self.blocking(move |conn| {
            conn.execute(UPSERT, rusqlite::params![ns.as_str(), key, value, now])?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StoreError> {
        let key = key.to_owned();
        self.blocking(move |conn| {
            conn.execute(DELETE, rusqlite::params![ns.as_str(), key])?;
            Ok(())
        })
        .await
    }

    async fn write_batch(&self, writes: Vec<KvWrite>) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for write in &writes {
                match write {
                    KvWrite::Put { ns, key, value } => {
                        tx.execute(UPSERT, rusqlite::params![ns.as_str(), key, value, now])?;
                    }
                    KvWrite::Delete { ns, key } => {
                        tx.execute(DELETE, rusqlite::params![ns.as_str(), key])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// Process-local [`KvStore`]; nothing survives a restart.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<(Namespace, String), String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(&(ns, key.to_owned())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &str, value: String) -> Result<(), StoreError> {
        let _ = self.entries.lock().insert((ns, key.to_owned()), value);
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<(), StoreError> {
        let _ = self.entries.lock().remove(&(ns, key.to_owned()));
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<KvWrite>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        for write in writes {
            match write {
                KvWrite::Put { ns, key, value } => {
                    let _ = entries.insert((ns, key), value);
                }
                KvWrite::Delete { ns, key } => {
                    let _ = entries.remove(&(ns, key));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sqlite() -> SqliteKv {
        SqliteKv::new(Database::in_memory().unwrap())
    }

    async fn exercise(kv: &dyn KvStore) {
        assert_eq!(kv.get(Namespace::Mailbox, "h").await.unwrap(), None);

        kv.put(Namespace::Mailbox, "h", "[1]".into()).await.unwrap();
        assert_eq!(
            kv.get(Namespace::Mailbox, "h").await.unwrap().as_deref(),
            Some("[1]")
        );

        kv.put(Namespace::Mailbox, "h", "[1,2]".into()).await.unwrap();
        assert_eq!(
            kv.get(Namespace::Mailbox, "h").await.unwrap().as_deref(),
            Some("[1,2]")
        );

        // Same key in another namespace is independent.
        assert_eq!(kv.get(Namespace::Allowed, "h").await.unwrap(), None);

        kv.delete(Namespace::Mailbox, "h").await.unwrap();
        assert_eq!(kv.get(Namespace::Mailbox, "h").await.unwrap(), None);

        // Deleting an absent key is not an error.
        kv.delete(Namespace::Mailbox, "h").await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_get_put_delete() {
        exercise(&sqlite()).await;
    }

    #[tokio::test]
    async fn memory_get_put_delete() {
        exercise(&MemoryKv::new()).await;
    }

    #[tokio::test]
    async fn sqlite_write_batch_applies_all() {
        let kv = sqlite();
        kv.put(Namespace::Pending, "h", "[\"x\"]".into()).await.unwrap();
        kv.write_batch(vec![
            KvWrite::Put {
                ns: Namespace::Allowed,
                key: "h".into(),
                value: "[\"x\"]".into(),
            },
            KvWrite::Delete {
                ns: Namespace::Pending,
                key: "h".into(),
            },
        ])
        .await
        .unwrap();
        assert_eq!(
            kv.get(Namespace::Allowed, "h").await.unwrap().as_deref(),
            Some("[\"x\"]")
        );
        assert_eq!(kv.get(Namespace::Pending, "h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_write_batch_rolls_back_on_failure() {
        let db = Database::in_memory().unwrap();
        let kv = SqliteKv::new(db.clone());
        kv.put(Namespace::Allowed, "h", "old".into()).await.unwrap();

        // A failure mid-batch must leave the first write unapplied.
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON kv
                 WHEN NEW.value = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let result = kv
            .write_batch(vec![
                KvWrite::Put {
                    ns: Namespace::Allowed,
                    key: "h".into(),
                    value: "new".into(),
                },
                KvWrite::Put {
                    ns: Namespace::Pending,
                    key: "h".into(),
                    value: "poison".into(),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(
            kv.get(Namespace::Allowed, "h").await.unwrap().as_deref(),
            Some("old")
        );
    }

    #[tokio::test]
    async fn sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let kv = SqliteKv::new(Database::open(&path).unwrap());
            kv.put(Namespace::Credential, "h", "secret".into()).await.unwrap();
        }
        let kv = SqliteKv::new(Database::open(&path).unwrap());
        assert_eq!(
            kv.get(Namespace::Credential, "h").await.unwrap().as_deref(),
            Some("secret")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_calls_run_off_the_runtime_workers() {
        let kv = Arc::new(SqliteKv::new(Database::in_memory().unwrap()));
        let mut handles = Vec::new();
        for i in 0..32 {
            let kv = Arc::clone(&kv);
            handles.push(tokio::spawn(async move {
                kv.put(Namespace::Mailbox, &format!("h{i}"), i.to_string())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            kv.get(Namespace::Mailbox, "h31").await.unwrap().as_deref(),
            Some("31")
        );
    }

    #[tokio::test]
    async fn panicked_store_call_becomes_task_error() {
        let kv = SqliteKv::new(Database::in_memory().unwrap());
        let result: Result<(), _> = kv.blocking(|_| panic!("connection poisoned")).await;
        assert!(matches!(result, Err(StoreError::Task(_))));
        assert_eq!(kv.get(Namespace::Credential, "h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_json_reports_corrupt_values() {
        let kv = MemoryKv::new();
        kv.put(Namespace::Allowed, "h", "{not json".into()).await.unwrap();
        let result: Result<Option<Vec<String>>, _> =
            get_json(&kv, Namespace::Allowed, "h").await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn namespace_names() {
        assert_eq!(Namespace::Credential.as_str(), "credential");
        assert_eq!(Namespace::Mailbox.to_string(), "mailbox");
        assert_eq!(Namespace::Allowed.as_str(), "allowed");
        assert_eq!(Namespace::Pending.as_str(), "pending");
    }
}
