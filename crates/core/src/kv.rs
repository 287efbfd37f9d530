use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Key-value store with per-entry expiry, backing the rate-limit counters.
///
/// An expired entry is indistinguishable from an absent one; implementations
/// reclaim expired entries on write.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by key. Expired entries read back as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value expiring `ttl` from now, overwriting any previous entry.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// A stored value together with its expiry instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    expires_at: DateTime<Utc>,
}

impl StoredValue {
    fn new(value: &str, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl).context("TTL out of range")?;
        Ok(Self {
            value: value.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Persistent key-value store using redb
#[derive(Clone)]
pub struct RedbKvStore {
    db: Arc<Database>,
}

impl RedbKvStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create kv directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _table = write_txn
                .open_table(KV_TABLE)
                .context("Failed to open kv table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredValue>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(KV_TABLE).context("Failed to open table")?;

        let value = table.get(key).context("Failed to get entry")?;

        match value {
            Some(guard) => {
                let entry: StoredValue = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize entry")?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn write_entry(&self, key: &str, entry: &StoredValue) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(KV_TABLE)
                .context("Failed to open table")?;

            // Expired rows are never read again; reclaim them while the
            // write lock is held
            let now = Utc::now();
            let mut expired = Vec::new();
            for row in table.iter().context("Failed to scan table")? {
                let (row_key, row_value) = row.context("Failed to read row")?;
                let stale = serde_json::from_slice::<StoredValue>(row_value.value())
                    .map(|stored| stored.is_expired(now))
                    .unwrap_or(true);
                if stale {
                    expired.push(row_key.value().to_string());
                }
            }
            for stale_key in &expired {
                table
                    .remove(stale_key.as_str())
                    .context("Failed to remove expired row")?;
            }

            let value = serde_json::to_vec(entry).context("Failed to serialize entry")?;

            table
                .insert(key, value.as_slice())
                .context("Failed to insert entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KvStore for RedbKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.read_entry(key)? {
            Some(entry) if entry.is_expired(Utc::now()) => Ok(None),
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write_entry(key, &StoredValue::new(value, ttl)?)
    }
}

/// In-memory key-value store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = StoredValue::new(value, ttl)?;
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, stored| !stored.is_expired(now));
        entries.insert(key.to_string(), entry);
        Ok(())
    }
}
