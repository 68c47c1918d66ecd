use crate::domain::ledger::{ConversionId, ConversionLedgerEntry, ConversionStatus};
use crate::domain::ports::ConversionLedgerStore;
use crate::error::{ConversionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for ledger entries, keyed by conversion ID.
pub const CF_CONVERSIONS: &str = "conversions";
/// Column Family mapping idempotency keys to conversion IDs.
pub const CF_IDEMPOTENCY_KEYS: &str = "idempotency_keys";

/// A persistent ledger store using RocksDB.
///
/// Entries and the idempotency index live in separate Column Families and are
/// written together in one `WriteBatch`. Writes are serialized through a mutex
/// so the uniqueness check and the status compare-and-set are atomic within
/// the process holding the database.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBLedgerStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBLedgerStore {
    /// Opens or creates a RocksDB instance at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_conversions = ColumnFamilyDescriptor::new(CF_CONVERSIONS, Options::default());
        let cf_keys = ColumnFamilyDescriptor::new(CF_IDEMPOTENCY_KEYS, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_conversions, cf_keys])?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ConversionError::Storage(format!("{} column family not found", name)))
    }

    fn read_entry(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>> {
        let cf = self.cf(CF_CONVERSIONS)?;
        match self.db.get_pinned_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn owner_of(&self, key: &str) -> Result<Option<ConversionId>> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        match self.db.get_pinned_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let raw = std::str::from_utf8(&bytes)
                    .map_err(|e| ConversionError::Storage(format!("Corrupt index entry: {}", e)))?;
                let id = raw
                    .parse()
                    .map_err(|e| ConversionError::Storage(format!("Corrupt index entry: {}", e)))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Callers must hold `write_lock`.
    fn write_entry(&self, entry: &ConversionLedgerEntry) -> Result<()> {
        if let Some(owner) = self.owner_of(&entry.idempotency_key)?
            && owner != entry.id
        {
            return Err(ConversionError::DuplicateIdempotencyKey(
                entry.idempotency_key.clone(),
            ));
        }

        let value = serde_json::to_vec(entry)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_CONVERSIONS)?, entry.id.as_bytes(), value);
        batch.put_cf(
            self.cf(CF_IDEMPOTENCY_KEYS)?,
            entry.idempotency_key.as_bytes(),
            entry.id.to_string().as_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    fn scan<F>(&self, predicate: F) -> Result<Vec<ConversionLedgerEntry>>
    where
        F: Fn(&ConversionLedgerEntry) -> bool,
    {
        let cf = self.cf(CF_CONVERSIONS)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let entry: ConversionLedgerEntry = serde_json::from_slice(&value)?;
            if predicate(&entry) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }
}

#[async_trait]
impl ConversionLedgerStore for RocksDBLedgerStore {
    async fn save(&self, entry: &ConversionLedgerEntry) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.write_entry(entry)
    }

    async fn save_if_status(
        &self,
        entry: &ConversionLedgerEntry,
        expected: ConversionStatus,
    ) -> Result<bool> {
        let _lock = self.write_lock.lock().await;
        match self.read_entry(entry.id)? {
            Some(stored) if stored.status == expected => {
                self.write_entry(entry)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_by_id(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>> {
        self.read_entry(id)
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionLedgerEntry>> {
        match self.owner_of(key)? {
            Some(id) => self.read_entry(id),
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, status: ConversionStatus) -> Result<Vec<ConversionLedgerEntry>> {
        self.scan(|e| e.status == status)
    }

    async fn list_pending_ready_for_execution(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversionLedgerEntry>> {
        self.scan(|e| e.is_ready_for_execution(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quote::{ConversionQuote, CryptoAmount};
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn entry(key: &str) -> ConversionLedgerEntry {
        let quote = ConversionQuote {
            id: format!("quote-{key}"),
            fiat_amount: dec!(25.00),
            fiat_currency: "USD".to_string(),
            crypto_amount: CryptoAmount::new(2_500_000).unwrap(),
            crypto_denom: "uve".to_string(),
            destination_address: "virtengine1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5eed0dg".to_string(),
            conversion_rate: dec!(0.1),
            fee: dec!(0.25),
            expires_at: Utc::now() + TimeDelta::minutes(5),
        };
        ConversionLedgerEntry::new(key, &quote, "uve", "pi_1", 3, BTreeMap::new(), Utc::now())
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBLedgerStore::open(dir.path()).expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_CONVERSIONS).is_some());
        assert!(store.db.cf_handle(CF_IDEMPOTENCY_KEYS).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBLedgerStore::open(dir.path()).unwrap();

        let e = entry("k1");
        store.save(&e).await.unwrap();

        assert_eq!(store.get_by_id(e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(store.get_by_idempotency_key("k1").await.unwrap(), Some(e.clone()));
        assert!(store.get_by_idempotency_key("k2").await.unwrap().is_none());

        let err = store.save(&entry("k1")).await.unwrap_err();
        assert!(matches!(err, ConversionError::DuplicateIdempotencyKey(_)));

        let pending = store.list_by_status(ConversionStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_compare_and_set() {
        let dir = tempdir().unwrap();
        let store = RocksDBLedgerStore::open(dir.path()).unwrap();

        let mut e = entry("k1");
        store.save(&e).await.unwrap();
        e.mark_executing(Utc::now()).unwrap();

        assert!(store.save_if_status(&e, ConversionStatus::Pending).await.unwrap());
        assert!(!store.save_if_status(&e, ConversionStatus::Pending).await.unwrap());

        let stored = store.get_by_id(e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversionStatus::Executing);
        assert!(store
            .list_pending_ready_for_execution(Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rocksdb_survives_reopen() {
        let dir = tempdir().unwrap();
        let e = entry("k1");
        {
            let store = RocksDBLedgerStore::open(dir.path()).unwrap();
            store.save(&e).await.unwrap();
        }

        let store = RocksDBLedgerStore::open(dir.path()).unwrap();
        assert_eq!(store.get_by_idempotency_key("k1").await.unwrap(), Some(e));
    }
}
