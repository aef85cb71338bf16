//! Marking results and settings persistence.
//!
//! [`RedbStore`] keeps records in an embedded `redb` database, one JSON
//! document per row keyed by big-endian insertion sequence. Settings
//! documents live in a second table keyed by name and are seeded from the
//! configuration when the database is created.

use async_trait::async_trait;
use cell_common::config::SettingsSeed;
use cell_common::{
    CellError, CellResult, FieldTemplate, GradePolicy, MarkingRecord, RecordPatch, ShiftTable,
};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Records table: big-endian sequence -> JSON record.
const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

/// Settings table: document name -> JSON document.
const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

const SHIFT_TABLE_KEY: &str = "shift_table";
const GRADE_POLICY_KEY: &str = "grade_policy";
const FIELD_TEMPLATE_KEY: &str = "field_template";

/// Results and settings store used by the orchestrator.
#[async_trait]
pub trait CellStore: Send + Sync {
    /// Most recently inserted record.
    async fn latest_record(&self) -> CellResult<Option<MarkingRecord>>;

    /// Append a record.
    async fn insert(&self, record: &MarkingRecord) -> CellResult<()>;

    /// Patch the newest record with `serial`. Returns false when none exists.
    async fn update_last_matching(&self, serial: &str, patch: &RecordPatch) -> CellResult<bool>;

    /// Active shift table.
    async fn shift_table(&self) -> CellResult<ShiftTable>;

    /// Active grade policy.
    async fn grade_policy(&self) -> CellResult<GradePolicy>;

    /// Active barcode template.
    async fn field_template(&self) -> CellResult<FieldTemplate>;

    /// Release the store. Later calls fail.
    async fn close(&self) -> CellResult<()>;
}

fn store_err(err: impl Display) -> CellError {
    CellError::Store(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> CellResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(store_err)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CellResult<T> {
    serde_json::from_slice(bytes).map_err(store_err)
}

/// Open a store, retrying up to `attempts` times `delay` apart.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn open_with_retry<T, F>(attempts: u32, delay: Duration, mut open: F) -> CellResult<T>
where
    F: FnMut() -> CellResult<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match open() {
            Ok(store) => return Ok(store),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Store open failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `redb`-backed store.
pub struct RedbStore {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .field("open", &self.db.read().is_some())
            .finish()
    }
}

impl RedbStore {
    /// Open or create the database and seed missing settings documents.
    ///
    /// # Errors
    ///
    /// [`CellError::Store`] when the database cannot be opened or seeded.
    pub fn open(path: &Path, seed: &SettingsSeed) -> CellResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;

        let txn = db.begin_write().map_err(store_err)?;
        {
            txn.open_table(RECORDS).map_err(store_err)?;
            let mut settings = txn.open_table(SETTINGS).map_err(store_err)?;
            let documents = [
                (SHIFT_TABLE_KEY, encode(&seed.shift_table)?),
                (GRADE_POLICY_KEY, encode(&seed.grade)?),
                (FIELD_TEMPLATE_KEY, encode(&seed.field_template)?),
            ];
            for (key, value) in documents {
                if settings.get(key).map_err(store_err)?.is_none() {
                    settings.insert(key, value.as_slice()).map_err(store_err)?;
                    debug!(key, "Seeded settings document");
                }
            }
        }
        txn.commit().map_err(store_err)?;

        info!(path = %path.display(), "Store opened");
        Ok(Self {
            path: path.to_path_buf(),
            db: RwLock::new(Some(Arc::new(db))),
        })
    }

    /// Database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record, oldest first.
    ///
    /// # Errors
    ///
    /// [`CellError::Store`] on database failure.
    pub async fn records(&self) -> CellResult<Vec<MarkingRecord>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(store_err)?;
            let table = txn.open_table(RECORDS).map_err(store_err)?;
            let mut records = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (_, value) = entry.map_err(store_err)?;
                records.push(decode(value.value())?);
            }
            Ok(records)
        })
        .await
    }

    fn handle(&self) -> CellResult<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| CellError::Store("store is closed".into()))
    }

    /// Run a database operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> CellResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> CellResult<T> + Send + 'static,
    {
        let db = self.handle()?;
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(store_err)?
    }

    async fn setting<T>(&self, key: &'static str) -> CellResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(store_err)?;
            let table = txn.open_table(SETTINGS).map_err(store_err)?;
            let value = table
                .get(key)
                .map_err(store_err)?
                .ok_or_else(|| CellError::Store(format!("settings document {key} missing")))?;
            decode(value.value())
        })
        .await
    }
}

#[async_trait]
impl CellStore for RedbStore {
    async fn latest_record(&self) -> CellResult<Option<MarkingRecord>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(store_err)?;
            let table = txn.open_table(RECORDS).map_err(store_err)?;
            let latest = match table.last().map_err(store_err)? {
                Some((_, value)) => Some(decode(value.value())?),
                None => None,
            };
            Ok(latest)
        })
        .await
    }

    async fn insert(&self, record: &MarkingRecord) -> CellResult<()> {
        let value = encode(record)?;
        let serial = record.serial_number.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(store_err)?;
            {
                let mut table = txn.open_table(RECORDS).map_err(store_err)?;
                let next = match table.last().map_err(store_err)? {
                    Some((key, _)) => sequence_of(key.value())? + 1,
                    None => 1,
                };
                let key = next.to_be_bytes();
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(store_err)?;
            }
            txn.commit().map_err(store_err)?;
            debug!(%serial, "Record inserted");
            Ok(())
        })
        .await
    }

    async fn update_last_matching(&self, serial: &str, patch: &RecordPatch) -> CellResult<bool> {
        let serial = serial.to_string();
        let patch = patch.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(store_err)?;
            let updated = {
                let mut table = txn.open_table(RECORDS).map_err(store_err)?;
                let mut found = None;
                for entry in table.iter().map_err(store_err)?.rev() {
                    let (key, value) = entry.map_err(store_err)?;
                    let record: MarkingRecord = decode(value.value())?;
                    if record.serial_number == serial {
                        found = Some((key.value().to_vec(), record));
                        break;
                    }
                }
                match found {
                    Some((key, mut record)) => {
                        record.apply(&patch);
                        let value = encode(&record)?;
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(store_err)?;
                        true
                    }
                    None => false,
                }
            };
            txn.commit().map_err(store_err)?;
            Ok(updated)
        })
        .await
    }

    async fn shift_table(&self) -> CellResult<ShiftTable> {
        self.setting(SHIFT_TABLE_KEY).await
    }

    async fn grade_policy(&self) -> CellResult<GradePolicy> {
        self.setting(GRADE_POLICY_KEY).await
    }

    async fn field_template(&self) -> CellResult<FieldTemplate> {
        self.setting(FIELD_TEMPLATE_KEY).await
    }

    async fn close(&self) -> CellResult<()> {
        if self.db.write().take().is_some() {
            info!(path = %self.path.display(), "Store closed");
        }
        Ok(())
    }
}

fn sequence_of(key: &[u8]) -> CellResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| CellError::Store(format!("malformed record key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// In-memory store for simulation and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<MarkingRecord>>,
    settings: Mutex<SettingsSeed>,
}

impl MemoryStore {
    /// Empty store with the given settings.
    #[must_use]
    pub fn new(settings: SettingsSeed) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            settings: Mutex::new(settings),
        }
    }

    /// Every record, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<MarkingRecord> {
        self.records.lock().clone()
    }

    /// Replace the grade policy.
    pub fn set_grade_policy(&self, policy: GradePolicy) {
        self.settings.lock().grade = policy;
    }
}

#[async_trait]
impl CellStore for MemoryStore {
    async fn latest_record(&self) -> CellResult<Option<MarkingRecord>> {
        Ok(self.records.lock().last().cloned())
    }

    async fn insert(&self, record: &MarkingRecord) -> CellResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn update_last_matching(&self, serial: &str, patch: &RecordPatch) -> CellResult<bool> {
        let mut records = self.records.lock();
        match records.iter_mut().rev().find(|r| r.serial_number == serial) {
            Some(record) => {
                record.apply(patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shift_table(&self) -> CellResult<ShiftTable> {
        Ok(self.settings.lock().shift_table.clone())
    }

    async fn grade_policy(&self) -> CellResult<GradePolicy> {
        Ok(self.settings.lock().grade.clone())
    }

    async fn field_template(&self) -> CellResult<FieldTemplate> {
        Ok(self.settings.lock().field_template.clone())
    }

    async fn close(&self) -> CellResult<()> {
        Ok(())
    }
}
