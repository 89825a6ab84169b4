//! In-process doubles for the storage and store seams.
//!
//! Compiled for this crate's tests and behind the `testing` feature for
//! downstream integration tests. Both doubles keep the constraints of the real
//! backends (unique object keys, unique identifiers, a bounded connection
//! budget) and accept injected faults.

use crate::{
    error::{PersistError, PublishError},
    publish::ObjectStorage,
    store::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_SIZE, LOOKUP_TABLES, RecordStore},
    types::{Identifier, RecordFields, RecordSummary, TableSelector},
};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Failure injected into [`MemoryStorage`] uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFault {
    /// Every upload fails with a transport error.
    Transport,
    /// Every upload is rejected with the given status.
    Status(u16),
    /// The next `n` uploads fail with a transport error, later ones succeed.
    TransientFor(u32),
    /// The next `n` uploads are stored but answer with a transport error.
    LostAckFor(u32),
}

/// In-process [`ObjectStorage`] keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<(String, String), (Vec<u8>, String)>>,
    fault: Mutex<Option<StorageFault>>,
    attempts: Mutex<u32>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, fault: StorageFault) {
        *self.fault.lock() = Some(fault);
    }

    /// Stored bytes and content type for an object.
    pub fn get(&self, bucket: &str, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Upload attempts seen so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }

    fn store(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        let mut objects = self.objects.lock();
        let slot = (bucket.to_string(), key.to_string());
        if objects.contains_key(&slot) {
            return Err(PublishError::Rejected {
                status: 409,
                body: "The resource already exists".into(),
            });
        }
        objects.insert(slot, (bytes, content_type.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        *self.attempts.lock() += 1;

        let mut fault = self.fault.lock();
        let current = *fault;
        match current {
            Some(StorageFault::Transport) => {
                return Err(PublishError::Transport("connection refused".into()));
            }
            Some(StorageFault::Status(status)) => {
                return Err(PublishError::Rejected {
                    status,
                    body: "rejected by memory storage".into(),
                });
            }
            Some(StorageFault::TransientFor(n)) if n > 0 => {
                *fault = Some(StorageFault::TransientFor(n - 1));
                return Err(PublishError::Transport("connection reset".into()));
            }
            Some(StorageFault::LostAckFor(n)) if n > 0 => {
                *fault = Some(StorageFault::LostAckFor(n - 1));
                drop(fault);
                self.store(bucket, key, bytes, content_type)?;
                return Err(PublishError::Transport(
                    "connection closed before response".into(),
                ));
            }
            _ => {}
        }
        drop(fault);

        self.store(bucket, key, bytes, content_type)
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<(), PublishError> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

/// Failure injected into [`MemoryRecordStore`] inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Every insert fails with a connectivity error.
    Connectivity,
    /// The next `n` inserts fail with a connectivity error.
    TransientFor(u32),
    /// Inserts commit, then take this long to answer.
    SlowCommit(Duration),
}

/// In-process [`RecordStore`] with a bounded connection budget.
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<TableSelector, Vec<RecordFields>>>,
    fault: Mutex<Option<StoreFault>>,
    connections: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::with_pool(DEFAULT_POOL_SIZE, DEFAULT_ACQUIRE_TIMEOUT)
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            fault: Mutex::new(None),
            connections: Arc::new(Semaphore::new(max_connections as usize)),
            acquire_timeout,
        }
    }

    pub fn fail_with(&self, fault: StoreFault) {
        *self.fault.lock() = Some(fault);
    }

    /// Takes one connection out of the budget until the permit is dropped.
    pub async fn hold_connection(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.connections).acquire_owned().await.ok()
    }

    /// Rows written to `table`, in insertion order.
    pub fn rows(&self, table: TableSelector) -> Vec<RecordFields> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.lock().values().map(Vec::len).sum()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, PersistError> {
        match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.connections).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(PersistError::Connectivity("pool closed".into())),
            Err(_elapsed) => Err(PersistError::PoolExhausted),
        }
    }

    fn append(&self, table: TableSelector, fields: &RecordFields) -> Result<(), PersistError> {
        let mut tables = self.tables.lock();
        let rows = tables.entry(table).or_default();
        if rows.iter().any(|row| row.identifier == fields.identifier) {
            return Err(PersistError::Constraint(format!(
                "duplicate key value violates unique constraint \"{}_unique_id_key\"",
                table.table()
            )));
        }
        rows.push(fields.clone());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(
        &self,
        table: TableSelector,
        fields: &RecordFields,
    ) -> Result<(), PersistError> {
        let _connection = self.acquire().await?;

        let stall = {
            let mut fault = self.fault.lock();
            let current = *fault;
            match current {
                Some(StoreFault::Connectivity) => {
                    return Err(PersistError::Connectivity("connection reset by peer".into()));
                }
                Some(StoreFault::TransientFor(n)) if n > 0 => {
                    *fault = Some(StoreFault::TransientFor(n - 1));
                    return Err(PersistError::Connectivity("connection reset by peer".into()));
                }
                Some(StoreFault::SlowCommit(delay)) => Some(delay),
                _ => None,
            }
        };

        self.append(table, fields)?;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn lookup(&self, identifier: &Identifier) -> Result<Option<RecordSummary>, PersistError> {
        let _connection = self.acquire().await?;

        let tables = self.tables.lock();
        let found = LOOKUP_TABLES.iter().find_map(|table| {
            tables.get(table).and_then(|rows| {
                rows.iter()
                    .find(|row| &row.identifier == identifier)
                    .map(|row| RecordSummary {
                        name: row.name.clone(),
                        unique_id: row.identifier.to_string(),
                        source: table.table().to_string(),
                    })
            })
        });
        Ok(found)
    }

    async fn close(&self) {
        self.connections.close();
    }
}
