//! Data sources backing a binding.

use crate::codec::{FieldErrors, Fields, Record};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Data source errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No record for the key, or the key does not resolve.
    #[error("Record not found")]
    NotFound,

    /// The source rejected the fields.
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    /// Storage failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Persistence for one resource type.
///
/// Keys are JSON values; each source decides which values resolve to a
/// record. A key that does not resolve is [`SourceError::NotFound`].
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Persist a new record.
    async fn create(&self, fields: Fields) -> Result<Record, SourceError>;

    /// Fetch a record by key.
    async fn get(&self, pk: &Value) -> Result<Record, SourceError>;

    /// Update a record. With `partial`, `fields` are merged into the stored
    /// record; otherwise they replace it.
    async fn update(&self, pk: &Value, fields: Fields, partial: bool)
        -> Result<Record, SourceError>;

    /// Delete a record.
    async fn delete(&self, pk: &Value) -> Result<(), SourceError>;

    /// One page of records in key order. Pages are 1-indexed; pages past the
    /// end are empty.
    async fn list(&self, page: u64, page_size: usize) -> Result<Vec<Record>, SourceError>;

    /// Total number of records.
    async fn count(&self) -> Result<usize, SourceError>;
}

/// In-process data source with sequential integer keys starting at 1.
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<u64, Fields>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Integer and numeric-string keys resolve; anything else does not.
    fn resolve_key(pk: &Value) -> Result<u64, SourceError> {
        match pk {
            Value::Number(n) => n.as_u64().ok_or(SourceError::NotFound),
            Value::String(s) => s.trim().parse().map_err(|_| SourceError::NotFound),
            _ => Err(SourceError::NotFound),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for MemoryStore {
    async fn create(&self, fields: Fields) -> Result<Record, SourceError> {
        let mut records = self.records.write().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        records.insert(id, fields.clone());
        trace!(pk = id, "Record created");
        Ok(Record::new(id, fields))
    }

    async fn get(&self, pk: &Value) -> Result<Record, SourceError> {
        let id = Self::resolve_key(pk)?;
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|fields| Record::new(id, fields.clone()))
            .ok_or(SourceError::NotFound)
    }

    async fn update(
        &self,
        pk: &Value,
        fields: Fields,
        partial: bool,
    ) -> Result<Record, SourceError> {
        let id = Self::resolve_key(pk)?;
        let mut records = self.records.write().await;
        let stored = records.get_mut(&id).ok_or(SourceError::NotFound)?;

        if partial {
            stored.extend(fields);
        } else {
            *stored = fields;
        }

        trace!(pk = id, partial, "Record updated");
        Ok(Record::new(id, stored.clone()))
    }

    async fn delete(&self, pk: &Value) -> Result<(), SourceError> {
        let id = Self::resolve_key(pk)?;
        let mut records = self.records.write().await;
        records.remove(&id).ok_or(SourceError::NotFound)?;
        trace!(pk = id, "Record deleted");
        Ok(())
    }

    async fn list(&self, page: u64, page_size: usize) -> Result<Vec<Record>, SourceError> {
        if page == 0 || page_size == 0 {
            return Ok(Vec::new());
        }

        let skip = usize::try_from(page - 1)
            .ok()
            .and_then(|p| p.checked_mul(page_size));
        let Some(skip) = skip else {
            return Ok(Vec::new());
        };

        let records = self.records.read().await;
        Ok(records
            .iter()
            .skip(skip)
            .take(page_size)
            .map(|(id, fields)| Record::new(*id, fields.clone()))
            .collect())
    }

    async fn count(&self) -> Result<usize, SourceError> {
        Ok(self.records.read().await.len())
    }
}
