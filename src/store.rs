//! The record store seam.
//!
//! The pipeline never mutates a record itself. It reads marker fields
//! through `RecordStore::load` and asks the store to apply human decisions
//! through `RecordStore::apply`.

use crate::errors::StoreError;
use crate::record::{Decision, Marker, Markers, Record, RecordId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// An update requested by the gate resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub id: RecordId,
    pub decision: Decision,
}

/// Abstraction over the catalog's record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read the current state of `ids`. Unknown ids are an error.
    async fn load(&self, ids: &[RecordId]) -> Result<Vec<Record>, StoreError>;

    /// Apply human decisions to the affected records.
    async fn apply(&self, updates: &[RecordUpdate]) -> Result<(), StoreError>;
}

/// In-process record store.
///
/// Decisions map onto markers: a chosen candidate sets the candidate marker
/// (and records the id in the payload), an approval sets the approval
/// marker, a rejection changes nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn insert(&self, record: Record) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().await.get(id).cloned()
    }

    /// Set one marker on a record.
    pub async fn set_marker(&self, id: &RecordId, marker: Marker) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.markers.set(marker, true);
        Ok(())
    }

    pub async fn set_markers(&self, id: &RecordId, markers: Markers) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.markers = markers;
        Ok(())
    }

    /// All records, ordered by id.
    pub async fn snapshot(&self) -> Vec<Record> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<RecordId> {
        self.records.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, ids: &[RecordId]) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read().await;
        ids.iter()
            .map(|id| {
                records
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(id.clone()))
            })
            .collect()
    }

    async fn apply(&self, updates: &[RecordUpdate]) -> Result<(), StoreError> {
        let mut records = self.records.write().await;

        // validate first so a bad id leaves every record untouched
        if let Some(missing) = updates.iter().find(|u| !records.contains_key(&u.id)) {
            return Err(StoreError::NotFound(missing.id.clone()));
        }

        for update in updates {
            let Some(record) = records.get_mut(&update.id) else {
                continue;
            };
            match &update.decision {
                Decision::CandidateChosen { candidate_id } => {
                    record.markers.set(Marker::ChosenCandidate, true);
                    if !record.payload.is_object() {
                        record.payload = serde_json::json!({});
                    }
                    record.payload["chosen_candidate"] =
                        serde_json::Value::String(candidate_id.clone());
                }
                Decision::Approved => record.markers.set(Marker::Approval, true),
                Decision::Rejected { .. } => {}
            }
        }
        Ok(())
    }
}
