use super::{RecordStore, StoreError};
use crate::record::{FieldPatch, RawRecord, RecordId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// In-process store with the same partial-update and delete semantics as the Postgres
/// table. Faults can be switched on to exercise the recoverable error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<RawRecord>>,
    unavailable: AtomicBool,
    fail_deletes: AtomicBool,
    update_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: RecordId, created_at: Option<DateTime<Utc>>, doc: Value) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.push(RawRecord {
                id,
                created_at,
                doc,
                data_quality: None,
            });
        }
    }

    pub fn get(&self, id: RecordId) -> Option<RawRecord> {
        self.rows
            .lock()
            .ok()?
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    fn rows(&self) -> Result<MutexGuard<'_, Vec<RawRecord>>, StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

fn project(doc: &Value, keys: &[&str]) -> Value {
    match doc {
        Value::Object(map) => {
            let projected: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| keys.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(projected)
        }
        other => other.clone(),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_recent(&self, keys: &[&str], limit: usize) -> Result<Vec<RawRecord>, StoreError> {
        let rows = self.rows()?;
        let mut ordered: Vec<&RawRecord> = rows.iter().collect();
        // created_at DESC NULLS LAST; stable so insertion order breaks ties.
        ordered.sort_by(|a, b| match (a.created_at, b.created_at) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(ordered
            .into_iter()
            .take(limit)
            .map(|row| RawRecord {
                doc: project(&row.doc, keys),
                ..row.clone()
            })
            .collect())
    }

    async fn update_fields(&self, id: RecordId, patch: &FieldPatch) -> Result<u64, StoreError> {
        let mut rows = self.rows()?;
        self.update_calls.fetch_add(1, Ordering::Relaxed);
        let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
            return Ok(0);
        };
        if !row.doc.is_object() {
            row.doc = Value::Object(Map::new());
        }
        if let Value::Object(doc) = &mut row.doc {
            doc.extend(patch.document());
        }
        if let Some(quality) = &patch.data_quality {
            row.data_quality = Some(quality.clone());
        }
        Ok(1)
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        let mut rows = self.rows()?;
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(StoreError::Query("injected delete failure".to_string()));
        }
        let before = rows.len();
        rows.retain(|row| !ids.contains(&row.id));
        Ok((before - rows.len()) as u64)
    }
}
