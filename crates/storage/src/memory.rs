//! Deterministic in-memory backend.
//!
//! Every operation takes the single store-wide mutex for its whole duration,
//! which makes each call trivially atomic. Used by engine tests and as the
//! reference behaviour for the conformance suite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::record::{
    ContentUpdate, EdgeRecord, EdgeUpdate, Labels, LockInfo, NewEdge, NewState, OutputKeyRecord,
    SchemaSource, StateQuery, StateRecord, ValidationStatus,
};
use crate::traits::{EdgeStore, StateStore};

#[derive(Default)]
struct Inner {
    states: BTreeMap<String, StateRecord>,
    content: BTreeMap<String, Vec<u8>>,
    /// Keyed by (state guid, output key).
    outputs: BTreeMap<(String, String), OutputKeyRecord>,
    edges: BTreeMap<i64, EdgeRecord>,
    next_edge_id: i64,
}

impl Inner {
    fn state_mut(&mut self, guid: &str) -> Result<&mut StateRecord, StorageError> {
        self.states
            .get_mut(guid)
            .ok_or_else(|| StorageError::StateNotFound {
                guid: guid.to_string(),
            })
    }
}

/// In-memory `StateStore` + `EdgeStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_state(&self, state: NewState) -> Result<StateRecord, StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.states.contains_key(&state.guid) {
            return Err(StorageError::AlreadyExists {
                field: "guid".to_string(),
                value: state.guid,
            });
        }
        if inner.states.values().any(|s| s.logic_id == state.logic_id) {
            return Err(StorageError::AlreadyExists {
                field: "logic_id".to_string(),
                value: state.logic_id,
            });
        }
        let record = StateRecord {
            guid: state.guid.clone(),
            logic_id: state.logic_id,
            serial: 0,
            lineage: None,
            terraform_version: None,
            size_bytes: 0,
            labels: state.labels,
            lock: None,
            created_at: state.created_at.clone(),
            updated_at: state.created_at,
        };
        inner.states.insert(state.guid, record.clone());
        Ok(record)
    }

    async fn get_state(&self, guid: &str) -> Result<StateRecord, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .states
            .get(guid)
            .cloned()
            .ok_or_else(|| StorageError::StateNotFound {
                guid: guid.to_string(),
            })
    }

    async fn get_state_by_logic_id(&self, logic_id: &str) -> Result<StateRecord, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .states
            .values()
            .find(|s| s.logic_id == logic_id)
            .cloned()
            .ok_or_else(|| StorageError::LogicIdNotFound {
                logic_id: logic_id.to_string(),
            })
    }

    async fn list_states(&self, query: &StateQuery) -> Result<Vec<StateRecord>, StorageError> {
        let inner = self.inner.lock().await;
        let iter = inner
            .states
            .values()
            .filter(|s| match &query.after_guid {
                Some(after) => s.guid.as_str() > after.as_str(),
                None => true,
            })
            .filter(|s| query.matches(s))
            .cloned();
        Ok(if query.limit == 0 {
            iter.collect()
        } else {
            iter.take(query.limit).collect()
        })
    }

    async fn get_content(&self, guid: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().await;
        if !inner.states.contains_key(guid) {
            return Err(StorageError::StateNotFound {
                guid: guid.to_string(),
            });
        }
        Ok(inner.content.get(guid).cloned())
    }

    async fn update_content(
        &self,
        guid: &str,
        update: ContentUpdate,
    ) -> Result<StateRecord, StorageError> {
        let mut inner = self.inner.lock().await;

        // Validate everything before touching any row.
        let current = inner.state_mut(guid)?.clone();
        if let Some(held) = &current.lock {
            if update.lock_id.as_deref() != Some(held.id.as_str()) {
                return Err(StorageError::LockMismatch {
                    guid: guid.to_string(),
                    held: Some(held.clone()),
                });
            }
        }
        if let Some(expected) = update.expected_serial {
            if expected != current.serial {
                return Err(StorageError::SerialConflict {
                    expected,
                    actual: current.serial,
                });
            }
        }
        if update.serial < current.serial {
            return Err(StorageError::SerialRegression {
                current: current.serial,
                attempted: update.serial,
            });
        }

        let size = i64::try_from(update.content.len())
            .map_err(|_| StorageError::Backend("content too large".to_string()))?;

        let existing: Vec<OutputKeyRecord> = inner
            .outputs
            .range((guid.to_string(), String::new())..)
            .take_while(|((g, _), _)| g == guid)
            .map(|(_, rec)| rec.clone())
            .collect();
        for rec in existing {
            if update.outputs.iter().any(|o| o.key == rec.key) {
                continue;
            }
            let k = (guid.to_string(), rec.key.clone());
            if rec.schema_source == Some(SchemaSource::Manual) {
                if let Some(row) = inner.outputs.get_mut(&k) {
                    row.digest = None;
                    row.sensitive = false;
                    row.validation_status = ValidationStatus::NotValidated;
                    row.validation_error = None;
                }
            } else {
                inner.outputs.remove(&k);
            }
        }
        for out in &update.outputs {
            let k = (guid.to_string(), out.key.clone());
            let row = inner.outputs.entry(k).or_insert_with(|| OutputKeyRecord {
                state_guid: guid.to_string(),
                key: out.key.clone(),
                digest: None,
                sensitive: false,
                schema_json: None,
                schema_source: None,
                validation_status: ValidationStatus::NotValidated,
                validation_error: None,
                validated_at: None,
            });
            if row.digest.as_deref() != Some(out.digest.as_str()) {
                row.validation_status = ValidationStatus::NotValidated;
                row.validation_error = None;
            }
            row.digest = Some(out.digest.clone());
            row.sensitive = out.sensitive;
        }

        inner.content.insert(guid.to_string(), update.content);
        let state = inner.state_mut(guid)?;
        state.serial = update.serial;
        state.lineage = update.lineage;
        state.terraform_version = update.terraform_version;
        state.size_bytes = size;
        state.updated_at = update.updated_at;
        Ok(state.clone())
    }

    async fn update_labels(
        &self,
        guid: &str,
        labels: Labels,
        updated_at: &str,
    ) -> Result<StateRecord, StorageError> {
        let mut inner = self.inner.lock().await;
        let state = inner.state_mut(guid)?;
        state.labels = labels;
        state.updated_at = updated_at.to_string();
        Ok(state.clone())
    }

    async fn lock_state(&self, guid: &str, lock: &LockInfo) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let state = inner.state_mut(guid)?;
        if let Some(existing) = &state.lock {
            return Err(StorageError::LockConflict {
                existing: existing.clone(),
            });
        }
        state.lock = Some(lock.clone());
        Ok(())
    }

    async fn unlock_state(&self, guid: &str, lock_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let state = inner.state_mut(guid)?;
        match &state.lock {
            Some(held) if held.id == lock_id => {
                state.lock = None;
                Ok(())
            }
            held => Err(StorageError::LockMismatch {
                guid: guid.to_string(),
                held: held.clone(),
            }),
        }
    }

    async fn list_outputs(&self, guid: &str) -> Result<Vec<OutputKeyRecord>, StorageError> {
        let inner = self.inner.lock().await;
        if !inner.states.contains_key(guid) {
            return Err(StorageError::StateNotFound {
                guid: guid.to_string(),
            });
        }
        Ok(inner
            .outputs
            .range((guid.to_string(), String::new())..)
            .take_while(|((g, _), _)| g == guid)
            .map(|(_, rec)| rec.clone())
            .collect())
    }

    async fn get_state_with_outputs(
        &self,
        guid: &str,
    ) -> Result<(StateRecord, Vec<OutputKeyRecord>), StorageError> {
        let inner = self.inner.lock().await;
        let state = inner
            .states
            .get(guid)
            .cloned()
            .ok_or_else(|| StorageError::StateNotFound {
                guid: guid.to_string(),
            })?;
        let outputs = inner
            .outputs
            .range((guid.to_string(), String::new())..)
            .take_while(|((g, _), _)| g == guid)
            .map(|(_, rec)| rec.clone())
            .collect();
        Ok((state, outputs))
    }

    async fn set_output_schema(
        &self,
        guid: &str,
        key: &str,
        schema_json: &str,
        source: SchemaSource,
    ) -> Result<OutputKeyRecord, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.state_mut(guid)?;
        let row = inner
            .outputs
            .entry((guid.to_string(), key.to_string()))
            .or_insert_with(|| OutputKeyRecord {
                state_guid: guid.to_string(),
                key: key.to_string(),
                digest: None,
                sensitive: false,
                schema_json: None,
                schema_source: None,
                validation_status: ValidationStatus::NotValidated,
                validation_error: None,
                validated_at: None,
            });
        row.schema_json = Some(schema_json.to_string());
        row.schema_source = Some(source);
        row.validation_status = ValidationStatus::NotValidated;
        row.validation_error = None;
        Ok(row.clone())
    }

    async fn record_validation(
        &self,
        guid: &str,
        key: &str,
        status: ValidationStatus,
        error: Option<&str>,
        validated_at: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.outputs.get_mut(&(guid.to_string(), key.to_string())) {
            row.validation_status = status;
            row.validation_error = error.map(str::to_string);
            row.validated_at = Some(validated_at.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl EdgeStore for MemoryStore {
    async fn insert_edge(&self, edge: NewEdge) -> Result<(EdgeRecord, bool), StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.edges.values().find(|e| e.same_identity(&edge)) {
            return Ok((existing.clone(), false));
        }
        inner.next_edge_id += 1;
        let id = inner.next_edge_id;
        let record = EdgeRecord {
            id,
            from_guid: edge.from_guid,
            from_output: edge.from_output,
            to_guid: edge.to_guid,
            to_input_name: edge.to_input_name,
            status: edge.status,
            in_digest: None,
            last_out_at: edge.out_digest.as_ref().map(|_| edge.created_at.clone()),
            out_digest: edge.out_digest,
            mock_value_json: edge.mock_value_json,
            last_in_at: None,
            created_at: edge.created_at.clone(),
            updated_at: edge.created_at,
        };
        inner.edges.insert(id, record.clone());
        Ok((record, true))
    }

    async fn get_edge(&self, id: i64) -> Result<EdgeRecord, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .edges
            .get(&id)
            .cloned()
            .ok_or(StorageError::EdgeNotFound { id })
    }

    async fn delete_edge(&self, id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .edges
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::EdgeNotFound { id })
    }

    async fn list_edges_from(&self, producer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .edges
            .values()
            .filter(|e| e.from_guid == producer_guid)
            .cloned()
            .collect())
    }

    async fn list_edges_to(&self, consumer_guid: &str) -> Result<Vec<EdgeRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .edges
            .values()
            .filter(|e| e.to_guid == consumer_guid)
            .cloned()
            .collect())
    }

    async fn update_edge(&self, id: i64, update: EdgeUpdate) -> Result<EdgeRecord, StorageError> {
        let mut inner = self.inner.lock().await;
        let edge = inner
            .edges
            .get_mut(&id)
            .ok_or(StorageError::EdgeNotFound { id })?;
        edge.status = update.status;
        edge.in_digest = update.in_digest;
        edge.out_digest = update.out_digest;
        edge.last_in_at = update.last_in_at;
        edge.last_out_at = update.last_out_at;
        edge.updated_at = update.updated_at;
        Ok(edge.clone())
    }
}
