//! Service façade over a [`Storage`] backend.
//!
//! [`Engine`] is what the HTTP layer holds. Every public method validates
//! its arguments, normalizes GUIDs, and maps storage failures onto
//! [`Error`]. Content uploads run the output, validation and edge update
//! steps in order before returning.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stategraph_storage::{
    ContentUpdate, EdgeRecord, Labels, LockInfo, NewState, OutputKeyRecord, SchemaSource,
    StateQuery, StateRecord, Storage,
};

use crate::deps::{self, AddDependency, AddedEdge};
use crate::error::{Error, Result};
use crate::graph::{self, DependencyGraph, Direction, Layer};
use crate::ident::{new_guid, normalize_guid, validate_logic_id};
use crate::job::{self, EdgeJobConfig, EdgeUpdateReport};
use crate::labels::{AllowAllLabels, LabelValidator};
use crate::now_rfc3339;
use crate::outputs::parse_state;
use crate::report::{self, StateStatus};
use crate::schema::{check_schema, infer_schema, JsonSchemaValidator, SchemaValidator};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Public base URL used to render Terraform backend addresses.
    pub base_url: String,
    pub edge_job: EdgeJobConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            edge_job: EdgeJobConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateState {
    /// Client-generated GUID; a fresh v7 UUID is used when absent.
    #[serde(default)]
    pub guid: Option<String>,
    pub logic_id: String,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListStates {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub logic_id_prefix: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePage {
    pub states: Vec<StateRecord>,
    pub next_page_token: Option<String>,
}

/// Addresses for a Terraform `backend "http"` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAddresses {
    pub address: String,
    pub lock_address: String,
    pub unlock_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateInfo {
    pub state: StateRecord,
    pub outputs: Vec<OutputKeyRecord>,
    pub incoming: Vec<EdgeRecord>,
    pub outgoing: Vec<EdgeRecord>,
    pub backend: BackendAddresses,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub state: StateRecord,
    pub producer_edges: EdgeUpdateReport,
    pub consumer_edges: EdgeUpdateReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSchema {
    pub key: String,
    pub schema_json: Option<String>,
    pub source: Option<SchemaSource>,
}

pub struct Engine<S: Storage> {
    store: Arc<S>,
    labels: Arc<dyn LabelValidator>,
    schemas: Arc<dyn SchemaValidator>,
    config: EngineConfig,
}

impl<S: Storage> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            labels: Arc::clone(&self.labels),
            schemas: Arc::clone(&self.schemas),
            config: self.config.clone(),
        }
    }
}

fn encode_page_token(guid: &str) -> String {
    URL_SAFE_NO_PAD.encode(guid.as_bytes())
}

fn decode_page_token(token: &str) -> Result<String> {
    let invalid = || Error::InvalidArgument(format!("invalid page_token '{token}'"));
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    String::from_utf8(bytes).map_err(|_| invalid())
}

impl<S: Storage> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            labels: Arc::new(AllowAllLabels),
            schemas: Arc::new(JsonSchemaValidator),
            config,
        }
    }

    pub fn with_label_validator(mut self, validator: Arc<dyn LabelValidator>) -> Self {
        self.labels = validator;
        self
    }

    pub fn with_schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schemas = validator;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_labels(&self, labels: &Labels) -> Result<()> {
        self.labels.validate(labels).map_err(Error::ValidationFailed)
    }

    // ── States ────────────────────────────────────────────────────────────────

    pub async fn create_state(&self, req: CreateState) -> Result<StateRecord> {
        let guid = match req.guid.as_deref() {
            Some(raw) => normalize_guid(raw)?,
            None => new_guid(),
        };
        validate_logic_id(&req.logic_id)?;
        self.check_labels(&req.labels)?;
        let state = self
            .store
            .create_state(NewState {
                guid,
                logic_id: req.logic_id,
                labels: req.labels,
                created_at: now_rfc3339(),
            })
            .await?;
        tracing::info!(guid = %state.guid, logic_id = %state.logic_id, "state created");
        Ok(state)
    }

    pub async fn get_state(&self, guid: &str) -> Result<StateRecord> {
        Ok(self.store.get_state(&normalize_guid(guid)?).await?)
    }

    pub async fn get_state_by_logic_id(&self, logic_id: &str) -> Result<StateRecord> {
        validate_logic_id(logic_id)?;
        Ok(self.store.get_state_by_logic_id(logic_id).await?)
    }

    pub fn backend_addresses(&self, guid: &str) -> BackendAddresses {
        let address = format!(
            "{}/tfstate/{guid}",
            self.config.base_url.trim_end_matches('/')
        );
        BackendAddresses {
            lock_address: format!("{address}/lock"),
            unlock_address: format!("{address}/unlock"),
            address,
        }
    }

    pub async fn get_state_info(&self, guid: &str) -> Result<StateInfo> {
        let guid = normalize_guid(guid)?;
        let (state, outputs) = self.store.get_state_with_outputs(&guid).await?;
        let incoming = self.store.list_edges_to(&guid).await?;
        let outgoing = self.store.list_edges_from(&guid).await?;
        Ok(StateInfo {
            backend: self.backend_addresses(&state.guid),
            state,
            outputs,
            incoming,
            outgoing,
        })
    }

    pub async fn list_states(&self, req: ListStates) -> Result<StatePage> {
        let page_size = match req.page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };
        let after_guid = req.page_token.as_deref().map(decode_page_token).transpose()?;
        let query = StateQuery {
            labels: req.labels,
            logic_id_prefix: req.logic_id_prefix.filter(|p| !p.is_empty()),
            after_guid,
            limit: page_size + 1,
        };
        let mut states = self.store.list_states(&query).await?;
        let next_page_token = if states.len() > page_size {
            states.truncate(page_size);
            states.last().map(|s| encode_page_token(&s.guid))
        } else {
            None
        };
        Ok(StatePage {
            states,
            next_page_token,
        })
    }

    /// Apply `removals`, then `adds`, validate the result and persist it.
    pub async fn update_labels(
        &self,
        guid: &str,
        adds: Labels,
        removals: Vec<String>,
    ) -> Result<StateRecord> {
        let guid = normalize_guid(guid)?;
        let mut labels = self.store.get_state(&guid).await?.labels;
        for key in &removals {
            labels.remove(key);
        }
        labels.extend(adds);
        self.check_labels(&labels)?;
        Ok(self.store.update_labels(&guid, labels, &now_rfc3339()).await?)
    }

    // ── Content ───────────────────────────────────────────────────────────────

    pub async fn get_content(&self, guid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get_content(&normalize_guid(guid)?).await?)
    }

    /// Store a new state document and bring every dependent edge up to date.
    ///
    /// The document is parsed before anything is written. Schema inference,
    /// validation and edge recomputation run after the commit and are
    /// advisory: their failures are logged, never returned.
    pub async fn update_content(
        &self,
        guid: &str,
        content: Vec<u8>,
        lock_id: Option<String>,
        expected_serial: Option<i64>,
    ) -> Result<UploadOutcome> {
        let guid = normalize_guid(guid)?;
        let parsed = parse_state(&content)?;
        let outputs = parsed.digests();
        let state = self
            .store
            .update_content(
                &guid,
                ContentUpdate {
                    content,
                    serial: parsed.serial,
                    lineage: parsed.lineage.clone(),
                    terraform_version: parsed.terraform_version.clone(),
                    outputs: outputs.clone(),
                    lock_id: lock_id.filter(|id| !id.is_empty()),
                    expected_serial,
                    updated_at: now_rfc3339(),
                },
            )
            .await?;
        tracing::info!(
            guid = %state.guid,
            serial = state.serial,
            size_bytes = state.size_bytes,
            outputs = parsed.outputs.len(),
            "state content updated"
        );

        if let Err(e) = self.refresh_validation(&guid, &parsed.values()).await {
            tracing::warn!(guid = %guid, error = %e, "output validation skipped");
        }
        let producer_edges = job::update_edges_for_producer(
            self.store.as_ref(),
            &guid,
            &outputs,
            &self.config.edge_job,
        )
        .await;
        let consumer_edges =
            job::update_edges_for_consumer(self.store.as_ref(), &guid, &self.config.edge_job).await;

        Ok(UploadOutcome {
            state,
            producer_edges,
            consumer_edges,
        })
    }

    /// Infer schemas for outputs that have none, then validate every output
    /// that has a schema and persist the results.
    async fn refresh_validation(&self, guid: &str, values: &BTreeMap<String, Value>) -> Result<()> {
        let mut schemas: BTreeMap<String, String> = BTreeMap::new();
        for row in self.store.list_outputs(guid).await? {
            if let Some(schema) = row.schema_json {
                schemas.insert(row.key, schema);
            }
        }
        for (key, value) in values {
            if schemas.contains_key(key) {
                continue;
            }
            let inferred = infer_schema(value).to_string();
            self.store
                .set_output_schema(guid, key, &inferred, SchemaSource::Inferred)
                .await?;
            schemas.insert(key.clone(), inferred);
        }

        let validated_at = now_rfc3339();
        for result in self.schemas.validate_outputs(&schemas, values) {
            self.store
                .record_validation(
                    guid,
                    &result.key,
                    result.status,
                    result.error.as_deref(),
                    &validated_at,
                )
                .await?;
        }
        Ok(())
    }

    // ── Locks ─────────────────────────────────────────────────────────────────

    pub async fn lock(&self, guid: &str, info: LockInfo) -> Result<()> {
        let guid = normalize_guid(guid)?;
        if info.id.is_empty() {
            return Err(Error::InvalidArgument("lock info must carry an ID".into()));
        }
        self.store.lock_state(&guid, &info).await?;
        tracing::info!(guid = %guid, lock_id = %info.id, who = %info.who, "state locked");
        Ok(())
    }

    pub async fn unlock(&self, guid: &str, lock_id: &str) -> Result<()> {
        let guid = normalize_guid(guid)?;
        self.store.unlock_state(&guid, lock_id).await?;
        tracing::info!(guid = %guid, lock_id, "state unlocked");
        Ok(())
    }

    // ── Dependencies ──────────────────────────────────────────────────────────

    pub async fn add_dependency(&self, req: AddDependency) -> Result<AddedEdge> {
        deps::add_dependency(self.store.as_ref(), req).await
    }

    pub async fn remove_dependency(&self, edge_id: i64) -> Result<()> {
        deps::remove_dependency(self.store.as_ref(), edge_id).await
    }

    pub async fn list_dependencies(&self, consumer_guid: &str) -> Result<Vec<EdgeRecord>> {
        deps::list_dependencies(self.store.as_ref(), consumer_guid).await
    }

    pub async fn list_dependents(&self, producer_guid: &str) -> Result<Vec<EdgeRecord>> {
        deps::list_dependents(self.store.as_ref(), producer_guid).await
    }

    // ── Graph ─────────────────────────────────────────────────────────────────

    pub async fn topological_order(&self, guid: &str, direction: Direction) -> Result<Vec<Layer>> {
        graph::topological_order(self.store.as_ref(), &normalize_guid(guid)?, direction).await
    }

    pub async fn dependency_graph(&self, consumer_guid: &str) -> Result<DependencyGraph> {
        graph::dependency_graph(self.store.as_ref(), &normalize_guid(consumer_guid)?).await
    }

    pub async fn state_status(&self, guid: &str) -> Result<StateStatus> {
        report::state_status(self.store.as_ref(), &normalize_guid(guid)?).await
    }

    // ── Outputs ───────────────────────────────────────────────────────────────

    pub async fn list_outputs(&self, guid: &str) -> Result<Vec<OutputKeyRecord>> {
        let guid = normalize_guid(guid)?;
        self.store.get_state(&guid).await?;
        Ok(self.store.list_outputs(&guid).await?)
    }

    /// Attach a manual schema. When the producer currently publishes the
    /// output, its value is validated right away and outgoing edges are
    /// recomputed against the new result.
    pub async fn set_output_schema(
        &self,
        guid: &str,
        key: &str,
        schema_json: &str,
    ) -> Result<OutputKeyRecord> {
        let guid = normalize_guid(guid)?;
        if key.trim().is_empty() {
            return Err(Error::InvalidArgument("output key must not be empty".into()));
        }
        check_schema(schema_json).map_err(Error::InvalidArgument)?;
        let state = self.store.get_state(&guid).await?;
        let row = self
            .store
            .set_output_schema(&guid, key, schema_json, SchemaSource::Manual)
            .await?;
        if !(state.has_content() && row.is_present()) {
            return Ok(row);
        }

        let Some(content) = self.store.get_content(&guid).await? else {
            return Ok(row);
        };
        let parsed = parse_state(&content)?;
        let values = parsed.values();
        let schemas = BTreeMap::from([(key.to_string(), schema_json.to_string())]);
        let validated_at = now_rfc3339();
        for result in self.schemas.validate_outputs(&schemas, &values) {
            self.store
                .record_validation(
                    &guid,
                    &result.key,
                    result.status,
                    result.error.as_deref(),
                    &validated_at,
                )
                .await?;
        }
        job::update_edges_for_producer(
            self.store.as_ref(),
            &guid,
            &parsed.digests(),
            &self.config.edge_job,
        )
        .await;

        self.store
            .list_outputs(&guid)
            .await?
            .into_iter()
            .find(|o| o.key == key)
            .ok_or_else(|| Error::NotFound(format!("output '{key}' of state {guid}")))
    }

    pub async fn get_output_schema(&self, guid: &str, key: &str) -> Result<OutputSchema> {
        self.list_outputs(guid)
            .await?
            .into_iter()
            .find(|o| o.key == key)
            .map(|o| OutputSchema {
                key: o.key,
                schema_json: o.schema_json,
                source: o.schema_source,
            })
            .ok_or_else(|| Error::NotFound(format!("output '{key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_tokens_round_trip_and_reject_garbage() {
        let guid = "0190a1b2-0000-7000-8000-000000000001";
        assert_eq!(decode_page_token(&encode_page_token(guid)).unwrap(), guid);
        assert_eq!(decode_page_token("!!!").unwrap_err().kind(), "invalid_argument");
    }

    #[test]
    fn backend_addresses_trim_trailing_slash() {
        let engine = Engine::new(
            Arc::new(stategraph_storage::MemoryStore::new()),
            EngineConfig {
                base_url: "https://sg.example.com/".into(),
                ..Default::default()
            },
        );
        let a = engine.backend_addresses("abc");
        assert_eq!(a.address, "https://sg.example.com/tfstate/abc");
        assert_eq!(a.lock_address, "https://sg.example.com/tfstate/abc/lock");
        assert_eq!(a.unlock_address, "https://sg.example.com/tfstate/abc/unlock");
    }
}
