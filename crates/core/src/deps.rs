//! Dependency edge management.

use serde::{Deserialize, Serialize};
use stategraph_storage::{EdgeRecord, NewEdge, Storage};

use crate::error::{Error, Result};
use crate::graph::{reaches, Direction};
use crate::ident::{normalize_guid, sanitize_input_name};
use crate::job::ProducerSnapshot;
use crate::now_rfc3339;
use crate::status::{compute_status, EdgeInputs};

/// Request to declare that `to_guid` consumes `from_output` of `from_guid`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddDependency {
    pub from_guid: String,
    pub from_output: String,
    pub to_guid: String,
    /// Defaults to the sanitized output name.
    #[serde(default)]
    pub to_input_name: Option<String>,
    /// JSON text used in place of the output until the producer has content.
    #[serde(default)]
    pub mock_value_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedEdge {
    pub edge: EdgeRecord,
    /// True when the identical edge already existed and was returned as is.
    pub already_exists: bool,
}

pub async fn add_dependency<S: Storage>(store: &S, req: AddDependency) -> Result<AddedEdge> {
    let from_guid = normalize_guid(&req.from_guid)?;
    let to_guid = normalize_guid(&req.to_guid)?;
    let from_output = req.from_output.trim();
    if from_output.is_empty() {
        return Err(Error::InvalidArgument("from_output must not be empty".into()));
    }
    let to_input_name = match req.to_input_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => sanitize_input_name(from_output),
    };
    if let Some(mock) = &req.mock_value_json {
        serde_json::from_str::<serde_json::Value>(mock)
            .map_err(|e| Error::InvalidArgument(format!("mock_value_json is not valid JSON: {e}")))?;
    }
    if from_guid == to_guid {
        return Err(Error::InvalidArgument(
            "a state cannot depend on its own outputs".into(),
        ));
    }

    store.get_state(&from_guid).await?;
    store.get_state(&to_guid).await?;

    if let Some(existing) = store
        .list_edges_to(&to_guid)
        .await?
        .into_iter()
        .find(|e| {
            e.from_guid == from_guid && e.from_output == from_output && e.to_input_name == to_input_name
        })
    {
        return Ok(AddedEdge {
            edge: existing,
            already_exists: true,
        });
    }

    // from -> to closes a cycle iff from is already downstream of to.
    if reaches(store, &to_guid, &from_guid, Direction::Downstream).await? {
        return Err(Error::InvalidArgument(format!(
            "dependency {from_guid} -> {to_guid} would create a cycle"
        )));
    }

    let producer = ProducerSnapshot::load(store, &from_guid).await?;
    let output = producer.output(from_output);
    let status = compute_status(&EdgeInputs {
        producer: output,
        in_digest: None,
        has_mock: req.mock_value_json.is_some(),
    });

    let (edge, created) = store
        .insert_edge(NewEdge {
            from_guid,
            from_output: from_output.to_string(),
            to_guid,
            to_input_name,
            mock_value_json: req.mock_value_json,
            status,
            out_digest: output.digest().map(str::to_string),
            created_at: now_rfc3339(),
        })
        .await?;
    if created {
        tracing::info!(
            edge_id = edge.id,
            from = %edge.from_guid,
            output = %edge.from_output,
            to = %edge.to_guid,
            status = %edge.status,
            "dependency added"
        );
    }
    Ok(AddedEdge {
        edge,
        already_exists: !created,
    })
}

pub async fn remove_dependency<S: Storage>(store: &S, edge_id: i64) -> Result<()> {
    store.delete_edge(edge_id).await?;
    tracing::info!(edge_id, "dependency removed");
    Ok(())
}

/// Incoming edges of a consumer.
pub async fn list_dependencies<S: Storage>(store: &S, consumer_guid: &str) -> Result<Vec<EdgeRecord>> {
    let guid = normalize_guid(consumer_guid)?;
    store.get_state(&guid).await?;
    Ok(store.list_edges_to(&guid).await?)
}

/// Outgoing edges of a producer.
pub async fn list_dependents<S: Storage>(store: &S, producer_guid: &str) -> Result<Vec<EdgeRecord>> {
    let guid = normalize_guid(producer_guid)?;
    store.get_state(&guid).await?;
    Ok(store.list_edges_from(&guid).await?)
}
