//! Edge status recomputation after a content upload.
//!
//! Both entry points run inline in the upload request, bounded by their own
//! deadline. Failures are logged and counted in the returned report; they
//! never surface as request errors since the content write has already
//! committed by the time these run.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use stategraph_storage::{
    EdgeRecord, EdgeUpdate, OutputDigest, OutputKeyRecord, Storage, StorageError, ValidationStatus,
};
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};
use crate::now_rfc3339;
use crate::status::{compute_status, EdgeInputs, ProducerOutput};

pub const DEFAULT_EDGE_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeJobConfig {
    pub timeout: Duration,
}

impl Default for EdgeJobConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EDGE_UPDATE_TIMEOUT,
        }
    }
}

/// What one job run did to the edges it looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeUpdateReport {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Edges not examined because the deadline passed.
    pub skipped: usize,
    pub timed_out: bool,
}

/// A producer's content flag and output rows, read once per job run.
#[derive(Debug, Clone, Default)]
pub struct ProducerSnapshot {
    pub has_content: bool,
    pub outputs: BTreeMap<String, OutputKeyRecord>,
}

impl ProducerSnapshot {
    /// A producer that no longer exists looks like one without content.
    pub async fn load<S: Storage>(store: &S, guid: &str) -> Result<Self> {
        let (state, outputs) = match store.get_state_with_outputs(guid).await {
            Ok(snapshot) => snapshot,
            Err(StorageError::StateNotFound { .. }) => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            has_content: state.has_content(),
            outputs: outputs.into_iter().map(|o| (o.key.clone(), o)).collect(),
        })
    }

    /// Replace the stored digests with the ones `published` by an upload.
    /// Validation bookkeeping is kept from the stored rows; outputs the
    /// upload does not carry read as missing.
    pub fn with_published(mut self, guid: &str, published: &[OutputDigest]) -> Self {
        let outputs = published
            .iter()
            .map(|out| {
                let mut row = self.outputs.remove(&out.key).unwrap_or_else(|| OutputKeyRecord {
                    state_guid: guid.to_string(),
                    key: out.key.clone(),
                    digest: None,
                    sensitive: out.sensitive,
                    schema_json: None,
                    schema_source: None,
                    validation_status: ValidationStatus::NotValidated,
                    validation_error: None,
                    validated_at: None,
                });
                row.digest = Some(out.digest.clone());
                row.sensitive = out.sensitive;
                (out.key.clone(), row)
            })
            .collect();
        Self {
            has_content: true,
            outputs,
        }
    }

    pub fn output(&self, key: &str) -> ProducerOutput<'_> {
        ProducerOutput::from_row(self.has_content, self.outputs.get(key))
    }
}

/// `None` once the deadline has passed.
async fn before<T>(deadline: Instant, fut: impl Future<Output = Result<T>>) -> Option<Result<T>> {
    timeout_at(deadline, fut).await.ok()
}

enum Outcome {
    Written,
    Unchanged,
}

async fn persist<S: Storage>(
    store: &S,
    edge: &EdgeRecord,
    mut update: EdgeUpdate,
    now: &str,
    deadline: Instant,
) -> Option<Result<Outcome>> {
    if update == EdgeUpdate::from_edge(edge) {
        return Some(Ok(Outcome::Unchanged));
    }
    update.updated_at = now.to_string();
    let write = async {
        store.update_edge(edge.id, update).await?;
        Ok::<_, Error>(Outcome::Written)
    };
    before(deadline, write).await
}

fn tally(report: &mut EdgeUpdateReport, edge: &EdgeRecord, result: Result<Outcome>) {
    match result {
        Ok(Outcome::Written) => report.updated += 1,
        Ok(Outcome::Unchanged) => report.unchanged += 1,
        Err(e) => {
            tracing::warn!(edge_id = edge.id, error = %e, "edge status update failed");
            report.failed += 1;
        }
    }
}

fn timed_out(report: &mut EdgeUpdateReport, guid: &str, remaining: usize) {
    report.timed_out = true;
    report.skipped = remaining;
    tracing::warn!(state = guid, skipped = remaining, "edge update deadline exceeded");
}

/// Recompute every outgoing edge of `producer_guid` from the outputs the
/// producer just `published`.
///
/// `out_digest` follows the published digests even if a later upload has
/// already replaced them in the store; that upload runs its own job.
/// `in_digest` is left alone, so an edge whose output changed turns dirty
/// until the consumer uploads again.
pub async fn update_edges_for_producer<S: Storage>(
    store: &S,
    producer_guid: &str,
    published: &[OutputDigest],
    config: &EdgeJobConfig,
) -> EdgeUpdateReport {
    let deadline = Instant::now() + config.timeout;
    let mut report = EdgeUpdateReport::default();
    let now = now_rfc3339();

    let loaded = before(deadline, async {
        let edges = store.list_edges_from(producer_guid).await?;
        let snapshot = ProducerSnapshot::load(store, producer_guid)
            .await?
            .with_published(producer_guid, published);
        Ok::<_, Error>((edges, snapshot))
    })
    .await;
    let (edges, snapshot) = match loaded {
        Some(Ok(loaded)) => loaded,
        Some(Err(e)) => {
            tracing::warn!(state = producer_guid, error = %e, "could not load producer edges");
            report.failed = 1;
            return report;
        }
        None => {
            timed_out(&mut report, producer_guid, 0);
            return report;
        }
    };

    for (i, edge) in edges.iter().enumerate() {
        if Instant::now() >= deadline {
            timed_out(&mut report, producer_guid, edges.len() - i);
            break;
        }
        let producer = snapshot.output(&edge.from_output);
        let mut update = EdgeUpdate::from_edge(edge);
        update.out_digest = producer.digest().map(str::to_string);
        if update.out_digest != edge.out_digest {
            update.last_out_at = Some(now.clone());
        }
        update.status = compute_status(&EdgeInputs {
            producer,
            in_digest: edge.in_digest.as_deref(),
            has_mock: edge.mock_value_json.is_some(),
        });
        match persist(store, edge, update, &now, deadline).await {
            Some(result) => tally(&mut report, edge, result),
            None => {
                timed_out(&mut report, producer_guid, edges.len() - i);
                break;
            }
        }
    }

    tracing::debug!(
        state = producer_guid,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        skipped = report.skipped,
        "producer edge update finished"
    );
    report
}

/// Recompute every incoming edge of `consumer_guid` after the consumer
/// uploaded. Edges whose producer currently publishes the output record
/// that digest as observed, which makes them clean.
pub async fn update_edges_for_consumer<S: Storage>(
    store: &S,
    consumer_guid: &str,
    config: &EdgeJobConfig,
) -> EdgeUpdateReport {
    let deadline = Instant::now() + config.timeout;
    let mut report = EdgeUpdateReport::default();
    let now = now_rfc3339();

    let listed = before(deadline, async {
        Ok::<_, Error>(store.list_edges_to(consumer_guid).await?)
    })
    .await;
    let edges = match listed {
        Some(Ok(edges)) => edges,
        Some(Err(e)) => {
            tracing::warn!(state = consumer_guid, error = %e, "could not load consumer edges");
            report.failed = 1;
            return report;
        }
        None => {
            timed_out(&mut report, consumer_guid, 0);
            return report;
        }
    };

    let mut producers: HashMap<String, ProducerSnapshot> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        if Instant::now() >= deadline {
            timed_out(&mut report, consumer_guid, edges.len() - i);
            break;
        }
        if !producers.contains_key(&edge.from_guid) {
            match before(deadline, ProducerSnapshot::load(store, &edge.from_guid)).await {
                Some(Ok(snapshot)) => {
                    producers.insert(edge.from_guid.clone(), snapshot);
                }
                Some(Err(e)) => {
                    tally(&mut report, edge, Err(e));
                    continue;
                }
                None => {
                    timed_out(&mut report, consumer_guid, edges.len() - i);
                    break;
                }
            }
        }
        let Some(snapshot) = producers.get(&edge.from_guid) else {
            continue;
        };

        let producer = snapshot.output(&edge.from_output);
        let mut update = EdgeUpdate::from_edge(edge);
        if let Some(digest) = producer.digest() {
            if edge.in_digest.as_deref() != Some(digest) {
                update.in_digest = Some(digest.to_string());
                update.last_in_at = Some(now.clone());
            }
            if edge.out_digest.as_deref() != Some(digest) {
                update.out_digest = Some(digest.to_string());
                update.last_out_at = Some(now.clone());
            }
        }
        update.status = compute_status(&EdgeInputs {
            producer,
            in_digest: update.in_digest.as_deref(),
            has_mock: edge.mock_value_json.is_some(),
        });
        match persist(store, edge, update, &now, deadline).await {
            Some(result) => tally(&mut report, edge, result),
            None => {
                timed_out(&mut report, consumer_guid, edges.len() - i);
                break;
            }
        }
    }

    tracing::debug!(
        state = consumer_guid,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        skipped = report.skipped,
        "consumer edge update finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use stategraph_storage::{
        ContentUpdate, EdgeStatus, EdgeStore, Labels, MemoryStore, NewEdge, NewState, OutputDigest,
        StateStore,
    };

    async fn state(store: &MemoryStore, guid: &str) {
        store
            .create_state(NewState {
                guid: guid.into(),
                logic_id: guid.into(),
                labels: Labels::new(),
                created_at: "t0".into(),
            })
            .await
            .unwrap();
    }

    fn published(outputs: &[(&str, &str)]) -> Vec<OutputDigest> {
        outputs
            .iter()
            .map(|(k, d)| OutputDigest {
                key: k.to_string(),
                digest: d.to_string(),
                sensitive: false,
            })
            .collect()
    }

    async fn upload(
        store: &MemoryStore,
        guid: &str,
        serial: i64,
        outputs: &[(&str, &str)],
    ) -> Vec<OutputDigest> {
        let outputs = published(outputs);
        store
            .update_content(
                guid,
                ContentUpdate {
                    content: format!("{{\"serial\":{serial}}}").into_bytes(),
                    serial,
                    lineage: None,
                    terraform_version: None,
                    outputs: outputs.clone(),
                    lock_id: None,
                    expected_serial: None,
                    updated_at: "t1".into(),
                },
            )
            .await
            .unwrap();
        outputs
    }

    async fn edge(store: &MemoryStore, from: &str, output: &str, to: &str, mock: bool) -> i64 {
        let (edge, _) = store
            .insert_edge(NewEdge {
                from_guid: from.into(),
                from_output: output.into(),
                to_guid: to.into(),
                to_input_name: output.into(),
                mock_value_json: mock.then(|| "\"placeholder\"".to_string()),
                status: EdgeStatus::Pending,
                out_digest: None,
                created_at: "t0".into(),
            })
            .await
            .unwrap();
        edge.id
    }

    #[tokio::test]
    async fn producer_upload_dirties_then_consumer_upload_cleans() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        state(&store, "app").await;
        let id = edge(&store, "net", "vpc_id", "app", false).await;

        let net = upload(&store, "net", 1, &[("vpc_id", "d1")]).await;
        let report =
            update_edges_for_producer(&store, "net", &net, &EdgeJobConfig::default()).await;
        assert_eq!(report.updated, 1);
        let e = store.get_edge(id).await.unwrap();
        assert_eq!(e.status, EdgeStatus::Dirty);
        assert_eq!(e.out_digest.as_deref(), Some("d1"));
        assert!(e.last_out_at.is_some());
        assert!(e.in_digest.is_none());

        upload(&store, "app", 1, &[]).await;
        let report = update_edges_for_consumer(&store, "app", &EdgeJobConfig::default()).await;
        assert_eq!(report.updated, 1);
        let e = store.get_edge(id).await.unwrap();
        assert_eq!(e.status, EdgeStatus::Clean);
        assert_eq!(e.in_digest.as_deref(), Some("d1"));
        assert!(e.last_in_at.is_some());
    }

    #[tokio::test]
    async fn rerun_without_changes_writes_nothing() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        state(&store, "app").await;
        edge(&store, "net", "vpc_id", "app", false).await;
        let net = upload(&store, "net", 1, &[("vpc_id", "d1")]).await;

        update_edges_for_producer(&store, "net", &net, &EdgeJobConfig::default()).await;
        let again =
            update_edges_for_producer(&store, "net", &net, &EdgeJobConfig::default()).await;
        assert_eq!(again.updated, 0);
        assert_eq!(again.unchanged, 1);
    }

    #[tokio::test]
    async fn missing_output_overrides_mock() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        state(&store, "app").await;
        let id = edge(&store, "net", "vpc_id", "app", true).await;

        let net = upload(&store, "net", 1, &[("subnet", "d1")]).await;
        update_edges_for_producer(&store, "net", &net, &EdgeJobConfig::default()).await;
        let e = store.get_edge(id).await.unwrap();
        assert_eq!(e.status, EdgeStatus::MissingOutput);
        assert!(e.out_digest.is_none());
    }

    #[tokio::test]
    async fn consumer_path_leaves_unpublished_outputs_alone() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        state(&store, "app").await;
        let id = edge(&store, "net", "vpc_id", "app", true).await;

        upload(&store, "app", 1, &[]).await;
        let report = update_edges_for_consumer(&store, "app", &EdgeJobConfig::default()).await;
        assert_eq!(report.updated, 1);
        let e = store.get_edge(id).await.unwrap();
        assert_eq!(e.status, EdgeStatus::Mock);
        assert!(e.in_digest.is_none());
    }

    #[tokio::test]
    async fn zero_timeout_skips_every_edge() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        for consumer in ["a", "b", "c"] {
            state(&store, consumer).await;
            edge(&store, "net", "vpc_id", consumer, false).await;
        }
        let net = upload(&store, "net", 1, &[("vpc_id", "d1")]).await;

        let config = EdgeJobConfig {
            timeout: Duration::ZERO,
        };
        let report = update_edges_for_producer(&store, "net", &net, &config).await;
        assert!(report.timed_out);
        assert_eq!(report.updated, 0);
        for e in store.list_edges_from("net").await.unwrap() {
            assert_eq!(e.status, EdgeStatus::Pending);
        }
    }

    #[tokio::test]
    async fn producer_job_uses_published_digests_over_later_rows() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        state(&store, "app").await;
        let id = edge(&store, "net", "vpc_id", "app", false).await;

        let first = upload(&store, "net", 1, &[("vpc_id", "d1")]).await;
        upload(&store, "net", 2, &[("vpc_id", "d2")]).await;
        update_edges_for_producer(&store, "net", &first, &EdgeJobConfig::default()).await;
        let e = store.get_edge(id).await.unwrap();
        assert_eq!(e.out_digest.as_deref(), Some("d1"));
        assert_eq!(e.status, EdgeStatus::Dirty);
    }

    #[tokio::test]
    async fn published_outputs_keep_stored_validation() {
        let store = MemoryStore::new();
        state(&store, "net").await;
        upload(&store, "net", 1, &[("vpc_id", "d1")]).await;
        store
            .record_validation("net", "vpc_id", ValidationStatus::Invalid, Some("bad"), "t2")
            .await
            .unwrap();

        let snapshot = ProducerSnapshot::load(&store, "net")
            .await
            .unwrap()
            .with_published("net", &published(&[("vpc_id", "d9"), ("subnet", "d3")]));
        assert_eq!(
            snapshot.output("vpc_id"),
            ProducerOutput::Present {
                digest: "d9",
                validation: ValidationStatus::Invalid,
            }
        );
        assert_eq!(
            snapshot.output("subnet"),
            ProducerOutput::Present {
                digest: "d3",
                validation: ValidationStatus::NotValidated,
            }
        );
        let dropped = ProducerSnapshot::load(&store, "net")
            .await
            .unwrap()
            .with_published("net", &[]);
        assert_eq!(dropped.output("vpc_id"), ProducerOutput::Missing);
    }

    #[tokio::test]
    async fn deleted_producer_reads_as_no_content() {
        let store = MemoryStore::new();
        let snapshot = ProducerSnapshot::load(&store, "gone").await.unwrap();
        assert!(!snapshot.has_content);
        assert_eq!(snapshot.output("x"), ProducerOutput::NoContent);
    }
}
