//! Read-only status views over persisted edges.
//!
//! `potentially-stale` exists only here. It marks a clean edge whose
//! producer is itself behind something upstream; nothing in this module
//! writes to storage.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;
use stategraph_storage::{EdgeRecord, EdgeStatus, StateRecord, Storage};

use crate::error::Result;

pub const POTENTIALLY_STALE: &str = "potentially-stale";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverallStatus {
    Clean,
    Stale,
    PotentiallyStale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeView {
    #[serde(flatten)]
    pub edge: EdgeRecord,
    /// The persisted status, or `potentially-stale` for a clean edge with
    /// upstream staleness.
    pub effective_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateStatus {
    pub state: StateRecord,
    pub status: OverallStatus,
    pub incoming: Vec<EdgeView>,
    /// Incoming edge count per effective status.
    pub summary: BTreeMap<String, usize>,
}

/// True if any edge upstream of `guid` (at any depth) is stale.
async fn has_upstream_staleness<S: Storage>(
    store: &S,
    guid: &str,
    memo: &mut HashMap<String, bool>,
) -> Result<bool> {
    if let Some(known) = memo.get(guid) {
        return Ok(*known);
    }
    let mut visited: HashSet<String> = HashSet::from([guid.to_string()]);
    let mut queue: VecDeque<String> = VecDeque::from([guid.to_string()]);
    let mut stale = false;
    while let Some(current) = queue.pop_front() {
        if memo.get(&current) == Some(&true) {
            stale = true;
            break;
        }
        let edges = store.list_edges_to(&current).await?;
        if edges.iter().any(|e| e.status.is_stale()) {
            stale = true;
            break;
        }
        for e in edges {
            if visited.insert(e.from_guid.clone()) {
                queue.push_back(e.from_guid);
            }
        }
    }
    memo.insert(guid.to_string(), stale);
    Ok(stale)
}

pub async fn state_status<S: Storage>(store: &S, guid: &str) -> Result<StateStatus> {
    let state = store.get_state(guid).await?;
    let edges = store.list_edges_to(guid).await?;

    let mut memo = HashMap::new();
    let mut incoming = Vec::with_capacity(edges.len());
    for edge in edges {
        let clean = matches!(edge.status, EdgeStatus::Clean | EdgeStatus::CleanInvalid);
        let effective_status =
            if clean && has_upstream_staleness(store, &edge.from_guid, &mut memo).await? {
                POTENTIALLY_STALE.to_string()
            } else {
                edge.status.as_str().to_string()
            };
        incoming.push(EdgeView {
            edge,
            effective_status,
        });
    }

    let mut summary: BTreeMap<String, usize> = BTreeMap::new();
    for view in &incoming {
        *summary.entry(view.effective_status.clone()).or_default() += 1;
    }

    let status = if incoming.iter().any(|v| v.edge.status.is_stale()) {
        OverallStatus::Stale
    } else if incoming.iter().any(|v| v.effective_status == POTENTIALLY_STALE) {
        OverallStatus::PotentiallyStale
    } else {
        OverallStatus::Clean
    };

    Ok(StateStatus {
        state,
        status,
        incoming,
        summary,
    })
}
