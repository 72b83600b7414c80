//! Traversal over the dependency edge set.
//!
//! Edges are read from storage on demand; nothing here is cached. Every
//! walk keeps a visited set, so an accidental cycle terminates instead of
//! looping.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stategraph_storage::{EdgeRecord, Storage, StorageError};

use crate::error::{Error, Result};

/// Which way to follow edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward producers (and their producers).
    Upstream,
    /// Toward consumers (and their consumers).
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        })
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            other => Err(Error::InvalidArgument(format!(
                "direction must be 'upstream' or 'downstream', got '{other}'"
            ))),
        }
    }
}

/// A state as it appears in traversal results. `logic_id` is `None` when
/// an edge points at a state that no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRef {
    pub guid: String,
    pub logic_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub level: usize,
    pub states: Vec<StateRef>,
}

/// Upstream closure of one consumer, flattened for config generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    pub consumer: StateRef,
    pub producers: Vec<StateRef>,
    /// Every edge whose consumer is inside the closure, ordered by id.
    pub edges: Vec<EdgeRecord>,
}

async fn edges_of<S: Storage>(store: &S, guid: &str, direction: Direction) -> Result<Vec<EdgeRecord>> {
    let edges = match direction {
        Direction::Upstream => store.list_edges_to(guid).await?,
        Direction::Downstream => store.list_edges_from(guid).await?,
    };
    Ok(edges)
}

/// Distinct neighbour GUIDs one hop away, in GUID order.
async fn neighbours<S: Storage>(store: &S, guid: &str, direction: Direction) -> Result<BTreeSet<String>> {
    Ok(edges_of(store, guid, direction)
        .await?
        .into_iter()
        .map(|e| match direction {
            Direction::Upstream => e.from_guid,
            Direction::Downstream => e.to_guid,
        })
        .collect())
}

async fn state_ref<S: Storage>(store: &S, guid: &str) -> Result<StateRef> {
    match store.get_state(guid).await {
        Ok(state) => Ok(StateRef {
            guid: state.guid,
            logic_id: Some(state.logic_id),
        }),
        Err(StorageError::StateNotFound { .. }) => Ok(StateRef {
            guid: guid.to_string(),
            logic_id: None,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Breadth-first layering from `root`.
///
/// The root itself is level 0 and is not returned. Layer `n` holds every
/// state first reached after exactly `n` hops; a state reachable along
/// several path lengths appears only in the earliest layer. States within
/// a layer are ordered by GUID.
pub async fn topological_order<S: Storage>(
    store: &S,
    root: &str,
    direction: Direction,
) -> Result<Vec<Layer>> {
    store.get_state(root).await?;

    let mut visited: HashSet<String> = HashSet::from([root.to_string()]);
    let mut frontier: Vec<String> = vec![root.to_string()];
    let mut layers = Vec::new();

    while !frontier.is_empty() {
        let mut next = BTreeSet::new();
        for guid in &frontier {
            for n in neighbours(store, guid, direction).await? {
                if !visited.contains(&n) {
                    next.insert(n);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        let mut states = Vec::with_capacity(next.len());
        for guid in &next {
            visited.insert(guid.clone());
            states.push(state_ref(store, guid).await?);
        }
        layers.push(Layer {
            level: layers.len() + 1,
            states,
        });
        frontier = next.into_iter().collect();
    }

    Ok(layers)
}

/// True if `target` is reachable from `start` following `direction`.
pub async fn reaches<S: Storage>(
    store: &S,
    start: &str,
    target: &str,
    direction: Direction,
) -> Result<bool> {
    if start == target {
        return Ok(true);
    }
    let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
    let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);
    while let Some(guid) = queue.pop_front() {
        for n in neighbours(store, &guid, direction).await? {
            if n == target {
                return Ok(true);
            }
            if visited.insert(n.clone()) {
                queue.push_back(n);
            }
        }
    }
    Ok(false)
}

/// Full upstream closure of `consumer`: all transitive producers and the
/// edges connecting them.
pub async fn dependency_graph<S: Storage>(store: &S, consumer: &str) -> Result<DependencyGraph> {
    let consumer_ref = state_ref(store, consumer).await?;
    if consumer_ref.logic_id.is_none() {
        return Err(Error::NotFound(format!("state {consumer}")));
    }

    let mut visited: HashSet<String> = HashSet::from([consumer.to_string()]);
    let mut queue: VecDeque<String> = VecDeque::from([consumer.to_string()]);
    let mut order: Vec<String> = Vec::new();
    let mut edges: Vec<EdgeRecord> = Vec::new();

    while let Some(guid) = queue.pop_front() {
        let incoming = store.list_edges_to(&guid).await?;
        let producers: BTreeSet<String> = incoming.iter().map(|e| e.from_guid.clone()).collect();
        edges.extend(incoming);
        for p in producers {
            if visited.insert(p.clone()) {
                order.push(p.clone());
                queue.push_back(p);
            }
        }
    }
    edges.sort_by_key(|e| e.id);

    let mut producers = Vec::with_capacity(order.len());
    for guid in &order {
        producers.push(state_ref(store, guid).await?);
    }
    Ok(DependencyGraph {
        consumer: consumer_ref,
        producers,
        edges,
    })
}
