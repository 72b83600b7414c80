#![allow(clippy::result_large_err)]
//! stategraph-core: state and dependency graph engine.
//!
//! Sits between the HTTP layer and a [`stategraph_storage::Storage`]
//! backend. Parses uploaded Terraform state, keeps output digests and
//! schemas current, and derives the status of every dependency edge.
//!
//! # Public API
//!
//! - [`Engine`] -- service façade used by the server
//! - [`compute_status`] -- pure edge status function
//! - [`parse_state`] / [`digest_value`] -- output extraction
//! - [`topological_order`] / [`dependency_graph`] -- traversal
//! - [`update_edges_for_producer`] / [`update_edges_for_consumer`] -- edge
//!   recomputation after an upload
//! - [`Error`] -- engine error taxonomy

pub mod deps;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ident;
pub mod job;
pub mod labels;
pub mod outputs;
pub mod report;
pub mod schema;
pub mod status;

// ── Convenience re-exports: key types ────────────────────────────────

pub use deps::{AddDependency, AddedEdge};
pub use engine::{
    BackendAddresses, CreateState, Engine, EngineConfig, ListStates, OutputSchema, StateInfo,
    StatePage, UploadOutcome,
};
pub use error::{Error, Result};
pub use graph::{DependencyGraph, Direction, Layer, StateRef};
pub use job::{EdgeJobConfig, EdgeUpdateReport, DEFAULT_EDGE_UPDATE_TIMEOUT};
pub use labels::{AllowAllLabels, LabelPolicy, LabelValidator, PolicyLabelValidator};
pub use report::{EdgeView, OverallStatus, StateStatus};
pub use schema::{JsonSchemaValidator, SchemaValidator, ValidationResult};

// ── Convenience re-exports: entry points ─────────────────────────────

pub use graph::{dependency_graph, topological_order};
pub use job::{update_edges_for_consumer, update_edges_for_producer};
pub use outputs::{digest_value, parse_state};
pub use status::compute_status;

/// Current UTC time as RFC 3339, the format every stored timestamp uses.
pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
