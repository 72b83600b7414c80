use std::future::Future;

use super::{make_edge, TestResult, T1};
use crate::record::{EdgeStatus, EdgeUpdate};
use crate::{Storage, StorageError};

pub(super) async fn run_edge_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "edges",
        "insert_edge_assigns_id",
        insert_edge_assigns_id(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "insert_edge_is_idempotent",
        insert_edge_is_idempotent(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "distinct_input_names_are_distinct_edges",
        distinct_input_names_are_distinct_edges(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "list_edges_by_endpoint",
        list_edges_by_endpoint(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "update_edge_overwrites_derived_fields",
        update_edge_overwrites_derived_fields(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "delete_edge_removes_row",
        delete_edge_removes_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "edges",
        "missing_edge_operations",
        missing_edge_operations(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn insert_edge_assigns_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut new = make_edge("g-1", "vpc_id", "g-2");
    new.out_digest = Some("d1".into());
    new.status = EdgeStatus::Dirty;
    let (edge, created) = s.insert_edge(new).await.map_err(|e| e.to_string())?;
    if !created {
        return Err("first insert must report created".to_string());
    }
    if edge.status != EdgeStatus::Dirty || edge.out_digest.as_deref() != Some("d1") {
        return Err(format!("initial fields not stored: {edge:?}"));
    }
    if edge.in_digest.is_some() {
        return Err("a new edge has never been consumed".to_string());
    }
    let fetched = s.get_edge(edge.id).await.map_err(|e| e.to_string())?;
    if fetched != edge {
        return Err(format!("get_edge returned {fetched:?}, expected {edge:?}"));
    }
    Ok(())
}

async fn insert_edge_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (first, _) = s
        .insert_edge(make_edge("g-1", "vpc_id", "g-2"))
        .await
        .map_err(|e| e.to_string())?;
    let mut again = make_edge("g-1", "vpc_id", "g-2");
    again.status = EdgeStatus::Clean;
    let (second, created) = s.insert_edge(again).await.map_err(|e| e.to_string())?;
    if created || second.id != first.id {
        return Err(format!(
            "expected existing edge {} back, got {} (created={created})",
            first.id, second.id
        ));
    }
    if second.status != EdgeStatus::Pending {
        return Err("re-insert must not overwrite the existing edge".to_string());
    }
    let all = s.list_edges_from("g-1").await.map_err(|e| e.to_string())?;
    if all.len() != 1 {
        return Err(format!("expected one edge, found {}", all.len()));
    }
    Ok(())
}

async fn distinct_input_names_are_distinct_edges<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (a, _) = s
        .insert_edge(make_edge("g-1", "vpc_id", "g-2"))
        .await
        .map_err(|e| e.to_string())?;
    let mut other = make_edge("g-1", "vpc_id", "g-2");
    other.to_input_name = "network_vpc".into();
    let (b, created) = s.insert_edge(other).await.map_err(|e| e.to_string())?;
    if !created || a.id == b.id {
        return Err("a different input name must create a new edge".to_string());
    }
    Ok(())
}

async fn list_edges_by_endpoint<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (from, output, to) in [
        ("net", "vpc_id", "app"),
        ("net", "subnet_ids", "app"),
        ("net", "vpc_id", "db"),
        ("dns", "zone_id", "app"),
    ] {
        s.insert_edge(make_edge(from, output, to))
            .await
            .map_err(|e| e.to_string())?;
    }
    let outgoing = s.list_edges_from("net").await.map_err(|e| e.to_string())?;
    let targets: Vec<(&str, &str)> = outgoing
        .iter()
        .map(|e| (e.from_output.as_str(), e.to_guid.as_str()))
        .collect();
    if targets != [("vpc_id", "app"), ("subnet_ids", "app"), ("vpc_id", "db")] {
        return Err(format!("unexpected outgoing edges: {targets:?}"));
    }
    let incoming = s.list_edges_to("app").await.map_err(|e| e.to_string())?;
    let sources: Vec<&str> = incoming.iter().map(|e| e.from_guid.as_str()).collect();
    if sources != ["net", "net", "dns"] {
        return Err(format!("unexpected incoming edges: {sources:?}"));
    }
    if !s
        .list_edges_to("nobody")
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("unknown consumer must have no edges".to_string());
    }
    Ok(())
}

async fn update_edge_overwrites_derived_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (edge, _) = s
        .insert_edge(make_edge("g-1", "vpc_id", "g-2"))
        .await
        .map_err(|e| e.to_string())?;
    let update = EdgeUpdate {
        status: EdgeStatus::Clean,
        in_digest: Some("d1".into()),
        out_digest: Some("d1".into()),
        last_in_at: Some(T1.into()),
        last_out_at: Some(T1.into()),
        updated_at: T1.into(),
    };
    let updated = s
        .update_edge(edge.id, update.clone())
        .await
        .map_err(|e| e.to_string())?;
    let reread = s.get_edge(edge.id).await.map_err(|e| e.to_string())?;
    for rec in [&updated, &reread] {
        if EdgeUpdate::from_edge(rec) != update {
            return Err(format!("update not applied: {rec:?}"));
        }
        if rec.from_output != "vpc_id" || rec.created_at != edge.created_at {
            return Err("update must not touch edge identity".to_string());
        }
    }
    Ok(())
}

async fn delete_edge_removes_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let (edge, _) = s
        .insert_edge(make_edge("g-1", "vpc_id", "g-2"))
        .await
        .map_err(|e| e.to_string())?;
    s.delete_edge(edge.id).await.map_err(|e| e.to_string())?;
    match s.get_edge(edge.id).await {
        Err(StorageError::EdgeNotFound { .. }) => {}
        other => return Err(format!("expected EdgeNotFound, got {other:?}")),
    }
    if !s
        .list_edges_to("g-2")
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("deleted edge still listed".to_string());
    }
    // The same identity can be re-created afterwards.
    let (_, created) = s
        .insert_edge(make_edge("g-1", "vpc_id", "g-2"))
        .await
        .map_err(|e| e.to_string())?;
    if !created {
        return Err("re-insert after delete must create a row".to_string());
    }
    Ok(())
}

async fn missing_edge_operations<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.delete_edge(999).await {
        Err(StorageError::EdgeNotFound { id: 999 }) => {}
        other => return Err(format!("delete: expected EdgeNotFound, got {other:?}")),
    }
    let update = EdgeUpdate {
        status: EdgeStatus::Clean,
        in_digest: None,
        out_digest: None,
        last_in_at: None,
        last_out_at: None,
        updated_at: T1.into(),
    };
    match s.update_edge(999, update).await {
        Err(StorageError::EdgeNotFound { .. }) => Ok(()),
        other => Err(format!("update: expected EdgeNotFound, got {other:?}")),
    }
}
