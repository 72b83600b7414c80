use std::future::Future;

use super::{make_state, seed_states, TestResult, T1};
use crate::record::{LabelValue, Labels, StateQuery};
use crate::{Storage, StorageError};

pub(super) async fn run_state_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "state",
        "create_state_starts_empty_at_serial_0",
        create_state_starts_empty_at_serial_0(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "duplicate_guid_returns_already_exists",
        duplicate_guid_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "duplicate_logic_id_returns_already_exists",
        duplicate_logic_id_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "get_state_nonexistent",
        get_state_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "get_state_by_logic_id",
        get_state_by_logic_id(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "get_state_by_logic_id_nonexistent",
        get_state_by_logic_id_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "labels_round_trip",
        labels_round_trip(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "update_labels_replaces_map",
        update_labels_replaces_map(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "list_states_ordered_by_guid",
        list_states_ordered_by_guid(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "list_states_cursor_and_limit",
        list_states_cursor_and_limit(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "list_states_label_filter",
        list_states_label_filter(factory).await,
    ));
    results.push(TestResult::from_result(
        "state",
        "list_states_logic_id_prefix",
        list_states_logic_id_prefix(factory).await,
    ));

    results
}

fn labels(pairs: &[(&str, LabelValue)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn create_state_starts_empty_at_serial_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = s
        .create_state(make_state("g-1", "network"))
        .await
        .map_err(|e| e.to_string())?;
    if rec.serial != 0 || rec.size_bytes != 0 || rec.lock.is_some() {
        return Err(format!("unexpected initial record: {rec:?}"));
    }
    let content = s.get_content("g-1").await.map_err(|e| e.to_string())?;
    if content.is_some() {
        return Err("new state must have no content".to_string());
    }
    Ok(())
}

async fn duplicate_guid_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    match s.create_state(make_state("g-1", "other")).await {
        Err(StorageError::AlreadyExists { field, .. }) if field == "guid" => Ok(()),
        other => Err(format!("expected AlreadyExists(guid), got {other:?}")),
    }
}

async fn duplicate_logic_id_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    match s.create_state(make_state("g-2", "network")).await {
        Err(StorageError::AlreadyExists { field, value }) if field == "logic_id" => {
            if value != "network" {
                return Err(format!("expected value 'network', got '{value}'"));
            }
            Ok(())
        }
        other => Err(format!("expected AlreadyExists(logic_id), got {other:?}")),
    }
}

async fn get_state_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_state("missing").await {
        Err(StorageError::StateNotFound { guid }) if guid == "missing" => Ok(()),
        other => Err(format!("expected StateNotFound, got {other:?}")),
    }
}

async fn get_state_by_logic_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network"), ("g-2", "app")]).await?;
    let rec = s
        .get_state_by_logic_id("app")
        .await
        .map_err(|e| e.to_string())?;
    if rec.guid != "g-2" {
        return Err(format!("expected g-2, got {}", rec.guid));
    }
    Ok(())
}

async fn get_state_by_logic_id_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_state_by_logic_id("nope").await {
        Err(StorageError::LogicIdNotFound { .. }) => Ok(()),
        other => Err(format!("expected LogicIdNotFound, got {other:?}")),
    }
}

async fn labels_round_trip<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut new = make_state("g-1", "network");
    new.labels = labels(&[
        ("env", LabelValue::String("prod".into())),
        ("tier", LabelValue::Number(2.0)),
        ("critical", LabelValue::Bool(true)),
    ]);
    let expected = new.labels.clone();
    s.create_state(new).await.map_err(|e| e.to_string())?;
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.labels != expected {
        return Err(format!("labels mismatch: {:?} vs {:?}", rec.labels, expected));
    }
    Ok(())
}

async fn update_labels_replaces_map<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut new = make_state("g-1", "network");
    new.labels = labels(&[("env", LabelValue::String("dev".into()))]);
    s.create_state(new).await.map_err(|e| e.to_string())?;

    let replacement = labels(&[("team", LabelValue::String("core".into()))]);
    let rec = s
        .update_labels("g-1", replacement.clone(), T1)
        .await
        .map_err(|e| e.to_string())?;
    if rec.labels != replacement || rec.updated_at != T1 {
        return Err(format!("unexpected record after update: {rec:?}"));
    }
    let reread = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if reread.labels.contains_key("env") {
        return Err("old label survived replacement".to_string());
    }
    Ok(())
}

async fn list_states_ordered_by_guid<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-3", "c"), ("g-1", "a"), ("g-2", "b")]).await?;
    let all = s
        .list_states(&StateQuery::default())
        .await
        .map_err(|e| e.to_string())?;
    let guids: Vec<&str> = all.iter().map(|r| r.guid.as_str()).collect();
    if guids != ["g-1", "g-2", "g-3"] {
        return Err(format!("expected GUID order, got {guids:?}"));
    }
    Ok(())
}

async fn list_states_cursor_and_limit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "a"), ("g-2", "b"), ("g-3", "c"), ("g-4", "d")]).await?;
    let page = s
        .list_states(&StateQuery {
            after_guid: Some("g-1".into()),
            limit: 2,
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    let guids: Vec<&str> = page.iter().map(|r| r.guid.as_str()).collect();
    if guids != ["g-2", "g-3"] {
        return Err(format!("expected [g-2, g-3], got {guids:?}"));
    }
    Ok(())
}

async fn list_states_label_filter<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (guid, logic_id, env, tier) in [
        ("g-1", "a", "prod", 1.0),
        ("g-2", "b", "dev", 1.0),
        ("g-3", "c", "prod", 2.0),
    ] {
        let mut new = make_state(guid, logic_id);
        new.labels = labels(&[
            ("env", LabelValue::String(env.into())),
            ("tier", LabelValue::Number(tier)),
        ]);
        s.create_state(new).await.map_err(|e| e.to_string())?;
    }
    let found = s
        .list_states(&StateQuery {
            labels: labels(&[
                ("env", LabelValue::String("prod".into())),
                ("tier", LabelValue::Number(2.0)),
            ]),
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    let guids: Vec<&str> = found.iter().map(|r| r.guid.as_str()).collect();
    if guids != ["g-3"] {
        return Err(format!("expected [g-3], got {guids:?}"));
    }
    Ok(())
}

async fn list_states_logic_id_prefix<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(
        &s,
        &[("g-1", "prod-network"), ("g-2", "dev-network"), ("g-3", "prod-app")],
    )
    .await?;
    let found = s
        .list_states(&StateQuery {
            logic_id_prefix: Some("prod-".into()),
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    let ids: Vec<&str> = found.iter().map(|r| r.logic_id.as_str()).collect();
    if ids != ["prod-network", "prod-app"] {
        return Err(format!("expected prod-* states, got {ids:?}"));
    }
    Ok(())
}
