use std::future::Future;

use super::{make_content, make_lock, seed_states, TestResult};
use crate::record::ValidationStatus;
use crate::{Storage, StorageError};

pub(super) async fn run_content_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "content",
        "update_content_sets_serial_metadata_and_size",
        update_content_sets_serial_metadata_and_size(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "update_content_bytes_readable",
        update_content_bytes_readable(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "update_content_writes_outputs",
        update_content_writes_outputs(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "update_content_replaces_output_set",
        update_content_replaces_output_set(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "update_content_nonexistent",
        update_content_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "equal_serial_accepted",
        equal_serial_accepted(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "serial_regression_rejected_without_side_effects",
        serial_regression_rejected_without_side_effects(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "expected_serial_mismatch_is_conflict",
        expected_serial_mismatch_is_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "locked_state_rejects_missing_or_wrong_lock_id",
        locked_state_rejects_missing_or_wrong_lock_id(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "locked_state_accepts_holder",
        locked_state_accepts_holder(factory).await,
    ));
    results.push(TestResult::from_result(
        "content",
        "changed_digest_resets_validation",
        changed_digest_resets_validation(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn update_content_sets_serial_metadata_and_size<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let update = make_content(3, &[]);
    let size = update.content.len() as i64;
    let rec = s
        .update_content("g-1", update)
        .await
        .map_err(|e| e.to_string())?;
    if rec.serial != 3 {
        return Err(format!("expected serial 3, got {}", rec.serial));
    }
    if rec.size_bytes != size {
        return Err(format!("expected size {size}, got {}", rec.size_bytes));
    }
    if rec.lineage.as_deref() != Some("lineage-1") {
        return Err(format!("lineage not stored: {:?}", rec.lineage));
    }
    let reread = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if reread.serial != 3 || !reread.has_content() {
        return Err(format!("stored record not updated: {reread:?}"));
    }
    Ok(())
}

async fn update_content_bytes_readable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let update = make_content(1, &[]);
    let expected = update.content.clone();
    s.update_content("g-1", update)
        .await
        .map_err(|e| e.to_string())?;
    let content = s.get_content("g-1").await.map_err(|e| e.to_string())?;
    if content.as_deref() != Some(expected.as_slice()) {
        return Err("content bytes differ from upload".to_string());
    }
    Ok(())
}

async fn update_content_writes_outputs<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1"), ("cidr", "d2")]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    let keys: Vec<(&str, Option<&str>)> = outputs
        .iter()
        .map(|o| (o.key.as_str(), o.digest.as_deref()))
        .collect();
    if keys != [("cidr", Some("d2")), ("vpc_id", Some("d1"))] {
        return Err(format!("unexpected outputs: {keys:?}"));
    }
    Ok(())
}

async fn update_content_replaces_output_set<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1"), ("cidr", "d2")]))
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(2, &[("vpc_id", "d3")]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    if outputs.len() != 1 || outputs[0].digest.as_deref() != Some("d3") {
        return Err(format!("expected only vpc_id=d3, got {outputs:?}"));
    }
    Ok(())
}

async fn update_content_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.update_content("missing", make_content(1, &[])).await {
        Err(StorageError::StateNotFound { .. }) => Ok(()),
        other => Err(format!("expected StateNotFound, got {other:?}")),
    }
}

async fn equal_serial_accepted<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(4, &[]))
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(4, &[("a", "d")]))
        .await
        .map_err(|e| format!("re-upload at same serial failed: {e}"))?;
    Ok(())
}

async fn serial_regression_rejected_without_side_effects<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(5, &[("vpc_id", "d5")]))
        .await
        .map_err(|e| e.to_string())?;
    match s
        .update_content("g-1", make_content(4, &[("vpc_id", "d4")]))
        .await
    {
        Err(StorageError::SerialRegression {
            current: 5,
            attempted: 4,
        }) => {}
        other => return Err(format!("expected SerialRegression, got {other:?}")),
    }
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    if rec.serial != 5 || outputs[0].digest.as_deref() != Some("d5") {
        return Err("rejected upload left partial writes behind".to_string());
    }
    Ok(())
}

async fn expected_serial_mismatch_is_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(2, &[]))
        .await
        .map_err(|e| e.to_string())?;
    let mut update = make_content(3, &[]);
    update.expected_serial = Some(1);
    match s.update_content("g-1", update).await {
        Err(StorageError::SerialConflict {
            expected: 1,
            actual: 2,
        }) => {}
        other => return Err(format!("expected SerialConflict, got {other:?}")),
    }
    let mut update = make_content(3, &[]);
    update.expected_serial = Some(2);
    s.update_content("g-1", update)
        .await
        .map_err(|e| format!("matching expected_serial rejected: {e}"))?;
    Ok(())
}

async fn locked_state_rejects_missing_or_wrong_lock_id<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "old")]))
        .await
        .map_err(|e| e.to_string())?;
    s.lock_state("g-1", &make_lock("L1", "alice"))
        .await
        .map_err(|e| e.to_string())?;

    for lock_id in [None, Some("wrong".to_string())] {
        let mut update = make_content(2, &[("vpc_id", "new")]);
        update.lock_id = lock_id.clone();
        match s.update_content("g-1", update).await {
            Err(StorageError::LockMismatch { held: Some(h), .. }) if h.id == "L1" => {}
            other => {
                return Err(format!(
                    "lock id {lock_id:?}: expected LockMismatch, got {other:?}"
                ))
            }
        }
    }
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    if outputs[0].digest.as_deref() != Some("old") {
        return Err("rejected upload changed outputs".to_string());
    }
    Ok(())
}

async fn locked_state_accepts_holder<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.lock_state("g-1", &make_lock("L1", "alice"))
        .await
        .map_err(|e| e.to_string())?;
    let mut update = make_content(1, &[]);
    update.lock_id = Some("L1".to_string());
    s.update_content("g-1", update)
        .await
        .map_err(|e| format!("holder upload rejected: {e}"))?;
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.lock.as_ref().map(|l| l.id.as_str()) != Some("L1") {
        return Err("content upload must not release the lock".to_string());
    }
    Ok(())
}

async fn changed_digest_resets_validation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("a", "d1"), ("b", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    for key in ["a", "b"] {
        s.record_validation("g-1", key, ValidationStatus::Valid, None, super::T1)
            .await
            .map_err(|e| e.to_string())?;
    }
    s.update_content("g-1", make_content(2, &[("a", "d2"), ("b", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    let a = outputs.iter().find(|o| o.key == "a").ok_or("a missing")?;
    let b = outputs.iter().find(|o| o.key == "b").ok_or("b missing")?;
    if a.validation_status != ValidationStatus::NotValidated {
        return Err(format!("changed output kept {:?}", a.validation_status));
    }
    if b.validation_status != ValidationStatus::Valid {
        return Err(format!("unchanged output lost {:?}", b.validation_status));
    }
    Ok(())
}
