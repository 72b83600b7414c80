use std::future::Future;

use super::{make_lock, seed_states, TestResult};
use crate::{Storage, StorageError};

pub(super) async fn run_lock_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "lock",
        "lock_stores_lock_info",
        lock_stores_lock_info(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "second_lock_conflicts_with_holder_info",
        second_lock_conflicts_with_holder_info(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "relock_with_same_id_conflicts",
        relock_with_same_id_conflicts(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "unlock_wrong_id_keeps_lock",
        unlock_wrong_id_keeps_lock(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "unlock_when_unlocked_is_mismatch",
        unlock_when_unlocked_is_mismatch(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "unlock_then_relock",
        unlock_then_relock(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "lock_nonexistent_state",
        lock_nonexistent_state(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "locks_are_per_state",
        locks_are_per_state(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn lock_stores_lock_info<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let lock = make_lock("L1", "alice@laptop");
    s.lock_state("g-1", &lock).await.map_err(|e| e.to_string())?;
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.lock.as_ref() != Some(&lock) {
        return Err(format!("expected stored lock {lock:?}, got {:?}", rec.lock));
    }
    Ok(())
}

async fn second_lock_conflicts_with_holder_info<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let first = make_lock("L1", "alice");
    s.lock_state("g-1", &first)
        .await
        .map_err(|e| e.to_string())?;
    match s.lock_state("g-1", &make_lock("L2", "bob")).await {
        Err(StorageError::LockConflict { existing }) if existing == first => Ok(()),
        other => Err(format!("expected LockConflict carrying L1, got {other:?}")),
    }
}

async fn relock_with_same_id_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let lock = make_lock("L1", "alice");
    s.lock_state("g-1", &lock).await.map_err(|e| e.to_string())?;
    match s.lock_state("g-1", &lock).await {
        Err(StorageError::LockConflict { .. }) => Ok(()),
        other => Err(format!("expected LockConflict, got {other:?}")),
    }
}

async fn unlock_wrong_id_keeps_lock<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let lock = make_lock("L1", "alice");
    s.lock_state("g-1", &lock).await.map_err(|e| e.to_string())?;
    match s.unlock_state("g-1", "wrong-id").await {
        Err(StorageError::LockMismatch { held: Some(h), .. }) if h == lock => {}
        other => return Err(format!("expected LockMismatch, got {other:?}")),
    }
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.lock.as_ref() != Some(&lock) {
        return Err("failed unlock must leave the lock intact".to_string());
    }
    Ok(())
}

async fn unlock_when_unlocked_is_mismatch<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    match s.unlock_state("g-1", "L1").await {
        Err(StorageError::LockMismatch { held: None, .. }) => Ok(()),
        other => Err(format!("expected LockMismatch with no holder, got {other:?}")),
    }
}

async fn unlock_then_relock<S, F, Fut>(factory: &F) -> Result<(), String>
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
    s.unlock_state("g-1", "L1")
        .await
        .map_err(|e| e.to_string())?;
    let rec = s.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.lock.is_some() {
        return Err("lock info must be cleared on unlock".to_string());
    }
    s.lock_state("g-1", &make_lock("L2", "bob"))
        .await
        .map_err(|e| format!("relock after unlock failed: {e}"))?;
    Ok(())
}

async fn lock_nonexistent_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.lock_state("missing", &make_lock("L1", "alice")).await {
        Err(StorageError::StateNotFound { .. }) => {}
        other => return Err(format!("lock: expected StateNotFound, got {other:?}")),
    }
    match s.unlock_state("missing", "L1").await {
        Err(StorageError::StateNotFound { .. }) => Ok(()),
        other => Err(format!("unlock: expected StateNotFound, got {other:?}")),
    }
}

async fn locks_are_per_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network"), ("g-2", "app")]).await?;
    s.lock_state("g-1", &make_lock("L1", "alice"))
        .await
        .map_err(|e| e.to_string())?;
    s.lock_state("g-2", &make_lock("L2", "bob"))
        .await
        .map_err(|e| format!("lock on independent state failed: {e}"))?;
    Ok(())
}
