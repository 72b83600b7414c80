use std::future::Future;
use std::sync::Arc;

use super::{make_content, make_edge, make_lock, make_state, seed_states, TestResult};
use crate::{Storage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_lock_exactly_one_wins",
        concurrent_lock_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_edge_insert_single_row",
        concurrent_edge_insert_single_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_create_same_logic_id_one_wins",
        concurrent_create_same_logic_id_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_uploads_to_different_states_all_succeed",
        concurrent_uploads_to_different_states_all_succeed(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "snapshot_read_pairs_serial_with_outputs",
        snapshot_read_pairs_serial_with_outputs(factory).await,
    ));

    results
}

// ── Concurrent lock: exactly one wins ───────────────────────────────────────

/// N tasks race to lock the same state. Exactly one acquires it; every
/// loser sees the winner's lock info.
async fn concurrent_lock_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_states(storage.as_ref(), &[("g-1", "network")]).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let lock = make_lock(&format!("L{i}"), &format!("worker-{i}"));
            match s.lock_state("g-1", &lock).await {
                Ok(()) => Ok(Some(lock.id)),
                Err(StorageError::LockConflict { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        winners.extend(won);
    }

    if winners.len() != 1 {
        return Err(format!("expected exactly 1 winner, got {winners:?}"));
    }
    let rec = storage.get_state("g-1").await.map_err(|e| e.to_string())?;
    if rec.lock.map(|l| l.id) != winners.pop() {
        return Err("stored lock is not the winner's".to_string());
    }
    Ok(())
}

// ── Concurrent edge insert: single row ──────────────────────────────────────

/// N tasks add the same dependency at once. All observe the same edge id
/// and exactly one reports having created it.
async fn concurrent_edge_insert_single_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.insert_edge(make_edge("net", "vpc_id", "app")).await
        }));
    }

    let mut ids = Vec::new();
    let mut created = 0usize;
    for handle in handles {
        let (edge, was_created) = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        ids.push(edge.id);
        if was_created {
            created += 1;
        }
    }

    if created != 1 {
        return Err(format!("expected exactly 1 creator, got {created}"));
    }
    ids.dedup();
    if ids.len() != 1 {
        return Err(format!("tasks saw different edge ids: {ids:?}"));
    }
    Ok(())
}

// ── Concurrent create: logic id uniqueness ──────────────────────────────────

async fn concurrent_create_same_logic_id_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match s.create_state(make_state(&format!("g-{i}"), "network")).await {
                Ok(_) => Ok(true),
                Err(StorageError::AlreadyExists { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Concurrent uploads to different states: all succeed ─────────────────────

/// No false conflicts when there is no contention.
async fn concurrent_uploads_to_different_states_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        storage
            .create_state(make_state(&format!("g-{i}"), &format!("state-{i}")))
            .await
            .map_err(|e| format!("create g-{i}: {e}"))?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let digest = format!("d{i}");
            s.update_content(&format!("g-{i}"), make_content(1, &[("out", &digest)]))
                .await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    for i in 0..N {
        let outputs = storage
            .list_outputs(&format!("g-{i}"))
            .await
            .map_err(|e| format!("outputs g-{i}: {e}"))?;
        let expected = format!("d{i}");
        if outputs.first().and_then(|o| o.digest.as_deref()) != Some(expected.as_str()) {
            return Err(format!("g-{i}: expected digest {expected}, got {outputs:?}"));
        }
    }
    Ok(())
}

// ── Snapshot read during uploads ────────────────────────────────────────────

/// One task uploads serial after serial while another reads the state and
/// its outputs together. Every read must pair a serial with that upload's
/// digest.
async fn snapshot_read_pairs_serial_with_outputs<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    const UPLOADS: i64 = 30;
    let storage = Arc::new(factory().await);
    seed_states(storage.as_ref(), &[("g-1", "network")]).await?;

    let writer = {
        let s = storage.clone();
        tokio::spawn(async move {
            for serial in 1..=UPLOADS {
                let digest = format!("d{serial}");
                s.update_content("g-1", make_content(serial, &[("s", &digest)]))
                    .await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, StorageError>(())
        })
    };

    let mut reads = 0usize;
    loop {
        let finished = writer.is_finished();
        let (state, outputs) = storage
            .get_state_with_outputs("g-1")
            .await
            .map_err(|e| format!("read {reads}: {e}"))?;
        let digests: Vec<Option<&str>> = outputs.iter().map(|o| o.digest.as_deref()).collect();
        let expected = format!("d{}", state.serial);
        let consistent = match state.serial {
            0 => digests.is_empty(),
            _ => digests == [Some(expected.as_str())],
        };
        if !consistent {
            return Err(format!("serial {} read with digests {digests:?}", state.serial));
        }
        reads += 1;
        if finished {
            break;
        }
        tokio::task::yield_now().await;
    }

    writer
        .await
        .map_err(|e| format!("writer panic: {e}"))?
        .map_err(|e| format!("upload failed: {e}"))?;
    let (state, _) = storage
        .get_state_with_outputs("g-1")
        .await
        .map_err(|e| e.to_string())?;
    if state.serial != UPLOADS {
        return Err(format!("final read saw serial {}", state.serial));
    }
    Ok(())
}
