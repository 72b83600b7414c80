use std::future::Future;

use super::{make_content, seed_states, TestResult, T1};
use crate::record::{SchemaSource, ValidationStatus};
use crate::{Storage, StorageError};

pub(super) async fn run_output_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "outputs",
        "schema_on_missing_output_creates_placeholder",
        schema_on_missing_output_creates_placeholder(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "schema_preserved_across_uploads",
        schema_preserved_across_uploads(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "manual_schema_row_survives_output_removal",
        manual_schema_row_survives_output_removal(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "inferred_schema_row_removed_with_output",
        inferred_schema_row_removed_with_output(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "record_validation_persists_outcome",
        record_validation_persists_outcome(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "list_outputs_nonexistent_state",
        list_outputs_nonexistent_state(factory).await,
    ));
    results.push(TestResult::from_result(
        "outputs",
        "state_with_outputs_matches_separate_reads",
        state_with_outputs_matches_separate_reads(factory).await,
    ));

    results
}

const SCHEMA: &str = r#"{"type":"string"}"#;

// ── Test implementations ──────────────────────────────────────────────────────

async fn schema_on_missing_output_creates_placeholder<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    let rec = s
        .set_output_schema("g-1", "vpc_id", SCHEMA, SchemaSource::Manual)
        .await
        .map_err(|e| e.to_string())?;
    if rec.is_present() || rec.schema_json.as_deref() != Some(SCHEMA) {
        return Err(format!("unexpected placeholder: {rec:?}"));
    }
    Ok(())
}

async fn schema_preserved_across_uploads<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.set_output_schema("g-1", "vpc_id", SCHEMA, SchemaSource::Manual)
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(2, &[("vpc_id", "d2")]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    let o = outputs.first().ok_or("vpc_id missing")?;
    if o.schema_source != Some(SchemaSource::Manual) || o.digest.as_deref() != Some("d2") {
        return Err(format!("schema or digest lost: {o:?}"));
    }
    Ok(())
}

async fn manual_schema_row_survives_output_removal<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    s.set_output_schema("g-1", "vpc_id", SCHEMA, SchemaSource::Manual)
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(2, &[]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    match outputs.as_slice() {
        [o] if o.digest.is_none() && o.schema_json.as_deref() == Some(SCHEMA) => Ok(()),
        other => Err(format!("expected digest-less schema row, got {other:?}")),
    }
}

async fn inferred_schema_row_removed_with_output<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    s.set_output_schema("g-1", "vpc_id", SCHEMA, SchemaSource::Inferred)
        .await
        .map_err(|e| e.to_string())?;
    s.update_content("g-1", make_content(2, &[]))
        .await
        .map_err(|e| e.to_string())?;
    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    if !outputs.is_empty() {
        return Err(format!("expected no outputs, got {outputs:?}"));
    }
    Ok(())
}

async fn record_validation_persists_outcome<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(1, &[("vpc_id", "d1")]))
        .await
        .map_err(|e| e.to_string())?;
    s.record_validation(
        "g-1",
        "vpc_id",
        ValidationStatus::Invalid,
        Some("42 is not of type \"string\""),
        T1,
    )
    .await
    .map_err(|e| e.to_string())?;
    // Unknown keys are ignored rather than failing.
    s.record_validation("g-1", "gone", ValidationStatus::Valid, None, T1)
        .await
        .map_err(|e| format!("unknown key must be ignored: {e}"))?;

    let outputs = s.list_outputs("g-1").await.map_err(|e| e.to_string())?;
    let o = outputs.first().ok_or("vpc_id missing")?;
    if o.validation_status != ValidationStatus::Invalid
        || o.validation_error.is_none()
        || o.validated_at.as_deref() != Some(T1)
    {
        return Err(format!("validation not stored: {o:?}"));
    }
    if outputs.len() != 1 {
        return Err("record_validation must not create rows".to_string());
    }
    Ok(())
}

async fn list_outputs_nonexistent_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.list_outputs("missing").await {
        Err(StorageError::StateNotFound { .. }) => {}
        other => return Err(format!("expected StateNotFound, got {other:?}")),
    }
    match s.get_state_with_outputs("missing").await {
        Err(StorageError::StateNotFound { .. }) => Ok(()),
        other => Err(format!("combined read: expected StateNotFound, got {other:?}")),
    }
}

async fn state_with_outputs_matches_separate_reads<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_states(&s, &[("g-1", "network")]).await?;
    s.update_content("g-1", make_content(3, &[("vpc_id", "d1"), ("subnet", "d2")]))
        .await
        .map_err(|e| e.to_string())?;
    s.set_output_schema("g-1", "vpc_id", SCHEMA, SchemaSource::Manual)
        .await
        .map_err(|e| e.to_string())?;

    let (state, outputs) = s.get_state_with_outputs("g-1").await.map_err(|e| e.to_string())?;
    if state != s.get_state("g-1").await.map_err(|e| e.to_string())? {
        return Err("state differs from get_state".to_string());
    }
    if outputs != s.list_outputs("g-1").await.map_err(|e| e.to_string())? {
        return Err("outputs differ from list_outputs".to_string());
    }
    let keys: Vec<&str> = outputs.iter().map(|o| o.key.as_str()).collect();
    if keys != ["subnet", "vpc_id"] {
        return Err(format!("expected outputs ordered by key, got {keys:?}"));
    }
    Ok(())
}
