//! Terraform HTTP backend protocol.
//!
//! - `GET    /tfstate/{guid}`          state document, 404 when none
//! - update  `/tfstate/{guid}`         store a new document (`?ID=` lock id)
//! - lock    `/tfstate/{guid}/lock`    body is Terraform `LockInfo`
//! - unlock  `/tfstate/{guid}/unlock`  lock id from the body or `?ID=`
//!
//! Update, lock and unlock verbs come from `[tfstate]` in the config, so
//! each route is registered with `any` and dispatched on the method here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use stategraph_core::Error;
use stategraph_storage::LockInfo;

use super::handlers::{ApiError, ApiResult};
use super::state::AppState;

/// Query parameter Terraform uses to pass the lock id.
const LOCK_ID_PARAM: &str = "ID";

fn method_not_allowed(method: &Method) -> Response {
    super::json_error(
        StatusCode::METHOD_NOT_ALLOWED,
        &format!("method {method} is not supported here"),
    )
    .into_response()
}

fn parse_lock_info(body: &[u8]) -> Result<LockInfo, Error> {
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("invalid lock info: {e}")))
}

/// /tfstate/{guid}
pub(crate) async fn handle_state(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    body: Bytes,
) -> ApiResult<Response> {
    if method == Method::GET {
        return match state.engine.get_content(&guid).await? {
            Some(content) => Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                content,
            )
                .into_response()),
            None => Ok(super::json_error(StatusCode::NOT_FOUND, "state has no content")
                .into_response()),
        };
    }
    if state.methods.update.contains(&method) {
        let lock_id = query.get(LOCK_ID_PARAM).cloned();
        let outcome = state
            .engine
            .update_content(&guid, body.to_vec(), lock_id, None)
            .await?;
        tracing::debug!(
            guid = %outcome.state.guid,
            producer_updated = outcome.producer_edges.updated,
            consumer_updated = outcome.consumer_edges.updated,
            "tfstate update"
        );
        return Ok(StatusCode::OK.into_response());
    }
    Ok(method_not_allowed(&method))
}

/// /tfstate/{guid}/lock
pub(crate) async fn handle_lock(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    method: Method,
    body: Bytes,
) -> ApiResult<Response> {
    if !state.methods.lock.contains(&method) {
        return Ok(method_not_allowed(&method));
    }
    let info = parse_lock_info(&body)?;
    state.engine.lock(&guid, info).await?;
    Ok(StatusCode::OK.into_response())
}

/// /tfstate/{guid}/unlock
pub(crate) async fn handle_unlock(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    body: Bytes,
) -> ApiResult<Response> {
    if !state.methods.unlock.contains(&method) {
        return Ok(method_not_allowed(&method));
    }
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(parse_lock_info(&body)?.id)
    };
    let lock_id = from_body
        .filter(|id| !id.is_empty())
        .or_else(|| query.get(LOCK_ID_PARAM).cloned())
        .ok_or_else(|| {
            ApiError(Error::InvalidArgument(
                "unlock requires a lock id in the body or the ID query parameter".into(),
            ))
        })?;
    state.engine.unlock(&guid, &lock_id).await?;
    Ok(StatusCode::OK.into_response())
}
