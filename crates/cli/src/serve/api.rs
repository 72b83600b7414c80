//! JSON management API under `/api/v1`.
//!
//! Endpoints:
//! - POST   /api/v1/states                              - CreateState
//! - GET    /api/v1/states                              - ListStates
//! - GET    /api/v1/states/by-logic-id/{logic_id}       - lookup by logic id
//! - GET    /api/v1/states/{guid}                       - GetStateInfo
//! - PATCH  /api/v1/states/{guid}/labels                - UpdateLabels
//! - GET    /api/v1/states/{guid}/status                - edge status report
//! - GET    /api/v1/states/{guid}/dependencies          - incoming edges
//! - GET    /api/v1/states/{guid}/dependents            - outgoing edges
//! - GET    /api/v1/states/{guid}/topology?direction=   - layered traversal
//! - GET    /api/v1/states/{guid}/graph                 - upstream closure
//! - GET    /api/v1/states/{guid}/outputs               - output rows
//! - GET    /api/v1/states/{guid}/outputs/{key}/schema  - GetOutputSchema
//! - PUT    /api/v1/states/{guid}/outputs/{key}/schema  - SetOutputSchema
//! - POST   /api/v1/dependencies                        - AddDependency
//! - DELETE /api/v1/dependencies/{id}                   - RemoveDependency

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use stategraph_core::{AddDependency, CreateState, Direction, Error, ListStates};
use stategraph_storage::{LabelValue, Labels};

use super::handlers::ApiResult;
use super::state::AppState;

/// Query parameters prefixed with this are label filters.
const LABEL_PARAM_PREFIX: &str = "label.";

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/states", post(create_state).get(list_states))
        .route("/states/by-logic-id/{logic_id}", get(get_state_by_logic_id))
        .route("/states/{guid}", get(get_state_info))
        .route("/states/{guid}/labels", patch(update_labels))
        .route("/states/{guid}/status", get(state_status))
        .route("/states/{guid}/dependencies", get(list_dependencies))
        .route("/states/{guid}/dependents", get(list_dependents))
        .route("/states/{guid}/topology", get(topology))
        .route("/states/{guid}/graph", get(dependency_graph))
        .route("/states/{guid}/outputs", get(list_outputs))
        .route(
            "/states/{guid}/outputs/{key}/schema",
            get(get_output_schema).put(set_output_schema),
        )
        .route("/dependencies", post(add_dependency))
        .route("/dependencies/{id}", delete(remove_dependency))
}

async fn create_state(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateState>,
) -> ApiResult<impl IntoResponse> {
    let created = state.engine.create_state(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Label filter values are read as JSON scalars when they parse as one
/// (`label.tier=1`, `label.prod=true`, `label.code="1"`), otherwise as
/// plain strings.
fn label_value(raw: &str) -> LabelValue {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Bool(b)) => LabelValue::Bool(b),
        Ok(Value::Number(n)) => n
            .as_f64()
            .map(LabelValue::Number)
            .unwrap_or_else(|| LabelValue::String(raw.to_string())),
        Ok(Value::String(s)) => LabelValue::String(s),
        _ => LabelValue::String(raw.to_string()),
    }
}

fn list_request(params: &HashMap<String, String>) -> Result<ListStates, Error> {
    let page_size = params
        .get("page_size")
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| Error::InvalidArgument(format!("invalid page_size '{raw}'")))
        })
        .transpose()?;
    let labels: Labels = params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(LABEL_PARAM_PREFIX)
                .map(|key| (key.to_string(), label_value(v)))
        })
        .collect();
    Ok(ListStates {
        labels,
        logic_id_prefix: params.get("logic_id_prefix").cloned(),
        page_size,
        page_token: params.get("page_token").cloned(),
    })
}

async fn list_states(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let page = state.engine.list_states(list_request(&params)?).await?;
    Ok(Json(page))
}

async fn get_state_by_logic_id(
    State(state): State<Arc<AppState>>,
    Path(logic_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_state_by_logic_id(&logic_id).await?))
}

async fn get_state_info(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_state_info(&guid).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LabelsPatch {
    adds: Labels,
    removals: Vec<String>,
}

async fn update_labels(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    Json(patch): Json<LabelsPatch>,
) -> ApiResult<impl IntoResponse> {
    let updated = state
        .engine
        .update_labels(&guid, patch.adds, patch.removals)
        .await?;
    Ok(Json(updated))
}

async fn state_status(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.state_status(&guid).await?))
}

async fn list_dependencies(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let edges = state.engine.list_dependencies(&guid).await?;
    Ok(Json(serde_json::json!({ "edges": edges })))
}

async fn list_dependents(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let edges = state.engine.list_dependents(&guid).await?;
    Ok(Json(serde_json::json!({ "edges": edges })))
}

#[derive(Debug, Default, Deserialize)]
struct TopologyQuery {
    direction: Option<String>,
}

async fn topology(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    Query(query): Query<TopologyQuery>,
) -> ApiResult<impl IntoResponse> {
    let direction = match query.direction.as_deref() {
        Some(raw) => raw.parse::<Direction>()?,
        None => Direction::Upstream,
    };
    let layers = state.engine.topological_order(&guid, direction).await?;
    Ok(Json(serde_json::json!({
        "root": guid,
        "direction": direction,
        "layers": layers,
    })))
}

async fn dependency_graph(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.dependency_graph(&guid).await?))
}

async fn list_outputs(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outputs = state.engine.list_outputs(&guid).await?;
    Ok(Json(serde_json::json!({ "outputs": outputs })))
}

async fn get_output_schema(
    State(state): State<Arc<AppState>>,
    Path((guid, key)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_output_schema(&guid, &key).await?))
}

/// The request body is the JSON Schema itself.
async fn set_output_schema(
    State(state): State<Arc<AppState>>,
    Path((guid, key)): Path<(String, String)>,
    Json(schema): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let row = state
        .engine
        .set_output_schema(&guid, &key, &schema.to_string())
        .await?;
    Ok(Json(row))
}

async fn add_dependency(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDependency>,
) -> ApiResult<impl IntoResponse> {
    let added = state.engine.add_dependency(req).await?;
    let status = if added.already_exists {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(added)))
}

async fn remove_dependency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.engine.remove_dependency(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
