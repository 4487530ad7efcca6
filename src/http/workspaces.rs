use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::AssignmentStatus;
use crate::model::{AssignedWorkspace, AssignedWorkspaceInput, Offering, Properties, Workspace, WorkspaceInput};

use super::floors::WindowQuery;
use super::{ApiResult, AppState, JsonBody, PathId, QueryParams};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/workspaces", post(create_workspace).get(list_workspaces))
        .route("/workspaces/assigned", post(create_assigned_workspace))
        .route(
            "/workspaces/{id}",
            get(get_workspace)
                .put(upsert_workspace)
                .patch(update_workspace)
                .delete(delete_workspace),
        )
        .route("/workspaces/{id}/properties", patch(update_properties))
        .route("/workspaces/{id}/assignment", get(assignment_status))
        .route("/workspaces/{id}/offering", get(covering_offering))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    floor_id: Option<Ulid>,
}

async fn create_workspace(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<WorkspaceInput>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let workspace = state.engine.create_workspace(input).await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn create_assigned_workspace(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<AssignedWorkspaceInput>,
) -> ApiResult<(StatusCode, Json<AssignedWorkspace>)> {
    let created = state.engine.create_assigned_workspace(input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// 201 when the id was new, 200 when an existing workspace was overwritten.
async fn upsert_workspace(
    State(state): State<AppState>,
    PathId(id): PathId,
    JsonBody(input): JsonBody<WorkspaceInput>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let (workspace, created) = state.engine.upsert_workspace(id, input).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(workspace)))
}

async fn list_workspaces(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> ApiResult<Json<Vec<Workspace>>> {
    Ok(Json(state.engine.list_workspaces(query.floor_id).await?))
}

async fn get_workspace(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<Json<Workspace>> {
    Ok(Json(state.engine.get_workspace(id).await?))
}

async fn update_workspace(
    State(state): State<AppState>,
    PathId(id): PathId,
    JsonBody(input): JsonBody<WorkspaceInput>,
) -> ApiResult<Json<Workspace>> {
    Ok(Json(state.engine.update_workspace(id, input).await?))
}

async fn update_properties(
    State(state): State<AppState>,
    PathId(id): PathId,
    JsonBody(properties): JsonBody<Properties>,
) -> ApiResult<Json<Workspace>> {
    Ok(Json(state.engine.update_workspace_properties(id, properties).await?))
}

async fn delete_workspace(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<StatusCode> {
    state.engine.remove_workspace(id).await?;
    Ok(StatusCode::OK)
}

async fn assignment_status(
    State(state): State<AppState>,
    PathId(id): PathId,
    QueryParams(window): QueryParams<WindowQuery>,
) -> ApiResult<Json<AssignmentStatus>> {
    Ok(Json(state.engine.assignment_status(id, window.start, window.end).await?))
}

async fn covering_offering(
    State(state): State<AppState>,
    PathId(id): PathId,
    QueryParams(window): QueryParams<WindowQuery>,
) -> ApiResult<Json<Offering>> {
    Ok(Json(state.engine.offering_covering(id, window.start, window.end).await?))
}
