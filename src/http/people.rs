use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{Assignment, User, UserAssignment};

use super::reservations::RecordQuery;
use super::{ApiError, ApiResult, AppState, PathId, QueryParams};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/{id}", get(get_user))
        .route("/assignments", get(list_assignments))
        .route("/assignments/users", get(assigned_users))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.engine.list_users().await?))
}

async fn get_user(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<Json<User>> {
    Ok(Json(state.engine.get_user(id).await?))
}

async fn list_assignments(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<RecordQuery>,
) -> ApiResult<Json<Vec<Assignment>>> {
    Ok(Json(state.engine.list_assignments(query.filter()?).await?))
}

/// Either an instant (`at`) or a window (`start` + `end`).
#[derive(Debug, Deserialize)]
struct AssignedQuery {
    at: Option<DateTime<Utc>>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn assigned_users(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<AssignedQuery>,
) -> ApiResult<Json<Vec<UserAssignment>>> {
    let users = match (query.at, query.start, query.end) {
        (Some(at), None, None) => state.engine.assigned_users_at(at).await?,
        (None, Some(start), Some(end)) => state.engine.assigned_users_in_range(start, end).await?,
        _ => return Err(ApiError::validation("pass either `at` or both `start` and `end`")),
    };
    Ok(Json(users))
}
