//! Bookings and offerings share one route shape: create, list with filters,
//! get (optionally expanded), update, and DELETE meaning cancel.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Booking, Offering, ReservationInput, Span};
use crate::store::RecordFilter;

use super::{ApiError, ApiResult, AppState, JsonBody, PathId, QueryParams};

pub(super) fn booking_routes() -> Router<AppState> {
    Router::new()
        .route("/bookings", get(list_bookings).post(create_booking))
        .route(
            "/bookings/{id}",
            get(get_booking).patch(update_booking).delete(cancel_booking),
        )
}

pub(super) fn offering_routes() -> Router<AppState> {
    Router::new()
        .route("/offerings", get(list_offerings).post(create_offering))
        .route(
            "/offerings/{id}",
            get(get_offering).patch(update_offering).delete(cancel_offering),
        )
}

/// List filters. At most one of workspace, user or time range applies.
#[derive(Debug, Default, Deserialize)]
pub(super) struct RecordQuery {
    pub workspace_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expand: bool,
}

impl RecordQuery {
    pub fn filter(&self) -> ApiResult<RecordFilter> {
        let range = match (self.start, self.end) {
            (None, None) => None,
            (Some(start), Some(end)) => Some(
                Span::from_times(&start, &end)
                    .ok_or_else(|| ApiError::validation("start must be before end"))?,
            ),
            _ => return Err(ApiError::validation("start and end must be given together")),
        };
        match (self.workspace_id, self.user_id, range) {
            (None, None, None) => Ok(RecordFilter::All),
            (Some(id), None, None) => Ok(RecordFilter::Workspace(id)),
            (None, Some(id), None) => Ok(RecordFilter::User(id)),
            (None, None, Some(span)) => Ok(RecordFilter::Range(span)),
            _ => Err(ApiError::validation(
                "filter by one of workspace_id, user_id or start/end",
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExpandQuery {
    #[serde(default)]
    expand: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

async fn create_booking(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ReservationInput>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = state.engine.create_booking(input).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn list_bookings(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<RecordQuery>,
) -> ApiResult<Response> {
    let filter = query.filter()?;
    if query.expand {
        Ok(Json(state.engine.list_expanded_bookings(filter).await?).into_response())
    } else {
        Ok(Json(state.engine.list_bookings(filter).await?).into_response())
    }
}

async fn get_booking(
    State(state): State<AppState>,
    PathId(id): PathId,
    QueryParams(query): QueryParams<ExpandQuery>,
) -> ApiResult<Response> {
    if query.expand {
        Ok(Json(state.engine.get_expanded_booking(id).await?).into_response())
    } else {
        Ok(Json(state.engine.get_booking(id).await?).into_response())
    }
}

async fn update_booking(
    State(state): State<AppState>,
    PathId(id): PathId,
    JsonBody(input): JsonBody<ReservationInput>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.update_booking(id, input).await?))
}

async fn cancel_booking(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.cancel_booking(id).await?))
}

// ── Offerings ────────────────────────────────────────────────────

async fn create_offering(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ReservationInput>,
) -> ApiResult<(StatusCode, Json<Offering>)> {
    let offering = state.engine.create_offering(input).await?;
    Ok((StatusCode::CREATED, Json(offering)))
}

async fn list_offerings(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<RecordQuery>,
) -> ApiResult<Response> {
    let filter = query.filter()?;
    if query.expand {
        Ok(Json(state.engine.list_expanded_offerings(filter).await?).into_response())
    } else {
        Ok(Json(state.engine.list_offerings(filter).await?).into_response())
    }
}

async fn get_offering(
    State(state): State<AppState>,
    PathId(id): PathId,
    QueryParams(query): QueryParams<ExpandQuery>,
) -> ApiResult<Response> {
    if query.expand {
        Ok(Json(state.engine.get_expanded_offering(id).await?).into_response())
    } else {
        Ok(Json(state.engine.get_offering(id).await?).into_response())
    }
}

async fn update_offering(
    State(state): State<AppState>,
    PathId(id): PathId,
    JsonBody(input): JsonBody<ReservationInput>,
) -> ApiResult<Json<Offering>> {
    Ok(Json(state.engine.update_offering(id, input).await?))
}

async fn cancel_offering(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<Json<Offering>> {
    Ok(Json(state.engine.cancel_offering(id).await?))
}
