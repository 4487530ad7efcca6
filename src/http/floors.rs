use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::image::sniff_image;
use crate::limits::MAX_FLOOR_PLAN_BYTES;
use crate::model::{DeleteFloor, Floor, NewFloor};

use super::{ApiError, ApiResult, AppState, PathId, QueryParams};

/// Room for the text fields and multipart framing around the image.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/floors",
            post(create_floor)
                .layer(DefaultBodyLimit::max(MAX_FLOOR_PLAN_BYTES + MULTIPART_OVERHEAD))
                .get(list_floors),
        )
        .route("/floors/ids", get(list_floor_ids))
        .route("/floors/{id}", get(get_floor).delete(delete_floor))
        .route("/floors/{id}/availability", get(availability))
}

struct FloorUpload {
    name: Option<String>,
    address: Option<String>,
    image: Option<(String, Bytes)>,
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<FloorUpload> {
    let mut upload = FloorUpload { name: None, address: None, image: None };
    let bad = |e: axum::extract::multipart::MultipartError| ApiError::validation(e.body_text());
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("name") => upload.name = Some(field.text().await.map_err(bad)?),
            Some("address") => upload.address = Some(field.text().await.map_err(bad)?),
            Some("image") => {
                let file_name = field.file_name().unwrap_or("floor-plan").to_string();
                upload.image = Some((file_name, field.bytes().await.map_err(bad)?));
            }
            _ => {}
        }
    }
    Ok(upload)
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ApiError::validation(format!("multipart field `{field}` is required"))),
    }
}

#[tracing::instrument(skip_all)]
async fn create_floor(State(state): State<AppState>, multipart: Multipart) -> ApiResult<(StatusCode, Json<Floor>)> {
    let upload = read_upload(multipart).await?;
    let name = required(upload.name, "name")?;
    let address = required(upload.address, "address")?;
    let (file_name, image) = upload
        .image
        .ok_or_else(|| ApiError::validation("multipart field `image` is required"))?;
    if image.len() > MAX_FLOOR_PLAN_BYTES {
        return Err(ApiError::validation(format!("image larger than {MAX_FLOOR_PLAN_BYTES} bytes")));
    }
    let content_type = sniff_image(&image).ok_or_else(|| ApiError::validation("image must be png or jpeg"))?;

    let image_id = state.images.upload(&file_name, content_type, image).await?;
    let floor = state
        .engine
        .create_floor(NewFloor {
            name,
            address,
            download_url: state.download_url.render(&image_id),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(floor)))
}

async fn list_floors(State(state): State<AppState>) -> ApiResult<Json<Vec<Floor>>> {
    Ok(Json(state.engine.list_floors().await?))
}

async fn list_floor_ids(State(state): State<AppState>) -> ApiResult<Json<Vec<Ulid>>> {
    Ok(Json(state.engine.list_floor_ids().await?))
}

async fn get_floor(State(state): State<AppState>, PathId(id): PathId) -> ApiResult<Json<Floor>> {
    Ok(Json(state.engine.get_floor(id).await?))
}

/// The body is optional; an absent body means `force_delete: false`.
async fn delete_floor(State(state): State<AppState>, PathId(id): PathId, body: Bytes) -> ApiResult<StatusCode> {
    let opts: DeleteFloor = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteFloor::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(format!("invalid body: {e}")))?
    };
    state.engine.remove_floor(id, opts).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Availability {
    floor_id: Ulid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    workspace_ids: Vec<Ulid>,
}

async fn availability(
    State(state): State<AppState>,
    PathId(floor_id): PathId,
    QueryParams(window): QueryParams<WindowQuery>,
) -> ApiResult<Json<Availability>> {
    let workspace_ids = state
        .engine
        .available_workspaces(floor_id, window.start, window.end)
        .await?;
    Ok(Json(Availability {
        floor_id,
        start: window.start,
        end: window.end,
        workspace_ids,
    }))
}
