//! HTTP boundary: tile fetches, placement checks and point mutations.
//!
//! Session verification happens upstream; the verified user id arrives in
//! the `x-user-id` header. Every failure is rendered as the JSON envelope
//! `{success: false, error, requestId}`.

use crate::error::{GridError, GridResult};
use crate::events::EventBroadcaster;
use crate::repository::PointRepository;
use crate::restricted::{Direction, RestrictedSquareCalculator};
use crate::tile_store::{validate_tile_coords, TileFetch, TileService};
use crate::utils::http_date;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use shared::geometry::SlopeRegistry;
use shared::tile::TileBounds;
use shared::{within_world_bounds, Point, WORLD_BOUND};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const USER_HEADER: &str = "x-user-id";
pub const TILE_CACHE_CONTROL: &str = "public, max-age=10, s-maxage=10";

#[derive(Clone)]
pub struct AppState {
    pub points: Arc<dyn PointRepository>,
    pub tiles: Arc<TileService>,
    pub events: Arc<EventBroadcaster>,
    pub restricted: Arc<RestrictedSquareCalculator>,
    pub registry: Arc<RwLock<SlopeRegistry>>,
    pub reset_threshold: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub request_id: String,
}

/// A [`GridError`] tagged with the id of the request that produced it.
#[derive(Debug)]
pub struct ApiError {
    pub error: GridError,
    pub request_id: String,
}

impl From<GridError> for ApiError {
    fn from(error: GridError) -> Self {
        Self {
            error,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        GridError::validation(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.error {
            GridError::Internal(detail) => {
                error!("Request {} failed: {}", self.request_id, detail)
            }
            other => warn!("Request {} rejected: {}", self.request_id, other),
        }
        let body = ErrorEnvelope {
            success: false,
            error: self.error.client_message(),
            request_id: self.request_id,
        };
        (self.error.status_code(), Json(body)).into_response()
    }
}

/// Tile payload; `data` is the raw bitmap as comma-joined decimal bytes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileResponse {
    pub tile_x: i64,
    pub tile_y: i64,
    pub data: String,
    pub version: u32,
    pub last_updated_ms: i64,
    pub from_cache: bool,
    pub bounds: TileBounds,
}

impl From<&TileFetch> for TileResponse {
    fn from(fetch: &TileFetch) -> Self {
        let tile = &fetch.tile;
        Self {
            tile_x: tile.tile_x,
            tile_y: tile.tile_y,
            data: tile
                .data
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(","),
            version: tile.version,
            last_updated_ms: tile.last_updated_ms,
            from_cache: fetch.from_cache,
            bounds: tile.bounds(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedSquaresRequest {
    pub border_indices: Vec<i64>,
    pub current_position: [i64; 2],
    pub direction: Direction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SquaresData {
    pub squares: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlacePointRequest {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldStats {
    pub total_points: usize,
    pub non_origin_points: usize,
    pub reset_threshold: usize,
    pub oldest_prime_timestamp: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tiles/:tile_x/:tile_y", get(get_tile))
        .route("/api/restricted-squares", post(restricted_squares))
        .route("/api/points", post(place_point))
        .route("/api/points/:id", delete(delete_point))
        .route("/api/stats", get(world_stats))
        .with_state(state)
}

/// Parses an integer path segment, reporting failures as validation errors.
pub fn parse_path_integer(name: &str, raw: &str) -> GridResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| GridError::validation(format!("{} must be an integer, got {:?}", name, raw)))
}

fn authenticated_user(headers: &HeaderMap) -> GridResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GridError::Authentication("missing user session".to_string()))
}

async fn get_tile(
    State(state): State<AppState>,
    Path((raw_x, raw_y)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let tile_x = parse_path_integer("tileX", &raw_x)?;
    let tile_y = parse_path_integer("tileY", &raw_y)?;
    validate_tile_coords(tile_x, tile_y)?;

    let fetch = state
        .tiles
        .load_tile(tile_x, tile_y, state.points.as_ref())
        .await?;
    debug!(
        "Tile {},{} v{} served (cache: {})",
        tile_x, tile_y, fetch.tile.version, fetch.from_cache
    );

    let last_updated = fetch.tile.last_updated_ms;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(TILE_CACHE_CONTROL),
    );
    if let Ok(etag) = header::HeaderValue::from_str(&format!("\"{}\"", last_updated)) {
        headers.insert(header::ETAG, etag);
    }
    if let Some(modified) =
        http_date(last_updated).and_then(|d| header::HeaderValue::from_str(&d).ok())
    {
        headers.insert(header::LAST_MODIFIED, modified);
    }

    Ok((StatusCode::OK, headers, Json(TileResponse::from(&fetch))).into_response())
}

async fn restricted_squares(
    State(state): State<AppState>,
    payload: Result<Json<RestrictedSquaresRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<SquaresData>>, ApiError> {
    let Json(request) = payload?;
    let [px, py] = request.current_position;

    let points = state.points.get_all().await?;
    let squares = state.restricted.calculate(
        &request.border_indices,
        (px, py),
        request.direction,
        &points,
    )?;
    Ok(ApiResponse::ok(SquaresData { squares }))
}

async fn place_point(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PlacePointRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Point>>, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let Json(request) = payload?;
    if !within_world_bounds(request.x, request.y) {
        return Err(GridError::validation(format!(
            "coordinates ({}, {}) are outside ±{}",
            request.x, request.y, WORLD_BOUND
        ))
        .into());
    }

    let placement = state.points.add(&user_id, request.x, request.y).await?;
    if placement.created {
        state
            .tiles
            .invalidate_for_point(placement.point.x, placement.point.y)
            .await;
        state.events.emit_created(&placement.point).await;
    }
    Ok(ApiResponse::ok(placement.point))
}

async fn delete_point(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<ApiResponse<Point>>, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let id = parse_path_integer("id", &raw_id)?;
    let owned = state
        .points
        .get_by_user(&user_id)
        .await?
        .into_iter()
        .any(|p| p.id == id);
    if !owned {
        return Err(GridError::NotFound(format!("point {}", id)).into());
    }

    let point = state
        .points
        .delete(id)
        .await?
        .ok_or_else(|| GridError::NotFound(format!("point {}", id)))?;
    state.tiles.invalidate_for_point(point.x, point.y).await;
    state.events.emit_deleted(&point, 1).await;
    Ok(ApiResponse::ok(point))
}

async fn world_stats(State(state): State<AppState>) -> Result<Json<ApiResponse<WorldStats>>, ApiError> {
    let stats = WorldStats {
        total_points: state.points.get_total_count().await?,
        non_origin_points: state.points.get_count_excluding_origin().await?,
        reset_threshold: state.reset_threshold,
        oldest_prime_timestamp: state.registry.read().await.oldest_prime_timestamp(),
    };
    Ok(ApiResponse::ok(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryPointRepository;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use shared::events::ServerEvent;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            points: Arc::new(InMemoryPointRepository::new()),
            tiles: Arc::new(TileService::default()),
            events: Arc::new(EventBroadcaster::new()),
            restricted: Arc::new(RestrictedSquareCalculator::new()),
            registry: Arc::new(RwLock::new(SlopeRegistry::new())),
            reset_threshold: 800,
        }
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_parse_path_integer() {
        assert_eq!(parse_path_integer("tileX", "-16").unwrap(), -16);
        assert!(parse_path_integer("tileX", "1.5").is_err());
        assert!(parse_path_integer("tileX", "abc").is_err());
        assert!(parse_path_integer("tileX", "NaN").is_err());
    }

    #[tokio::test]
    async fn test_tile_fetch_payload_and_headers() {
        let state = state();
        state.points.add("alice", 0, 0).await.unwrap();

        let (status, headers, body) = send(&state, get("/api/tiles/0/0")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], TILE_CACHE_CONTROL);

        let last_updated = body["lastUpdatedMs"].as_i64().unwrap();
        assert_eq!(
            headers[header::ETAG].to_str().unwrap(),
            format!("\"{}\"", last_updated)
        );
        assert!(headers.contains_key(header::LAST_MODIFIED));

        let data = body["data"].as_str().unwrap();
        let bytes: Vec<&str> = data.split(',').collect();
        assert_eq!(bytes.len(), 512);
        assert_eq!(bytes[0], "128");
        assert_eq!(body["fromCache"], false);
        assert_eq!(body["bounds"], json!({"minX": 0, "minY": 0, "maxX": 63, "maxY": 63}));

        let (_, _, again) = send(&state, get("/api/tiles/0/0")).await;
        assert_eq!(again["fromCache"], true);
    }

    #[tokio::test]
    async fn test_tile_out_of_range_is_client_error() {
        let state = state();
        let (status, _, body) = send(&state, get("/api/tiles/17/0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["requestId"].as_str().is_some());

        let (status, _, _) = send(&state, get("/api/tiles/0.5/0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_place_point_requires_user() {
        let state = state();
        let (status, _, body) =
            send(&state, post_json("/api/points", None, json!({"x": 1, "y": 2}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_place_point_validates_bounds() {
        let state = state();
        let (status, _, _) = send(
            &state,
            post_json("/api/points", Some("alice"), json!({"x": 1001, "y": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(
            &state,
            post_json("/api/points", Some("alice"), json!({"x": 1.5, "y": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.points.get_total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_place_point_broadcasts_and_invalidates() {
        let state = state();
        let mut rx = state.events.subscribe();

        let (_, _, before) = send(&state, get("/api/tiles/0/0")).await;
        let (status, _, body) = send(
            &state,
            post_json("/api/points", Some("alice"), json!({"x": 3, "y": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["userId"], "alice");

        match rx.recv().await.unwrap() {
            ServerEvent::BasePointChanged { point } => assert_eq!((point.x, point.y), (3, 4)),
            other => panic!("Unexpected event {:?}", other),
        }

        let (_, _, after) = send(&state, get("/api/tiles/0/0")).await;
        assert_eq!(after["fromCache"], false);
        assert_ne!(after["data"], before["data"]);
    }

    #[tokio::test]
    async fn test_restricted_squares_endpoint() {
        let state = state();
        let (status, _, body) = send(
            &state,
            post_json(
                "/api/restricted-squares",
                None,
                json!({"borderIndices": [1, 16, 17, 19], "currentPosition": [0, 0], "direction": "up"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["squares"], json!([1, 16, 17]));
    }

    #[tokio::test]
    async fn test_restricted_squares_rejects_bad_direction() {
        let state = state();
        let (status, _, body) = send(
            &state,
            post_json(
                "/api/restricted-squares",
                None,
                json!({"borderIndices": [1], "currentPosition": [0, 0], "direction": "sideways"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_restricted_squares_rejects_position_outside_world() {
        let state = state();
        for position in [json!([1001, 0]), json!([i64::MAX, 0])] {
            let (status, _, body) = send(
                &state,
                post_json(
                    "/api/restricted-squares",
                    None,
                    json!({"borderIndices": [1], "currentPosition": position, "direction": "up"}),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test]
    async fn test_delete_point_with_malformed_id() {
        let state = state();
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/points/abc")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["requestId"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_delete_point_only_by_owner() {
        let state = state();
        let placed = state.points.add("alice", 5, 5).await.unwrap().point;
        let uri = format!("/api/points/{}", placed.id);

        let request = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .header(USER_HEADER, "mallory")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], placed.id);
        assert_eq!(state.points.get_total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_world_stats() {
        let state = state();
        state.points.add("a", 0, 0).await.unwrap();
        state.points.add("a", 4, 9).await.unwrap();

        let (status, _, body) = send(&state, get("/api/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["totalPoints"], 2);
        assert_eq!(body["data"]["nonOriginPoints"], 1);
        assert_eq!(body["data"]["resetThreshold"], 800);
        assert_eq!(body["data"]["oldestPrimeTimestamp"], Value::Null);
    }
}
