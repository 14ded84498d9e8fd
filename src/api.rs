use crate::config::ApiConfig;
use crate::download_gate::{request_download, GateError};
use crate::image_store::{
    ImageFilter, ImageRecord, ImageStore, ImageUpdate, NewImage, PremiumAccess, Tag,
};
use crate::object_store::ObjectStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ImageStore>,
    pub objects: Arc<ObjectStore>,
}

/// Uniform response envelope: a success flag plus either data or a
/// short error message.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageListQuery {
    /// Comma-separated tag names
    pub tags: Option<String>,
    pub is_premium: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Pagination for favorites
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlResponse {
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteRequest {
    pub image_id: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumRequest {
    pub user_id: String,
}

/// Parse a comma-separated tag list, rejecting names outside the fixed
/// category set.
fn parse_tags(raw: &str) -> Result<Vec<Tag>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Tag>())
        .collect()
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/images", get(list_images).post(create_image))
        .route(
            "/api/images/:id",
            get(get_image).put(update_image).delete(delete_image),
        )
        .route("/api/images/:id/download", post(download_image))
        .route(
            "/api/users/:user_id/favorites",
            get(list_favorites).post(add_favorite),
        )
        .route(
            "/api/users/:user_id/favorites/:image_id",
            delete(remove_favorite),
        )
        .route("/api/users/premium", post(grant_premium))
        .route(
            "/api/users/premium/:user_id",
            get(premium_details).delete(revoke_premium),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gallery-service"
    }))
}

/// Readiness endpoint; pings the database
async fn readiness_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        })),
        Err(e) => Json(serde_json::json!({
            "status": "not_ready",
            "database": "disconnected",
            "error": e.to_string()
        })),
    }
}

/// List images with filtering and pagination
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ImageListQuery>,
) -> Json<ApiResponse<Vec<ImageRecord>>> {
    let tags = match params.tags.as_deref() {
        Some(raw) => match parse_tags(raw) {
            Ok(tags) if tags.is_empty() => None,
            Ok(tags) => Some(tags),
            Err(e) => return ApiResponse::err(e),
        },
        None => None,
    };

    let filter = ImageFilter {
        tags,
        is_premium: params.is_premium,
        page: params.page.unwrap_or(1),
        limit: params.limit.unwrap_or(20),
    };

    match state.store.list_images(&filter).await {
        Ok(images) => ApiResponse::ok(images),
        Err(e) => {
            error!(error = %e, "Failed to fetch images");
            ApiResponse::err("Failed to fetch images")
        }
    }
}

/// Get a single image
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Json<ApiResponse<ImageRecord>> {
    match state.store.get_image(id).await {
        Ok(Some(image)) => ApiResponse::ok(image),
        Ok(None) => ApiResponse::err("Image not found"),
        Err(e) => {
            error!(error = %e, "Failed to fetch image");
            ApiResponse::err("Failed to fetch image")
        }
    }
}

/// Create an image (admin/import path)
#[instrument(skip(state, image))]
async fn create_image(
    State(state): State<AppState>,
    Json(image): Json<NewImage>,
) -> Json<ApiResponse<ImageRecord>> {
    match state.store.create_image(&image).await {
        Ok(created) => ApiResponse::ok(created),
        Err(e) => {
            error!(error = %e, "Failed to create image");
            ApiResponse::err("Failed to create image")
        }
    }
}

/// Update image metadata
#[instrument(skip(state, update))]
async fn update_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(update): Json<ImageUpdate>,
) -> Json<ApiResponse<ImageRecord>> {
    match state.store.update_image(id, &update).await {
        Ok(Some(updated)) => ApiResponse::ok(updated),
        Ok(None) => ApiResponse::err("Image not found"),
        Err(e) => {
            error!(error = %e, "Failed to update image");
            ApiResponse::err("Failed to update image")
        }
    }
}

/// Delete an image
#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Json<ApiResponse<ImageRecord>> {
    match state.store.delete_image(id).await {
        Ok(Some(deleted)) => ApiResponse::ok(deleted),
        Ok(None) => ApiResponse::err("Image not found"),
        Err(e) => {
            error!(error = %e, "Failed to delete image");
            ApiResponse::err("Failed to delete image")
        }
    }
}

/// Gate and issue a time-limited download URL
#[instrument(skip(state, request))]
async fn download_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(request): Json<DownloadRequest>,
) -> Json<ApiResponse<DownloadUrlResponse>> {
    if request.user_id.is_empty() {
        return ApiResponse::err("User ID is required");
    }

    match request_download(
        state.store.as_ref(),
        state.objects.as_ref(),
        id,
        &request.user_id,
    )
    .await
    {
        Ok(grant) => ApiResponse::ok(DownloadUrlResponse {
            download_url: grant.url,
            expires_at: grant.expires_at,
        }),
        Err(GateError::NotFound) => ApiResponse::err("Image not found"),
        Err(GateError::Forbidden) => {
            ApiResponse::err("Premium access required to download this image")
        }
        Err(GateError::Storage(e)) => {
            error!(error = %e, image_id = id, "Failed to generate download URL");
            ApiResponse::err("Failed to generate download URL")
        }
    }
}

/// List a user's favorite images
#[instrument(skip(state))]
async fn list_favorites(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<PageQuery>,
) -> Json<ApiResponse<Vec<ImageRecord>>> {
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(20);

    match state.store.list_favorites(&user_id, page, limit).await {
        Ok(images) => ApiResponse::ok(images),
        Err(e) => {
            error!(error = %e, "Failed to fetch favorites");
            ApiResponse::err("Failed to fetch favorites")
        }
    }
}

/// Add an image to a user's favorites (idempotent)
#[instrument(skip(state, request))]
async fn add_favorite(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<FavoriteRequest>,
) -> Json<ApiResponse<serde_json::Value>> {
    match state.store.add_favorite(request.image_id, &user_id).await {
        Ok(added) => ApiResponse::ok(serde_json::json!({ "added": added })),
        Err(e) => {
            error!(error = %e, "Failed to add favorite");
            ApiResponse::err("Failed to add favorite")
        }
    }
}

/// Remove one favorite pair
#[instrument(skip(state))]
async fn remove_favorite(
    State(state): State<AppState>,
    Path((user_id, image_id)): Path<(String, i32)>,
) -> Json<ApiResponse<serde_json::Value>> {
    match state.store.remove_favorite(image_id, &user_id).await {
        Ok(removed) => ApiResponse::ok(serde_json::json!({ "removed": removed })),
        Err(e) => {
            error!(error = %e, "Failed to remove favorite");
            ApiResponse::err("Failed to remove favorite")
        }
    }
}

/// Grant a premium entitlement (idempotent)
#[instrument(skip(state, request))]
async fn grant_premium(
    State(state): State<AppState>,
    Json(request): Json<PremiumRequest>,
) -> Json<ApiResponse<PremiumAccess>> {
    if request.user_id.is_empty() {
        return ApiResponse::err("User ID is required");
    }

    match state.store.grant_premium_access(&request.user_id).await {
        Ok(access) => ApiResponse::ok(access),
        Err(e) => {
            error!(error = %e, "Failed to grant premium access");
            ApiResponse::err("Failed to grant premium access")
        }
    }
}

/// Get the entitlement record for a user
#[instrument(skip(state))]
async fn premium_details(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<ApiResponse<PremiumAccess>> {
    match state.store.premium_access_details(&user_id).await {
        Ok(Some(access)) => ApiResponse::ok(access),
        Ok(None) => ApiResponse::err("Premium access not found"),
        Err(e) => {
            error!(error = %e, "Failed to fetch premium access");
            ApiResponse::err("Failed to fetch premium access")
        }
    }
}

/// Revoke a premium entitlement
#[instrument(skip(state))]
async fn revoke_premium(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<ApiResponse<serde_json::Value>> {
    match state.store.revoke_premium_access(&user_id).await {
        Ok(revoked) => ApiResponse::ok(serde_json::json!({ "revoked": revoked })),
        Err(e) => {
            error!(error = %e, "Failed to revoke premium access");
            ApiResponse::err("Failed to revoke premium access")
        }
    }
}

/// Start the storefront API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags("Kasiki,Studio").unwrap(),
            vec![Tag::Kasiki, Tag::Studio]
        );
        assert_eq!(parse_tags(" Nikah , Magazine ").unwrap(), vec![Tag::Nikah, Tag::Magazine]);
        assert_eq!(parse_tags("").unwrap(), Vec::<Tag>::new());
        assert!(parse_tags("Kasiki,Wedding").is_err());
    }

    #[test]
    fn test_envelope_omits_absent_fields() {
        let ok = ApiResponse::<i32>::ok(7);
        let json = serde_json::to_value(&ok.0).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 7);
        assert!(json.get("error").is_none());

        let err = ApiResponse::<i32>::err("Image not found");
        let json = serde_json::to_value(&err.0).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Image not found");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_download_response_is_camel_case() {
        let response = DownloadUrlResponse {
            download_url: "https://storage.test/signed/a.jpg".to_string(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("downloadUrl").is_some());
        assert!(json.get("expiresAt").is_some());
    }
}
