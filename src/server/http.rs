//! HTTP surface of the orchestrator

use super::auth::AuthUser;
use super::error::ServiceResult;
use super::storage::LocalStorage;
use super::AppState;
use crate::upload::types::{
    CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    WatchResponse,
};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState, local_storage: Option<Arc<LocalStorage>>) -> Router {
    let api = Router::new()
        .route("/api/recordings/upload/init", post(init_upload))
        .route("/api/recordings/upload/complete", post(complete_upload))
        .route("/api/watch/{share_token}", get(watch))
        .route("/health", get(health))
        .with_state(state);

    let app = match local_storage {
        Some(storage) => api.merge(storage.routes()),
        None => api,
    };
    app.layer(TraceLayer::new_for_http())
}

async fn init_upload(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(request): Json<InitUploadRequest>,
) -> ServiceResult<Json<InitUploadResponse>> {
    state.orchestrator.init(&principal, &request).await.map(Json)
}

async fn complete_upload(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(request): Json<CompleteUploadRequest>,
) -> ServiceResult<Json<CompleteUploadResponse>> {
    state.orchestrator.complete(&principal, &request).await.map(Json)
}

async fn watch(
    State(state): State<AppState>,
    Path(share_token): Path<String>,
) -> ServiceResult<Json<WatchResponse>> {
    state.orchestrator.watch(&share_token).await.map(Json)
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::JwtService;
    use crate::server::models::Tier;
    use crate::server::orchestrator::{OrchestratorSettings, UploadOrchestrator};
    use crate::server::repository::MemoryRepository;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<JwtService>) {
        let storage = Arc::new(LocalStorage::new("http://localhost:8080", "secret").unwrap());
        let orchestrator = UploadOrchestrator::new(
            Arc::new(MemoryRepository::new()),
            storage.clone(),
            OrchestratorSettings::default(),
        );
        let jwt = Arc::new(JwtService::new("test-secret"));
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            jwt: jwt.clone(),
        };
        (router(state, Some(storage)), jwt)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_init_requires_bearer_token() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::post("/api/recordings/upload/init")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"estimatedSize":10,"partCount":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_init_returns_one_url_per_part() {
        let (app, jwt) = app();
        let token = jwt.issue("alice", Tier::Free, chrono::Duration::hours(1)).unwrap();
        let response = app
            .oneshot(
                Request::post("/api/recordings/upload/init")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::from(r#"{"estimatedSize":12000000,"partCount":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let init: InitUploadResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(init.upload_urls.len(), 3);
        assert!(init.upload_urls[2].contains("/storage/parts/"));
    }

    #[tokio::test]
    async fn test_unknown_share_token_is_404() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/api/watch/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
