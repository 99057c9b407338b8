//! Control API
//!
//! Loopback HTTP surface for the daemon. Every response uses the
//! `ApiResponse` envelope; errors map through `WardenError::status_code`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use warden_shared::{ApiResponse, StackAction, WardenError};

use crate::supervisor::Supervisor;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupList {
    pub snapshots: Vec<String>,
    pub latest: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanParams {
    #[serde(default)]
    pub remediate: bool,
}

pub fn create_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/stacks/:name/:action", post(stack_action))
        .route("/api/v1/drift/scan", post(drift_scan))
        .route("/api/v1/backups", post(create_backup).get(list_backups))
        .with_state(supervisor)
        .layer(TraceLayer::new_for_http())
}

/// Envelope a result: 200 with data, or the error's own status and code
fn respond<T: Serialize>(result: warden_shared::Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &WardenError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<()>::error(e.error_code(), e.to_string()))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        service: "warden".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn get_status(State(sup): State<Arc<Supervisor>>) -> Response {
    respond(sup.status().await.map(|(snapshot, _)| snapshot))
}

async fn stack_action(
    State(sup): State<Arc<Supervisor>>,
    Path((name, action)): Path<(String, StackAction)>,
) -> Response {
    respond(sup.stack_action(&name, action).await)
}

async fn drift_scan(State(sup): State<Arc<Supervisor>>, Query(params): Query<ScanParams>) -> Response {
    respond(sup.drift(params.remediate).await)
}

async fn create_backup(State(sup): State<Arc<Supervisor>>) -> Response {
    respond(sup.backup().await)
}

async fn list_backups(State(sup): State<Arc<Supervisor>>) -> Response {
    respond(
        sup.list_backups()
            .map(|(snapshots, latest)| BackupList { snapshots, latest }),
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{StackConfig, WardenConfig};
    use crate::health::tests::serve;
    use crate::stack::tests::FakeStack;
    use std::path::PathBuf;
    use warden_shared::{Phase, PlatformStatusSnapshot, ServiceCategory, ServiceDescriptor, StackRef};

    async fn api(dir: &std::path::Path) -> String {
        let target = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        let mut search = ServiceDescriptor::native("search", Phase::Containers, "unused", &[], &format!("{}/", target));
        search.category = ServiceCategory::Stack;
        search.command = None;
        search.stack = Some(StackRef {
            compose_file: PathBuf::from("stacks/search.yml"),
            project: None,
            services: Vec::new(),
        });
        let config = WardenConfig {
            project_root: dir.to_path_buf(),
            services: vec![search],
            stacks: StackConfig {
                grace_ms: 0,
                ..StackConfig::default()
            },
            ..WardenConfig::default()
        };
        let fake = Arc::new(FakeStack::default());
        let sup = Supervisor::with_system(config, &dir.join("warden.toml"), fake.clone(), fake).unwrap();
        serve(create_router(Arc::new(sup))).await
    }

    #[tokio::test]
    async fn test_status_route_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let base = api(dir.path()).await;

        let body: ApiResponse<PlatformStatusSnapshot> = reqwest::get(format!("{}/api/v1/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.success);
        assert_eq!(body.data.unwrap().up_count(), 1);
    }

    #[tokio::test]
    async fn test_stack_actions_are_a_closed_set() {
        let dir = tempfile::tempdir().unwrap();
        let base = api(dir.path()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/v1/stacks/search/up", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["up"], true);

        let resp = client
            .post(format!("{}/api/v1/stacks/search/explode", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/api/v1/stacks/nope/status", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "SERVICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_backup_routes() {
        let dir = tempfile::tempdir().unwrap();
        let base = api(dir.path()).await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{}/api/v1/backups", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: ApiResponse<BackupList> = client
            .get(format!("{}/api/v1/backups", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let list = body.data.unwrap();
        assert_eq!(list.snapshots.len(), 1);
        assert_eq!(list.latest, list.snapshots.first().cloned());
    }
}
