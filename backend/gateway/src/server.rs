//! Main HTTP Gateway Server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use pagecast_pipeline::Coordinator;
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes;

pub const SERVICE_NAME: &str = "pagecast";

/// Application state shared across routes.
#[derive(Clone)]
pub struct GatewayState {
    coordinator: Coordinator,
    access_keyword: Arc<str>,
    service: Arc<str>,
}

impl GatewayState {
    pub fn new(coordinator: Coordinator, access_keyword: &str) -> Self {
        Self {
            coordinator,
            access_keyword: Arc::from(access_keyword),
            service: Arc::from(SERVICE_NAME),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn access_keyword(&self) -> &str {
        &self.access_keyword
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(routes::banner))
        .route("/start", post(routes::start))
        .route("/stop", post(routes::stop))
        .route("/status", get(routes::status))
        .fallback(routes::not_found)
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
#[instrument(skip(state, shutdown))]
pub async fn start_server<F>(addr: SocketAddr, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway HTTP server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    info!("Gateway HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use pagecast_core::SessionState;
    use pagecast_core::mock::{MockEncoderBehavior, MockEncoderSpawner, MockLauncher, MockRenderer};
    use pagecast_pipeline::PipelineSettings;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn coordinator(stream_key: Option<&str>) -> Coordinator {
        let mut settings = PipelineSettings {
            target_url: "https://dashboard.example/board".into(),
            ..Default::default()
        };
        settings.encoder.ingest_url = "rtmp://ingest.example/live2".into();
        settings.encoder.stream_key = stream_key.map(str::to_string);
        Coordinator::new(
            settings,
            Arc::new(MockLauncher::new(MockRenderer::new())),
            Arc::new(MockEncoderSpawner::new(MockEncoderBehavior::default())),
        )
    }

    fn app(keyword: &str) -> (Router, Coordinator) {
        let coordinator = coordinator(Some("k"));
        (router(GatewayState::new(coordinator.clone(), keyword)), coordinator)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn banner_is_public() {
        let (app, _) = app("secret");
        let (status, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["status"], "running");
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (app, _) = app("secret");
        let (status, body) = send(&app, Request::get("/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "success": false, "message": "Endpoint not found" }));
    }

    #[tokio::test]
    async fn start_requires_keyword() {
        let (app, coordinator) = app("secret");
        let (status, body) = send(&app, post("/start", json!({ "keyword": "wrong" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid access keyword");

        let missing = Request::post("/start").body(Body::empty()).unwrap();
        let (status, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn unconfigured_keyword_disables_control() {
        let (app, _) = app("");
        let (status, body) = send(&app, post("/start", json!({ "keyword": "" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["message"], "Access keyword not configured");
    }

    #[tokio::test]
    async fn start_status_stop_round() {
        let (app, coordinator) = app("secret");

        let (status, body) = send(&app, post("/start", json!({ "keyword": "secret" }))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert!(body["session_id"].is_string());
        assert_eq!(coordinator.state(), SessionState::Active);

        let (status, body) = send(&app, post("/start", json!({ "keyword": "secret" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let req = Request::get("/status")
            .header("x-access-keyword", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "active");
        assert_eq!(body["target_url"], "https://dashboard.example/board");

        let (status, body) = send(&app, post("/stop", json!({ "keyword": "secret" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Stream stopped");
        assert_eq!(coordinator.state(), SessionState::Idle);

        let (_, body) = send(&app, post("/stop", json!({ "keyword": "secret" }))).await;
        assert_eq!(body["message"], "Not streaming");
    }

    #[tokio::test]
    async fn status_accepts_query_keyword() {
        let (app, _) = app("secret");
        let req = Request::get("/status?keyword=secret").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");

        let req = Request::get("/status?keyword=nope").body(Body::empty()).unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn start_without_stream_key_is_rejected() {
        let coordinator = coordinator(None);
        let app = router(GatewayState::new(coordinator.clone(), "secret"));
        let (status, body) = send(&app, post("/start", json!({ "keyword": "secret" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(coordinator.state(), SessionState::Idle);
    }
}
