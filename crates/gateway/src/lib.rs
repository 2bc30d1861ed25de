//! HTTP gateway for Loopwire.
//!
//! Exposes the agent loop over SSE (`POST /v1/chat/stream`) along with a
//! health check, the tool catalogue, and in-memory conversation lookup.
//!
//! Built on Axum.

pub mod api;
pub mod emitter;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use loopwire_agent::AgentLoop;

pub use api::{ApiState, SharedApiState};

/// Build the full router: `/health` plus the v1 API under `/v1`.
pub fn build_router(state: SharedApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// The provider and tool registry are built once here and shared by every
/// request through the agent loop.
pub async fn start(config: loopwire_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let provider = loopwire_providers::build_from_config(&config)?;
    let tools = Arc::new(loopwire_tools::default_registry());
    let agent = Arc::new(AgentLoop::from_config(provider, tools, &config));
    let state = Arc::new(ApiState::new(agent, &config.gateway));

    let app = build_router(state);

    info!(
        addr = %addr,
        model = %config.model,
        heartbeat_secs = config.gateway.heartbeat_interval_secs,
        timeout_secs = config.gateway.request_timeout_secs,
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    provider: String,
    tools: usize,
    uptime_secs: i64,
}

async fn health_handler(State(state): State<SharedApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        provider: state.agent.provider_name().to_string(),
        tools: state.agent.tools().len(),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use loopwire_core::error::ProviderError;
    use loopwire_core::provider::{Provider, ProviderRequest, UpstreamStream};
    use tower::ServiceExt;

    struct IdleProvider;

    #[async_trait]
    impl Provider for IdleProvider {
        fn name(&self) -> &str {
            "idle"
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<UpstreamStream, ProviderError> {
            Err(ProviderError::NotConfigured("test".into()))
        }
    }

    fn test_router() -> Router {
        let tools = Arc::new(loopwire_tools::default_registry());
        let agent = Arc::new(AgentLoop::new(Arc::new(IdleProvider), "mock-model", tools));
        let state = Arc::new(ApiState::new(
            agent,
            &loopwire_config::GatewayConfig::default(),
        ));
        build_router(state)
    }

    #[tokio::test]
    async fn health_check() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["provider"], "idle");
        assert_eq!(json["tools"], 2);
    }

    #[tokio::test]
    async fn v1_routes_are_nested() {
        let response = test_router()
            .oneshot(Request::builder().uri("/v1/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let response = test_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
