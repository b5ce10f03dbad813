//! HTTP status API of the keeper.
//!
//! Read-only: every route reports state, nothing here can register jobs or
//! push transactions.

use axum::{extract::State, response::Json, routing::get, Router};
use keeper_config::ApiConfig;
use keeper_core::KeeperEngine;
use keeper_types::NetworkStatus;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<KeeperEngine>,
}

/// Builds the router with all routes nested under `/api`.
pub fn router(engine: Arc<KeeperEngine>) -> Router {
	Router::new()
		.nest(
			"/api",
			Router::new()
				.route("/status", get(handle_status))
				.route("/health", get(handle_health)),
		)
		.layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
		.with_state(AppState { engine })
}

/// Serves the API until the listener fails.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<KeeperEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Keeper API server starting on {}", bind_address);

	axum::serve(listener, router(engine)).await?;

	Ok(())
}

/// Handles GET /api/status requests.
async fn handle_status(State(state): State<AppState>) -> Json<Vec<NetworkStatus>> {
	Json(state.engine.status().await)
}

async fn handle_health() -> Json<Value> {
	Json(json!({ "status": "ok" }))
}
