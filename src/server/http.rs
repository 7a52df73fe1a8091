//! HTTP admin surface served alongside the WebSocket accept route:
//! health, file listing, device listing, and token issuance. Every route
//! but `/health` is gated on the master bearer token.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::server::coordinator::SyncCoordinator;

pub fn router() -> Router<SyncCoordinator> {
	Router::new()
		.route("/health", get(health))
		.route("/api/files", get(list_files))
		.route("/api/devices", get(list_devices))
		.route("/api/token", post(issue_token))
		.route("/api/token", delete(revoke_token))
}

#[derive(Serialize)]
struct HealthResponse {
	status: &'static str,
	devices: usize,
	storage: String,
}

async fn health(State(coordinator): State<SyncCoordinator>) -> impl IntoResponse {
	let devices = coordinator.hub().connected_devices().await.len();
	Json(HealthResponse {
		status: "ok",
		devices,
		storage: coordinator.store().root_dir().display().to_string(),
	})
}

#[derive(Deserialize)]
struct TokenQuery {
	token: Option<String>,
}

async fn require_master(coordinator: &SyncCoordinator, token: Option<&str>) -> Result<(), Response> {
	let token = token.unwrap_or_default();
	match coordinator.auth().validate(token).await {
		Ok(Identity::Master) => Ok(()),
		_ => Err((StatusCode::UNAUTHORIZED, "master token required").into_response()),
	}
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
	headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(|v| v.to_string())
}

async fn list_files(
	State(coordinator): State<SyncCoordinator>,
	headers: axum::http::HeaderMap,
	Query(query): Query<TokenQuery>,
) -> Response {
	let token = bearer_token(&headers).or(query.token);
	if let Err(resp) = require_master(&coordinator, token.as_deref()).await {
		return resp;
	}
	match coordinator.store().list().await {
		Ok(files) => Json(files).into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

#[derive(Serialize)]
struct DeviceListResponse {
	devices: Vec<String>,
}

async fn list_devices(
	State(coordinator): State<SyncCoordinator>,
	headers: axum::http::HeaderMap,
	Query(query): Query<TokenQuery>,
) -> Response {
	let token = bearer_token(&headers).or(query.token);
	if let Err(resp) = require_master(&coordinator, token.as_deref()).await {
		return resp;
	}
	let devices = coordinator.auth().list_devices().await;
	Json(DeviceListResponse { devices }).into_response()
}

#[derive(Deserialize)]
struct IssueTokenRequest {
	device_id: String,
	/// Human-readable label for operator convenience; not persisted beyond
	/// this request's log line, since the Auth Gate's device-token table
	/// (§4.5) keys purely on device id.
	#[serde(default)]
	name: Option<String>,
}

#[derive(Serialize)]
struct IssueTokenResponse {
	device_id: String,
	token: String,
}

async fn issue_token(
	State(coordinator): State<SyncCoordinator>,
	headers: axum::http::HeaderMap,
	Query(query): Query<TokenQuery>,
	Json(request): Json<IssueTokenRequest>,
) -> Response {
	let token = bearer_token(&headers).or(query.token);
	if let Err(resp) = require_master(&coordinator, token.as_deref()).await {
		return resp;
	}
	crate::logging::info!(device_id = %request.device_id, name = ?request.name, "issuing device token");
	let issued = coordinator.auth().issue(&request.device_id).await;
	Json(IssueTokenResponse { device_id: request.device_id, token: issued }).into_response()
}

#[derive(Deserialize)]
struct RevokeTokenRequest {
	device_id: String,
}

#[derive(Serialize)]
struct RevokeTokenResponse {
	device_id: String,
	revoked: bool,
}

async fn revoke_token(
	State(coordinator): State<SyncCoordinator>,
	headers: axum::http::HeaderMap,
	Query(query): Query<TokenQuery>,
	Json(request): Json<RevokeTokenRequest>,
) -> Response {
	let token = bearer_token(&headers).or(query.token);
	if let Err(resp) = require_master(&coordinator, token.as_deref()).await {
		return resp;
	}
	let revoked = coordinator.auth().revoke(&request.device_id).await;
	Json(RevokeTokenResponse { device_id: request.device_id, revoked }).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::AuthGate;
	use crate::hub::ConnectionHub;
	use crate::store::ContentStore;
	use crate::tombstone::TombstoneRegistry;
	use axum::body::Body;
	use axum::http::Request;
	use tower::ServiceExt;

	fn coordinator(root: &std::path::Path) -> SyncCoordinator {
		SyncCoordinator::new(
			ContentStore::new(root.join("data"), 50 * 1024 * 1024),
			TombstoneRegistry::new(root.join("tombstones.log"), crate::tombstone::DEFAULT_TTL_SECS),
			ConnectionHub::new(),
			AuthGate::new("master-secret"),
			crate::config::ConflictResolution::LastWriteWins,
			true,
		)
	}

	#[tokio::test]
	async fn health_is_unauthenticated() {
		let dir = tempfile::tempdir().unwrap();
		let app = router().with_state(coordinator(dir.path()));
		let resp = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn files_without_token_is_unauthorized() {
		let dir = tempfile::tempdir().unwrap();
		let app = router().with_state(coordinator(dir.path()));
		let resp = app.oneshot(Request::builder().uri("/api/files").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn files_with_master_token_succeeds() {
		let dir = tempfile::tempdir().unwrap();
		let app = router().with_state(coordinator(dir.path()));
		let resp = app
			.oneshot(
				Request::builder()
					.uri("/api/files")
					.header(header::AUTHORIZATION, "Bearer master-secret")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn issue_token_then_devices_lists_it() {
		let dir = tempfile::tempdir().unwrap();
		let app = router().with_state(coordinator(dir.path()));
		let resp = app
			.clone()
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/token")
					.header(header::AUTHORIZATION, "Bearer master-secret")
					.header(header::CONTENT_TYPE, "application/json")
					.body(Body::from(r#"{"device_id":"laptop-1"}"#))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		let resp = app
			.oneshot(
				Request::builder()
					.uri("/api/devices")
					.header(header::AUTHORIZATION, "Bearer master-secret")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}
}
