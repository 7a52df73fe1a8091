//! Server process: Content Store, Tombstone Registry, Connection Hub, and
//! the HTTP/WebSocket listener, wired together and driven until shutdown.

pub mod coordinator;
pub mod http;
pub mod session;

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::signal;

use crate::auth::{AuthGate, Identity};
use crate::config::Config;
use crate::error::SyncError;
use crate::hub::ConnectionHub;
use crate::logging::info;
use crate::store::ContentStore;
use crate::tombstone::TombstoneRegistry;

pub use coordinator::SyncCoordinator;

/// Build every long-lived component and serve HTTP + WebSocket traffic on
/// `config.server`'s bind address until SIGINT/SIGTERM, then return.
pub async fn serve(config: Config) -> Result<(), SyncError> {
	let store = ContentStore::new(config.storage.path.clone(), config.sync.max_file_size_mb * 1024 * 1024);
	let rebuilt = store.rebuild_cache().await?;
	info!(files = rebuilt, "content store cache rebuilt from disk");

	let tombstone_log = config.storage.state_dir.join("tombstones.log");
	let tombstones = TombstoneRegistry::new(tombstone_log, config.tombstone.ttl_secs());
	let loaded = tombstones.load().await?;
	info!(tombstones = loaded, "tombstone registry replayed from disk");

	let hub = ConnectionHub::new();
	let auth = AuthGate::new(config.auth.master_token.clone());

	let coordinator = SyncCoordinator::new(
		store,
		tombstones,
		hub,
		auth,
		config.sync.conflict_resolution,
		config.sync.empty_write_guard,
	);

	spawn_tombstone_gc(coordinator.clone());

	let app = http::router().route("/ws", get(accept_websocket)).with_state(coordinator);

	let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.port)
		.parse()
		.map_err(|e| SyncError::InvalidConfig { message: format!("invalid bind address: {}", e) })?;
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(addr = %addr, "vault-sync server listening");

	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
	info!("vault-sync server shut down cleanly");
	Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
	token: String,
	device_id: Option<String>,
}

async fn accept_websocket(
	State(coordinator): State<SyncCoordinator>,
	Query(query): Query<WsQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let identity = match coordinator.auth().validate(&query.token).await {
		Ok(identity) => identity,
		Err(_) => return (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
	};

	let device_id = match identity {
		Identity::Device(device_id) => device_id,
		Identity::Master => match query.device_id {
			Some(device_id) => device_id,
			None => return (StatusCode::BAD_REQUEST, "device_id is required for master-token connections").into_response(),
		},
	};

	ws.on_upgrade(move |socket| session::run(socket, device_id, coordinator))
}

/// Run `TombstoneRegistry::gc` on a fixed cadence for the lifetime of the
/// process. The spec only requires "at least once per 24h"; six hours gives
/// four chances a day to catch up if one tick is skipped under load.
const TOMBSTONE_GC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(6 * 3600);

fn spawn_tombstone_gc(coordinator: SyncCoordinator) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(TOMBSTONE_GC_INTERVAL);
		interval.tick().await; // first tick fires immediately; nothing to collect yet
		loop {
			interval.tick().await;
			match coordinator.tombstones().gc().await {
				Ok(removed) => {
					if removed > 0 {
						info!(removed, "tombstone garbage collection removed expired entries");
					}
				}
				Err(e) => crate::logging::warn!(error = %e, "tombstone garbage collection failed"),
			}
		}
	});
}

async fn shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install SIGINT handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
	info!("shutdown signal received, draining sessions");
}
