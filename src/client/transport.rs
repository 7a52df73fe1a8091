//! WebSocket client transport: connects to a vault-sync server, frames
//! `ClientMessage`/`ServerMessage` as JSON text frames, and reconnects with
//! exponential back-off on transport failure. Mirrors the shape of
//! `server::session` (one read side, one write side, driven by a single
//! `tokio::select!` loop) from the other end of the same wire protocol.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::client::coordinator::{ClientCoordinator, ClientNotice};
use crate::logging::{info, warn};
use crate::protocol::ClientMessage;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Build the `ws(s)://host:port/ws?token=...&device_id=...` connection URL
/// per §6. `device_id` is only required for master-token connections; a
/// device token resolves its own identity server-side.
pub fn connection_url(base: &Url, token: &str, device_id: Option<&str>) -> Result<Url, url::ParseError> {
	let mut url = base.join("ws")?;
	{
		let mut pairs = url.query_pairs_mut();
		pairs.append_pair("token", token);
		if let Some(device_id) = device_id {
			pairs.append_pair("device_id", device_id);
		}
	}
	Ok(url)
}

/// Handle used to tell a running `run` loop to stop reconnecting and exit.
#[derive(Clone)]
pub struct DisconnectHandle {
	tx: watch::Sender<bool>,
}

impl DisconnectHandle {
	pub fn disconnect(&self) {
		let _ = self.tx.send(true);
	}
}

/// Drive the connection until explicitly disconnected or the reconnect
/// budget (§5: `min(2^n·1s, 30s)`, up to 10 attempts) is exhausted.
pub async fn run(
	url: Url,
	coordinator: std::sync::Arc<ClientCoordinator>,
	mut outbound_rx: mpsc::Receiver<ClientMessage>,
) -> DisconnectHandle {
	let (disconnect_tx, disconnect_rx) = watch::channel(false);
	let handle = DisconnectHandle { tx: disconnect_tx };

	let mut rx = disconnect_rx.clone();
	tokio::spawn(async move {
		let mut attempt: u32 = 0;
		loop {
			if *rx.borrow() {
				return;
			}
			match connect_once(&url, &coordinator, &mut outbound_rx, &mut rx).await {
				Ok(()) => info!("session ended cleanly"),
				Err(e) => warn!(error = %e, "session ended with error"),
			}
			coordinator.notify(ClientNotice::Disconnected);

			if *rx.borrow() {
				return;
			}
			if attempt >= MAX_RECONNECT_ATTEMPTS {
				warn!(attempts = attempt, "giving up after exhausting the reconnect budget");
				return;
			}
			let delay = backoff_delay(attempt);
			coordinator.notify(ClientNotice::ReconnectingIn { seconds: delay.as_secs() });
			tokio::time::sleep(delay).await;
			attempt += 1;
		}
	});

	handle
}

fn backoff_delay(attempt: u32) -> Duration {
	let computed = Duration::from_secs(1).saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
	computed.min(MAX_BACKOFF)
}

async fn connect_once(
	url: &Url,
	coordinator: &std::sync::Arc<ClientCoordinator>,
	outbound_rx: &mut mpsc::Receiver<ClientMessage>,
	disconnect_rx: &mut watch::Receiver<bool>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
	let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
	let (mut sink, mut stream) = stream.split();
	coordinator.notify(ClientNotice::Connected);
	info!(url = %url, "connected to vault-sync server");

	loop {
		tokio::select! {
			biased;

			changed = disconnect_rx.changed() => {
				if changed.is_err() || *disconnect_rx.borrow() {
					let _ = sink.send(Message::Close(None)).await;
					return Ok(());
				}
			}

			frame = stream.next() => {
				match frame {
					None => return Ok(()),
					Some(Err(e)) => return Err(e),
					Some(Ok(Message::Close(_))) => return Ok(()),
					Some(Ok(Message::Text(text))) => {
						match serde_json::from_str(&text) {
							Ok(msg) => coordinator.handle_inbound(msg).await,
							Err(e) => warn!(error = %e, "dropping unparseable server frame"),
						}
					}
					Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
				}
			}

			outbound = outbound_rx.recv() => {
				match outbound {
					None => return Ok(()),
					Some(msg) => {
						let text = serde_json::to_string(&msg).expect("ClientMessage always serializes");
						sink.send(Message::Text(text.into())).await?;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_grows_geometrically_then_caps_at_30s() {
		assert_eq!(backoff_delay(0), Duration::from_secs(1));
		assert_eq!(backoff_delay(1), Duration::from_secs(2));
		assert_eq!(backoff_delay(2), Duration::from_secs(4));
		assert_eq!(backoff_delay(5), Duration::from_secs(30));
		assert_eq!(backoff_delay(10), Duration::from_secs(30));
	}

	#[test]
	fn connection_url_includes_token_and_device_id() {
		let base = Url::parse("ws://localhost:7878/").unwrap();
		let url = connection_url(&base, "tok123", Some("laptop-1")).unwrap();
		assert!(url.as_str().contains("token=tok123"));
		assert!(url.as_str().contains("device_id=laptop-1"));
	}

	#[test]
	fn connection_url_omits_device_id_for_device_tokens() {
		let base = Url::parse("ws://localhost:7878/").unwrap();
		let url = connection_url(&base, "dvt_abc", None).unwrap();
		assert!(!url.as_str().contains("device_id"));
	}
}
