//! # vault-sync
//!
//! Real-time, multi-device synchronization of a flat-file document tree
//! (paths → byte blobs) across clients connected to a central
//! authoritative server over a persistent WebSocket channel.
//!
//! The server side lives in [`server`]: a [`store::ContentStore`] for
//! durable path→bytes persistence with a hash cache, a
//! [`tombstone::TombstoneRegistry`] for causally-tracked deletions, a
//! [`hub::ConnectionHub`] enforcing one live session per device, and
//! [`server::coordinator::SyncCoordinator`] tying them together with
//! conflict resolution and full-sync assembly.
//!
//! The client side lives in [`client`]: a debounced outbound queue keyed by
//! path, inbound frame application against a host-supplied filesystem, and
//! full-sync reconciliation with move detection.
//!
//! ## Quick start (server)
//!
//! ```rust,ignore
//! use vault_sync::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     vault_sync::server::serve(config).await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod path;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tombstone;
pub mod vector_clock;

// Re-export the types most integrators need without reaching into
// individual modules.
pub use client::{ClientCoordinator, ClientNotice, HostFilesystem};
pub use config::Config;
pub use error::SyncError;
pub use server::SyncCoordinator;

// vim: ts=4
