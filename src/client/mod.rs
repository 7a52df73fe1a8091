//! Client-side pieces: the Sync Coordinator (§4.9), the host filesystem
//! contract plus reference adapter (§4.13), and the WebSocket transport
//! (§5 reconnect policy).

pub mod coordinator;
pub mod host;
pub mod transport;

pub use coordinator::{ClientCoordinator, ClientNotice};
pub use host::{HostEvent, HostFilesystem, LocalFilesystem};
