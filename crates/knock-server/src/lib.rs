//! WebSocket signaling relay: handshake, per-connection sessions and the
//! host/guest state machine.

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod health;
pub mod heartbeat;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{RelayOptions, ServerConfig};
pub use error::RelayError;
pub use relay::{Relay, SessionState};
pub use server::KnockServer;
pub use shutdown::ShutdownCoordinator;
