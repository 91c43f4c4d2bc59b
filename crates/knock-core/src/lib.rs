//! Shared identifiers, wire protocol and constants for the knock relay.

pub mod constants;
pub mod ids;
pub mod protocol;

pub use ids::{ConnectionId, Role, UserId};
pub use protocol::{
    Inbound, MailboxMessage, MessageKind, Outbound, PermissionEntry, PermissionSnapshot, ProtocolError,
    Timestamp,
};
