pub mod credentials;
pub mod database;
pub mod error;
pub mod kv;
pub mod locks;
pub mod mailbox;
pub mod permissions;
pub mod schema;

pub use credentials::{CredentialVerifier, Verdict};
pub use database::Database;
pub use error::StoreError;
pub use kv::{KvStore, KvWrite, MemoryKv, Namespace, SqliteKv};
pub use mailbox::{Enqueued, Mailbox};
pub use permissions::{PendingOutcome, PermissionStore};
