use knock_core::ProtocolError;
use knock_store::StoreError;

/// Failure while handling one inbound frame. Both kinds are answered with the
/// same generic `error` frame; the variant only decides how it is logged.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Short label for structured logs.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Store(_) => "store",
        }
    }
}
