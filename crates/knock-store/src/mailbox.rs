//! Messages buffered for hosts that are offline.

use std::sync::Arc;

use knock_core::MailboxMessage;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::kv::{get_json, put_json, KvStore, Namespace};
use crate::locks::HostLocks;

/// What [`Mailbox::enqueue_unless`] did with a message.
#[derive(Debug, PartialEq)]
pub enum Enqueued {
    /// Stored; carries the new mailbox depth.
    Queued(usize),
    /// The host is online; the message is handed back undelivered.
    Declined(MailboxMessage),
}

pub struct Mailbox {
    kv: Arc<dyn KvStore>,
    locks: HostLocks,
}

impl Mailbox {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: HostLocks::new(),
        }
    }

    /// Append a message for `host_id` unless `delivered_live` reports the
    /// host came online. The check runs under the host's mailbox lock, the
    /// same lock [`flush`](Self::flush) takes after the host registers, so a
    /// message is either flushed on login or handed back for live delivery.
    #[instrument(skip(self, message, delivered_live))]
    pub async fn enqueue_unless<F>(
        &self,
        host_id: &str,
        message: MailboxMessage,
        delivered_live: F,
    ) -> Result<Enqueued, StoreError>
    where
        F: FnOnce() -> bool + Send,
    {
        let _guard = self.locks.lock(host_id).await;
        if delivered_live() {
            debug!("host came online, message not buffered");
            return Ok(Enqueued::Declined(message));
        }
        let mut queued = self.read(host_id).await?;
        queued.push(message);
        self.kv
            .write_batch(vec![put_json(Namespace::Mailbox, host_id, &queued)?])
            .await?;
        debug!(depth = queued.len(), "message buffered for offline host");
        Ok(Enqueued::Queued(queued.len()))
    }

    /// Take everything queued for `host_id` and clear the mailbox.
    ///
    /// The read and the delete are separate store calls. If the delete fails
    /// the error is returned and the messages stay queued for the next flush.
    #[instrument(skip(self))]
    pub async fn flush(&self, host_id: &str) -> Result<Vec<MailboxMessage>, StoreError> {
        let _guard = self.locks.lock(host_id).await;
        let queued = self.read(host_id).await?;
        if !queued.is_empty() {
            self.kv.delete(Namespace::Mailbox, host_id).await?;
        }
        debug!(count = queued.len(), "mailbox flushed");
        Ok(queued)
    }

    /// Number of messages waiting for `host_id`.
    pub async fn depth(&self, host_id: &str) -> Result<usize, StoreError> {
        Ok(self.read(host_id).await?.len())
    }

    async fn read(&self, host_id: &str) -> Result<Vec<MailboxMessage>, StoreError> {
        Ok(get_json(self.kv.as_ref(), Namespace::Mailbox, host_id)
            .await?
            .unwrap_or_default())
    }
}
