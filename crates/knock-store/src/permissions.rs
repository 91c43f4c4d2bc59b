//! Per-host allowed/pending guest lists.
//!
//! Each list lives under its own namespace keyed by host id and is rewritten
//! whole on every change. Mutations for one host run under that host's lock,
//! and transitions touching both lists commit as one batch.

use std::sync::Arc;

use knock_core::{PermissionEntry, PermissionSnapshot};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::kv::{get_json, put_json, KvStore, Namespace};
use crate::locks::HostLocks;

/// Result of [`PermissionStore::add_pending`].
#[derive(Clone, Debug, PartialEq)]
pub enum PendingOutcome {
    /// The guest was unknown and is now pending.
    Added(PermissionSnapshot),
    /// The guest is already allowed; nothing changed.
    AlreadyAllowed(PermissionSnapshot),
    /// The guest is already pending; nothing changed.
    AlreadyPending,
}

pub struct PermissionStore {
    kv: Arc<dyn KvStore>,
    locks: HostLocks,
}

impl PermissionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: HostLocks::new(),
        }
    }

    /// Current lists for a host; absent lists read as empty.
    pub async fn snapshot(&self, host_id: &str) -> Result<PermissionSnapshot, StoreError> {
        let allowed = self.read(Namespace::Allowed, host_id).await?;
        let pending = self.read(Namespace::Pending, host_id).await?;
        Ok(PermissionSnapshot { allowed, pending })
    }

    async fn read(&self, ns: Namespace, host_id: &str) -> Result<Vec<PermissionEntry>, StoreError> {
        Ok(get_json(self.kv.as_ref(), ns, host_id)
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, nickname))]
    pub async fn add_pending(
        &self,
        host_id: &str,
        guest_id: &str,
        nickname: Option<String>,
    ) -> Result<PendingOutcome, StoreError> {
        let _guard = self.locks.lock(host_id).await;
        let mut snapshot = self.snapshot(host_id).await?;

        if snapshot.is_allowed(guest_id) {
            return Ok(PendingOutcome::AlreadyAllowed(snapshot));
        }
        if snapshot.is_pending(guest_id) {
            return Ok(PendingOutcome::AlreadyPending);
        }

        snapshot
            .pending
            .push(PermissionEntry::new(guest_id, nickname));
        self.kv
            .write_batch(vec![put_json(Namespace::Pending, host_id, &snapshot.pending)?])
            .await?;
        debug!(pending = snapshot.pending.len(), "guest added to pending");
        Ok(PendingOutcome::Added(snapshot))
    }

    /// Move a guest into `allowed`. Without a nickname the pending entry's
    /// nickname carries over.
    #[instrument(skip(self, nickname))]
    pub async fn approve(
        &self,
        host_id: &str,
        guest_id: &str,
        nickname: Option<String>,
    ) -> Result<PermissionSnapshot, StoreError> {
        let _guard = self.locks.lock(host_id).await;
        let mut snapshot = self.snapshot(host_id).await?;

        let previous = take_entry(&mut snapshot.pending, guest_id);
        if !snapshot.is_allowed(guest_id) {
            let nickname = nickname.or_else(|| previous.and_then(|p| p.nickname));
            snapshot
                .allowed
                .push(PermissionEntry::new(guest_id, nickname));
        }

        self.kv
            .write_batch(vec![
                put_json(Namespace::Allowed, host_id, &snapshot.allowed)?,
                put_json(Namespace::Pending, host_id, &snapshot.pending)?,
            ])
            .await?;
        Ok(snapshot)
    }

    /// Drop a guest from `pending`; `allowed` is untouched.
    #[instrument(skip(self))]
    pub async fn reject(
        &self,
        host_id: &str,
        guest_id: &str,
    ) -> Result<PermissionSnapshot, StoreError> {
        let _guard = self.locks.lock(host_id).await;
        let mut snapshot = self.snapshot(host_id).await?;
        let _ = take_entry(&mut snapshot.pending, guest_id);
        self.kv
            .write_batch(vec![put_json(Namespace::Pending, host_id, &snapshot.pending)?])
            .await?;
        Ok(snapshot)
    }

    /// Drop a guest from `allowed`; `pending` is untouched.
    #[instrument(skip(self))]
    pub async fn revoke(
        &self,
        host_id: &str,
        guest_id: &str,
    ) -> Result<PermissionSnapshot, StoreError> {
        let _guard = self.locks.lock(host_id).await;
        let mut snapshot = self.snapshot(host_id).await?;
        let _ = take_entry(&mut snapshot.allowed, guest_id);
        self.kv
            .write_batch(vec![put_json(Namespace::Allowed, host_id, &snapshot.allowed)?])
            .await?;
        Ok(snapshot)
    }
}

/// Remove every entry for `guest_id`, returning the first one.
fn take_entry(list: &mut Vec<PermissionEntry>, guest_id: &str) -> Option<PermissionEntry> {
    let idx = list.iter().position(|g| g.id == guest_id)?;
    let entry = list.remove(idx);
    list.retain(|g| g.id != guest_id);
    Some(entry)
}
