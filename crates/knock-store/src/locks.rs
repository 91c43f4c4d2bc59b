use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-host async locks. Every read-modify-write on a host's keys runs under
/// that host's guard, so concurrent connections acting on the same host id
/// cannot interleave their list overwrites.
///
/// Entries live only while someone holds or waits on them.
#[derive(Default)]
pub struct HostLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held while a host's keys are being modified. Dropping it releases the
/// lock and evicts the host's entry when nobody else wants it.
pub struct HostGuard<'a> {
    locks: &'a HostLocks,
    host_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, host_id: &str) -> HostGuard<'_> {
        // Clone the Arc out so the shard lock is released before awaiting.
        let lock = self
            .locks
            .entry(host_id.to_owned())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        HostGuard {
            locks: self,
            host_id: host_id.to_owned(),
            guard: Some(guard),
        }
    }

    pub fn tracked_hosts(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters cloned the Arc under the shard lock, so a count of one
        // (the map's own) means nobody is queued behind us.
        let _ = self
            .locks
            .locks
            .remove_if(self.host_id.as_str(), |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_host_is_exclusive() {
        let locks = Arc::new(HostLocks::new());
        let guard = locks.lock("h").await;

        let contender = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _guard = contender.lock("h").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn different_hosts_do_not_block() {
        let locks = HostLocks::new();
        let _a = locks.lock("a").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b"))
            .await
            .unwrap();
        assert_eq!(locks.tracked_hosts(), 2);
    }

    #[tokio::test]
    async fn released_hosts_are_forgotten() {
        let locks = HostLocks::new();
        for i in 0..500 {
            let _guard = locks.lock(&format!("host-{i}")).await;
        }
        assert_eq!(locks.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(HostLocks::new());
        let first = locks.lock("h").await;

        let contender = Arc::clone(&locks);
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            let _guard = contender.lock("h").await;
            let _ = held_tx.send(());
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        held_rx.await.unwrap();
        assert_eq!(locks.tracked_hosts(), 1);

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        assert_eq!(locks.tracked_hosts(), 0);
    }
}
