// ── Pending request registry ──
//
// Tracks in-flight, non-exempt requests by fingerprint. All mutations
// happen under a short synchronous lock that is never held across an
// await point.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Method;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::fingerprint::Fingerprint;

#[derive(Debug)]
struct PendingEntry {
    /// Distinguishes successive entries that share a fingerprint.
    id: u64,
    method: Method,
    path: String,
    cancel: CancellationToken,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    by_fingerprint: HashMap<Fingerprint, PendingEntry>,
    next_id: u64,
}

/// Outcome of [`PendingRegistry::admit`], mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    pub id: u64,
    /// An older identical request inside the dedup window was cancelled.
    pub superseded: bool,
    /// Number of stale entries swept.
    pub swept: usize,
}

#[derive(Debug, Default)]
pub(crate) struct PendingRegistry {
    inner: Mutex<Entries>,
}

impl PendingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new in-flight request.
    ///
    /// Sweeps entries older than `stale_after`, then cancels an identical
    /// predecessor issued less than `window` ago. A predecessor outside the
    /// window keeps running but is no longer tracked; the newest request
    /// always owns the fingerprint.
    pub(crate) fn admit(
        &self,
        fingerprint: Fingerprint,
        method: &Method,
        path: &str,
        cancel: CancellationToken,
        window: Duration,
        stale_after: Duration,
    ) -> Admission {
        let now = Instant::now();
        let mut entries = self.lock();

        let before = entries.by_fingerprint.len();
        entries.by_fingerprint.retain(|fp, entry| {
            let stale = now.saturating_duration_since(entry.issued_at) >= stale_after;
            if stale {
                debug!(
                    fingerprint = %fp,
                    method = %entry.method,
                    path = %entry.path,
                    "sweeping stale request"
                );
                entry.cancel.cancel();
            }
            !stale
        });
        let swept = before - entries.by_fingerprint.len();

        let mut superseded = false;
        if let Some(previous) = entries.by_fingerprint.remove(&fingerprint) {
            if now.saturating_duration_since(previous.issued_at) < window {
                debug!(
                    fingerprint = %fingerprint,
                    previous_id = previous.id,
                    "cancelling superseded duplicate request"
                );
                previous.cancel.cancel();
                superseded = true;
            }
        }

        entries.next_id += 1;
        let id = entries.next_id;
        entries.by_fingerprint.insert(
            fingerprint,
            PendingEntry {
                id,
                method: method.clone(),
                path: path.to_owned(),
                cancel,
                issued_at: now,
            },
        );

        Admission {
            id,
            superseded,
            swept,
        }
    }

    /// Remove the entry for `fingerprint` if it is still the one admitted as `id`.
    pub(crate) fn settle(&self, fingerprint: &Fingerprint, id: u64) {
        let mut entries = self.lock();
        if entries
            .by_fingerprint
            .get(fingerprint)
            .is_some_and(|entry| entry.id == id)
        {
            entries.by_fingerprint.remove(fingerprint);
        }
    }

    /// Cancel and drop every tracked request.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.by_fingerprint.len();
        for (_, entry) in entries.by_fingerprint.drain() {
            entry.cancel.cancel();
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().by_fingerprint.len()
    }
}

/// Settles a registry entry when dropped, so an abandoned `send` future
/// cannot leak its entry.
pub(crate) struct SettleOnDrop<'a> {
    pub registry: &'a PendingRegistry,
    pub fingerprint: Fingerprint,
    pub id: u64,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.settle(&self.fingerprint, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestBody;

    const WINDOW: Duration = Duration::from_millis(300);
    const STALE: Duration = Duration::from_millis(5000);

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::of(&Method::GET, path, &[], &RequestBody::Empty)
    }

    fn admit(registry: &PendingRegistry, path: &str, cancel: CancellationToken) -> Admission {
        registry.admit(fp(path), &Method::GET, path, cancel, WINDOW, STALE)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_inside_window_cancels_predecessor() {
        let registry = PendingRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let a = admit(&registry, "/widgets", first.clone());
        tokio::time::advance(Duration::from_millis(50)).await;
        let b = admit(&registry, "/widgets", second.clone());

        assert!(!a.superseded);
        assert!(b.superseded);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_outside_window_leaves_predecessor_running() {
        let registry = PendingRegistry::new();
        let first = CancellationToken::new();

        let a = admit(&registry, "/widgets", first.clone());
        tokio::time::advance(Duration::from_millis(400)).await;
        let c = admit(&registry, "/widgets", CancellationToken::new());

        assert!(!c.superseded);
        assert!(!first.is_cancelled());
        assert_eq!(registry.len(), 1);

        // The older request settling late must not evict its replacement.
        registry.settle(&fp("/widgets"), a.id);
        assert_eq!(registry.len(), 1);
        registry.settle(&fp("/widgets"), c.id);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_swept_on_admit() {
        let registry = PendingRegistry::new();
        let abandoned = CancellationToken::new();

        admit(&registry, "/slow", abandoned.clone());
        tokio::time::advance(Duration::from_millis(5_000)).await;
        let next = admit(&registry, "/fast", CancellationToken::new());

        assert_eq!(next.swept, 1);
        assert!(abandoned.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_on_drop_removes_entry() {
        let registry = PendingRegistry::new();
        let admission = admit(&registry, "/a", CancellationToken::new());
        {
            let _guard = SettleOnDrop {
                registry: &registry,
                fingerprint: fp("/a"),
                id: admission.id,
            };
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_empties_registry() {
        let registry = PendingRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        admit(&registry, "/a", a.clone());
        admit(&registry, "/b", b.clone());

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(registry.len(), 0);
    }
}
