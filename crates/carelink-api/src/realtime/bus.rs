// ── Typed publish/subscribe ──
//
// Maps each `EventKind` to an ordered list of handlers. Dispatch runs
// handlers in subscription order; a panicking handler is isolated so the
// rest still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use super::events::{EventKind, ServerEvent};

pub(crate) type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Handle returned by [`ConnectionManager::on`](super::ConnectionManager::on),
/// used to remove exactly that handler later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscriptions {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

#[derive(Default)]
pub(crate) struct EventBus {
    inner: Mutex<Subscriptions>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let mut subs = self.lock();
        subs.next_id += 1;
        let id = SubscriptionId(subs.next_id);
        subs.by_kind.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove one handler. Returns `false` if it was not subscribed to `kind`.
    pub(crate) fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let Some(handlers) = subs.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subs.by_kind.remove(&kind);
        }
        removed
    }

    /// Remove every handler for `kind`, returning how many were removed.
    pub(crate) fn clear_kind(&self, kind: EventKind) -> usize {
        self.lock().by_kind.remove(&kind).map_or(0, |h| h.len())
    }

    pub(crate) fn clear(&self) {
        self.lock().by_kind.clear();
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.lock().by_kind.get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler for the event's kind.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe without deadlocking; changes apply from the next event.
    pub(crate) fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, Handler)> =
            self.lock().by_kind.get(&kind).cloned().unwrap_or_default();

        for (id, handler) in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(event = %kind, subscription = id.0, %reason, "realtime listener panicked");
            }
        }
    }

    /// Parse a raw text frame and dispatch it. Unrecognised frames are dropped.
    pub(crate) fn dispatch_frame(&self, text: &str) {
        match ServerEvent::parse(text) {
            Ok(event) => self.dispatch(&event),
            Err(e) => debug!(error = %e, "dropping unrecognised realtime frame"),
        }
    }
}
