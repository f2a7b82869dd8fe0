//! Matching in-flight requests to their replies.
//!
//! A request is registered *before* it is sent so a reply that races ahead
//! of the sender still finds its slot. Every slot is removed when its wait
//! resolves, times out, or is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::CorrelationError;
use crate::transport::Reply;

/// How replies are matched to waits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Replies echo the request id; distinct ids may be pending at once.
    #[default]
    Exact,
    /// Replies carry no usable id. Only one wait may be pending and the
    /// next reply resolves it, whatever its origin.
    SingleSlot,
}

impl CorrelationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::SingleSlot => "single_slot",
        }
    }
}

impl std::str::FromStr for CorrelationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "single_slot" | "single-slot" | "single" => Ok(Self::SingleSlot),
            other => Err(format!("unknown correlation mode '{}'", other)),
        }
    }
}

struct Slot {
    token: u64,
    tx: oneshot::Sender<Reply>,
}

struct Inner {
    mode: CorrelationMode,
    pending: Mutex<HashMap<u64, Slot>>,
    next_token: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, id: u64, token: u64) {
        let mut pending = self.lock();
        if pending.get(&id).is_some_and(|slot| slot.token == token) {
            pending.remove(&id);
        }
    }
}

/// Matches replies to the requests that are waiting for them.
#[derive(Clone)]
pub struct ResponseCorrelator {
    inner: Arc<Inner>,
}

impl ResponseCorrelator {
    /// Create a correlator in the given mode.
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                pending: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.inner.mode
    }

    /// Reserve a slot for `id`.
    pub fn register(&self, id: u64) -> Result<PendingReply, CorrelationError> {
        let mut pending = self.inner.lock();

        match self.inner.mode {
            CorrelationMode::Exact => {
                if pending.contains_key(&id) {
                    return Err(CorrelationError::DuplicateRequest { id });
                }
            }
            CorrelationMode::SingleSlot => {
                if let Some(existing) = pending.keys().next() {
                    return Err(CorrelationError::SlotBusy { pending: *existing });
                }
            }
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.insert(id, Slot { token, tx });

        Ok(PendingReply {
            id,
            token,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Register `id` and wait up to `timeout` for its reply.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Result<Reply, CorrelationError> {
        self.register(id)?.wait(timeout).await
    }

    /// Hand a reply to whoever is waiting for it.
    ///
    /// Returns `false` when nothing was waiting; the reply is dropped.
    pub fn deliver(&self, reply: Reply) -> bool {
        let slot = {
            let mut pending = self.inner.lock();
            match self.inner.mode {
                CorrelationMode::Exact => reply.request_id.and_then(|id| pending.remove(&id)),
                CorrelationMode::SingleSlot => {
                    let id = pending.keys().next().copied();
                    id.and_then(|id| pending.remove(&id))
                }
            }
        };

        match slot {
            Some(slot) => {
                // The receiver may have given up between removal and send.
                slot.tx.send(reply).is_ok()
            }
            None => {
                tracing::debug!(
                    request_id = ?reply.request_id,
                    mode = self.inner.mode.as_str(),
                    "Dropping reply with no pending wait"
                );
                false
            }
        }
    }

    /// Number of waits currently pending.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Cancel every pending wait.
    pub fn cancel_all(&self) {
        self.inner.lock().clear();
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new(CorrelationMode::Exact)
    }
}

/// A registered wait. Dropping it releases the slot.
pub struct PendingReply {
    id: u64,
    token: u64,
    rx: oneshot::Receiver<Reply>,
    inner: Arc<Inner>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply, CorrelationError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CorrelationError::Cancelled { id: self.id }),
            Err(_) => Err(CorrelationError::Timeout {
                id: self.id,
                after: timeout,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.release(self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reply(id: Option<u64>, body: serde_json::Value) -> Reply {
        Reply {
            request_id: id,
            body,
        }
    }

    #[tokio::test]
    async fn test_exact_mode_matches_by_id() {
        let correlator = ResponseCorrelator::new(CorrelationMode::Exact);
        let first = correlator.register(1).unwrap();
        let second = correlator.register(2).unwrap();
        assert_eq!(correlator.pending_count(), 2);

        assert!(correlator.deliver(reply(Some(2), json!("two"))));
        assert!(correlator.deliver(reply(Some(1), json!("one"))));

        let timeout = Duration::from_secs(1);
        assert_eq!(first.wait(timeout).await.unwrap().body, json!("one"));
        assert_eq!(second.wait(timeout).await.unwrap().body, json!("two"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exact_mode_rejects_duplicate_id() {
        let correlator = ResponseCorrelator::default();
        let _held = correlator.register(7).unwrap();
        assert!(matches!(
            correlator.register(7),
            Err(CorrelationError::DuplicateRequest { id: 7 })
        ));
    }

    #[tokio::test]
    async fn test_exact_mode_ignores_unknown_and_missing_ids() {
        let correlator = ResponseCorrelator::default();
        let _held = correlator.register(1).unwrap();
        assert!(!correlator.deliver(reply(Some(99), json!(null))));
        assert!(!correlator.deliver(reply(None, json!(null))));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator = ResponseCorrelator::default();
        let err = correlator
            .wait(3, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CorrelationError::Timeout {
                id: 3,
                after: Duration::from_millis(500)
            }
        );
        assert_eq!(correlator.pending_count(), 0);

        // The id is free again.
        let _again = correlator.register(3).unwrap();
    }

    #[tokio::test]
    async fn test_dropped_wait_releases_slot() {
        let correlator = ResponseCorrelator::default();
        let pending = correlator.register(5).unwrap();
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.deliver(reply(Some(5), json!(null))));
    }

    #[tokio::test]
    async fn test_stale_drop_does_not_release_newer_registration() {
        let correlator = ResponseCorrelator::default();
        let first = correlator.register(8).unwrap();
        assert!(correlator.deliver(reply(Some(8), json!(1))));

        let _second = correlator.register(8).unwrap();
        drop(first);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_single_slot_resolves_with_any_reply() {
        let correlator = ResponseCorrelator::new(CorrelationMode::SingleSlot);
        let pending = correlator.register(10).unwrap();
        assert!(matches!(
            correlator.register(11),
            Err(CorrelationError::SlotBusy { pending: 10 })
        ));

        assert!(correlator.deliver(reply(None, json!({"ok": true}))));
        let got = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.body, json!({"ok": true}));

        // Slot is free for the next request.
        let _next = correlator.register(11).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_all_fails_pending_waits() {
        let correlator = ResponseCorrelator::default();
        let pending = correlator.register(4).unwrap();
        correlator.cancel_all();
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await.unwrap_err(),
            CorrelationError::Cancelled { id: 4 }
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("exact".parse::<CorrelationMode>(), Ok(CorrelationMode::Exact));
        assert_eq!(
            "single-slot".parse::<CorrelationMode>(),
            Ok(CorrelationMode::SingleSlot)
        );
        assert!("fuzzy".parse::<CorrelationMode>().is_err());
    }
}
