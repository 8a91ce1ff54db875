//! Keyed wait-registry
//!
//! Maps a response key to a one-shot completion slot. The slot is created when
//! the job is enqueued, so a result that arrives before anyone waits is held in
//! the channel instead of being lost. Whoever waits owns a guard that removes
//! the slot on every exit path, including the waiting task being dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use super::broker::BrokerError;

type Signal = Result<Vec<u8>, BrokerError>;

struct Slot {
    tx: Option<oneshot::Sender<Signal>>,
    rx: Option<oneshot::Receiver<Signal>>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    registered: Notify,
    release_hook: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Clone, Default)]
pub struct WaitRegistry {
    inner: Arc<Inner>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that reports keys released without a delivery on `hook`
    pub fn with_release_hook(hook: mpsc::UnboundedSender<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                release_hook: Some(hook),
                ..Inner::default()
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the slot for `key`. Returns `None` if the key is already pending.
    ///
    /// The slot lives only as long as the returned [`Registration`] unless
    /// [`Registration::keep`] is called once the job is on the queue.
    pub fn register(&self, key: &str) -> Option<Registration> {
        {
            let mut slots = self.slots();
            if slots.contains_key(key) {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(
                key.to_string(),
                Slot {
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );
        }
        self.inner.registered.notify_one();
        Some(Registration {
            registry: self.clone(),
            key: key.to_string(),
            armed: true,
        })
    }

    /// Complete the slot for `key`. Only the first delivery counts; returns
    /// false when nobody is registered or the slot was already resolved.
    pub fn resolve(&self, key: &str, bytes: Vec<u8>) -> bool {
        self.complete(key, Ok(bytes))
    }

    fn complete(&self, key: &str, signal: Signal) -> bool {
        let tx = self.slots().get_mut(key).and_then(|slot| slot.tx.take());
        match tx {
            Some(tx) => tx.send(signal).is_ok(),
            None => {
                debug!(response_key = key, "Discarding result for unknown or settled key");
                false
            }
        }
    }

    /// Fail every unresolved slot, e.g. after the transport went away
    pub fn fail_all(&self, detail: &str) -> usize {
        let senders: Vec<_> = self
            .slots()
            .values_mut()
            .filter_map(|slot| slot.tx.take())
            .collect();

        let count = senders.len();
        for tx in senders {
            let _ = tx.send(Err(BrokerError::Disconnected(detail.to_string())));
        }
        count
    }

    /// Keys that are still waiting for a delivery
    pub fn pending_keys(&self) -> Vec<String> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.tx.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once a key has been registered since the last call
    pub async fn registered(&self) {
        self.inner.registered.notified().await
    }

    /// Wait for the delivery on `key`. `Ok(None)` means the timeout elapsed.
    ///
    /// The slot is removed when this returns or when the future is dropped.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        let rx = self
            .slots()
            .get_mut(key)
            .and_then(|slot| slot.rx.take())
            .ok_or_else(|| BrokerError::NotPending(key.to_string()))?;

        let mut guard = SlotGuard {
            registry: self,
            key,
            delivered: false,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(bytes))) => {
                guard.delivered = true;
                Ok(Some(bytes))
            }
            Ok(Ok(Err(err))) => {
                guard.delivered = true;
                Err(err)
            }
            Ok(Err(_)) => Err(BrokerError::Disconnected("response slot closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    fn release(&self, key: &str, delivered: bool) {
        self.slots().remove(key);
        if delivered {
            return;
        }
        if let Some(hook) = &self.inner.release_hook {
            let _ = hook.send(key.to_string());
        }
    }
}

/// Pending registration between `register` and a successful enqueue
#[must_use = "dropping a registration removes its slot"]
pub struct Registration {
    registry: WaitRegistry,
    key: String,
    armed: bool,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Leave the slot in place for a later `wait`
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            debug!(response_key = %self.key, "Registration abandoned before enqueue completed");
            self.registry.release(&self.key, false);
        }
    }
}

struct SlotGuard<'a> {
    registry: &'a WaitRegistry,
    key: &'a str,
    delivered: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.key, self.delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep(registry: &WaitRegistry, key: &str) {
        registry.register(key).unwrap().keep();
    }

    #[tokio::test]
    async fn test_delivery_before_wait_is_kept() {
        let registry = WaitRegistry::new();
        keep(&registry, "q:response:1");
        assert!(registry.resolve("q:response:1", b"done".to_vec()));

        let got = registry.wait("q:response:1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, Some(b"done".to_vec()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_only_first_delivery_counts() {
        let registry = WaitRegistry::new();
        keep(&registry, "k");
        assert!(registry.resolve("k", b"first".to_vec()));
        assert!(!registry.resolve("k", b"second".to_vec()));

        let got = registry.wait("k", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let registry = WaitRegistry::new();
        let _first = registry.register("k").unwrap();
        assert!(registry.register("k").is_none());
    }

    #[tokio::test]
    async fn test_dropped_registration_releases_slot() {
        let (hook, mut released) = mpsc::unbounded_channel();
        let registry = WaitRegistry::with_release_hook(hook);

        let registration = registry.register("k").unwrap();
        assert_eq!(registry.pending_keys(), vec!["k".to_string()]);
        drop(registration);

        assert!(registry.is_empty());
        assert!(registry.pending_keys().is_empty());
        assert_eq!(released.recv().await.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_releases_slot() {
        let registry = WaitRegistry::new();

        let enqueue = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let registration = registry.register("k").unwrap();
                // push never completes
                std::future::pending::<()>().await;
                registration.keep();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.len(), 1);

        enqueue.abort();
        let _ = enqueue.await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let (hook, mut released) = mpsc::unbounded_channel();
        let registry = WaitRegistry::with_release_hook(hook);
        keep(&registry, "k");

        let started = tokio::time::Instant::now();
        let got = registry.wait("k", Duration::from_secs(2)).await.unwrap();

        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(registry.is_empty());
        assert_eq!(released.recv().await.as_deref(), Some("k"));

        // a late publish is dropped quietly
        assert!(!registry.resolve("k", b"late".to_vec()));
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_slot() {
        let (hook, mut released) = mpsc::unbounded_channel();
        let registry = WaitRegistry::with_release_hook(hook);
        keep(&registry, "k");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("k", Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        assert!(registry.is_empty());
        assert_eq!(released.recv().await.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters_with_error() {
        let registry = WaitRegistry::new();
        keep(&registry, "a");
        keep(&registry, "b");

        assert_eq!(registry.fail_all("connection reset"), 2);

        let err = registry.wait("a", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Disconnected(_)));
        assert!(registry.pending_keys().is_empty());
    }

    #[tokio::test]
    async fn test_wait_on_unknown_key_fails() {
        let registry = WaitRegistry::new();
        let err = registry.wait("missing", Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotPending(_)));
    }

    #[tokio::test]
    async fn test_pending_keys_excludes_resolved_slots() {
        let registry = WaitRegistry::new();
        keep(&registry, "a");
        keep(&registry, "b");
        registry.resolve("a", Vec::new());

        assert_eq!(registry.pending_keys(), vec!["b".to_string()]);
        assert_eq!(registry.len(), 2);
    }
}
