//! Subscription manager
//!
//! Bidirectional in-memory index of who watches which namespaced resource
//! URI. All operations take one short-lived mutex; fan-out reads return
//! snapshots so notification delivery never holds the lock.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// One client's interest in one resource
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: String,
    /// Namespaced resource URI
    pub namespaced_uri: String,
    /// Owning backend
    pub backend: String,
    /// When the subscription was recorded
    pub subscribed_at: Instant,
}

/// Result of removing a client's subscriptions
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    /// How many subscriptions were removed
    pub removed: usize,
    /// URIs (with owning backend) left with no subscribers, each of which
    /// needs exactly one backend unsubscribe
    pub orphaned: Vec<(String, String)>,
}

#[derive(Default)]
struct Inner {
    by_uri: HashMap<String, BTreeSet<String>>,
    by_client: HashMap<String, BTreeSet<String>>,
    entries: HashMap<(String, String), Subscription>,
}

/// Subscription index
pub struct SubscriptionManager {
    max_per_client: usize,
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(max_per_client: usize) -> Self {
        Self {
            max_per_client,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a subscription. Idempotent per (client, uri).
    pub fn subscribe(
        &self,
        client_id: &str,
        namespaced_uri: &str,
        backend: &str,
    ) -> Result<Subscription> {
        let mut inner = self.inner.lock();
        let key = (client_id.to_string(), namespaced_uri.to_string());

        if let Some(existing) = inner.entries.get(&key) {
            return Ok(existing.clone());
        }

        let current = inner.by_client.get(client_id).map_or(0, BTreeSet::len);
        if current >= self.max_per_client {
            return Err(Error::SubscriptionLimitExceeded {
                client_id: client_id.to_string(),
                limit: self.max_per_client,
            });
        }

        let subscription = Subscription {
            client_id: client_id.to_string(),
            namespaced_uri: namespaced_uri.to_string(),
            backend: backend.to_string(),
            subscribed_at: Instant::now(),
        };

        inner
            .by_uri
            .entry(namespaced_uri.to_string())
            .or_default()
            .insert(client_id.to_string());
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(namespaced_uri.to_string());
        inner.entries.insert(key, subscription.clone());

        debug!(client = %client_id, uri = %namespaced_uri, "Subscription recorded");
        Ok(subscription)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, client_id: &str, namespaced_uri: &str) -> bool {
        let mut inner = self.inner.lock();
        let key = (client_id.to_string(), namespaced_uri.to_string());
        let existed = inner.entries.remove(&key).is_some();
        if existed {
            if let Some(clients) = inner.by_uri.get_mut(namespaced_uri) {
                clients.remove(client_id);
                if clients.is_empty() {
                    inner.by_uri.remove(namespaced_uri);
                }
            }
            if let Some(uris) = inner.by_client.get_mut(client_id) {
                uris.remove(namespaced_uri);
                if uris.is_empty() {
                    inner.by_client.remove(client_id);
                }
            }
            debug!(client = %client_id, uri = %namespaced_uri, "Subscription removed");
        }
        existed
    }

    /// Snapshot of subscribers at this instant.
    #[must_use]
    pub fn subscribers(&self, namespaced_uri: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_uri
            .get(namespaced_uri)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any client currently watches the URI.
    #[must_use]
    pub fn has_subscribers(&self, namespaced_uri: &str) -> bool {
        self.inner
            .lock()
            .by_uri
            .get(namespaced_uri)
            .is_some_and(|clients| !clients.is_empty())
    }

    /// URIs a client currently watches.
    #[must_use]
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_client
            .get(client_id)
            .map(|uris| uris.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Details of one subscription.
    #[must_use]
    pub fn get(&self, client_id: &str, namespaced_uri: &str) -> Option<Subscription> {
        self.inner
            .lock()
            .entries
            .get(&(client_id.to_string(), namespaced_uri.to_string()))
            .cloned()
    }

    /// Remove every subscription owned by a client (disconnect path).
    ///
    /// The outcome lists URIs whose subscriber set became empty; the caller
    /// issues one backend unsubscribe per orphaned URI.
    pub fn cleanup_client(&self, client_id: &str) -> CleanupOutcome {
        let mut inner = self.inner.lock();
        let Some(uris) = inner.by_client.remove(client_id) else {
            return CleanupOutcome::default();
        };

        let mut outcome = CleanupOutcome {
            removed: uris.len(),
            orphaned: Vec::new(),
        };

        for uri in uris {
            let key = (client_id.to_string(), uri.clone());
            let backend = inner
                .entries
                .remove(&key)
                .map(|s| s.backend)
                .unwrap_or_default();
            if let Some(clients) = inner.by_uri.get_mut(&uri) {
                clients.remove(client_id);
                if clients.is_empty() {
                    inner.by_uri.remove(&uri);
                    outcome.orphaned.push((uri, backend));
                }
            }
        }

        debug!(client = %client_id, removed = outcome.removed, orphaned = outcome.orphaned.len(), "Client subscriptions cleaned up");
        outcome
    }

    /// Remove every subscription pointing at a backend (backend removal).
    ///
    /// Returns the namespaced URIs that were dropped.
    pub fn remove_backend(&self, backend: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let doomed: Vec<(String, String)> = inner
            .entries
            .iter()
            .filter(|(_, s)| s.backend == backend)
            .map(|(k, _)| k.clone())
            .collect();

        let mut uris: BTreeSet<String> = BTreeSet::new();
        for (client_id, uri) in doomed {
            inner.entries.remove(&(client_id.clone(), uri.clone()));
            if let Some(clients) = inner.by_uri.get_mut(&uri) {
                clients.remove(&client_id);
                if clients.is_empty() {
                    inner.by_uri.remove(&uri);
                }
            }
            if let Some(client_uris) = inner.by_client.get_mut(&client_id) {
                client_uris.remove(&uri);
                if client_uris.is_empty() {
                    inner.by_client.remove(&client_id);
                }
            }
            uris.insert(uri);
        }
        uris.into_iter().collect()
    }

    /// Total live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no subscriptions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent_per_client_uri() {
        let manager = SubscriptionManager::new(16);
        let first = manager.subscribe("client-a", "fs_file_a.txt", "fs").unwrap();
        let second = manager.subscribe("client-a", "fs_file_a.txt", "fs").unwrap();
        assert_eq!(first.subscribed_at, second.subscribed_at);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn limit_is_enforced_per_client() {
        let manager = SubscriptionManager::new(2);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        manager.subscribe("client-a", "fs_two", "fs").unwrap();
        let err = manager.subscribe("client-a", "fs_three", "fs").unwrap_err();
        assert!(matches!(err, Error::SubscriptionLimitExceeded { .. }));

        // Other clients are unaffected.
        assert!(manager.subscribe("client-b", "fs_three", "fs").is_ok());
    }

    #[test]
    fn resubscribing_existing_uri_does_not_count_against_limit() {
        let manager = SubscriptionManager::new(1);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        assert!(manager.subscribe("client-a", "fs_one", "fs").is_ok());
    }

    #[test]
    fn unsubscribe_reports_existence() {
        let manager = SubscriptionManager::new(16);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        assert!(manager.unsubscribe("client-a", "fs_one"));
        assert!(!manager.unsubscribe("client-a", "fs_one"));
        assert!(manager.is_empty());
    }

    #[test]
    fn subscribers_returns_snapshot_of_watchers() {
        let manager = SubscriptionManager::new(16);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        manager.subscribe("client-b", "fs_one", "fs").unwrap();
        manager.subscribe("client-c", "fs_two", "fs").unwrap();

        let watchers = manager.subscribers("fs_one");
        assert_eq!(watchers, vec!["client-a", "client-b"]);
        assert!(manager.subscribers("fs_missing").is_empty());
    }

    #[test]
    fn cleanup_client_reports_orphaned_uris() {
        let manager = SubscriptionManager::new(16);
        manager.subscribe("client-a", "fs_shared", "fs").unwrap();
        manager.subscribe("client-b", "fs_shared", "fs").unwrap();
        manager.subscribe("client-a", "fs_private", "fs").unwrap();

        let outcome = manager.cleanup_client("client-a");
        assert_eq!(outcome.removed, 2);
        // Only the URI nobody else watches needs a backend unsubscribe.
        assert_eq!(
            outcome.orphaned,
            vec![("fs_private".to_string(), "fs".to_string())]
        );

        assert!(manager.has_subscribers("fs_shared"));
        assert!(!manager.has_subscribers("fs_private"));
    }

    #[test]
    fn cleanup_unknown_client_is_a_noop() {
        let manager = SubscriptionManager::new(16);
        let outcome = manager.cleanup_client("ghost");
        assert_eq!(outcome.removed, 0);
        assert!(outcome.orphaned.is_empty());
    }

    #[test]
    fn remove_backend_drops_its_subscriptions() {
        let manager = SubscriptionManager::new(16);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        manager.subscribe("client-a", "web_page", "web").unwrap();

        let dropped = manager.remove_backend("fs");
        assert_eq!(dropped, vec!["fs_one"]);
        assert_eq!(manager.client_subscriptions("client-a"), vec!["web_page"]);
    }

    #[test]
    fn get_returns_subscription_details() {
        let manager = SubscriptionManager::new(16);
        manager.subscribe("client-a", "fs_one", "fs").unwrap();
        let subscription = manager.get("client-a", "fs_one").unwrap();
        assert_eq!(subscription.backend, "fs");
        assert!(manager.get("client-b", "fs_one").is_none());
    }
}
