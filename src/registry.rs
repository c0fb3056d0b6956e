use crate::models::{SnapshotStatus, SubscriptionEntry, UsageSnapshot};
use crate::providers::{FetchContext, Provider};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider with ID '{0}' already registered")]
    AlreadyRegistered(String),
}

/// Provider lookup table plus the concurrent fan-out over subscriptions.
///
/// Owned by the entry point and shared by handle; there is no global
/// instance.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `provider`. A duplicate id is rejected and leaves the table as is.
    pub fn register(&self, provider: Box<dyn Provider>) -> Result<(), RegistryError> {
        let mut providers = self.write();
        let id = provider.id();
        if providers.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        providers.insert(id.to_string(), Arc::from(provider));
        Ok(())
    }

    #[allow(dead_code)]
    pub fn unregister(&self, id: &str) {
        self.write().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.read().get(id).cloned()
    }

    /// Registered providers sorted by id
    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let mut providers: Vec<_> = self.read().values().cloned().collect();
        providers.sort_by(|a, b| a.id().cmp(b.id()));
        providers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Fetches every entry concurrently.
    ///
    /// The result always has one snapshot per entry, in input order. Failures
    /// of any kind become error snapshots for their own entry only.
    pub async fn fetch_all(
        &self,
        ctx: &FetchContext,
        entries: &[SubscriptionEntry],
    ) -> Vec<UsageSnapshot> {
        let handles: Vec<_> = entries
            .iter()
            .map(|entry| {
                let provider = self.get(&entry.provider_id);
                let ctx = ctx.clone();
                let entry = entry.clone();
                tokio::spawn(async move { fetch_entry(provider, &ctx, &entry).await })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(entries)
            .map(|(joined, entry)| {
                joined.unwrap_or_else(|err| {
                    let reason = format!("worker aborted: {}", err);
                    log_fetch_warning(entry, &reason);
                    UsageSnapshot::failed(entry, "", failure_message(entry, &reason))
                })
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Provider>>> {
        self.providers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Provider>>> {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn fetch_entry(
    provider: Option<Arc<dyn Provider>>,
    ctx: &FetchContext,
    entry: &SubscriptionEntry,
) -> UsageSnapshot {
    if let Some(err) = ctx.err() {
        let message = err.to_string();
        log_fetch_warning(entry, &message);
        return UsageSnapshot::failed(entry, "", message);
    }

    let Some(provider) = provider else {
        let message = format!("provider {:?} not registered", entry.provider_id);
        log_fetch_warning(entry, &message);
        return UsageSnapshot::failed(entry, "", message);
    };

    match provider.fetch_usage(ctx, &entry.auth).await {
        Ok(mut snap) => {
            snap.subscription_name = entry.display_name.clone();
            if snap.status != SnapshotStatus::Ok {
                if let Some(reason) = snap.error_message.take().filter(|m| !m.is_empty()) {
                    log_fetch_warning(entry, &reason);
                    snap.error_message = Some(failure_message(entry, &reason));
                }
            }
            snap
        }
        Err(err) => {
            let reason = err.to_string();
            log_fetch_warning(entry, &reason);
            UsageSnapshot::failed(entry, provider.display_name(), failure_message(entry, &reason))
        }
    }
}

fn failure_message(entry: &SubscriptionEntry, reason: &str) -> String {
    format!("provider {:?} fetch failed: {}", entry.provider_id, reason)
}

/// Text of the warning emitted for an entry that ended in error
pub fn fetch_warning(entry: &SubscriptionEntry, message: &str) -> Option<String> {
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    if entry.display_name.is_empty() {
        Some(format!(
            "provider {:?} fetch failed: {}",
            entry.provider_id, message
        ))
    } else {
        Some(format!(
            "provider {:?} ({}) fetch failed: {}",
            entry.provider_id, entry.display_name, message
        ))
    }
}

fn log_fetch_warning(entry: &SubscriptionEntry, message: &str) {
    if let Some(text) = fetch_warning(entry, message) {
        warn!(provider = %entry.provider_id, "{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthConfig, Capabilities, UsageAmount, UsageMetric, UsageWindow};
    use crate::providers::{FetchError, FetchResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Behavior {
        Succeed,
        Fail,
        StatusError,
        Sleep(Duration),
        Panic,
    }

    struct MockProvider {
        id: &'static str,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    impl MockProvider {
        fn new(id: &'static str, behavior: Behavior) -> Self {
            Self {
                id,
                behavior,
                calls: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn id(&self) -> &'static str {
            self.id
        }

        fn display_name(&self) -> &'static str {
            "Mock"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_usage_metrics: true,
                ..Capabilities::default()
            }
        }

        async fn validate_auth(&self, _ctx: &FetchContext, _auth: &AuthConfig) -> FetchResult<()> {
            Ok(())
        }

        async fn fetch_usage(
            &self,
            ctx: &FetchContext,
            _auth: &AuthConfig,
        ) -> FetchResult<UsageSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut snap = UsageSnapshot::new(self.id, "Mock");
            snap.subscription_name = "ignored".to_string();
            snap.metrics.push(UsageMetric {
                name: "Requests".to_string(),
                window: UsageWindow::new("daily", "Daily"),
                amount: UsageAmount::used(1.0, "requests"),
            });
            match &self.behavior {
                Behavior::Succeed => Ok(snap),
                Behavior::Fail => Err(FetchError::Config("failed to fetch usage".into())),
                Behavior::StatusError => {
                    snap.metrics.clear();
                    snap.mark_partial("upstream parsing failed");
                    Ok(snap)
                }
                Behavior::Sleep(d) => {
                    let d = *d;
                    ctx.run(async move {
                        tokio::time::sleep(d).await;
                        Ok(snap)
                    })
                    .await
                }
                Behavior::Panic => panic!("provider blew up"),
            }
        }
    }

    fn entry(provider: &str, name: &str) -> SubscriptionEntry {
        SubscriptionEntry::new(provider, name)
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("mock1", Behavior::Succeed)))
            .unwrap();

        let err = registry
            .register(Box::new(MockProvider::new("mock1", Behavior::Fail)))
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("mock1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_all_and_unregister() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("mock-b", Behavior::Succeed)))
            .unwrap();
        registry
            .register(Box::new(MockProvider::new("mock-a", Behavior::Succeed)))
            .unwrap();

        let ids: Vec<_> = registry.all().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["mock-a", "mock-b"]);
        assert!(registry.get("mock-a").is_some());
        assert!(registry.get("missing").is_none());

        registry.unregister("mock-a");
        assert!(registry.get("mock-a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_isolates_failures_and_keeps_order() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("success-provider", Behavior::Succeed)))
            .unwrap();
        registry
            .register(Box::new(MockProvider::new("fail-provider", Behavior::Fail)))
            .unwrap();

        let entries = vec![
            entry("success-provider", "test-sub"),
            entry("fail-provider", "test-sub-fail"),
            entry("not-registered", "test-sub-not-found"),
        ];
        let ctx = FetchContext::with_timeout(Duration::from_secs(2));

        let snaps = registry.fetch_all(&ctx, &entries).await;

        assert_eq!(snaps.len(), 3);

        assert_eq!(snaps[0].status, SnapshotStatus::Ok);
        assert_eq!(snaps[0].provider_id, "success-provider");
        assert_eq!(snaps[0].subscription_name, "test-sub");
        assert_eq!(snaps[0].metrics.len(), 1);

        assert_eq!(snaps[1].status, SnapshotStatus::Error);
        assert_eq!(snaps[1].subscription_name, "test-sub-fail");
        assert_eq!(snaps[1].display_name, "Mock");
        let message = snaps[1].error_message.as_deref().unwrap();
        assert!(message.contains(r#"provider "fail-provider" fetch failed"#));
        assert!(message.contains("failed to fetch usage"));
        assert!(snaps[1].metrics.is_empty());

        assert_eq!(snaps[2].status, SnapshotStatus::Error);
        assert_eq!(snaps[2].provider_id, "not-registered");
        assert_eq!(
            snaps[2].error_message.as_deref(),
            Some(r#"provider "not-registered" not registered"#)
        );
        assert!(snaps[2].metrics.is_empty());
        assert_eq!(serde_json::to_value(&snaps[2]).unwrap()["metrics"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_status_error_snapshot_is_prefixed() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("status-provider", Behavior::StatusError)))
            .unwrap();

        let ctx = FetchContext::with_timeout(Duration::from_secs(2));
        let snaps = registry
            .fetch_all(&ctx, &[entry("status-provider", "status-sub")])
            .await;

        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, SnapshotStatus::Error);
        assert_eq!(snaps[0].subscription_name, "status-sub");
        assert_eq!(
            snaps[0].error_message.as_deref(),
            Some(r#"provider "status-provider" fetch failed: upstream parsing failed"#)
        );
        assert!(snaps[0].metrics.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_context_never_calls_providers() {
        let registry = Registry::new();
        let provider = MockProvider::new("mock", Behavior::Succeed);
        let calls = provider.calls.clone();
        registry.register(Box::new(provider)).unwrap();

        let ctx = FetchContext::with_timeout(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;

        let entries = vec![entry("mock", "a"), entry("mock", "b"), entry("missing", "c")];
        let snaps = registry.fetch_all(&ctx, &entries).await;

        assert_eq!(snaps.len(), 3);
        for (snap, entry) in snaps.iter().zip(&entries) {
            assert_eq!(snap.status, SnapshotStatus::Error);
            assert_eq!(snap.subscription_name, entry.display_name);
            assert_eq!(
                snap.error_message.as_deref(),
                Some("context deadline exceeded")
            );
            assert!(snap.metrics.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_entry_does_not_hold_back_others() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new(
                "slow",
                Behavior::Sleep(Duration::from_secs(60)),
            )))
            .unwrap();
        registry
            .register(Box::new(MockProvider::new("fast", Behavior::Succeed)))
            .unwrap();

        let entries = vec![entry("slow", "slow-sub"), entry("fast", "fast-sub")];
        let ctx = FetchContext::with_timeout(Duration::from_secs(5));
        let snaps = registry.fetch_all(&ctx, &entries).await;

        assert_eq!(snaps[0].status, SnapshotStatus::Error);
        assert!(snaps[0]
            .error_message
            .as_deref()
            .unwrap()
            .ends_with("context deadline exceeded"));
        assert_eq!(snaps[1].status, SnapshotStatus::Ok);
        assert_eq!(snaps[1].subscription_name, "fast-sub");
    }

    #[tokio::test]
    async fn test_panicking_provider_is_contained() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("boom", Behavior::Panic)))
            .unwrap();
        registry
            .register(Box::new(MockProvider::new("fine", Behavior::Succeed)))
            .unwrap();

        let ctx = FetchContext::with_timeout(Duration::from_secs(2));
        let snaps = registry
            .fetch_all(&ctx, &[entry("boom", "x"), entry("fine", "y")])
            .await;

        assert_eq!(snaps[0].status, SnapshotStatus::Error);
        assert_eq!(snaps[0].subscription_name, "x");
        assert!(snaps[0].metrics.is_empty());
        assert_eq!(snaps[1].status, SnapshotStatus::Ok);
    }

    #[tokio::test]
    async fn test_order_matches_input_for_many_entries() {
        let registry = Registry::new();
        registry
            .register(Box::new(MockProvider::new("ok", Behavior::Succeed)))
            .unwrap();
        registry
            .register(Box::new(MockProvider::new("bad", Behavior::Fail)))
            .unwrap();

        let entries: Vec<_> = (0..25)
            .map(|i| entry(if i % 3 == 0 { "bad" } else { "ok" }, &format!("sub-{}", i)))
            .collect();
        let ctx = FetchContext::with_timeout(Duration::from_secs(2));
        let snaps = registry.fetch_all(&ctx, &entries).await;

        assert_eq!(snaps.len(), entries.len());
        for (i, snap) in snaps.iter().enumerate() {
            assert_eq!(snap.subscription_name, format!("sub-{}", i));
            assert_eq!(snap.is_ok(), i % 3 != 0);
        }
    }

    #[tokio::test]
    async fn test_empty_entry_list() {
        let registry = Registry::new();
        let snaps = registry.fetch_all(&FetchContext::new(), &[]).await;
        assert!(snaps.is_empty());
    }

    #[test]
    fn test_fetch_warning_text() {
        assert_eq!(
            fetch_warning(&entry("kimi", "home"), " boom "),
            Some(r#"provider "kimi" (home) fetch failed: boom"#.to_string())
        );
        assert_eq!(
            fetch_warning(&entry("kimi", ""), "boom"),
            Some(r#"provider "kimi" fetch failed: boom"#.to_string())
        );
        assert_eq!(fetch_warning(&entry("kimi", "home"), "  "), None);
    }
}
