use crate::{inventory, CloudProvider, ProviderResult, ResourceFilter, ResourceKind, ResourceSpec};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempt is 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Wraps a provider and retries transient failures with bounded exponential backoff.
pub struct RetryingProvider {
    inner: Arc<dyn CloudProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn CloudProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn retry<T, F, Fut>(&self, op: &str, target: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ProviderResult<T>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.transient && attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        "🔄 [{}] {} {} failed (attempt {}/{}): {} - retrying in {:?}",
                        self.inner.name(),
                        op,
                        target,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.transient {
                        tracing::error!(
                            "❌ [{}] {} {} gave up after {} attempt(s): {}",
                            self.inner.name(),
                            op,
                            target,
                            attempt,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl CloudProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ensure(&self, spec: &ResourceSpec) -> ProviderResult<String> {
        let target = format!("{} {}", spec.kind(), spec.identity());
        self.retry("ensure", &target, || self.inner.ensure(spec)).await
    }

    async fn query(&self, kind: ResourceKind, filter: &ResourceFilter) -> ProviderResult<Vec<String>> {
        self.retry("query", kind.as_str(), || self.inner.query(kind, filter))
            .await
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<bool> {
        let target = format!("{} {}", kind, id);
        self.retry("delete", &target, || self.inner.delete(kind, id)).await
    }

    async fn describe_instance(&self, id: &str) -> ProviderResult<Option<inventory::DiscoveredInstance>> {
        self.retry("describe", id, || self.inner.describe_instance(id)).await
    }

    async fn list_instances(&self) -> ProviderResult<Vec<inventory::DiscoveredInstance>> {
        self.retry("list", "instances", || self.inner.list_instances()).await
    }

    async fn set_tags(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> ProviderResult<bool> {
        self.retry("set_tags", instance_id, || self.inner.set_tags(instance_id, tags))
            .await
    }
}
