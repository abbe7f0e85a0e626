use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use stratum_providers::{CloudProvider, RetryPolicy, RetryingProvider};

use crate::manifest::NetworkSpec;
use crate::settings::Settings;

pub struct ProviderManager;

impl ProviderManager {
    /// Build the provider named in settings, wrapped with the retry policy.
    /// The mock provider is seeded with the declared network so lookups succeed.
    pub fn get_provider(settings: &Settings, network: Option<&NetworkSpec>) -> anyhow::Result<Arc<dyn CloudProvider>> {
        let inner = Self::build(&settings.provider, network)?;
        tracing::info!("🔵 [provider] using '{}' (max {} attempts)", inner.name(), settings.retry.max_attempts);
        Ok(Self::with_retry(inner, settings.retry))
    }

    pub fn with_retry(inner: Arc<dyn CloudProvider>, policy: RetryPolicy) -> Arc<dyn CloudProvider> {
        Arc::new(RetryingProvider::new(inner, policy))
    }

    fn build(provider_name: &str, network: Option<&NetworkSpec>) -> anyhow::Result<Arc<dyn CloudProvider>> {
        match provider_name {
            #[cfg(feature = "provider-scaleway")]
            "scaleway" => {
                let _ = network;
                Ok(Arc::new(Self::scaleway_from_env()?))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                let mut mock = stratum_providers::mock::MockProvider::new();
                if let Some(net) = network {
                    if !net.create_missing {
                        mock = mock.with_network(&net.vpc, &net.subnet, &net.security_group);
                    }
                }
                Ok(Arc::new(mock))
            }
            other => {
                let _ = network;
                bail!("unknown or disabled provider '{}'", other)
            }
        }
    }

    #[cfg(feature = "provider-scaleway")]
    fn scaleway_from_env() -> anyhow::Result<stratum_providers::scaleway::ScalewayProvider> {
        use stratum_providers::scaleway::{ScalewayConfig, ScalewayProvider, DEFAULT_API_URL};

        let env = |k: &str| std::env::var(k).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let project_id = env("SCALEWAY_PROJECT_ID").ok_or_else(|| anyhow!("SCALEWAY_PROJECT_ID is not set"))?;
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let secret_key = env("SCALEWAY_SECRET_KEY_FILE")
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| env("SCALEWAY_SECRET_KEY"))
            .ok_or_else(|| anyhow!("SCALEWAY_SECRET_KEY (or SCALEWAY_SECRET_KEY_FILE) is not set"))?;
        let zone = env("SCALEWAY_ZONE").unwrap_or_else(|| "fr-par-1".to_string());
        let region = env("SCALEWAY_REGION").unwrap_or_else(|| {
            zone.rsplit_once('-')
                .map(|(r, _)| r.to_string())
                .unwrap_or_else(|| "fr-par".to_string())
        });

        ScalewayProvider::new(ScalewayConfig {
            api_url: env("SCALEWAY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            project_id,
            secret_key,
            zone,
            region,
        })
        .context("failed to build Scaleway client")
    }
}
