// ============================================================================
// READINESS PROBING
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use stratum_common::ProvisionedInstance;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Upper bound for a single connect attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub interval: Duration,
    /// Ceiling for the whole poll, attempts included.
    pub timeout: Duration,
    pub attempt_timeout: Duration,
}

impl ProbeConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ready { attempts: u32, elapsed: Duration },
    Unreachable { attempts: u32, waited: Duration },
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub key: String,
    pub address: String,
    pub port: u16,
}

impl ProbeTarget {
    /// Public address when a floating IP is attached, readiness port by OS kind.
    pub fn for_instance(inst: &ProvisionedInstance) -> Self {
        Self {
            key: inst.key.clone(),
            address: inst.connect_address().to_string(),
            port: inst.os.readiness_port(),
        }
    }
}

/// Single TCP connect bounded by `limit`.
async fn check_port(ip: &str, port: u16, limit: Duration) -> bool {
    // Strip CIDR suffix if present (e.g. "1.2.3.4/32" -> "1.2.3.4")
    let clean_ip = ip.split('/').next().unwrap_or(ip);
    matches!(timeout(limit, TcpStream::connect((clean_ip, port))).await, Ok(Ok(_)))
}

/// Poll `address:port` every `interval` until it accepts a connection or the
/// ceiling is reached. Never returns later than the ceiling plus scheduling slack.
pub async fn probe(address: &str, port: u16, cfg: &ProbeConfig) -> ProbeOutcome {
    let started = Instant::now();
    let deadline = started + cfg.timeout;
    let mut attempts = 0u32;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        attempts += 1;
        let limit = cfg.attempt_timeout.min(deadline - now);
        if check_port(address, port, limit).await {
            tracing::debug!("✅ [probe] {}:{} open after {} attempt(s)", address, port, attempts);
            return ProbeOutcome::Ready {
                attempts,
                elapsed: started.elapsed(),
            };
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(cfg.interval.min(deadline - now)).await;
    }

    ProbeOutcome::Unreachable {
        attempts,
        waited: started.elapsed(),
    }
}

/// One concurrent poller per target; returns once every poller has finished.
pub async fn probe_all(targets: Vec<ProbeTarget>, cfg: &ProbeConfig) -> BTreeMap<String, ProbeOutcome> {
    let futures: Vec<_> = targets
        .iter()
        .map(|t| async move {
            let outcome = probe(&t.address, t.port, cfg).await;
            match &outcome {
                ProbeOutcome::Ready { attempts, elapsed } => tracing::info!(
                    "✅ [probe] {} ({}:{}) ready after {} attempt(s) in {:?}",
                    t.key,
                    t.address,
                    t.port,
                    attempts,
                    elapsed
                ),
                ProbeOutcome::Unreachable { attempts, waited } => tracing::warn!(
                    "⚠️ [probe] {} ({}:{}) unreachable after {} attempt(s) over {:?}",
                    t.key,
                    t.address,
                    t.port,
                    attempts,
                    waited
                ),
            }
            (t.key.clone(), outcome)
        })
        .collect();
    join_all(futures).await.into_iter().collect()
}
