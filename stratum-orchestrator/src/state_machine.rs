use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_common::journal::{ActionStatus, ActionType};
use stratum_common::InstanceStatus;

use crate::logger::ActionLog;

/// One row of the per-run state history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateTransition {
    pub instance_key: String,
    pub from_status: Option<InstanceStatus>,
    pub to_status: InstanceStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Lifecycle status of every instance touched during a run.
/// Transitions are guarded: a call whose source status does not match is a no-op returning false.
pub struct StateTracker {
    states: Mutex<BTreeMap<String, InstanceStatus>>,
    history: Mutex<Vec<StateTransition>>,
    journal: Arc<ActionLog>,
}

impl StateTracker {
    pub fn new(journal: Arc<ActionLog>) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            journal,
        }
    }

    pub fn status(&self, key: &str) -> Option<InstanceStatus> {
        self.states.lock().ok().and_then(|s| s.get(key).copied())
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// `allowed_from = None` accepts any current status (including untracked keys).
    async fn transition(
        &self,
        key: &str,
        allowed_from: Option<&[InstanceStatus]>,
        to: InstanceStatus,
        reason: &str,
    ) -> bool {
        let from = {
            let Ok(mut states) = self.states.lock() else {
                return false;
            };
            let current = states.get(key).copied();
            if current == Some(to) || current == Some(InstanceStatus::Terminated) {
                return false;
            }
            if let Some(allowed) = allowed_from {
                match current {
                    Some(c) if allowed.contains(&c) => {}
                    _ => {
                        tracing::debug!(
                            "⚠️ [state_machine] {}: {:?} -> {} rejected",
                            key,
                            current,
                            to
                        );
                        return false;
                    }
                }
            }
            states.insert(key.to_string(), to);
            current
        };

        if let Ok(mut history) = self.history.lock() {
            history.push(StateTransition {
                instance_key: key.to_string(),
                from_status: from,
                to_status: to,
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
        tracing::info!(
            "🔄 [state_machine] {}: {} -> {} ({})",
            key,
            from.map(|f| f.as_str()).unwrap_or("-"),
            to,
            reason
        );
        self.journal
            .log_quick(
                ActionType::StateTransition,
                ActionStatus::Success,
                Some(key),
                Some(serde_json::json!({
                    "from": from.map(|f| f.as_str()),
                    "to": to.as_str(),
                    "reason": reason,
                })),
            )
            .await;
        true
    }

    /// Untracked -> PLANNED. Keys already tracked are left alone.
    pub async fn plan(&self, key: &str) -> bool {
        if self.status(key).is_some() {
            return false;
        }
        self.transition(key, None, InstanceStatus::Planned, "planned").await
    }

    /// PLANNED -> PROVISIONING (idempotent).
    pub async fn planned_to_provisioning(&self, key: &str, reason: &str) -> bool {
        self.transition(key, Some(&[InstanceStatus::Planned]), InstanceStatus::Provisioning, reason)
            .await
    }

    /// PROVISIONING -> PROVISIONED once addresses are known.
    pub async fn provisioning_to_provisioned(&self, key: &str, reason: &str) -> bool {
        self.transition(
            key,
            Some(&[InstanceStatus::Provisioning]),
            InstanceStatus::Provisioned,
            reason,
        )
        .await
    }

    /// PROVISIONED/UNREACHABLE -> READY.
    pub async fn to_ready(&self, key: &str, reason: &str) -> bool {
        self.transition(
            key,
            Some(&[InstanceStatus::Provisioned, InstanceStatus::Unreachable]),
            InstanceStatus::Ready,
            reason,
        )
        .await
    }

    /// PROVISIONED/READY -> UNREACHABLE.
    pub async fn to_unreachable(&self, key: &str, reason: &str) -> bool {
        self.transition(
            key,
            Some(&[InstanceStatus::Provisioned, InstanceStatus::Ready]),
            InstanceStatus::Unreachable,
            reason,
        )
        .await
    }

    /// Any live status -> FAILED.
    pub async fn mark_failed(&self, key: &str, reason: &str) -> bool {
        self.transition(key, None, InstanceStatus::Failed, reason).await
    }

    /// PROVISIONED/READY/UNREACHABLE/FAILED -> TERMINATED (final).
    /// Untracked keys (teardown of instances from an earlier run) are accepted too;
    /// work still in flight (PLANNED, PROVISIONING) is not.
    pub async fn mark_terminated(&self, key: &str, reason: &str) -> bool {
        if self.status(key).is_none() {
            return self.transition(key, None, InstanceStatus::Terminated, reason).await;
        }
        self.transition(
            key,
            Some(&[
                InstanceStatus::Provisioned,
                InstanceStatus::Ready,
                InstanceStatus::Unreachable,
                InstanceStatus::Failed,
            ]),
            InstanceStatus::Terminated,
            reason,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StateTracker {
        StateTracker::new(Arc::new(ActionLog::disabled()))
    }

    #[tokio::test]
    async fn happy_path_is_recorded_in_order() {
        let t = tracker();
        assert!(t.plan("web1").await);
        assert!(t.planned_to_provisioning("web1", "create").await);
        assert!(t.provisioning_to_provisioned("web1", "described").await);
        assert!(t.to_ready("web1", "port 22 open").await);
        assert_eq!(t.status("web1"), Some(InstanceStatus::Ready));

        let h = t.history();
        let path: Vec<_> = h.iter().map(|s| s.to_status).collect();
        assert_eq!(
            path,
            vec![
                InstanceStatus::Planned,
                InstanceStatus::Provisioning,
                InstanceStatus::Provisioned,
                InstanceStatus::Ready
            ]
        );
        assert_eq!(h[0].from_status, None);
        assert_eq!(h[3].from_status, Some(InstanceStatus::Provisioned));
    }

    #[tokio::test]
    async fn guarded_transitions_reject_wrong_source() {
        let t = tracker();
        assert!(!t.to_ready("ghost", "no such key").await);
        t.plan("web1").await;
        assert!(!t.provisioning_to_provisioned("web1", "skipped a step").await);
        assert!(!t.plan("web1").await);
        assert_eq!(t.status("web1"), Some(InstanceStatus::Planned));
        assert_eq!(t.history().len(), 1);
    }

    #[tokio::test]
    async fn terminated_is_final_and_repeats_are_noops() {
        let t = tracker();
        t.plan("win1").await;
        assert!(t.mark_failed("win1", "quota").await);
        assert!(!t.mark_failed("win1", "again").await);
        assert!(t.mark_terminated("win1", "destroy").await);
        assert!(!t.mark_failed("win1", "late error").await);
        assert_eq!(t.status("win1"), Some(InstanceStatus::Terminated));
        assert_eq!(t.history().len(), 3);
    }

    #[tokio::test]
    async fn termination_requires_a_settled_instance() {
        let t = tracker();
        t.plan("web1").await;
        assert!(!t.mark_terminated("web1", "destroy").await);
        t.planned_to_provisioning("web1", "create").await;
        assert!(!t.mark_terminated("web1", "destroy").await);
        assert_eq!(t.status("web1"), Some(InstanceStatus::Provisioning));

        t.provisioning_to_provisioned("web1", "described").await;
        assert!(t.mark_terminated("web1", "destroy").await);

        assert!(t.mark_terminated("old1", "destroy").await);
        assert_eq!(t.status("old1"), Some(InstanceStatus::Terminated));
    }

    #[tokio::test]
    async fn unreachable_can_recover() {
        let t = tracker();
        t.plan("a").await;
        t.planned_to_provisioning("a", "").await;
        t.provisioning_to_provisioned("a", "").await;
        assert!(t.to_unreachable("a", "probe ceiling").await);
        assert!(t.to_ready("a", "re-probe").await);
    }
}
