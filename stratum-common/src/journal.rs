use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Journal actions (ACT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    #[serde(rename = "ACT:PLAN")]
    Plan,
    #[serde(rename = "ACT:RESOLVE_NETWORK")]
    ResolveNetwork,
    #[serde(rename = "ACT:ENSURE_SSH_KEY")]
    EnsureSshKey,
    #[serde(rename = "ACT:REMOVE_INSTANCE")]
    RemoveInstance,
    #[serde(rename = "ACT:PROVISION_INSTANCE")]
    ProvisionInstance,
    #[serde(rename = "ACT:DESCRIBE_INSTANCE")]
    DescribeInstance,
    #[serde(rename = "ACT:ENSURE_FLOATING_IP")]
    EnsureFloatingIp,
    #[serde(rename = "ACT:ASSOCIATE_FLOATING_IP")]
    AssociateFloatingIp,
    #[serde(rename = "ACT:DISSOCIATE_FLOATING_IP")]
    DissociateFloatingIp,
    #[serde(rename = "ACT:RELEASE_FLOATING_IP")]
    ReleaseFloatingIp,
    #[serde(rename = "ACT:REMOVE_SSH_KEY")]
    RemoveSshKey,
    #[serde(rename = "ACT:REMOVE_NETWORK")]
    RemoveNetwork,
    #[serde(rename = "ACT:RENDER")]
    Render,
    #[serde(rename = "ACT:PROBE")]
    Probe,
    #[serde(rename = "ACT:CONFIGURE")]
    Configure,
    #[serde(rename = "ACT:STATE_TRANSITION")]
    StateTransition,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Plan => "ACT:PLAN",
            ActionType::ResolveNetwork => "ACT:RESOLVE_NETWORK",
            ActionType::EnsureSshKey => "ACT:ENSURE_SSH_KEY",
            ActionType::RemoveInstance => "ACT:REMOVE_INSTANCE",
            ActionType::ProvisionInstance => "ACT:PROVISION_INSTANCE",
            ActionType::DescribeInstance => "ACT:DESCRIBE_INSTANCE",
            ActionType::EnsureFloatingIp => "ACT:ENSURE_FLOATING_IP",
            ActionType::AssociateFloatingIp => "ACT:ASSOCIATE_FLOATING_IP",
            ActionType::DissociateFloatingIp => "ACT:DISSOCIATE_FLOATING_IP",
            ActionType::ReleaseFloatingIp => "ACT:RELEASE_FLOATING_IP",
            ActionType::RemoveSshKey => "ACT:REMOVE_SSH_KEY",
            ActionType::RemoveNetwork => "ACT:REMOVE_NETWORK",
            ActionType::Render => "ACT:RENDER",
            ActionType::Probe => "ACT:PROBE",
            ActionType::Configure => "ACT:CONFIGURE",
            ActionType::StateTransition => "ACT:STATE_TRANSITION",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    InProgress,
    Success,
    Failed,
    Skipped,
}

/// One line of the run journal. A started action and its completion share `id`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JournalRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub instance_key: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl JournalRecord {
    pub fn new(
        run_id: Uuid,
        action_type: ActionType,
        status: ActionStatus,
        instance_key: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            action_type,
            status,
            instance_key: instance_key.map(str::to_string),
            error_message: None,
            duration_ms: None,
            metadata: None,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_serializes_to_wire_name() {
        for t in [ActionType::Plan, ActionType::ProvisionInstance, ActionType::Configure] {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn record_shape() {
        let run = Uuid::new_v4();
        let rec = JournalRecord::new(run, ActionType::Probe, ActionStatus::InProgress, Some("web1"));
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "ACT:PROBE");
        assert_eq!(v["status"], "in_progress");
        assert_eq!(v["instance_key"], "web1");
        assert_eq!(v["run_id"], run.to_string());
    }
}
