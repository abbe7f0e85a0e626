use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod errors;
pub mod journal;

pub use errors::{PartialApplyError, ProviderError, StratumError};

/// Tag carried by every instance this tool creates. Observed instances without it are ignored.
pub const MANAGED_TAG: &str = "stratum-managed";
/// Image label as declared. Providers report their own image ids, so drift is read from this tag.
pub const IMAGE_TAG: &str = "stratum-image";
/// Storage policy as declared.
pub const STORAGE_POLICY_TAG: &str = "stratum-storage-policy";

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Linux,
    Windows,
}

impl OsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsKind::Linux => "linux",
            OsKind::Windows => "windows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(OsKind::Linux),
            "windows" => Some(OsKind::Windows),
            _ => None,
        }
    }

    /// Port polled before the instance is handed to the configuration run.
    pub fn readiness_port(&self) -> u16 {
        match self {
            OsKind::Linux => 22,
            OsKind::Windows => 5985,
        }
    }

    /// Inbound TCP ports the security group must allow for this OS.
    pub fn inbound_ports(&self) -> &'static [u16] {
        match self {
            OsKind::Linux => &[22],
            OsKind::Windows => &[3389, 5985],
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    SshKey { key_ref: String },
    Password { password: String },
}

impl Credential {
    pub fn matches_os(&self, os: OsKind) -> bool {
        matches!(
            (self, os),
            (Credential::SshKey { .. }, OsKind::Linux) | (Credential::Password { .. }, OsKind::Windows)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Planned,      // Accepted by the planner, nothing sent yet
    Provisioning, // Create request sent to provider
    Provisioned,  // Instance exists with addresses resolved
    Ready,        // Readiness port answered
    Unreachable,  // Probe ceiling reached, degraded
    Failed,       // Provider error during apply
    Terminated,   // Destroyed
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Planned => "planned",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Provisioned => "provisioned",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Unreachable => "unreachable",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities ---

/// Operator-declared desired state for one instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub key: String,
    pub name: String,
    pub image: String,
    pub flavor: String,
    pub storage_size_gb: u64,
    pub storage_policy: String,
    pub os: OsKind,
    pub floating_ip: bool,
    pub credential: Credential,
    pub tags: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Tags as sent to the provider: declared tags plus the managed marker and OS kind.
    pub fn provider_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(MANAGED_TAG.to_string(), "true".to_string());
        tags.insert("os".to_string(), self.os.as_str().to_string());
        tags.insert("stratum-key".to_string(), self.key.clone());
        tags.insert(IMAGE_TAG.to_string(), self.image.clone());
        tags.insert(STORAGE_POLICY_TAG.to_string(), self.storage_policy.clone());
        tags
    }

    pub fn ssh_key_ref(&self) -> Option<&str> {
        match &self.credential {
            Credential::SshKey { key_ref } => Some(key_ref),
            Credential::Password { .. } => None,
        }
    }
}

/// Network placement resolved once per run and shared read-only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub key: String,
    pub id: String,
    pub name: String,
    pub os: OsKind,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub floating_ip_id: Option<String>,
    pub status: InstanceStatus,
}

impl ProvisionedInstance {
    /// Address used to reach the instance: the floating IP when one is attached.
    pub fn connect_address(&self) -> &str {
        self.public_ip.as_deref().unwrap_or(&self.private_ip)
    }
}

/// Derived per render, never persisted on its own.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    pub address: String,
    pub os: OsKind,
    pub user: String,
    pub credential: Credential,
}
