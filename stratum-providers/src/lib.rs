use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

pub use stratum_common::ProviderError;
use stratum_common::OsKind;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub mod retry;

pub use retry::{RetryPolicy, RetryingProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Vpc,
    Subnet,
    SecurityGroup,
    SshKey,
    Instance,
    FloatingIp,
    FloatingIpAssociation,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SshKey => "ssh_key",
            ResourceKind::Instance => "instance",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::FloatingIpAssociation => "floating_ip_association",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image: String,
    pub flavor: String,
    pub storage_size_gb: u64,
    pub storage_policy: String,
    pub os: OsKind,
    pub subnet_id: String,
    pub security_group_id: String,
    pub ssh_key_id: Option<String>,
    /// Boot-time script (cloud-init or cloudbase-init), if any.
    pub user_data: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Desired resource passed to `CloudProvider::ensure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    Vpc {
        name: String,
    },
    Subnet {
        name: String,
        vpc_id: String,
    },
    SecurityGroup {
        name: String,
        inbound_tcp_ports: Vec<u16>,
    },
    SshKey {
        name: String,
        public_key: String,
    },
    Instance(InstanceRequest),
    FloatingIp {
        name: String,
    },
    FloatingIpAssociation {
        floating_ip_id: String,
        instance_id: String,
    },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Vpc { .. } => ResourceKind::Vpc,
            ResourceSpec::Subnet { .. } => ResourceKind::Subnet,
            ResourceSpec::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            ResourceSpec::SshKey { .. } => ResourceKind::SshKey,
            ResourceSpec::Instance(_) => ResourceKind::Instance,
            ResourceSpec::FloatingIp { .. } => ResourceKind::FloatingIp,
            ResourceSpec::FloatingIpAssociation { .. } => ResourceKind::FloatingIpAssociation,
        }
    }

    /// Identity used for idempotent lookups and log lines.
    pub fn identity(&self) -> String {
        match self {
            ResourceSpec::Vpc { name }
            | ResourceSpec::Subnet { name, .. }
            | ResourceSpec::SecurityGroup { name, .. }
            | ResourceSpec::SshKey { name, .. }
            | ResourceSpec::FloatingIp { name } => name.clone(),
            ResourceSpec::Instance(req) => req.name.clone(),
            ResourceSpec::FloatingIpAssociation {
                floating_ip_id,
                instance_id,
            } => format!("{}->{}", floating_ip_id, instance_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub name: Option<String>,
    /// Parent resource (vpc for subnets).
    pub parent_id: Option<String>,
    /// Floating IP association lookups: the instance the IP is attached to.
    pub instance_id: Option<String>,
}

impl ResourceFilter {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn by_instance(instance_id: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create the resource unless one with the same identity already exists.
    /// Returns the provider id either way.
    async fn ensure(&self, spec: &ResourceSpec) -> ProviderResult<String>;

    async fn query(&self, kind: ResourceKind, filter: &ResourceFilter) -> ProviderResult<Vec<String>>;

    /// Returns Ok(false) when the resource was already gone.
    /// For `FloatingIpAssociation` the id is the floating IP id being detached.
    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<bool>;

    async fn describe_instance(&self, id: &str) -> ProviderResult<Option<inventory::DiscoveredInstance>>;

    /// All instances carrying the managed marker tag.
    async fn list_instances(&self) -> ProviderResult<Vec<inventory::DiscoveredInstance>>;

    // Optional: in-place tag update. Default is a no-op so providers without tag support compile.
    async fn set_tags(&self, _instance_id: &str, _tags: &BTreeMap<String, String>) -> ProviderResult<bool> {
        Ok(false)
    }
}

pub mod inventory {
    use std::collections::BTreeMap;
    use stratum_common::OsKind;

    /// Observed instance as reported by the provider.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DiscoveredInstance {
        pub provider_id: String,
        pub name: String,
        pub status: String,
        pub image: String,
        pub flavor: String,
        pub os: Option<OsKind>,
        pub storage_size_gb: Option<u64>,
        pub storage_policy: Option<String>,
        pub private_ip: Option<String>,
        pub public_ip: Option<String>,
        pub floating_ip_id: Option<String>,
        pub tags: BTreeMap<String, String>,
    }

    impl DiscoveredInstance {
        pub fn is_managed(&self) -> bool {
            self.tags.contains_key(stratum_common::MANAGED_TAG)
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "scaleway")]
pub mod scaleway;
