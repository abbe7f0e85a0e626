use crate::{
    inventory, CloudProvider, InstanceRequest, ProviderError, ProviderResult, ResourceFilter, ResourceKind,
    ResourceSpec,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use stratum_common::{OsKind, MANAGED_TAG};

#[derive(Debug, Clone)]
struct MockInstance {
    request: InstanceRequest,
    private_ip: String,
    status: String,
}

#[derive(Debug, Clone)]
struct MockIp {
    name: String,
    address: String,
    instance_id: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    next_private: u32,
    next_public: u32,
    vpcs: BTreeMap<String, String>,
    subnets: BTreeMap<String, (String, String)>,
    security_groups: BTreeMap<String, (String, BTreeSet<u16>)>,
    ssh_keys: BTreeMap<String, (String, String)>,
    instances: BTreeMap<String, MockInstance>,
    ips: BTreeMap<String, MockIp>,
    created: HashMap<ResourceKind, u32>,
    deleted: HashMap<ResourceKind, u32>,
    transient_budget: HashMap<String, u32>,
}

impl MockState {
    fn new_id(&mut self, kind: ResourceKind) -> String {
        self.next_id += 1;
        *self.created.entry(kind).or_insert(0) += 1;
        format!("{}-{}", kind.as_str().replace('_', ""), self.next_id)
    }
}

/// In-memory provider for local dry runs and tests.
///
/// Ids are deterministic (`<kind>-<n>`), private addresses come from 10.0.0.0/24 and
/// floating IPs from 51.15.0.0/24.
pub struct MockProvider {
    state: Mutex<MockState>,
    failing_instances: BTreeSet<String>,
    latency: Option<Duration>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            failing_instances: BTreeSet::new(),
            latency: None,
        }
    }

    /// Creating an instance with this name fails permanently (as with an invalid image).
    pub fn with_failing_instance(mut self, name: &str) -> Self {
        self.failing_instances.insert(name.to_string());
        self
    }

    /// The next `failures` create calls for this instance name fail with a transient error.
    pub fn with_transient_failures(self, name: &str, failures: u32) -> Self {
        self.lock().transient_budget.insert(name.to_string(), failures);
        self
    }

    /// Every call sleeps this long before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed an existing VPC / subnet / security group, as an operator would have created them.
    pub fn with_network(self, vpc: &str, subnet: &str, security_group: &str) -> Self {
        {
            let mut st = self.lock();
            st.next_id += 1;
            let vpc_id = format!("vpc-{}", st.next_id);
            st.vpcs.insert(vpc_id.clone(), vpc.to_string());
            st.next_id += 1;
            let subnet_id = format!("subnet-{}", st.next_id);
            st.subnets.insert(subnet_id, (subnet.to_string(), vpc_id));
            st.next_id += 1;
            let sg_id = format!("securitygroup-{}", st.next_id);
            st.security_groups
                .insert(sg_id, (security_group.to_string(), BTreeSet::new()));
        }
        self
    }

    /// Seed an instance created outside this tool (no managed tag).
    pub fn with_foreign_instance(self, name: &str) -> Self {
        {
            let mut st = self.lock();
            st.next_id += 1;
            let id = format!("instance-{}", st.next_id);
            st.next_private += 1;
            let private_ip = format!("10.0.0.{}", st.next_private + 3);
            let request = InstanceRequest {
                name: name.to_string(),
                image: "foreign-image".to_string(),
                flavor: "DEV1-S".to_string(),
                storage_size_gb: 20,
                storage_policy: "l_ssd".to_string(),
                os: OsKind::Linux,
                subnet_id: String::new(),
                security_group_id: String::new(),
                ssh_key_id: None,
                user_data: None,
                tags: BTreeMap::from([("owner".to_string(), "operator".to_string())]),
            };
            st.instances.insert(
                id,
                MockInstance {
                    request,
                    private_ip,
                    status: "running".to_string(),
                },
            );
        }
        self
    }

    /// Tags of an instance, managed or not.
    pub fn instance_tags(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.lock().instances.get(id).map(|i| i.request.tags.clone())
    }

    /// Number of resources of this kind created so far.
    pub fn created_count(&self, kind: ResourceKind) -> u32 {
        self.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn deleted_count(&self, kind: ResourceKind) -> u32 {
        self.lock().deleted.get(&kind).copied().unwrap_or(0)
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn security_group_ports(&self, name: &str) -> Vec<u16> {
        self.lock()
            .security_groups
            .values()
            .find(|(n, _)| n == name)
            .map(|(_, ports)| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    fn discovered(st: &MockState, id: &str, inst: &MockInstance) -> inventory::DiscoveredInstance {
        let ip = st
            .ips
            .iter()
            .find(|(_, ip)| ip.instance_id.as_deref() == Some(id));
        inventory::DiscoveredInstance {
            provider_id: id.to_string(),
            name: inst.request.name.clone(),
            status: inst.status.clone(),
            image: inst.request.image.clone(),
            flavor: inst.request.flavor.clone(),
            os: Some(inst.request.os),
            storage_size_gb: Some(inst.request.storage_size_gb),
            storage_policy: Some(inst.request.storage_policy.clone()),
            private_ip: Some(inst.private_ip.clone()),
            public_ip: ip.map(|(_, ip)| ip.address.clone()),
            floating_ip_id: ip.map(|(ip_id, _)| ip_id.clone()),
            tags: inst.request.tags.clone(),
        }
    }

    fn ensure_instance(&self, req: &InstanceRequest) -> ProviderResult<String> {
        let mut st = self.lock();
        if let Some((id, inst)) = st.instances.iter().find(|(_, i)| i.request.name == req.name) {
            if !inst.request.tags.contains_key(MANAGED_TAG) {
                return Err(ProviderError::permanent(
                    "name_conflict",
                    format!("mock: instance '{}' ({}) is not managed by stratum", req.name, id),
                ));
            }
            return Ok(id.clone());
        }
        if let Some(remaining) = st.transient_budget.get_mut(&req.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::transient("http_503", "mock: service unavailable"));
            }
        }
        if self.failing_instances.contains(&req.name) {
            return Err(ProviderError::permanent(
                "invalid_image",
                format!("mock: image '{}' rejected for {}", req.image, req.name),
            ));
        }
        if !st.subnets.contains_key(&req.subnet_id) {
            return Err(ProviderError::not_found(format!("subnet {}", req.subnet_id)));
        }
        if let Some(key_id) = &req.ssh_key_id {
            if !st.ssh_keys.contains_key(key_id) {
                return Err(ProviderError::not_found(format!("ssh key {}", key_id)));
            }
        }
        let id = st.new_id(ResourceKind::Instance);
        st.next_private += 1;
        let private_ip = format!("10.0.0.{}", st.next_private + 3);
        st.instances.insert(
            id.clone(),
            MockInstance {
                request: req.clone(),
                private_ip,
                status: "running".to_string(),
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ensure(&self, spec: &ResourceSpec) -> ProviderResult<String> {
        self.simulate_latency().await;
        match spec {
            ResourceSpec::Instance(req) => self.ensure_instance(req),
            ResourceSpec::Vpc { name } => {
                let mut st = self.lock();
                if let Some((id, _)) = st.vpcs.iter().find(|(_, n)| *n == name) {
                    return Ok(id.clone());
                }
                let id = st.new_id(ResourceKind::Vpc);
                st.vpcs.insert(id.clone(), name.clone());
                Ok(id)
            }
            ResourceSpec::Subnet { name, vpc_id } => {
                let mut st = self.lock();
                if !st.vpcs.contains_key(vpc_id) {
                    return Err(ProviderError::not_found(format!("vpc {}", vpc_id)));
                }
                if let Some((id, _)) = st
                    .subnets
                    .iter()
                    .find(|(_, (n, v))| n == name && v == vpc_id)
                {
                    return Ok(id.clone());
                }
                let id = st.new_id(ResourceKind::Subnet);
                st.subnets.insert(id.clone(), (name.clone(), vpc_id.clone()));
                Ok(id)
            }
            ResourceSpec::SecurityGroup {
                name,
                inbound_tcp_ports,
            } => {
                let mut st = self.lock();
                let existing = st
                    .security_groups
                    .iter()
                    .find(|(_, (n, _))| n == name)
                    .map(|(id, _)| id.clone());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = st.new_id(ResourceKind::SecurityGroup);
                        st.security_groups
                            .insert(id.clone(), (name.clone(), BTreeSet::new()));
                        id
                    }
                };
                if let Some((_, ports)) = st.security_groups.get_mut(&id) {
                    ports.extend(inbound_tcp_ports.iter().copied());
                }
                Ok(id)
            }
            ResourceSpec::SshKey { name, public_key } => {
                let mut st = self.lock();
                if let Some((id, _)) = st.ssh_keys.iter().find(|(_, (n, _))| n == name) {
                    return Ok(id.clone());
                }
                let id = st.new_id(ResourceKind::SshKey);
                st.ssh_keys.insert(id.clone(), (name.clone(), public_key.clone()));
                Ok(id)
            }
            ResourceSpec::FloatingIp { name } => {
                let mut st = self.lock();
                if let Some((id, _)) = st.ips.iter().find(|(_, ip)| ip.name == *name) {
                    return Ok(id.clone());
                }
                let id = st.new_id(ResourceKind::FloatingIp);
                st.next_public += 1;
                let address = format!("51.15.0.{}", st.next_public);
                st.ips.insert(
                    id.clone(),
                    MockIp {
                        name: name.clone(),
                        address,
                        instance_id: None,
                    },
                );
                Ok(id)
            }
            ResourceSpec::FloatingIpAssociation {
                floating_ip_id,
                instance_id,
            } => {
                let mut st = self.lock();
                if !st.instances.contains_key(instance_id) {
                    return Err(ProviderError::not_found(format!("instance {}", instance_id)));
                }
                let already = match st.ips.get(floating_ip_id) {
                    Some(ip) => ip.instance_id.as_deref() == Some(instance_id.as_str()),
                    None => {
                        return Err(ProviderError::not_found(format!(
                            "floating ip {}",
                            floating_ip_id
                        )))
                    }
                };
                if !already {
                    *st.created
                        .entry(ResourceKind::FloatingIpAssociation)
                        .or_insert(0) += 1;
                    if let Some(ip) = st.ips.get_mut(floating_ip_id) {
                        ip.instance_id = Some(instance_id.clone());
                    }
                }
                Ok(floating_ip_id.clone())
            }
        }
    }

    async fn query(&self, kind: ResourceKind, filter: &ResourceFilter) -> ProviderResult<Vec<String>> {
        self.simulate_latency().await;
        let st = self.lock();
        let name_ok = |n: &str| filter.name.as_deref().map_or(true, |f| f == n);
        let ids = match kind {
            ResourceKind::Vpc => st
                .vpcs
                .iter()
                .filter(|(_, n)| name_ok(n.as_str()))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::Subnet => st
                .subnets
                .iter()
                .filter(|(_, (n, vpc))| {
                    name_ok(n.as_str()) && filter.parent_id.as_deref().map_or(true, |p| p == vpc.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::SecurityGroup => st
                .security_groups
                .iter()
                .filter(|(_, (n, _))| name_ok(n.as_str()))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::SshKey => st
                .ssh_keys
                .iter()
                .filter(|(_, (n, _))| name_ok(n.as_str()))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::Instance => st
                .instances
                .iter()
                .filter(|(_, i)| name_ok(&i.request.name))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::FloatingIp => st
                .ips
                .iter()
                .filter(|(_, ip)| name_ok(&ip.name))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::FloatingIpAssociation => st
                .ips
                .iter()
                .filter(|(_, ip)| {
                    ip.instance_id.is_some()
                        && filter
                            .instance_id
                            .as_deref()
                            .map_or(true, |want| ip.instance_id.as_deref() == Some(want))
                })
                .map(|(id, _)| id.clone())
                .collect(),
        };
        Ok(ids)
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<bool> {
        self.simulate_latency().await;
        let mut st = self.lock();
        let removed = match kind {
            ResourceKind::Vpc => st.vpcs.remove(id).is_some(),
            ResourceKind::Subnet => st.subnets.remove(id).is_some(),
            ResourceKind::SecurityGroup => st.security_groups.remove(id).is_some(),
            ResourceKind::SshKey => st.ssh_keys.remove(id).is_some(),
            ResourceKind::Instance => {
                let removed = st.instances.remove(id).is_some();
                for ip in st.ips.values_mut() {
                    if ip.instance_id.as_deref() == Some(id) {
                        ip.instance_id = None;
                    }
                }
                removed
            }
            ResourceKind::FloatingIp => st.ips.remove(id).is_some(),
            ResourceKind::FloatingIpAssociation => match st.ips.get_mut(id) {
                Some(ip) => ip.instance_id.take().is_some(),
                None => false,
            },
        };
        if removed {
            *st.deleted.entry(kind).or_insert(0) += 1;
        }
        Ok(removed)
    }

    async fn describe_instance(&self, id: &str) -> ProviderResult<Option<inventory::DiscoveredInstance>> {
        self.simulate_latency().await;
        let st = self.lock();
        Ok(st
            .instances
            .get(id)
            .map(|inst| Self::discovered(&st, id, inst)))
    }

    async fn list_instances(&self) -> ProviderResult<Vec<inventory::DiscoveredInstance>> {
        self.simulate_latency().await;
        let st = self.lock();
        Ok(st
            .instances
            .iter()
            .map(|(id, inst)| Self::discovered(&st, id, inst))
            .filter(|d| d.is_managed())
            .collect())
    }

    async fn set_tags(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> ProviderResult<bool> {
        self.simulate_latency().await;
        let mut st = self.lock();
        match st.instances.get_mut(instance_id) {
            Some(inst) => {
                inst.request.tags = tags.clone();
                Ok(true)
            }
            None => Err(ProviderError::not_found(format!("instance {}", instance_id))),
        }
    }
}
