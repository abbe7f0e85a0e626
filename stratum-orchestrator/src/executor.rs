use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use stratum_common::journal::{ActionStatus, ActionType};
use stratum_common::{
    InstanceSpec, InstanceStatus, NetworkRef, PartialApplyError, ProviderError, ProvisionedInstance, StratumError,
};
use stratum_providers::inventory::DiscoveredInstance;
use stratum_providers::{CloudProvider, InstanceRequest, ProviderResult, ResourceFilter, ResourceKind, ResourceSpec};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bootstrap;
use crate::logger::ActionLog;
use crate::manifest::{Manifest, NetworkSpec};
use crate::planner::{Change, Operation, Plan};
use crate::state_machine::StateTracker;

const DESCRIBE_ATTEMPTS: u32 = 5;
const DESCRIBE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Name of the floating IP reserved for an instance.
pub fn floating_ip_name(instance_name: &str) -> String {
    format!("{}-fip", instance_name)
}

enum TaskOutcome<T> {
    Done(T),
    Failed(ProviderError),
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub network: Option<NetworkRef>,
    /// instance key -> provisioned instance (addresses resolved)
    pub instances: BTreeMap<String, ProvisionedInstance>,
    /// instance key -> floating IP id
    pub associations: BTreeMap<String, String>,
    /// Provider ids of removed instances (replacements and orphans).
    pub removed: Vec<String>,
    /// key -> "<stage>: <error>"
    pub failures: BTreeMap<String, String>,
    /// Keys whose work was not started because the run was cancelled.
    pub skipped: BTreeSet<String>,
}

impl ApplyReport {
    pub fn partial_error(&self) -> Option<PartialApplyError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(PartialApplyError {
                failures: self.failures.clone(),
            })
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    pub fn instance_list(&self) -> Vec<ProvisionedInstance> {
        self.instances.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyReport {
    /// Keys whose instance was deleted (or already gone).
    pub instances_removed: Vec<String>,
    pub floating_ips_released: Vec<String>,
    pub ssh_keys_removed: Vec<String>,
    pub network_removed: Vec<String>,
    pub failures: BTreeMap<String, String>,
    pub skipped: BTreeSet<String>,
}

impl DestroyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

enum Removal {
    /// `release_ip` is set when the replacement no longer wants a floating IP.
    Replace { instance_id: String, release_ip: Option<String> },
    Orphan { instance_id: String, floating_ip_id: Option<String> },
}

/// Runs a plan against a provider in fixed dependency tiers.
/// Work inside a tier runs on at most `workers` concurrent tasks; tiers are sequential.
pub struct Executor {
    provider: Arc<dyn CloudProvider>,
    workers: usize,
    cancel: CancellationToken,
    journal: Arc<ActionLog>,
    states: Arc<StateTracker>,
}

impl Executor {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        workers: usize,
        cancel: CancellationToken,
        journal: Arc<ActionLog>,
        states: Arc<StateTracker>,
    ) -> Self {
        Self {
            provider,
            workers: workers.max(1),
            cancel,
            journal,
            states,
        }
    }

    /// Spawn one task per item, bounded by the worker semaphore. Cancellation is checked
    /// once a permit is held; tasks already running are never aborted.
    async fn run_tier<I, T, F, Fut>(&self, action: ActionType, items: Vec<(String, I)>, op: F) -> Vec<(String, TaskOutcome<T>)>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<dyn CloudProvider>, I) -> Fut,
        Fut: Future<Output = ProviderResult<T>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let labels: Vec<String> = items.iter().map(|(l, _)| l.clone()).collect();
        let mut set = JoinSet::new();

        for (idx, (label, item)) in items.into_iter().enumerate() {
            let call = op(self.provider.clone(), item);
            let semaphore = semaphore.clone();
            let cancel = self.cancel.clone();
            let journal = self.journal.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, TaskOutcome::Skipped);
                };
                if cancel.is_cancelled() {
                    journal
                        .log_quick(action, ActionStatus::Skipped, Some(&label), None)
                        .await;
                    return (idx, TaskOutcome::Skipped);
                }
                let pending = journal.log_event(action, Some(&label), None).await;
                match call.await {
                    Ok(v) => {
                        journal
                            .log_event_complete(pending, ActionStatus::Success, None, None)
                            .await;
                        (idx, TaskOutcome::Done(v))
                    }
                    Err(e) => {
                        journal
                            .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                            .await;
                        (idx, TaskOutcome::Failed(e))
                    }
                }
            });
        }

        let mut outcomes: BTreeMap<usize, TaskOutcome<T>> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    outcomes.insert(idx, outcome);
                }
                Err(e) => tracing::error!("❌ [executor] {} task aborted: {}", action.as_str(), e),
            }
        }

        labels
            .into_iter()
            .enumerate()
            .map(|(idx, label)| {
                let outcome = outcomes.remove(&idx).unwrap_or_else(|| {
                    TaskOutcome::Failed(ProviderError::permanent("task_aborted", "worker task panicked"))
                });
                (label, outcome)
            })
            .collect()
    }

    async fn fail(&self, report: &mut ApplyReport, key: &str, stage: &str, err: &ProviderError) {
        tracing::error!("❌ [executor] {} failed at {}: {}", key, stage, err);
        report
            .failures
            .insert(key.to_string(), format!("{}: {}", stage, err));
        self.states.mark_failed(key, &format!("{}: {}", stage, err)).await;
    }

    async fn lookup_or_create(
        &self,
        kind: ResourceKind,
        filter: ResourceFilter,
        spec: ResourceSpec,
        create: bool,
    ) -> ProviderResult<String> {
        if let Some(id) = self.provider.query(kind, &filter).await?.into_iter().next() {
            return Ok(id);
        }
        if create {
            tracing::info!("🔵 [executor] creating {} '{}'", kind, spec.identity());
            self.provider.ensure(&spec).await
        } else {
            Err(ProviderError::not_found(format!("{} '{}'", kind, spec.identity())))
        }
    }

    /// Resolve (or create) the shared network once. The security group always gets
    /// the inbound rules the declared OS kinds need.
    pub async fn resolve_network(&self, spec: &NetworkSpec, ports: &[u16]) -> Result<NetworkRef, StratumError> {
        let pending = self
            .journal
            .log_event(
                ActionType::ResolveNetwork,
                None,
                Some(serde_json::json!({
                    "vpc": spec.vpc,
                    "subnet": spec.subnet,
                    "security_group": spec.security_group,
                    "create_missing": spec.create_missing,
                })),
            )
            .await;

        let result: ProviderResult<NetworkRef> = async {
            let vpc_id = self
                .lookup_or_create(
                    ResourceKind::Vpc,
                    ResourceFilter::by_name(&spec.vpc),
                    ResourceSpec::Vpc { name: spec.vpc.clone() },
                    spec.create_missing,
                )
                .await?;
            let subnet_id = self
                .lookup_or_create(
                    ResourceKind::Subnet,
                    ResourceFilter {
                        name: Some(spec.subnet.clone()),
                        parent_id: Some(vpc_id.clone()),
                        instance_id: None,
                    },
                    ResourceSpec::Subnet {
                        name: spec.subnet.clone(),
                        vpc_id: vpc_id.clone(),
                    },
                    spec.create_missing,
                )
                .await?;
            let sg_exists = !self
                .provider
                .query(ResourceKind::SecurityGroup, &ResourceFilter::by_name(&spec.security_group))
                .await?
                .is_empty();
            if !sg_exists && !spec.create_missing {
                return Err(ProviderError::not_found(format!(
                    "security_group '{}'",
                    spec.security_group
                )));
            }
            let security_group_id = self
                .provider
                .ensure(&ResourceSpec::SecurityGroup {
                    name: spec.security_group.clone(),
                    inbound_tcp_ports: ports.to_vec(),
                })
                .await?;
            Ok(NetworkRef {
                vpc_id,
                subnet_id,
                security_group_id,
            })
        }
        .await;

        match result {
            Ok(net) => {
                tracing::info!(
                    "✅ [executor] network resolved: vpc={} subnet={} sg={}",
                    net.vpc_id,
                    net.subnet_id,
                    net.security_group_id
                );
                self.journal
                    .log_event_complete(
                        pending,
                        ActionStatus::Success,
                        None,
                        serde_json::to_value(&net).ok(),
                    )
                    .await;
                Ok(net)
            }
            Err(e) => {
                tracing::error!("❌ [executor] network resolution failed: {}", e);
                self.journal
                    .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                    .await;
                Err(StratumError::Provider(e))
            }
        }
    }

    fn instance_request(
        spec: &InstanceSpec,
        network: &NetworkRef,
        manifest: &Manifest,
        ssh_key_id: Option<String>,
    ) -> InstanceRequest {
        let public_key = spec
            .ssh_key_ref()
            .and_then(|r| manifest.ssh_keys.get(r))
            .map(|k| k.public_key.as_str());
        InstanceRequest {
            name: spec.name.clone(),
            image: spec.image.clone(),
            flavor: spec.flavor.clone(),
            storage_size_gb: spec.storage_size_gb,
            storage_policy: spec.storage_policy.clone(),
            os: spec.os,
            subnet_id: network.subnet_id.clone(),
            security_group_id: network.security_group_id.clone(),
            ssh_key_id,
            user_data: bootstrap::user_data(spec, public_key),
            tags: spec.provider_tags(),
        }
    }

    /// Apply `plan`. Only network resolution failures abort the run; everything else is
    /// isolated per key and recorded in the report.
    pub async fn apply(&self, manifest: &Manifest, plan: &Plan) -> Result<ApplyReport, StratumError> {
        let mut report = ApplyReport::default();

        let mut live: BTreeSet<String> = BTreeSet::new();
        for op in &plan.operations {
            if let Some(key) = op.key() {
                if manifest.instances.contains_key(key) {
                    self.states.plan(key).await;
                    live.insert(key.to_string());
                }
            }
        }

        if self.cancel.is_cancelled() {
            tracing::warn!("⚠️ [executor] run cancelled before start");
            report.skipped = live;
            return Ok(report);
        }

        let network = self
            .resolve_network(&manifest.network, &manifest.required_ports())
            .await?;
        report.network = Some(network.clone());

        // --- SSH keys ---
        let needed: BTreeSet<String> = live
            .iter()
            .filter_map(|k| manifest.instances.get(k))
            .filter_map(|s| s.ssh_key_ref().map(str::to_string))
            .collect();
        let items: Vec<(String, ResourceSpec)> = needed
            .iter()
            .filter_map(|name| manifest.ssh_keys.get(name))
            .map(|k| {
                (
                    k.name.clone(),
                    ResourceSpec::SshKey {
                        name: k.name.clone(),
                        public_key: k.public_key.clone(),
                    },
                )
            })
            .collect();
        let mut ssh_ids: BTreeMap<String, String> = BTreeMap::new();
        let mut ssh_errors: BTreeMap<String, Option<ProviderError>> = BTreeMap::new();
        for (name, outcome) in self
            .run_tier(ActionType::EnsureSshKey, items, |p, spec| async move { p.ensure(&spec).await })
            .await
        {
            match outcome {
                TaskOutcome::Done(id) => {
                    ssh_ids.insert(name, id);
                }
                TaskOutcome::Failed(e) => {
                    ssh_errors.insert(name, Some(e));
                }
                TaskOutcome::Skipped => {
                    ssh_errors.insert(name, None);
                }
            }
        }
        for key in live.clone() {
            let Some(key_ref) = manifest.instances.get(&key).and_then(|s| s.ssh_key_ref()) else {
                continue;
            };
            match ssh_errors.get(key_ref) {
                Some(Some(e)) => {
                    self.fail(&mut report, &key, "ssh_key", e).await;
                    live.remove(&key);
                }
                Some(None) => {
                    report.skipped.insert(key.clone());
                    live.remove(&key);
                }
                None => {}
            }
        }

        // --- Removals (replacements and orphans) ---
        let mut removals: Vec<(String, Removal)> = Vec::new();
        for op in &plan.operations {
            match op {
                Operation::Replace {
                    key,
                    existing_id,
                    floating_ip_id,
                    reasons,
                } if live.contains(key) => {
                    tracing::info!("🔄 [executor] replacing {} ({})", key, reasons.join(", "));
                    let keeps_ip = manifest.instances.get(key).is_some_and(|s| s.floating_ip);
                    removals.push((
                        key.clone(),
                        Removal::Replace {
                            instance_id: existing_id.clone(),
                            release_ip: floating_ip_id.clone().filter(|_| !keeps_ip),
                        },
                    ));
                }
                Operation::Delete {
                    name,
                    existing_id,
                    floating_ip_id,
                } => removals.push((
                    name.clone(),
                    Removal::Orphan {
                        instance_id: existing_id.clone(),
                        floating_ip_id: floating_ip_id.clone(),
                    },
                )),
                _ => {}
            }
        }
        let removal_ids: BTreeMap<String, String> = removals
            .iter()
            .map(|(label, r)| match r {
                Removal::Replace { instance_id, .. } | Removal::Orphan { instance_id, .. } => {
                    (label.clone(), instance_id.clone())
                }
            })
            .collect();
        for (label, outcome) in self
            .run_tier(ActionType::RemoveInstance, removals, |p, removal| async move {
                let (instance_id, release_ip) = match removal {
                    Removal::Replace {
                        instance_id,
                        release_ip,
                    } => (instance_id, release_ip),
                    Removal::Orphan {
                        instance_id,
                        floating_ip_id,
                    } => (instance_id, floating_ip_id),
                };
                let removed = p.delete(ResourceKind::Instance, &instance_id).await?;
                if let Some(ip) = release_ip {
                    p.delete(ResourceKind::FloatingIp, &ip).await?;
                }
                Ok(removed)
            })
            .await
        {
            let is_declared = live.contains(&label);
            match outcome {
                TaskOutcome::Done(_) => {
                    if let Some(id) = removal_ids.get(&label) {
                        report.removed.push(id.clone());
                    }
                }
                TaskOutcome::Failed(e) if is_declared => {
                    self.fail(&mut report, &label, "remove", &e).await;
                    live.remove(&label);
                }
                TaskOutcome::Failed(e) => {
                    tracing::error!("❌ [executor] orphan {} not removed: {}", label, e);
                    report.failures.insert(label, format!("remove: {}", e));
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(label.clone());
                    live.remove(&label);
                }
            }
        }

        // --- Instances ---
        let mut items: Vec<(String, (InstanceRequest, bool))> = Vec::new();
        for key in &live {
            let Some(spec) = manifest.instances.get(key) else {
                continue;
            };
            let ssh_key_id = spec.ssh_key_ref().and_then(|r| ssh_ids.get(r)).cloned();
            let update_tags = matches!(
                plan.operation_for(key),
                Some(Operation::Update { changes, .. }) if changes.contains(&Change::Tags)
            );
            items.push((
                key.clone(),
                (
                    Self::instance_request(spec, &network, manifest, ssh_key_id),
                    update_tags,
                ),
            ));
        }
        for (key, _) in &items {
            self.states.planned_to_provisioning(key, "ensure instance").await;
        }
        let mut instance_ids: BTreeMap<String, String> = BTreeMap::new();
        for (key, outcome) in self
            .run_tier(ActionType::ProvisionInstance, items, |p, (req, update_tags)| async move {
                let tags = req.tags.clone();
                let id = p.ensure(&ResourceSpec::Instance(req)).await?;
                if update_tags {
                    p.set_tags(&id, &tags).await?;
                }
                Ok(id)
            })
            .await
        {
            match outcome {
                TaskOutcome::Done(id) => {
                    tracing::info!("✅ [executor] instance {} -> {}", key, id);
                    instance_ids.insert(key, id);
                }
                TaskOutcome::Failed(e) => {
                    self.fail(&mut report, &key, "instance", &e).await;
                    live.remove(&key);
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(key.clone());
                    live.remove(&key);
                }
            }
        }

        // --- Floating IP detachments (flag turned off) ---
        let detach: Vec<(String, String)> = plan
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Update { key, changes, .. } if live.contains(key) => {
                    changes.iter().find_map(|c| match c {
                        Change::DetachFloatingIp { floating_ip_id } => {
                            Some((key.clone(), floating_ip_id.clone()))
                        }
                        _ => None,
                    })
                }
                _ => None,
            })
            .collect();
        for (key, outcome) in self
            .run_tier(ActionType::ReleaseFloatingIp, detach, |p, ip| async move {
                p.delete(ResourceKind::FloatingIpAssociation, &ip).await?;
                p.delete(ResourceKind::FloatingIp, &ip).await
            })
            .await
        {
            match outcome {
                TaskOutcome::Done(_) => {}
                TaskOutcome::Failed(e) => {
                    self.fail(&mut report, &key, "release_floating_ip", &e).await;
                    live.remove(&key);
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(key.clone());
                    live.remove(&key);
                }
            }
        }

        // --- Floating IPs ---
        let items: Vec<(String, ResourceSpec)> = live
            .iter()
            .filter_map(|k| manifest.instances.get(k))
            .filter(|s| s.floating_ip)
            .map(|s| {
                (
                    s.key.clone(),
                    ResourceSpec::FloatingIp {
                        name: floating_ip_name(&s.name),
                    },
                )
            })
            .collect();
        let mut ip_ids: BTreeMap<String, String> = BTreeMap::new();
        for (key, outcome) in self
            .run_tier(ActionType::EnsureFloatingIp, items, |p, spec| async move { p.ensure(&spec).await })
            .await
        {
            match outcome {
                TaskOutcome::Done(id) => {
                    ip_ids.insert(key, id);
                }
                TaskOutcome::Failed(e) => {
                    self.fail(&mut report, &key, "floating_ip", &e).await;
                    live.remove(&key);
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(key.clone());
                    live.remove(&key);
                }
            }
        }

        // --- Associations ---
        let items: Vec<(String, ResourceSpec)> = ip_ids
            .iter()
            .filter_map(|(key, ip)| {
                instance_ids.get(key).map(|inst| {
                    (
                        key.clone(),
                        ResourceSpec::FloatingIpAssociation {
                            floating_ip_id: ip.clone(),
                            instance_id: inst.clone(),
                        },
                    )
                })
            })
            .collect();
        for (key, outcome) in self
            .run_tier(ActionType::AssociateFloatingIp, items, |p, spec| async move { p.ensure(&spec).await })
            .await
        {
            match outcome {
                TaskOutcome::Done(ip) => {
                    report.associations.insert(key, ip);
                }
                TaskOutcome::Failed(e) => {
                    self.fail(&mut report, &key, "associate", &e).await;
                    live.remove(&key);
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(key.clone());
                    live.remove(&key);
                }
            }
        }

        // --- Describe ---
        let items: Vec<(String, String)> = live
            .iter()
            .filter_map(|k| instance_ids.get(k).map(|id| (k.clone(), id.clone())))
            .collect();
        for (key, outcome) in self
            .run_tier(ActionType::DescribeInstance, items, |p, id| async move {
                // Private addresses can lag behind the create call.
                for attempt in 1..=DESCRIBE_ATTEMPTS {
                    match p.describe_instance(&id).await? {
                        Some(d) if d.private_ip.is_some() => return Ok(d),
                        Some(_) if attempt < DESCRIBE_ATTEMPTS => {
                            tokio::time::sleep(DESCRIBE_INTERVAL).await;
                        }
                        Some(_) => break,
                        None => return Err(ProviderError::not_found(format!("instance {}", id))),
                    }
                }
                Err(ProviderError::permanent(
                    "no_private_ip",
                    format!("instance {} has no private address", id),
                ))
            })
            .await
        {
            match outcome {
                TaskOutcome::Done(d) => {
                    let Some(spec) = manifest.instances.get(&key) else {
                        continue;
                    };
                    let inst = ProvisionedInstance {
                        key: key.clone(),
                        id: d.provider_id,
                        name: d.name,
                        os: spec.os,
                        private_ip: d.private_ip.unwrap_or_default(),
                        public_ip: d.public_ip,
                        floating_ip_id: d.floating_ip_id,
                        status: InstanceStatus::Provisioned,
                    };
                    self.states
                        .provisioning_to_provisioned(&key, "addresses resolved")
                        .await;
                    report.instances.insert(key, inst);
                }
                TaskOutcome::Failed(e) => {
                    self.fail(&mut report, &key, "describe", &e).await;
                }
                TaskOutcome::Skipped => {
                    report.skipped.insert(key);
                }
            }
        }

        if report.failures.is_empty() {
            tracing::info!("✅ [executor] apply complete: {} instance(s)", report.instances.len());
        } else {
            tracing::warn!(
                "⚠️ [executor] apply degraded: {} ok, {} failed",
                report.instances.len(),
                report.failures.len()
            );
        }
        Ok(report)
    }

    /// Tear down declared instances in reverse dependency order.
    /// `targets` pairs each declared key with the observed instance it maps to.
    pub async fn destroy(
        &self,
        manifest: &Manifest,
        targets: Vec<(String, DiscoveredInstance)>,
    ) -> Result<DestroyReport, StratumError> {
        let mut report = DestroyReport::default();

        // --- Dissociate ---
        let items: Vec<(String, String)> = targets
            .iter()
            .filter_map(|(k, d)| d.floating_ip_id.clone().map(|ip| (k.clone(), ip)))
            .collect();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        for (key, outcome) in self
            .run_tier(ActionType::DissociateFloatingIp, items, |p, ip| async move {
                p.delete(ResourceKind::FloatingIpAssociation, &ip).await
            })
            .await
        {
            self.record_destroy_outcome(&mut report, &mut blocked, &key, "dissociate", outcome, |_, _| {});
        }

        // --- Release floating IPs (attached or reserved by name) ---
        let mut ips: BTreeMap<String, (String, String)> = BTreeMap::new();
        for (key, d) in &targets {
            if let Some(ip) = &d.floating_ip_id {
                ips.insert(ip.clone(), (key.clone(), ip.clone()));
            }
        }
        for spec in manifest.instances.values().filter(|s| s.floating_ip) {
            if let Ok(found) = self
                .provider
                .query(ResourceKind::FloatingIp, &ResourceFilter::by_name(&floating_ip_name(&spec.name)))
                .await
            {
                for ip in found {
                    ips.entry(ip.clone()).or_insert_with(|| (spec.key.clone(), ip));
                }
            }
        }
        let items: Vec<(String, String)> = ips.into_values().filter(|(k, _)| !blocked.contains(k)).collect();
        for (key, outcome) in self
            .run_tier(ActionType::ReleaseFloatingIp, items, |p, ip| async move {
                p.delete(ResourceKind::FloatingIp, &ip).await?;
                Ok(ip)
            })
            .await
        {
            self.record_destroy_outcome(&mut report, &mut blocked, &key, "release_floating_ip", outcome, |r, ip| {
                r.floating_ips_released.push(ip)
            });
        }

        // --- Instances ---
        let items: Vec<(String, String)> = targets
            .iter()
            .filter(|(k, _)| !blocked.contains(k))
            .map(|(k, d)| (k.clone(), d.provider_id.clone()))
            .collect();
        let mut terminated: Vec<String> = Vec::new();
        for (key, outcome) in self
            .run_tier(ActionType::RemoveInstance, items, |p, id| async move {
                p.delete(ResourceKind::Instance, &id).await
            })
            .await
        {
            if matches!(outcome, TaskOutcome::Done(_)) {
                terminated.push(key.clone());
            }
            self.record_destroy_outcome(&mut report, &mut blocked, &key, "instance", outcome, |r, _| {
                r.instances_removed.push(key.clone())
            });
        }
        for key in &terminated {
            self.states.mark_terminated(key, "destroyed").await;
        }

        if !report.failures.is_empty() || !report.skipped.is_empty() {
            tracing::warn!("⚠️ [executor] instances remain, keeping ssh keys and network");
            return Ok(report);
        }

        // --- SSH keys ---
        let mut items: Vec<(String, String)> = Vec::new();
        for name in manifest.ssh_keys.keys() {
            let found = self
                .provider
                .query(ResourceKind::SshKey, &ResourceFilter::by_name(name))
                .await?;
            items.extend(found.into_iter().map(|id| (format!("ssh_key:{}", name), id)));
        }
        for (label, outcome) in self
            .run_tier(ActionType::RemoveSshKey, items, |p, id| async move {
                p.delete(ResourceKind::SshKey, &id).await
            })
            .await
        {
            let name = label.trim_start_matches("ssh_key:").to_string();
            self.record_destroy_outcome(&mut report, &mut blocked, &label, "ssh_key", outcome, |r, _| {
                r.ssh_keys_removed.push(name.clone())
            });
        }

        // --- Network (only what this tool created) ---
        if manifest.network.create_missing && report.failures.is_empty() && !self.cancel.is_cancelled() {
            self.destroy_network(&manifest.network, &mut report).await?;
        }

        Ok(report)
    }

    fn record_destroy_outcome<T>(
        &self,
        report: &mut DestroyReport,
        blocked: &mut BTreeSet<String>,
        key: &str,
        stage: &str,
        outcome: TaskOutcome<T>,
        on_done: impl FnOnce(&mut DestroyReport, T),
    ) {
        match outcome {
            TaskOutcome::Done(v) => on_done(report, v),
            TaskOutcome::Failed(e) => {
                tracing::error!("❌ [executor] destroy {} failed at {}: {}", key, stage, e);
                report.failures.insert(key.to_string(), format!("{}: {}", stage, e));
                blocked.insert(key.to_string());
            }
            TaskOutcome::Skipped => {
                report.skipped.insert(key.to_string());
                blocked.insert(key.to_string());
            }
        }
    }

    async fn destroy_network(&self, spec: &NetworkSpec, report: &mut DestroyReport) -> Result<(), StratumError> {
        let pending = self.journal.log_event(ActionType::RemoveNetwork, None, None).await;
        let result: ProviderResult<()> = async {
            for id in self
                .provider
                .query(ResourceKind::SecurityGroup, &ResourceFilter::by_name(&spec.security_group))
                .await?
            {
                if self.provider.delete(ResourceKind::SecurityGroup, &id).await? {
                    report.network_removed.push(format!("security_group:{}", spec.security_group));
                }
            }
            let vpcs = self
                .provider
                .query(ResourceKind::Vpc, &ResourceFilter::by_name(&spec.vpc))
                .await?;
            for vpc in &vpcs {
                let filter = ResourceFilter {
                    name: Some(spec.subnet.clone()),
                    parent_id: Some(vpc.clone()),
                    instance_id: None,
                };
                for id in self.provider.query(ResourceKind::Subnet, &filter).await? {
                    if self.provider.delete(ResourceKind::Subnet, &id).await? {
                        report.network_removed.push(format!("subnet:{}", spec.subnet));
                    }
                }
            }
            for vpc in vpcs {
                if self.provider.delete(ResourceKind::Vpc, &vpc).await? {
                    report.network_removed.push(format!("vpc:{}", spec.vpc));
                }
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.journal
                    .log_event_complete(pending, ActionStatus::Success, None, None)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.journal
                    .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                    .await;
                report.failures.insert("network".to_string(), format!("network: {}", e));
                Ok(())
            }
        }
    }
}
