use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use stratum_common::{InstanceSpec, StratumError, IMAGE_TAG, STORAGE_POLICY_TAG};
use stratum_providers::inventory::DiscoveredInstance;

/// In-place change applied by an `Update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    Tags,
    AttachFloatingIp,
    DetachFloatingIp { floating_ip_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        key: String,
    },
    /// Immutable attribute changed: delete `existing_id`, then create.
    /// `floating_ip_id` is the address attached to the old instance.
    Replace {
        key: String,
        existing_id: String,
        floating_ip_id: Option<String>,
        reasons: Vec<String>,
    },
    Update {
        key: String,
        existing_id: String,
        changes: Vec<Change>,
    },
    Unchanged {
        key: String,
        existing_id: String,
    },
    /// Managed instance no longer declared.
    Delete {
        name: String,
        existing_id: String,
        floating_ip_id: Option<String>,
    },
}

impl Operation {
    /// Declared key, `None` for deletions of undeclared instances.
    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::Create { key }
            | Operation::Replace { key, .. }
            | Operation::Update { key, .. }
            | Operation::Unchanged { key, .. } => Some(key),
            Operation::Delete { .. } => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Unchanged { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create { key } => write!(f, "+ create   {}", key),
            Operation::Replace { key, reasons, .. } => {
                write!(f, "± replace  {} ({})", key, reasons.join(", "))
            }
            Operation::Update { key, changes, .. } => {
                let names: Vec<&str> = changes
                    .iter()
                    .map(|c| match c {
                        Change::Tags => "tags",
                        Change::AttachFloatingIp => "attach floating ip",
                        Change::DetachFloatingIp { .. } => "detach floating ip",
                    })
                    .collect();
                write!(f, "~ update   {} ({})", key, names.join(", "))
            }
            Operation::Unchanged { key, .. } => write!(f, "  ok       {}", key),
            Operation::Delete { name, existing_id, .. } => {
                write!(f, "- delete   {} [{}]", name, existing_id)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub replace: usize,
    pub update: usize,
    pub unchanged: usize,
    pub delete: usize,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for op in &self.operations {
            match op {
                Operation::Create { .. } => s.create += 1,
                Operation::Replace { .. } => s.replace += 1,
                Operation::Update { .. } => s.update += 1,
                Operation::Unchanged { .. } => s.unchanged += 1,
                Operation::Delete { .. } => s.delete += 1,
            }
        }
        s
    }

    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(Operation::is_mutation)
    }

    pub fn operation_for(&self, key: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.key() == Some(key))
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to replace, {} to update, {} unchanged, {} to delete",
            self.create, self.replace, self.update, self.unchanged, self.delete
        )
    }
}

/// Fails with `PlanConflict` when two keys declare the same instance name.
pub fn check_unique_names(desired: &BTreeMap<String, InstanceSpec>) -> Result<(), StratumError> {
    let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for spec in desired.values() {
        by_name.entry(spec.name.as_str()).or_default().push(spec.key.clone());
    }
    match by_name.into_iter().find(|(_, keys)| keys.len() > 1) {
        Some((name, keys)) => Err(StratumError::PlanConflict {
            name: name.to_string(),
            keys,
        }),
        None => Ok(()),
    }
}

/// Fails with `PlanConflict` when the provider holds more than one managed instance
/// under a declared name.
fn check_unique_observed(
    desired: &BTreeMap<String, InstanceSpec>,
    observed: &[DiscoveredInstance],
) -> Result<(), StratumError> {
    for spec in desired.values() {
        let mut ids: Vec<String> = observed
            .iter()
            .filter(|i| i.is_managed() && i.name == spec.name)
            .map(|i| i.provider_id.clone())
            .collect();
        if ids.len() > 1 {
            ids.sort();
            return Err(StratumError::PlanConflict {
                name: spec.name.clone(),
                keys: ids,
            });
        }
    }
    Ok(())
}

/// Attributes that cannot change in place.
/// Image and storage policy come from the tags written at creation; providers report their
/// own identifiers (image UUID, volume type) for both.
fn replacement_reasons(spec: &InstanceSpec, observed: &DiscoveredInstance) -> Vec<String> {
    let mut reasons = Vec::new();
    if let Some(os) = observed.os {
        if os != spec.os {
            reasons.push(format!("os {} -> {}", os, spec.os));
        }
    }
    let image = observed.tags.get(IMAGE_TAG).unwrap_or(&observed.image);
    if image != &spec.image {
        reasons.push(format!("image {} -> {}", image, spec.image));
    }
    if observed.flavor != spec.flavor {
        reasons.push(format!("flavor {} -> {}", observed.flavor, spec.flavor));
    }
    if let Some(size) = observed.storage_size_gb {
        if size != spec.storage_size_gb {
            reasons.push(format!("storage {}GB -> {}GB", size, spec.storage_size_gb));
        }
    }
    let policy = observed
        .tags
        .get(STORAGE_POLICY_TAG)
        .or(observed.storage_policy.as_ref());
    if let Some(policy) = policy {
        if policy != &spec.storage_policy {
            reasons.push(format!("storage policy {} -> {}", policy, spec.storage_policy));
        }
    }
    reasons
}

fn in_place_changes(spec: &InstanceSpec, observed: &DiscoveredInstance) -> Vec<Change> {
    let mut changes = Vec::new();
    if observed.tags != spec.provider_tags() {
        changes.push(Change::Tags);
    }
    match (spec.floating_ip, &observed.floating_ip_id) {
        (true, None) => changes.push(Change::AttachFloatingIp),
        (false, Some(id)) => changes.push(Change::DetachFloatingIp {
            floating_ip_id: id.clone(),
        }),
        _ => {}
    }
    changes
}

/// Diff desired specs against observed managed instances.
///
/// Deletions come first (sorted by name), then exactly one operation per declared key
/// in key order. Observed instances without the managed tag are never touched.
pub fn plan(
    desired: &BTreeMap<String, InstanceSpec>,
    observed: &[DiscoveredInstance],
) -> Result<Plan, StratumError> {
    check_unique_names(desired)?;
    check_unique_observed(desired, observed)?;

    let mut by_name: HashMap<&str, &DiscoveredInstance> = HashMap::new();
    for inst in observed.iter().filter(|i| i.is_managed()) {
        by_name.entry(inst.name.as_str()).or_insert(inst);
    }

    let declared: HashMap<&str, &str> = desired
        .values()
        .map(|s| (s.name.as_str(), s.key.as_str()))
        .collect();

    let mut deletes: Vec<Operation> = observed
        .iter()
        .filter(|i| i.is_managed() && !declared.contains_key(i.name.as_str()))
        .map(|i| Operation::Delete {
            name: i.name.clone(),
            existing_id: i.provider_id.clone(),
            floating_ip_id: i.floating_ip_id.clone(),
        })
        .collect();
    deletes.sort_by(|a, b| match (a, b) {
        (
            Operation::Delete { name: an, existing_id: ai, .. },
            Operation::Delete { name: bn, existing_id: bi, .. },
        ) => (an, ai).cmp(&(bn, bi)),
        _ => std::cmp::Ordering::Equal,
    });

    let mut operations = deletes;
    for spec in desired.values() {
        let op = match by_name.get(spec.name.as_str()) {
            None => Operation::Create { key: spec.key.clone() },
            Some(existing) => {
                let reasons = replacement_reasons(spec, existing);
                if !reasons.is_empty() {
                    Operation::Replace {
                        key: spec.key.clone(),
                        existing_id: existing.provider_id.clone(),
                        floating_ip_id: existing.floating_ip_id.clone(),
                        reasons,
                    }
                } else {
                    let changes = in_place_changes(spec, existing);
                    if changes.is_empty() {
                        Operation::Unchanged {
                            key: spec.key.clone(),
                            existing_id: existing.provider_id.clone(),
                        }
                    } else {
                        Operation::Update {
                            key: spec.key.clone(),
                            existing_id: existing.provider_id.clone(),
                            changes,
                        }
                    }
                }
            }
        };
        operations.push(op);
    }

    tracing::debug!("📋 [planner] {} operation(s)", operations.len());
    Ok(Plan { operations })
}

/// Teardown selection: managed instances whose name is declared.
pub fn destroy_targets<'a>(
    desired: &BTreeMap<String, InstanceSpec>,
    observed: &'a [DiscoveredInstance],
) -> Vec<(String, &'a DiscoveredInstance)> {
    let mut targets: Vec<(String, &DiscoveredInstance)> = desired
        .values()
        .flat_map(|spec| {
            observed
                .iter()
                .filter(move |i| i.is_managed() && i.name == spec.name)
                .map(move |i| (spec.key.clone(), i))
        })
        .collect();
    targets.sort_by(|a, b| (&a.0, &a.1.provider_id).cmp(&(&b.0, &b.1.provider_id)));
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_common::{Credential, OsKind, MANAGED_TAG};

    const IMAGE_UUID: &str = "4e5a1a9c-6f0e-4b7a-9d1c-2b3f8e7a6c51";

    fn spec(key: &str, os: OsKind, floating_ip: bool) -> InstanceSpec {
        let credential = match os {
            OsKind::Linux => Credential::SshKey {
                key_ref: "deploy".to_string(),
            },
            OsKind::Windows => Credential::Password {
                password: "pw".to_string(),
            },
        };
        InstanceSpec {
            key: key.to_string(),
            name: key.to_string(),
            image: "img".to_string(),
            flavor: "DEV1-S".to_string(),
            storage_size_gb: 20,
            storage_policy: "sbs_5k".to_string(),
            os,
            floating_ip,
            credential,
            tags: BTreeMap::new(),
        }
    }

    fn observed_from(spec: &InstanceSpec, id: &str) -> DiscoveredInstance {
        DiscoveredInstance {
            provider_id: id.to_string(),
            name: spec.name.clone(),
            status: "running".to_string(),
            image: spec.image.clone(),
            flavor: spec.flavor.clone(),
            os: Some(spec.os),
            storage_size_gb: Some(spec.storage_size_gb),
            storage_policy: Some(spec.storage_policy.clone()),
            private_ip: Some("10.0.0.4".to_string()),
            public_ip: None,
            floating_ip_id: None,
            tags: spec.provider_tags(),
        }
    }

    fn desired(specs: Vec<InstanceSpec>) -> BTreeMap<String, InstanceSpec> {
        specs.into_iter().map(|s| (s.key.clone(), s)).collect()
    }

    #[test]
    fn one_operation_per_spec_when_nothing_exists() {
        let d = desired(vec![
            spec("web2", OsKind::Linux, false),
            spec("web1", OsKind::Linux, true),
            spec("win1", OsKind::Windows, false),
        ]);
        let p = plan(&d, &[]).unwrap();
        let keys: Vec<_> = p.operations.iter().map(|o| o.key().unwrap()).collect();
        assert_eq!(keys, vec!["web1", "web2", "win1"]);
        assert!(p.operations.iter().all(|o| matches!(o, Operation::Create { .. })));
        assert_eq!(p.summary().create, 3);
    }

    #[test]
    fn duplicate_names_conflict() {
        let mut b = spec("b", OsKind::Linux, false);
        b.name = "a".to_string();
        let d = desired(vec![spec("a", OsKind::Linux, false), b]);
        match plan(&d, &[]) {
            Err(StratumError::PlanConflict { name, keys }) => {
                assert_eq!(name, "a");
                assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn image_or_os_change_forces_replacement() {
        let s = spec("web1", OsKind::Linux, false);
        let mut obs = observed_from(&s, "srv-1");
        obs.tags.insert(IMAGE_TAG.to_string(), "old-img".to_string());
        obs.floating_ip_id = Some("ip-3".to_string());
        let p = plan(&desired(vec![s.clone()]), &[obs]).unwrap();
        match &p.operations[0] {
            Operation::Replace {
                existing_id,
                floating_ip_id,
                reasons,
                ..
            } => {
                assert_eq!(existing_id, "srv-1");
                assert_eq!(floating_ip_id.as_deref(), Some("ip-3"));
                assert_eq!(reasons[0], "image old-img -> img");
            }
            other => panic!("expected replace, got {:?}", other),
        }

        let mut obs = observed_from(&s, "srv-1");
        obs.os = Some(OsKind::Windows);
        let p = plan(&desired(vec![s]), &[obs]).unwrap();
        assert!(matches!(p.operations[0], Operation::Replace { .. }));
    }

    #[test]
    fn provider_identifiers_do_not_force_replacement() {
        let s = spec("web1", OsKind::Linux, false);
        let mut obs = observed_from(&s, "srv-1");
        obs.image = IMAGE_UUID.to_string();
        obs.storage_policy = Some("sbs_volume".to_string());
        let p = plan(&desired(vec![s.clone()]), &[obs.clone()]).unwrap();
        assert_eq!(
            p.operations,
            vec![Operation::Unchanged {
                key: "web1".to_string(),
                existing_id: "srv-1".to_string(),
            }]
        );

        // Instances created without the tags fall back to the reported values.
        obs.tags.remove(IMAGE_TAG);
        obs.tags.remove(STORAGE_POLICY_TAG);
        let p = plan(&desired(vec![s]), &[obs]).unwrap();
        assert!(matches!(&p.operations[0], Operation::Replace { reasons, .. } if reasons.len() == 2));
    }

    #[test]
    fn duplicate_observed_names_conflict() {
        let s = spec("web1", OsKind::Linux, false);
        let first = observed_from(&s, "srv-2");
        let second = observed_from(&s, "srv-1");
        match plan(&desired(vec![s]), &[first, second]) {
            Err(StratumError::PlanConflict { name, keys }) => {
                assert_eq!(name, "web1");
                assert_eq!(keys, vec!["srv-1".to_string(), "srv-2".to_string()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn tag_and_floating_ip_changes_are_updates() {
        let mut s = spec("web1", OsKind::Linux, true);
        let obs = observed_from(&s, "srv-1");
        s.tags.insert("team".to_string(), "ops".to_string());
        let p = plan(&desired(vec![s.clone()]), &[obs]).unwrap();
        assert_eq!(
            p.operations,
            vec![Operation::Update {
                key: "web1".to_string(),
                existing_id: "srv-1".to_string(),
                changes: vec![Change::Tags, Change::AttachFloatingIp],
            }]
        );

        let s = spec("web1", OsKind::Linux, false);
        let mut obs = observed_from(&s, "srv-1");
        obs.floating_ip_id = Some("ip-9".to_string());
        let p = plan(&desired(vec![s]), &[obs]).unwrap();
        assert_eq!(
            p.operations[0],
            Operation::Update {
                key: "web1".to_string(),
                existing_id: "srv-1".to_string(),
                changes: vec![Change::DetachFloatingIp {
                    floating_ip_id: "ip-9".to_string()
                }],
            }
        );
    }

    #[test]
    fn converged_state_is_unchanged_and_orphans_are_deleted() {
        let s = spec("web1", OsKind::Linux, false);
        let obs = observed_from(&s, "srv-1");
        let orphan = observed_from(&spec("old", OsKind::Linux, false), "srv-0");
        let mut foreign = observed_from(&spec("not-ours", OsKind::Linux, false), "srv-x");
        foreign.tags.remove(MANAGED_TAG);

        let p = plan(&desired(vec![s]), &[obs, orphan, foreign]).unwrap();
        assert_eq!(p.operations.len(), 2);
        assert!(matches!(&p.operations[0], Operation::Delete { name, .. } if name == "old"));
        assert!(matches!(&p.operations[1], Operation::Unchanged { key, .. } if key == "web1"));
        assert_eq!(p.summary().delete, 1);
        assert!(p.has_changes());
    }

    #[test]
    fn destroy_targets_only_declared_managed() {
        let s = spec("web1", OsKind::Linux, false);
        let obs = observed_from(&s, "srv-1");
        let orphan = observed_from(&spec("old", OsKind::Linux, false), "srv-0");
        let all = vec![obs, orphan];
        let t = destroy_targets(&desired(vec![s]), &all);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].0, "web1");
        assert_eq!(t[0].1.provider_id, "srv-1");
    }
}
