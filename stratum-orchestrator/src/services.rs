use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use stratum_common::journal::{ActionStatus, ActionType};
use stratum_common::{InstanceStatus, ProvisionedInstance, StratumError};
use stratum_providers::inventory::DiscoveredInstance;
use stratum_providers::CloudProvider;
use tokio_util::sync::CancellationToken;

use crate::configuration::ConfigurationInvoker;
use crate::executor::{ApplyReport, DestroyReport, Executor};
use crate::health_check::{self, ProbeConfig, ProbeOutcome, ProbeTarget};
use crate::logger::ActionLog;
use crate::manifest::Manifest;
use crate::planner::{self, Plan};
use crate::renderer::{self, RenderConfig};
use crate::settings::Settings;
use crate::state_machine::{StateTracker, StateTransition};

/// Shared handles for one CLI invocation.
pub struct RunContext {
    pub settings: Settings,
    pub provider: Arc<dyn CloudProvider>,
    pub journal: Arc<ActionLog>,
    pub states: Arc<StateTracker>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        settings: Settings,
        provider: Arc<dyn CloudProvider>,
        journal: Arc<ActionLog>,
        cancel: CancellationToken,
    ) -> Self {
        let states = Arc::new(StateTracker::new(journal.clone()));
        Self {
            settings,
            provider,
            journal,
            states,
            cancel,
        }
    }

    fn executor(&self) -> Executor {
        Executor::new(
            self.provider.clone(),
            self.settings.workers,
            self.cancel.clone(),
            self.journal.clone(),
            self.states.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub playbook: Option<PathBuf>,
    pub configure: bool,
    pub probe: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            playbook: None,
            configure: true,
            probe: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigurationStatus {
    NotRequested,
    Skipped { reason: String },
    Succeeded { code: i32, duration_ms: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: Plan,
    pub apply: ApplyReport,
    pub artifacts: Vec<PathBuf>,
    pub probes: BTreeMap<String, ProbeOutcome>,
    pub configuration: ConfigurationStatus,
    /// Every lifecycle transition of this run, in order.
    pub transitions: Vec<StateTransition>,
}

impl RunReport {
    /// Unreachable instances as errors (non-fatal, for reporting).
    pub fn unreachable(&self) -> Vec<StratumError> {
        self.probes
            .iter()
            .filter_map(|(key, outcome)| match outcome {
                ProbeOutcome::Unreachable { waited, .. } => {
                    let inst = self.apply.instances.get(key)?;
                    Some(StratumError::Unreachable {
                        key: key.clone(),
                        address: inst.connect_address().to_string(),
                        port: inst.os.readiness_port(),
                        waited_ms: waited.as_millis(),
                    })
                }
                ProbeOutcome::Ready { .. } => None,
            })
            .collect()
    }

    /// Partial apply, skipped work, unreachable instances or a failed configuration run.
    pub fn is_degraded(&self) -> bool {
        !self.apply.is_clean()
            || self.probes.values().any(|p| !p.is_ready())
            || matches!(self.configuration, ConfigurationStatus::Failed { .. })
    }
}

/// Observe provider state and diff it against the manifest. No mutation.
pub async fn process_plan(ctx: &RunContext, manifest: &Manifest) -> Result<(Plan, Vec<DiscoveredInstance>), StratumError> {
    let pending = ctx.journal.log_event(ActionType::Plan, None, None).await;
    let result = async {
        let observed = ctx.provider.list_instances().await?;
        let plan = planner::plan(&manifest.instances, &observed)?;
        Ok::<_, StratumError>((plan, observed))
    }
    .await;
    match &result {
        Ok((plan, observed)) => {
            let summary = plan.summary();
            tracing::info!("📋 [plan] {} ({} observed)", summary, observed.len());
            ctx.journal
                .log_event_complete(pending, ActionStatus::Success, None, serde_json::to_value(summary).ok())
                .await;
        }
        Err(e) => {
            ctx.journal
                .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                .await;
        }
    }
    result
}

async fn render_and_write(
    ctx: &RunContext,
    manifest: &Manifest,
    instances: &[ProvisionedInstance],
) -> Result<Vec<PathBuf>, StratumError> {
    let pending = ctx.journal.log_event(ActionType::Render, None, None).await;
    let rendered = renderer::render(instances, &manifest.instances, &RenderConfig::from_settings(&ctx.settings));
    match renderer::write_artifacts(&rendered, &ctx.settings.output_dir).await {
        Ok(paths) => {
            ctx.journal
                .log_event_complete(
                    pending,
                    ActionStatus::Success,
                    None,
                    Some(serde_json::json!({ "files": paths.len() })),
                )
                .await;
            Ok(paths)
        }
        Err(e) => {
            ctx.journal
                .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                .await;
            Err(e.into())
        }
    }
}

async fn probe_instances(ctx: &RunContext, instances: &[ProvisionedInstance]) -> BTreeMap<String, ProbeOutcome> {
    let cfg = ProbeConfig::new(ctx.settings.probe_interval, ctx.settings.probe_timeout);
    let targets: Vec<ProbeTarget> = instances.iter().map(ProbeTarget::for_instance).collect();
    tracing::info!(
        "🔵 [probe] polling {} instance(s), ceiling {:?}",
        targets.len(),
        cfg.timeout
    );
    let outcomes = health_check::probe_all(targets, &cfg).await;
    for (key, outcome) in &outcomes {
        let (status, meta) = match outcome {
            ProbeOutcome::Ready { attempts, elapsed } => {
                ctx.states.to_ready(key, "readiness port open").await;
                (
                    ActionStatus::Success,
                    serde_json::json!({ "attempts": attempts, "elapsed_ms": elapsed.as_millis() as u64 }),
                )
            }
            ProbeOutcome::Unreachable { attempts, waited } => {
                ctx.states.to_unreachable(key, "probe ceiling reached").await;
                (
                    ActionStatus::Failed,
                    serde_json::json!({ "attempts": attempts, "waited_ms": waited.as_millis() as u64 }),
                )
            }
        };
        ctx.journal
            .log_quick(ActionType::Probe, status, Some(key), Some(meta))
            .await;
    }
    outcomes
}

async fn configure(
    ctx: &RunContext,
    playbook: &std::path::Path,
    instances: &[ProvisionedInstance],
    probes: &BTreeMap<String, ProbeOutcome>,
) -> ConfigurationStatus {
    if ctx.cancel.is_cancelled() {
        return ConfigurationStatus::Skipped {
            reason: "run cancelled".to_string(),
        };
    }
    let mut reachable: Vec<String> = instances
        .iter()
        .filter(|i| probes.get(&i.key).map_or(true, |p| p.is_ready()))
        .map(|i| i.name.clone())
        .collect();
    reachable.sort();
    if reachable.is_empty() {
        tracing::warn!("⚠️ [configure] no reachable instance, skipping configuration run");
        ctx.journal
            .log_quick(ActionType::Configure, ActionStatus::Skipped, None, None)
            .await;
        return ConfigurationStatus::Skipped {
            reason: "no reachable instance".to_string(),
        };
    }
    let limit = (reachable.len() < instances.len()).then_some(reachable.as_slice());

    let invoker = ConfigurationInvoker::from_settings(&ctx.settings);
    let pending = ctx
        .journal
        .log_event(
            ActionType::Configure,
            None,
            Some(serde_json::json!({ "playbook": playbook.display().to_string(), "limit": limit })),
        )
        .await;
    match invoker.run(&ctx.settings.inventory_path(), playbook, limit).await {
        Ok(run) => {
            ctx.journal
                .log_event_complete(pending, ActionStatus::Success, None, serde_json::to_value(&run).ok())
                .await;
            ConfigurationStatus::Succeeded {
                code: run.code,
                duration_ms: run.duration_ms,
            }
        }
        Err(e) => {
            ctx.journal
                .log_event_complete(pending, ActionStatus::Failed, Some(&e.to_string()), None)
                .await;
            ConfigurationStatus::Failed { error: e.to_string() }
        }
    }
}

/// validate -> observe -> plan -> execute -> render -> probe -> configure.
/// Provisioned resources are never rolled back, whatever fails after the executor.
pub async fn process_apply(
    ctx: &RunContext,
    manifest: &Manifest,
    opts: &ApplyOptions,
) -> Result<RunReport, StratumError> {
    let (plan, _) = process_plan(ctx, manifest).await?;
    let apply = ctx.executor().apply(manifest, &plan).await?;
    if let Some(err) = apply.partial_error() {
        tracing::warn!("⚠️ [apply] {}", err);
    }

    let instances = apply.instance_list();
    let artifacts = render_and_write(ctx, manifest, &instances).await?;

    let probes = if opts.probe && !instances.is_empty() && !ctx.cancel.is_cancelled() {
        probe_instances(ctx, &instances).await
    } else {
        BTreeMap::new()
    };

    let configuration = match (&opts.playbook, opts.configure) {
        (Some(playbook), true) => configure(ctx, playbook, &instances, &probes).await,
        _ => ConfigurationStatus::NotRequested,
    };

    let mut apply = apply;
    for (key, inst) in apply.instances.iter_mut() {
        inst.status = ctx.states.status(key).unwrap_or(InstanceStatus::Provisioned);
    }

    Ok(RunReport {
        plan,
        apply,
        artifacts,
        probes,
        configuration,
        transitions: ctx.states.history(),
    })
}

/// Reverse teardown of every declared instance and its dependencies.
pub async fn process_destroy(ctx: &RunContext, manifest: &Manifest) -> Result<DestroyReport, StratumError> {
    planner::check_unique_names(&manifest.instances)?;
    let observed = ctx.provider.list_instances().await?;
    let targets: Vec<(String, DiscoveredInstance)> = planner::destroy_targets(&manifest.instances, &observed)
        .into_iter()
        .map(|(k, d)| (k, d.clone()))
        .collect();
    tracing::info!("🔵 [destroy] {} instance(s) to remove", targets.len());
    ctx.executor().destroy(manifest, targets).await
}

/// Re-render artifacts from observed state only.
pub async fn process_render(ctx: &RunContext, manifest: &Manifest) -> Result<Vec<PathBuf>, StratumError> {
    planner::check_unique_names(&manifest.instances)?;
    let observed = ctx.provider.list_instances().await?;
    let instances: Vec<ProvisionedInstance> = manifest
        .instances
        .values()
        .filter_map(|spec| {
            let d = observed.iter().find(|d| d.is_managed() && d.name == spec.name)?;
            let Some(private_ip) = d.private_ip.clone() else {
                tracing::warn!("⚠️ [render] {} has no private address yet, skipped", spec.key);
                return None;
            };
            Some(ProvisionedInstance {
                key: spec.key.clone(),
                id: d.provider_id.clone(),
                name: d.name.clone(),
                os: spec.os,
                private_ip,
                public_ip: d.public_ip.clone(),
                floating_ip_id: d.floating_ip_id.clone(),
                status: InstanceStatus::Provisioned,
            })
        })
        .collect();
    render_and_write(ctx, manifest, &instances).await
}
