#![cfg(feature = "provider-mock")]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stratum_common::{InstanceStatus, StratumError};
use stratum_orchestrator::logger::ActionLog;
use stratum_orchestrator::manifest::Manifest;
use stratum_orchestrator::services::{self, ApplyOptions, ConfigurationStatus, RunContext};
use stratum_orchestrator::settings::Settings;
use stratum_providers::mock::MockProvider;
use stratum_providers::{CloudProvider, ResourceFilter, ResourceKind};
use tokio_util::sync::CancellationToken;

const LAB: &str = r#"{
  "network": { "vpc": "main", "subnet": "app", "security_group": "app-sg" },
  "ssh_keys": { "deploy": { "public_key": "ssh-ed25519 AAAA ops@lab" } },
  "instances": {
    "web1": { "image": "ubuntu_jammy", "flavor": "DEV1-M", "storage_size_gb": 40,
              "storage_policy": "sbs_5k", "os": "linux", "floating_ip": true, "ssh_key": "deploy" },
    "win1": { "image": "windows_server_2022", "flavor": "POP2-4C-16G-WIN", "storage_size_gb": 80,
              "storage_policy": "sbs_15k", "os": "windows", "password": "S3cret!" }
  }
}"#;

fn lab() -> Manifest {
    Manifest::from_json(LAB, |_| None).unwrap()
}

fn linux_fleet(names: &[&str]) -> Manifest {
    let instances: Vec<String> = names
        .iter()
        .map(|n| {
            format!(
                r#""{n}": {{ "image": "ubuntu_jammy", "flavor": "DEV1-S", "storage_size_gb": 20,
                   "storage_policy": "sbs_5k", "os": "linux", "ssh_key": "deploy" }}"#
            )
        })
        .collect();
    let text = format!(
        r#"{{ "network": {{ "vpc": "main", "subnet": "app", "security_group": "app-sg" }},
             "ssh_keys": {{ "deploy": {{ "public_key": "ssh-ed25519 AAAA ops@lab" }} }},
             "instances": {{ {} }} }}"#,
        instances.join(",")
    );
    Manifest::from_json(&text, |_| None).unwrap()
}

fn seeded() -> Arc<MockProvider> {
    Arc::new(MockProvider::new().with_network("main", "app", "app-sg"))
}

async fn context(provider: Arc<MockProvider>, out: &Path, tweak: impl FnOnce(&mut Settings)) -> RunContext {
    let mut settings = Settings {
        provider: "mock".to_string(),
        output_dir: out.to_path_buf(),
        ssh_private_key: "/home/ops/.ssh/id_ed25519".to_string(),
        ..Settings::default()
    };
    tweak(&mut settings);
    let journal = Arc::new(ActionLog::open(&settings.journal_path()).await.unwrap());
    let provider: Arc<dyn CloudProvider> = provider;
    RunContext::new(settings, provider, journal, CancellationToken::new())
}

fn no_probe() -> ApplyOptions {
    ApplyOptions {
        playbook: None,
        configure: false,
        probe: false,
    }
}

/// Executable script that records its arguments, used in place of ansible-playbook.
fn recorder(dir: &Path, exit_code: i32) -> (PathBuf, PathBuf) {
    let log = dir.join("args.log");
    let script = dir.join("fake-ansible.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" >> '{}'\nexit {}\n", log.display(), exit_code),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (script, log)
}

#[tokio::test]
async fn example_lab_renders_grouped_inventory() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;

    let report = services::process_apply(&ctx, &lab(), &no_probe()).await.unwrap();

    assert!(!report.is_degraded(), "{:?}", report.apply.failures);
    assert_eq!(report.apply.instances.len(), 2);
    assert_eq!(provider.created_count(ResourceKind::FloatingIpAssociation), 1);
    assert_eq!(report.configuration, ConfigurationStatus::NotRequested);

    let inv = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();
    let linux = inv.split("[windows]").next().unwrap();
    assert!(linux.contains("web1 ansible_host=51.15.0.1\n"), "{}", inv);
    let windows_line = inv
        .lines()
        .find(|l| l.starts_with("win1 "))
        .expect("win1 in inventory");
    assert!(windows_line.starts_with("win1 ansible_host=10.0.0."), "{}", windows_line);
    assert!(inv.find("[linux]").unwrap() < inv.find("win1 ").unwrap());
    assert!(inv.find("[windows]").unwrap() < inv.find("win1 ").unwrap());

    assert!(out.path().join("connect-web1.sh").exists());
    assert!(out.path().join("win1.rdp").exists());

    let journal = std::fs::read_to_string(out.path().join("actions.jsonl")).unwrap();
    assert!(journal.contains("ACT:PLAN"));
    assert!(journal.contains("ACT:RENDER"));

    let web: Vec<InstanceStatus> = report
        .transitions
        .iter()
        .filter(|t| t.instance_key == "web1")
        .map(|t| t.to_status)
        .collect();
    assert_eq!(
        web,
        vec![
            InstanceStatus::Planned,
            InstanceStatus::Provisioning,
            InstanceStatus::Provisioned
        ]
    );
}

#[tokio::test]
async fn unmanaged_instance_with_declared_name_is_left_alone() {
    let out = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        MockProvider::new()
            .with_network("main", "app", "app-sg")
            .with_foreign_instance("web1"),
    );
    let foreign = provider
        .query(ResourceKind::Instance, &ResourceFilter::by_name("web1"))
        .await
        .unwrap()
        .remove(0);
    let ctx = context(provider.clone(), out.path(), |_| {}).await;

    let report = services::process_apply(&ctx, &lab(), &no_probe()).await.unwrap();

    assert!(report.is_degraded());
    assert_eq!(report.apply.partial_error().expect("partial apply").keys(), vec!["web1"]);
    assert!(report.apply.failures["web1"].contains("name_conflict"));
    assert!(report.apply.instances.contains_key("win1"));
    assert!(!report.apply.instances.contains_key("web1"));
    assert!(report.apply.associations.is_empty());
    assert_eq!(provider.created_count(ResourceKind::FloatingIp), 0);

    let tags = provider.instance_tags(&foreign).expect("foreign instance kept");
    assert_eq!(tags.get("owner").map(String::as_str), Some("operator"));
    assert_eq!(tags.len(), 1);
    let inv = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();
    assert!(!inv.contains("web1 "));
}

#[tokio::test]
async fn replacement_without_floating_ip_releases_the_reservation() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let mut m = lab();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    services::process_apply(&ctx, &m, &no_probe()).await.unwrap();

    let web = m.instances.get_mut("web1").unwrap();
    web.image = "ubuntu_noble".to_string();
    web.floating_ip = false;
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    let report = services::process_apply(&ctx, &m, &no_probe()).await.unwrap();

    assert!(!report.is_degraded(), "{:?}", report.apply.failures);
    assert_eq!(report.plan.summary().replace, 1);
    assert!(provider
        .query(ResourceKind::FloatingIp, &ResourceFilter::by_name("web1-fip"))
        .await
        .unwrap()
        .is_empty());
    let script = std::fs::read_to_string(out.path().join("connect-web1.sh")).unwrap();
    assert!(script.contains("root@10.0.0."), "{}", script);

    let (plan, _) = services::process_plan(&ctx, &m).await.unwrap();
    assert!(!plan.has_changes(), "{:?}", plan.operations);
}

#[tokio::test]
async fn removed_instance_loses_its_connect_helper() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    services::process_apply(&ctx, &lab(), &no_probe()).await.unwrap();
    assert!(out.path().join("win1.rdp").exists());

    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    let report = services::process_apply(&ctx, &linux_fleet(&["web1"]), &no_probe())
        .await
        .unwrap();

    assert!(!report.is_degraded(), "{:?}", report.apply.failures);
    assert_eq!(report.plan.summary().delete, 1);
    assert!(!out.path().join("win1.rdp").exists());
    assert!(out.path().join("connect-web1.sh").exists());
    assert!(out.path().join("actions.jsonl").exists());
}

#[tokio::test]
async fn one_failing_instance_does_not_block_the_others() {
    let out = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        MockProvider::new()
            .with_network("main", "app", "app-sg")
            .with_failing_instance("node3"),
    );
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    let fleet = linux_fleet(&["node1", "node2", "node3", "node4"]);

    let report = services::process_apply(&ctx, &fleet, &no_probe()).await.unwrap();

    assert!(report.is_degraded());
    let partial = report.apply.partial_error().expect("partial apply");
    assert_eq!(partial.keys(), vec!["node3"]);
    assert_eq!(report.apply.instances.len(), 3);
    assert_eq!(ctx.states.status("node3"), Some(InstanceStatus::Failed));

    let inv = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();
    assert!(inv.contains("node1 "));
    assert!(!inv.contains("node3 "));
}

#[tokio::test]
async fn second_apply_converges_without_creating() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let m = lab();

    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    services::process_apply(&ctx, &m, &no_probe()).await.unwrap();
    let first = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();

    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    let (plan, _) = services::process_plan(&ctx, &m).await.unwrap();
    assert!(!plan.has_changes(), "{:?}", plan.operations);
    let report = services::process_apply(&ctx, &m, &no_probe()).await.unwrap();
    assert!(!report.is_degraded());

    assert_eq!(provider.created_count(ResourceKind::Instance), 2);
    assert_eq!(provider.created_count(ResourceKind::FloatingIp), 1);
    let second = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn configuration_run_receives_inventory_and_playbook() {
    let out = tempfile::tempdir().unwrap();
    let (script, log) = recorder(out.path(), 0);
    let ctx = context(seeded(), out.path(), |s| {
        s.configure_program = script.display().to_string();
    })
    .await;
    let opts = ApplyOptions {
        playbook: Some(PathBuf::from("site.yml")),
        configure: true,
        probe: false,
    };

    let report = services::process_apply(&ctx, &lab(), &opts).await.unwrap();

    assert!(matches!(report.configuration, ConfigurationStatus::Succeeded { code: 0, .. }));
    let args = std::fs::read_to_string(&log).unwrap();
    let expected = format!("-i {} site.yml", out.path().join("inventory.ini").display());
    assert_eq!(args.trim(), expected);
}

#[tokio::test]
async fn failed_configuration_degrades_but_keeps_resources() {
    let out = tempfile::tempdir().unwrap();
    let (script, _) = recorder(out.path(), 3);
    let provider = seeded();
    let ctx = context(provider.clone(), out.path(), |s| {
        s.configure_program = script.display().to_string();
    })
    .await;
    let opts = ApplyOptions {
        playbook: Some(PathBuf::from("site.yml")),
        configure: true,
        probe: false,
    };

    let report = services::process_apply(&ctx, &lab(), &opts).await.unwrap();

    assert!(matches!(report.configuration, ConfigurationStatus::Failed { .. }));
    assert!(report.is_degraded());
    assert_eq!(provider.instance_count(), 2);
    assert_eq!(provider.deleted_count(ResourceKind::Instance), 0);
}

#[tokio::test]
async fn unreachable_instances_skip_configuration() {
    let out = tempfile::tempdir().unwrap();
    let (script, log) = recorder(out.path(), 0);
    let ctx = context(seeded(), out.path(), |s| {
        s.configure_program = script.display().to_string();
        s.probe_interval = Duration::from_millis(50);
        s.probe_timeout = Duration::from_millis(200);
    })
    .await;
    let opts = ApplyOptions {
        playbook: Some(PathBuf::from("site.yml")),
        configure: true,
        probe: true,
    };

    let report = services::process_apply(&ctx, &lab(), &opts).await.unwrap();

    assert_eq!(report.probes.len(), 2);
    assert!(report.probes.values().all(|p| !p.is_ready()));
    assert_eq!(report.unreachable().len(), 2);
    assert!(matches!(report.configuration, ConfigurationStatus::Skipped { .. }));
    assert!(report.is_degraded());
    assert!(!log.exists());
    assert_eq!(ctx.states.status("web1"), Some(InstanceStatus::Unreachable));
    assert_eq!(report.apply.instances["web1"].status, InstanceStatus::Unreachable);
}

#[tokio::test]
async fn destroy_removes_instances_and_keeps_existing_network() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let m = lab();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    services::process_apply(&ctx, &m, &no_probe()).await.unwrap();

    let report = services::process_destroy(&ctx, &m).await.unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.instances_removed.len(), 2);
    assert_eq!(report.floating_ips_released.len(), 1);
    assert_eq!(provider.instance_count(), 0);
    assert!(report.network_removed.is_empty());
    assert_eq!(provider.deleted_count(ResourceKind::Vpc), 0);

    let again = services::process_destroy(&ctx, &m).await.unwrap();
    assert!(again.is_clean());
    assert!(again.instances_removed.is_empty());
}

#[tokio::test]
async fn render_from_observed_state_matches_apply() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let m = lab();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    services::process_apply(&ctx, &m, &no_probe()).await.unwrap();
    let applied = std::fs::read_to_string(out.path().join("inventory.ini")).unwrap();

    let rerender = tempfile::tempdir().unwrap();
    let ctx = context(provider, rerender.path(), |_| {}).await;
    let paths = services::process_render(&ctx, &m).await.unwrap();

    assert_eq!(paths.len(), 3);
    let rendered = std::fs::read_to_string(rerender.path().join("inventory.ini")).unwrap();
    assert_eq!(applied, rendered);
}

#[tokio::test]
async fn duplicate_names_abort_before_any_call() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    let text = LAB.replace(
        r#""os": "windows", "password""#,
        r#""os": "windows", "name": "web1", "password""#,
    );
    let m = Manifest::from_json(&text, |_| None).unwrap();

    let err = services::process_apply(&ctx, &m, &no_probe()).await.unwrap_err();

    assert!(matches!(err, StratumError::PlanConflict { .. }));
    assert!(err.is_fatal());
    assert_eq!(provider.instance_count(), 0);
    assert!(!out.path().join("inventory.ini").exists());
}

#[tokio::test]
async fn cancelled_run_skips_everything() {
    let out = tempfile::tempdir().unwrap();
    let provider = seeded();
    let ctx = context(provider.clone(), out.path(), |_| {}).await;
    ctx.cancel.cancel();

    let report = services::process_apply(&ctx, &lab(), &no_probe()).await.unwrap();

    assert!(report.is_degraded());
    assert!(report.apply.skipped.contains("web1"));
    assert_eq!(provider.instance_count(), 0);
}
