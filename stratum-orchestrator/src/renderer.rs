use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use stratum_common::{Credential, InstanceSpec, InventoryEntry, OsKind, ProvisionedInstance};

pub const INVENTORY_FILE: &str = "inventory.ini";
const HEADER: &str = "# Generated by stratum. Changes are overwritten on the next render.\n";

/// Static inputs of a render (everything that is not instance state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    pub linux_user: String,
    pub windows_user: String,
    pub ssh_private_key: String,
}

impl RenderConfig {
    pub fn from_settings(settings: &crate::settings::Settings) -> Self {
        Self {
            linux_user: settings.linux_user.clone(),
            windows_user: settings.windows_user.clone(),
            ssh_private_key: crate::manifest::expand_home(&settings.ssh_private_key)
                .display()
                .to_string(),
        }
    }

    fn user_for(&self, os: OsKind) -> &str {
        match os {
            OsKind::Linux => &self.linux_user,
            OsKind::Windows => &self.windows_user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub content: String,
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    pub inventory: Artifact,
    pub connect: Vec<Artifact>,
}

impl RenderedArtifacts {
    pub fn all(&self) -> impl Iterator<Item = &Artifact> {
        std::iter::once(&self.inventory).chain(self.connect.iter())
    }
}

/// Inventory view of the provisioned instances, sorted by name.
/// Instances without a matching spec are skipped.
pub fn inventory_entries(
    instances: &[ProvisionedInstance],
    specs: &BTreeMap<String, InstanceSpec>,
    cfg: &RenderConfig,
) -> Vec<InventoryEntry> {
    let mut entries: Vec<InventoryEntry> = instances
        .iter()
        .filter_map(|inst| {
            let spec = specs.get(&inst.key)?;
            Some(InventoryEntry {
                name: inst.name.clone(),
                address: inst.connect_address().to_string(),
                os: inst.os,
                user: cfg.user_for(inst.os).to_string(),
                credential: spec.credential.clone(),
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Double-quoted INI value; ansible splits host lines shell-style.
fn ini_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn render_inventory(entries: &[InventoryEntry], cfg: &RenderConfig) -> String {
    let mut out = String::new();
    out.push_str(HEADER);

    out.push_str("[linux]\n");
    for e in entries.iter().filter(|e| e.os == OsKind::Linux) {
        out.push_str(&format!("{} ansible_host={}\n", e.name, e.address));
    }
    out.push('\n');

    out.push_str("[windows]\n");
    for e in entries.iter().filter(|e| e.os == OsKind::Windows) {
        out.push_str(&format!("{} ansible_host={}", e.name, e.address));
        if let Credential::Password { password } = &e.credential {
            out.push_str(&format!(" ansible_password={}", ini_quote(password)));
        }
        out.push('\n');
    }
    out.push('\n');

    out.push_str("[linux:vars]\n");
    out.push_str("ansible_connection=ssh\n");
    out.push_str(&format!("ansible_user={}\n", cfg.linux_user));
    out.push_str(&format!("ansible_ssh_private_key_file={}\n", cfg.ssh_private_key));
    out.push('\n');

    out.push_str("[windows:vars]\n");
    out.push_str("ansible_connection=winrm\n");
    out.push_str("ansible_port=5985\n");
    out.push_str("ansible_winrm_transport=ntlm\n");
    out.push_str("ansible_winrm_server_cert_validation=ignore\n");
    out.push_str(&format!("ansible_user={}\n", cfg.windows_user));
    out
}

fn render_connect(entry: &InventoryEntry, cfg: &RenderConfig) -> Artifact {
    match entry.os {
        OsKind::Linux => Artifact {
            file_name: format!("connect-{}.sh", entry.name),
            content: format!(
                "#!/usr/bin/env bash\n# Connect to {name} (linux)\nexec ssh -i {key} -o StrictHostKeyChecking=no {target} \"$@\"\n",
                name = entry.name,
                key = sh_escape_single(&cfg.ssh_private_key),
                target = sh_escape_single(&format!("{}@{}", entry.user, entry.address)),
            ),
            executable: true,
        },
        OsKind::Windows => Artifact {
            file_name: format!("{}.rdp", entry.name),
            content: format!(
                "full address:s:{}:3389\nusername:s:{}\nprompt for credentials:i:1\nauthentication level:i:2\n",
                entry.address, entry.user
            ),
            executable: false,
        },
    }
}

/// Pure and deterministic: identical input renders byte-identical artifacts.
pub fn render(
    instances: &[ProvisionedInstance],
    specs: &BTreeMap<String, InstanceSpec>,
    cfg: &RenderConfig,
) -> RenderedArtifacts {
    let entries = inventory_entries(instances, specs, cfg);
    RenderedArtifacts {
        inventory: Artifact {
            file_name: INVENTORY_FILE.to_string(),
            content: render_inventory(&entries, cfg),
            executable: false,
        },
        connect: entries.iter().map(|e| render_connect(e, cfg)).collect(),
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn is_connect_artifact(file_name: &str) -> bool {
    (file_name.starts_with("connect-") && file_name.ends_with(".sh")) || file_name.ends_with(".rdp")
}

/// Remove connect helpers in `dir` that are not part of `keep`. Returns the removed paths.
async fn prune_stale(dir: &Path, keep: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_connect_artifact(&name) || keep.contains(&name.as_str()) {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }
        tokio::fs::remove_file(entry.path()).await?;
        removed.push(entry.path());
    }
    removed.sort();
    Ok(removed)
}

/// Write every artifact under `dir`; shell scripts get mode 0755.
/// Connect helpers left over from instances that are no longer rendered are removed.
pub async fn write_artifacts(rendered: &RenderedArtifacts, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::new();
    for artifact in rendered.all() {
        let path = dir.join(&artifact.file_name);
        tokio::fs::write(&path, artifact.content.as_bytes()).await?;
        if artifact.executable {
            set_executable(&path).await?;
        }
        written.push(path);
    }
    let keep: Vec<&str> = rendered.connect.iter().map(|a| a.file_name.as_str()).collect();
    let pruned = prune_stale(dir, &keep).await?;
    for path in &pruned {
        tracing::info!("🗑️ [render] removed stale {}", path.display());
    }
    tracing::info!("📝 [render] wrote {} artifact(s) to {}", written.len(), dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_common::InstanceStatus;

    fn cfg() -> RenderConfig {
        RenderConfig {
            linux_user: "root".to_string(),
            windows_user: "Administrator".to_string(),
            ssh_private_key: "/home/op/.ssh/id_ed25519".to_string(),
        }
    }

    fn spec(key: &str, os: OsKind) -> InstanceSpec {
        InstanceSpec {
            key: key.to_string(),
            name: key.to_string(),
            image: "img".to_string(),
            flavor: "f".to_string(),
            storage_size_gb: 20,
            storage_policy: "p".to_string(),
            os,
            floating_ip: os == OsKind::Linux,
            credential: match os {
                OsKind::Linux => Credential::SshKey {
                    key_ref: "deploy".to_string(),
                },
                OsKind::Windows => Credential::Password {
                    password: "pa\"ss".to_string(),
                },
            },
            tags: BTreeMap::new(),
        }
    }

    fn instance(key: &str, os: OsKind, private_ip: &str, public_ip: Option<&str>) -> ProvisionedInstance {
        ProvisionedInstance {
            key: key.to_string(),
            id: format!("srv-{}", key),
            name: key.to_string(),
            os,
            private_ip: private_ip.to_string(),
            public_ip: public_ip.map(str::to_string),
            floating_ip_id: public_ip.map(|_| "ip-1".to_string()),
            status: InstanceStatus::Provisioned,
        }
    }

    fn fixture() -> (Vec<ProvisionedInstance>, BTreeMap<String, InstanceSpec>) {
        let instances = vec![
            instance("win1", OsKind::Windows, "10.0.0.5", None),
            instance("web1", OsKind::Linux, "10.0.0.4", Some("51.15.0.1")),
        ];
        let specs = [spec("web1", OsKind::Linux), spec("win1", OsKind::Windows)]
            .into_iter()
            .map(|s| (s.key.clone(), s))
            .collect();
        (instances, specs)
    }

    #[test]
    fn inventory_groups_and_addresses() {
        let (instances, specs) = fixture();
        let r = render(&instances, &specs, &cfg());
        let inv = &r.inventory.content;
        let expected_linux = "[linux]\nweb1 ansible_host=51.15.0.1\n\n";
        let expected_windows = "[windows]\nwin1 ansible_host=10.0.0.5 ansible_password=\"pa\\\"ss\"\n\n";
        assert!(inv.contains(expected_linux), "{}", inv);
        assert!(inv.contains(expected_windows), "{}", inv);
        assert!(inv.find("[linux]").unwrap() < inv.find("[windows]").unwrap());
        assert!(inv.contains("ansible_ssh_private_key_file=/home/op/.ssh/id_ed25519\n"));
        assert!(inv.contains("ansible_connection=winrm\n"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let (mut instances, specs) = fixture();
        let a = render(&instances, &specs, &cfg());
        instances.reverse();
        let b = render(&instances, &specs, &cfg());
        assert_eq!(a, b);
    }

    #[test]
    fn connect_artifacts_per_os() {
        let (instances, specs) = fixture();
        let r = render(&instances, &specs, &cfg());
        assert_eq!(r.connect.len(), 2);
        let ssh = &r.connect[0];
        assert_eq!(ssh.file_name, "connect-web1.sh");
        assert!(ssh.executable);
        assert!(ssh.content.contains("'root@51.15.0.1'"));
        let rdp = &r.connect[1];
        assert_eq!(rdp.file_name, "win1.rdp");
        assert!(!rdp.executable);
        assert!(rdp.content.starts_with("full address:s:10.0.0.5:3389\n"));
    }

    #[tokio::test]
    async fn written_scripts_are_executable() {
        let (instances, specs) = fixture();
        let r = render(&instances, &specs, &cfg());
        let dir = tempfile::tempdir().unwrap();
        let paths = write_artifacts(&r, dir.path()).await.unwrap();
        assert_eq!(paths.len(), 3);
        let inv = std::fs::read_to_string(dir.path().join(INVENTORY_FILE)).unwrap();
        assert_eq!(inv, r.inventory.content);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("connect-web1.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn stale_connect_helpers_are_removed() {
        let (instances, specs) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let first = render(&instances, &specs, &cfg());
        write_artifacts(&first, dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::write(dir.path().join("actions.jsonl"), "{}\n").unwrap();

        let web_only: Vec<ProvisionedInstance> = instances.into_iter().filter(|i| i.key == "web1").collect();
        let second = render(&web_only, &specs, &cfg());
        let paths = write_artifacts(&second, dir.path()).await.unwrap();
        assert_eq!(paths.len(), 2);

        assert!(dir.path().join("connect-web1.sh").exists());
        assert!(!dir.path().join("win1.rdp").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("actions.jsonl").exists());
        let inv = std::fs::read_to_string(dir.path().join(INVENTORY_FILE)).unwrap();
        assert!(!inv.contains("win1"));
    }

    #[test]
    fn only_connect_helpers_are_prunable() {
        assert!(is_connect_artifact("connect-web1.sh"));
        assert!(is_connect_artifact("win1.rdp"));
        assert!(!is_connect_artifact("inventory.ini"));
        assert!(!is_connect_artifact("deploy.sh"));
        assert!(!is_connect_artifact("actions.jsonl"));
    }
}
