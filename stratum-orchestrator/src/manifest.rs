use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use stratum_common::{Credential, InstanceSpec, OsKind, StratumError};

/// Named network resources the instances are placed into.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    pub vpc: String,
    pub subnet: String,
    pub security_group: String,
    /// Create the resources when absent (and delete them on destroy).
    #[serde(default)]
    pub create_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub name: String,
    pub public_key: String,
}

/// Validated desired state for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub network: NetworkSpec,
    pub ssh_keys: BTreeMap<String, SshKey>,
    pub instances: BTreeMap<String, InstanceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    network: NetworkSpec,
    #[serde(default)]
    ssh_keys: BTreeMap<String, RawSshKey>,
    #[serde(default)]
    defaults: RawDefaults,
    instances: BTreeMap<String, RawInstance>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawSshKey {
    public_key: Option<String>,
    public_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInstance {
    name: Option<String>,
    image: String,
    flavor: String,
    storage_size_gb: u64,
    storage_policy: String,
    os: String,
    #[serde(default)]
    floating_ip: bool,
    ssh_key: Option<String>,
    password: Option<String>,
    password_env: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

fn invalid(key: &str, reason: impl Into<String>) -> StratumError {
    StratumError::InvalidSpec {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Instance names become hostnames, inventory host names and artifact file names, so they
/// are restricted to a DNS label: lowercase ASCII letters, digits and `-`, 1 to 63 characters,
/// not starting or ending with `-`.
fn check_instance_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err(format!("name '{}' must be 1 to 63 characters", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "name '{}' may only contain lowercase letters, digits and '-'",
            name
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("name '{}' must not start or end with '-'", name));
    }
    Ok(())
}

/// `~/x` -> `$HOME/x`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, StratumError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StratumError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text, |k| std::env::var(k).ok())
    }

    /// Parse and validate. `env` resolves `password_env` indirections.
    pub fn from_json(text: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self, StratumError> {
        let raw: RawManifest =
            serde_json::from_str(text).map_err(|e| StratumError::Manifest(e.to_string()))?;

        for (field, value) in [
            ("vpc", &raw.network.vpc),
            ("subnet", &raw.network.subnet),
            ("security_group", &raw.network.security_group),
        ] {
            if value.trim().is_empty() {
                return Err(StratumError::Manifest(format!("network.{} must not be empty", field)));
            }
        }

        let mut ssh_keys = BTreeMap::new();
        for (name, key) in raw.ssh_keys {
            let public_key = match (key.public_key, key.public_key_file) {
                (Some(inline), _) => inline,
                (None, Some(file)) => {
                    let path = expand_home(&file);
                    std::fs::read_to_string(&path).map_err(|e| {
                        StratumError::Manifest(format!(
                            "ssh_keys.{}: cannot read {}: {}",
                            name,
                            path.display(),
                            e
                        ))
                    })?
                }
                (None, None) => {
                    return Err(StratumError::Manifest(format!(
                        "ssh_keys.{}: public_key or public_key_file required",
                        name
                    )))
                }
            };
            let public_key = public_key.trim().to_string();
            if public_key.is_empty() {
                return Err(StratumError::Manifest(format!("ssh_keys.{}: empty public key", name)));
            }
            ssh_keys.insert(name.clone(), SshKey { name, public_key });
        }

        let mut instances = BTreeMap::new();
        for (key, ri) in raw.instances {
            let os = OsKind::parse(&ri.os)
                .ok_or_else(|| invalid(&key, format!("unknown os '{}'", ri.os)))?;
            let name = ri.name.unwrap_or_else(|| key.clone());
            check_instance_name(&name).map_err(|reason| invalid(&key, reason))?;
            if ri.storage_size_gb == 0 {
                return Err(invalid(&key, "storage_size_gb must be positive"));
            }

            let credential = match (ri.ssh_key, ri.password, ri.password_env) {
                (Some(key_ref), None, None) => Credential::SshKey { key_ref },
                (None, Some(password), None) => Credential::Password { password },
                (None, None, Some(var)) => Credential::Password {
                    password: env(&var)
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| invalid(&key, format!("environment variable {} is not set", var)))?,
                },
                (None, None, None) => return Err(invalid(&key, "a credential (ssh_key or password) is required")),
                _ => return Err(invalid(&key, "exactly one of ssh_key, password, password_env is allowed")),
            };
            if !credential.matches_os(os) {
                let expected = match os {
                    OsKind::Linux => "ssh_key",
                    OsKind::Windows => "password",
                };
                return Err(invalid(&key, format!("{} instances require a {} credential", os, expected)));
            }
            if let Credential::SshKey { key_ref } = &credential {
                if !ssh_keys.contains_key(key_ref) {
                    return Err(invalid(&key, format!("ssh key '{}' is not declared", key_ref)));
                }
            }

            let mut tags = raw.defaults.tags.clone();
            tags.extend(ri.tags);

            instances.insert(
                key.clone(),
                InstanceSpec {
                    key,
                    name,
                    image: ri.image,
                    flavor: ri.flavor,
                    storage_size_gb: ri.storage_size_gb,
                    storage_policy: ri.storage_policy,
                    os,
                    floating_ip: ri.floating_ip,
                    credential,
                    tags,
                },
            );
        }

        Ok(Self {
            network: raw.network,
            ssh_keys,
            instances,
        })
    }

    /// Union of inbound ports required by the declared OS kinds, sorted.
    pub fn required_ports(&self) -> Vec<u16> {
        let ports: BTreeSet<u16> = self
            .instances
            .values()
            .flat_map(|s| s.os.inbound_ports().iter().copied())
            .collect();
        ports.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
      "network": { "vpc": "main", "subnet": "app", "security_group": "app-sg" },
      "ssh_keys": { "deploy": { "public_key": "ssh-ed25519 AAAA test@lab\n" } },
      "defaults": { "tags": { "project": "lab", "tier": "default" } },
      "instances": {
        "web1": { "image": "ubuntu_jammy", "flavor": "DEV1-M", "storage_size_gb": 40,
                  "storage_policy": "sbs_5k", "os": "linux", "floating_ip": true,
                  "ssh_key": "deploy", "tags": { "tier": "web" } },
        "win1": { "name": "win-one", "image": "windows_server_2022", "flavor": "POP2-4C-16G-WIN",
                  "storage_size_gb": 80, "storage_policy": "sbs_15k", "os": "windows",
                  "password_env": "WIN1_ADMIN_PASSWORD" }
      }
    }"#;

    fn env(k: &str) -> Option<String> {
        (k == "WIN1_ADMIN_PASSWORD").then(|| "S3cret!".to_string())
    }

    #[test]
    fn parses_example() {
        let m = Manifest::from_json(EXAMPLE, env).unwrap();
        assert!(!m.network.create_missing);
        assert_eq!(m.ssh_keys["deploy"].public_key, "ssh-ed25519 AAAA test@lab");

        let web = &m.instances["web1"];
        assert_eq!(web.key, "web1");
        assert_eq!(web.name, "web1");
        assert!(web.floating_ip);
        assert_eq!(web.tags.get("tier").map(String::as_str), Some("web"));
        assert_eq!(web.tags.get("project").map(String::as_str), Some("lab"));

        let win = &m.instances["win1"];
        assert_eq!(win.name, "win-one");
        assert!(!win.floating_ip);
        assert_eq!(
            win.credential,
            Credential::Password {
                password: "S3cret!".to_string()
            }
        );
        assert_eq!(m.required_ports(), vec![22, 3389, 5985]);
    }

    #[test]
    fn credential_must_match_os() {
        let text = EXAMPLE.replace(r#""ssh_key": "deploy""#, r#""password": "x""#);
        match Manifest::from_json(&text, env) {
            Err(StratumError::InvalidSpec { key, reason }) => {
                assert_eq!(key, "web1");
                assert!(reason.contains("ssh_key"));
            }
            other => panic!("expected InvalidSpec, got {:?}", other),
        }
    }

    #[test]
    fn unknown_ssh_key_and_missing_password_env() {
        let text = EXAMPLE.replace(r#""ssh_key": "deploy""#, r#""ssh_key": "nope""#);
        assert!(matches!(
            Manifest::from_json(&text, env),
            Err(StratumError::InvalidSpec { .. })
        ));
        let err = Manifest::from_json(EXAMPLE, |_| None).unwrap_err();
        assert!(err.to_string().contains("WIN1_ADMIN_PASSWORD"));
    }

    #[test]
    fn names_must_be_dns_labels() {
        for bad in ["../escaped", "a b", "Web1", "web=1", "-web", "web-", ""] {
            let text = EXAMPLE.replace(r#""name": "win-one""#, &format!(r#""name": "{}""#, bad));
            match Manifest::from_json(&text, env) {
                Err(StratumError::InvalidSpec { key, .. }) => assert_eq!(key, "win1", "{}", bad),
                other => panic!("expected InvalidSpec for {:?}, got {:?}", bad, other),
            }
        }
        let long = "a".repeat(64);
        let text = EXAMPLE.replace(r#""name": "win-one""#, &format!(r#""name": "{}""#, long));
        assert!(Manifest::from_json(&text, env).is_err());

        let ok = "a".repeat(63);
        let text = EXAMPLE.replace(r#""name": "win-one""#, &format!(r#""name": "{}""#, ok));
        assert_eq!(Manifest::from_json(&text, env).unwrap().instances["win1"].name, ok);
    }

    #[test]
    fn malformed_json_is_a_manifest_error() {
        assert!(matches!(
            Manifest::from_json("{", env),
            Err(StratumError::Manifest(_))
        ));
        let text = EXAMPLE.replace(r#""os": "windows""#, r#""os": "windows", "colour": "red""#);
        assert!(matches!(
            Manifest::from_json(&text, env),
            Err(StratumError::Manifest(_))
        ));
    }

    #[test]
    fn public_key_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id.pub");
        std::fs::write(&key_path, "ssh-ed25519 BBBB file@lab\n").unwrap();
        let text = EXAMPLE.replace(
            r#""public_key": "ssh-ed25519 AAAA test@lab\n""#,
            &format!(r#""public_key_file": "{}""#, key_path.display()),
        );
        let m = Manifest::from_json(&text, env).unwrap();
        assert_eq!(m.ssh_keys["deploy"].public_key, "ssh-ed25519 BBBB file@lab");
    }
}
