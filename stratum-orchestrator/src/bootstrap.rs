use stratum_common::{Credential, InstanceSpec, OsKind};

/// Boot-time user data for an instance: cloud-init for linux, a cloudbase-init
/// PowerShell script for windows. Output is deterministic for a given spec.
pub fn user_data(spec: &InstanceSpec, ssh_public_key: Option<&str>) -> Option<String> {
    match (spec.os, &spec.credential) {
        (OsKind::Linux, _) => Some(build_ssh_key_cloud_init(&spec.name, ssh_public_key.unwrap_or(""))),
        (OsKind::Windows, Credential::Password { password }) => Some(build_winrm_bootstrap(password)),
        (OsKind::Windows, Credential::SshKey { .. }) => None,
    }
}

fn build_ssh_key_cloud_init(hostname: &str, ssh_pub: &str) -> String {
    let mut cloud = String::new();
    cloud.push_str("#cloud-config\n");
    cloud.push_str(&format!("hostname: {}\n", hostname));
    if !ssh_pub.trim().is_empty() {
        cloud.push_str("ssh_authorized_keys:\n");
        cloud.push_str(&format!("  - {}\n", ssh_pub.trim()));
    }
    cloud
}

/// PowerShell single-quoted literal.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn build_winrm_bootstrap(password: &str) -> String {
    let mut script = String::new();
    script.push_str("#ps1_sysnative\n");
    script.push_str("$ErrorActionPreference = 'Stop'\n");
    script.push_str(&format!(
        "$pw = ConvertTo-SecureString {} -AsPlainText -Force\n",
        ps_quote(password)
    ));
    script.push_str("Set-LocalUser -Name 'Administrator' -Password $pw\n");
    script.push_str("Enable-PSRemoting -Force -SkipNetworkProfileCheck\n");
    script.push_str("Set-Item -Path WSMan:\\localhost\\Service\\Auth\\Basic -Value $true\n");
    script.push_str(
        "New-NetFirewallRule -Name 'stratum-winrm-http' -DisplayName 'WinRM HTTP' \
         -Direction Inbound -Protocol TCP -LocalPort 5985 -Action Allow\n",
    );
    script.push_str(
        "Set-ItemProperty -Path 'HKLM:\\System\\CurrentControlSet\\Control\\Terminal Server' \
         -Name 'fDenyTSConnections' -Value 0\n",
    );
    script.push_str("Enable-NetFirewallRule -DisplayGroup 'Remote Desktop'\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(os: OsKind, credential: Credential) -> InstanceSpec {
        InstanceSpec {
            key: "k".to_string(),
            name: "host1".to_string(),
            image: "img".to_string(),
            flavor: "f".to_string(),
            storage_size_gb: 10,
            storage_policy: "p".to_string(),
            os,
            floating_ip: false,
            credential,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn linux_gets_cloud_init_with_key() {
        let s = spec(
            OsKind::Linux,
            Credential::SshKey {
                key_ref: "deploy".to_string(),
            },
        );
        let ud = user_data(&s, Some(" ssh-ed25519 AAAA me@lab \n")).unwrap();
        assert_eq!(
            ud,
            "#cloud-config\nhostname: host1\nssh_authorized_keys:\n  - ssh-ed25519 AAAA me@lab\n"
        );
        let bare = user_data(&s, None).unwrap();
        assert!(!bare.contains("ssh_authorized_keys"));
    }

    #[test]
    fn windows_password_is_quoted() {
        let s = spec(
            OsKind::Windows,
            Credential::Password {
                password: "it's$ecret".to_string(),
            },
        );
        let ud = user_data(&s, None).unwrap();
        assert!(ud.starts_with("#ps1_sysnative\n"));
        assert!(ud.contains("ConvertTo-SecureString 'it''s$ecret'"));
        assert!(ud.contains("-LocalPort 5985"));
        assert_eq!(ud, user_data(&s, None).unwrap());
    }
}
