use std::path::PathBuf;
use std::time::Duration;
use stratum_providers::RetryPolicy;

/// Runtime configuration, read from the environment (`.env` is loaded first by `main`).
/// CLI flags override individual fields afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: String,
    pub workers: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub output_dir: PathBuf,
    pub linux_user: String,
    pub windows_user: String,
    pub ssh_private_key: String,
    pub configure_program: String,
    /// Placed before `-i`, e.g. a wrapper script when the program is an interpreter.
    pub configure_prefix_args: Vec<String>,
    pub configure_args: Vec<String>,
    pub configure_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_positive<T: std::str::FromStr + PartialOrd + Default>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn words(raw: Option<String>) -> Vec<String> {
    non_empty(raw)
        .map(|s| s.split_whitespace().map(|a| a.to_string()).collect())
        .unwrap_or_default()
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let retry_default = RetryPolicy::default();
        Self {
            provider: non_empty(lookup("STRATUM_PROVIDER"))
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "scaleway".to_string()),
            workers: parse_positive(lookup("STRATUM_WORKERS")).unwrap_or(4),
            probe_interval: Duration::from_secs(
                parse_positive(lookup("STRATUM_PROBE_INTERVAL_S")).unwrap_or(5),
            ),
            probe_timeout: Duration::from_secs(
                parse_positive(lookup("STRATUM_PROBE_TIMEOUT_S")).unwrap_or(300),
            ),
            output_dir: non_empty(lookup("STRATUM_OUTPUT_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("out")),
            linux_user: non_empty(lookup("STRATUM_LINUX_USER")).unwrap_or_else(|| "root".to_string()),
            windows_user: non_empty(lookup("STRATUM_WINDOWS_USER"))
                .unwrap_or_else(|| "Administrator".to_string()),
            ssh_private_key: non_empty(lookup("STRATUM_SSH_PRIVATE_KEY"))
                .unwrap_or_else(|| "~/.ssh/id_ed25519".to_string()),
            configure_program: non_empty(lookup("STRATUM_CONFIGURE_PROGRAM"))
                .unwrap_or_else(|| "ansible-playbook".to_string()),
            configure_prefix_args: words(lookup("STRATUM_CONFIGURE_PREFIX")),
            configure_args: words(lookup("STRATUM_CONFIGURE_ARGS")),
            configure_timeout: parse_positive(lookup("STRATUM_CONFIGURE_TIMEOUT_S"))
                .map(Duration::from_secs),
            retry: RetryPolicy {
                max_attempts: parse_positive(lookup("STRATUM_RETRY_ATTEMPTS"))
                    .unwrap_or(retry_default.max_attempts),
                ..retry_default
            },
        }
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.output_dir.join(crate::renderer::INVENTORY_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.output_dir.join("actions.jsonl")
    }
}
