use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use stratum_common::StratumError;
use tokio::process::Command;

use crate::settings::Settings;

fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().rev().take(max_chars).collect::<String>().chars().rev().collect()
}

/// Result of a configuration run that exited on its own.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigurationRun {
    pub code: i32,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Starts the external configuration-management run (ansible-playbook by default).
#[derive(Debug, Clone)]
pub struct ConfigurationInvoker {
    program: String,
    prefix_args: Vec<String>,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
}

impl ConfigurationInvoker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            extra_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.configure_program.clone())
            .with_prefix_args(settings.configure_prefix_args.clone())
            .with_extra_args(settings.configure_args.clone())
            .with_timeout(settings.configure_timeout)
    }

    /// Arguments placed before `-i` (e.g. a script path when the program is a shell).
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `<prefix..> -i <inventory> [--limit a,b] [extra..] <playbook>`
    pub fn args(&self, inventory: &Path, playbook: &Path, limit: Option<&[String]>) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.push("-i".to_string());
        args.push(inventory.display().to_string());
        if let Some(hosts) = limit {
            args.push("--limit".to_string());
            args.push(hosts.join(","));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(playbook.display().to_string());
        args
    }

    /// Exactly one run. Non-zero exit is `ConfigurationFailed`; hitting the timeout
    /// kills the child and yields `ConfigurationTimedOut`.
    pub async fn run(
        &self,
        inventory: &Path,
        playbook: &Path,
        limit: Option<&[String]>,
    ) -> Result<ConfigurationRun, StratumError> {
        let args = self.args(inventory, playbook, limit);
        tracing::info!("🔵 [configure] {} {}", self.program, args.join(" "));

        let started = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(out) => out?,
                Err(_) => {
                    tracing::error!("⏱️ [configure] timed out after {:?}, child killed", limit);
                    return Err(StratumError::ConfigurationTimedOut {
                        after_secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let run = ConfigurationRun {
            code: output.status.code().unwrap_or(-1),
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_tail: tail_str(&stdout, 8000),
            stderr_tail: tail_str(&stderr, 8000),
        };

        if output.status.success() {
            tracing::info!("✅ [configure] run succeeded in {}ms", run.duration_ms);
            Ok(run)
        } else {
            tracing::error!(
                "❌ [configure] run failed (exit={}): {}",
                run.code,
                tail_str(&stderr, 2000)
            );
            Err(StratumError::ConfigurationFailed { code: run.code })
        }
    }
}
