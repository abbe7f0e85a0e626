use std::sync::Arc;

use clap::Parser;
use stratum_common::StratumError;
use stratum_orchestrator::cli::{Cli, Commands};
use stratum_orchestrator::logger::ActionLog;
use stratum_orchestrator::manifest::Manifest;
use stratum_orchestrator::provider_manager::ProviderManager;
use stratum_orchestrator::services::{self, ApplyOptions, ConfigurationStatus, RunContext};
use stratum_orchestrator::settings::Settings;
use tokio_util::sync::CancellationToken;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_DEGRADED: i32 = 2;

fn exit_code_for(err: &StratumError) -> i32 {
    if err.is_fatal() {
        EXIT_FATAL
    } else {
        EXIT_DEGRADED
    }
}

async fn run(cli: Cli) -> i32 {
    let mut settings = Settings::from_env();
    cli.apply_overrides(&mut settings);

    let manifest = match Manifest::load(cli.manifest_path()) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("❌ {}", e);
            return EXIT_FATAL;
        }
    };

    let journal = match ActionLog::open(&settings.journal_path()).await {
        Ok(j) => Arc::new(j),
        Err(e) => {
            tracing::error!("❌ cannot open journal {}: {}", settings.journal_path().display(), e);
            return EXIT_FATAL;
        }
    };

    let provider = match ProviderManager::get_provider(&settings, Some(&manifest.network)) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("❌ provider setup failed: {:#}", e);
            return EXIT_FATAL;
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠️ interrupt received, finishing in-flight calls and stopping");
            signal_token.cancel();
        }
    });

    tracing::info!("🚀 stratum run {} ({} worker(s))", journal.run_id(), settings.workers);
    let ctx = RunContext::new(settings, provider, journal, cancel);

    match &cli.command {
        Commands::Plan(_) => match services::process_plan(&ctx, &manifest).await {
            Ok((plan, _)) => {
                for op in &plan.operations {
                    println!("{}", op);
                }
                println!("{}", plan.summary());
                EXIT_OK
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                exit_code_for(&e)
            }
        },
        Commands::Apply(args) => {
            let opts = ApplyOptions {
                playbook: args.playbook.clone(),
                configure: !args.skip_configure,
                probe: !args.skip_probe,
            };
            match services::process_apply(&ctx, &manifest, &opts).await {
                Ok(report) => {
                    if let Some(err) = report.apply.partial_error() {
                        tracing::error!("❌ {}", err);
                    }
                    for err in report.unreachable() {
                        tracing::warn!("⚠️ {}", err);
                    }
                    if let ConfigurationStatus::Failed { error } = &report.configuration {
                        tracing::error!("❌ {}", error);
                    }
                    for inst in report.apply.instance_list() {
                        println!("{}\t{}\t{}\t{}", inst.name, inst.os.as_str(), inst.connect_address(), inst.status.as_str());
                    }
                    if report.is_degraded() {
                        EXIT_DEGRADED
                    } else {
                        tracing::info!("✅ apply complete");
                        EXIT_OK
                    }
                }
                Err(e) => {
                    tracing::error!("❌ {}", e);
                    exit_code_for(&e)
                }
            }
        }
        Commands::Destroy(_) => match services::process_destroy(&ctx, &manifest).await {
            Ok(report) if report.is_clean() => {
                tracing::info!(
                    "✅ destroy complete ({} instance(s) removed)",
                    report.instances_removed.len()
                );
                EXIT_OK
            }
            Ok(report) => {
                for (label, err) in &report.failures {
                    tracing::error!("❌ {}: {}", label, err);
                }
                EXIT_DEGRADED
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                exit_code_for(&e)
            }
        },
        Commands::Render(_) => match services::process_render(&ctx, &manifest).await {
            Ok(paths) => {
                for p in paths {
                    println!("{}", p.display());
                }
                EXIT_OK
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                exit_code_for(&e)
            }
        },
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}
