use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use plugin_warden::agent::{PluginAgent, RunOptions};
use plugin_warden::config::Settings;
use plugin_warden::observability::ObservabilityGuard;

#[derive(Parser, Debug)]
#[command(name = "plugin-warden")]
#[command(about = "Signed plugin updater for the monitoring agent", long_about = None)]
struct Cli {
    /// Export spans and metrics over OTLP.
    #[arg(long, global = true, default_value_t = false)]
    otel: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime config and signing keys.
    Doctor,
    /// Fetch, verify and check out one plugin revision.
    Update {
        /// Revision to check out instead of the configured default.
        #[arg(long)]
        revision: Option<String>,
    },
    /// Print the revision currently checked out.
    Version,
    /// Discard local modifications in the plugin working copy.
    ForceReset,
    /// Replace and re-exec this binary if the checkout ships a newer one.
    SelfUpdate,
    /// Show guard state and the telemetry snapshot as JSON.
    Status,
    /// Periodically update the plugin (and self-update when enabled).
    Run {
        /// Run a single update cycle then exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init(settings.debug, cli.otel);
    let agent = PluginAgent::new(settings)?;

    let result = dispatch(&agent, cli.command.unwrap_or(Commands::Doctor));
    if let Err(err) = &result {
        error!(error = %format!("{:#}", err), "plugin-warden command failed");
    }
    result
}

fn dispatch(agent: &PluginAgent, command: Commands) -> Result<()> {
    match command {
        Commands::Doctor => {
            let report = agent.doctor();
            println!("Plugin Warden Doctor");
            println!("hostname: {}", report.hostname);
            println!("data_dir: {}", report.data_dir.display());
            println!("telemetry_file: {}", report.telemetry_file.display());
            println!("git_bin: {}", report.git_bin);
            println!("plugin_enabled: {}", report.plugin_enabled);
            println!("checkout_path: {}", report.checkout_path.display());
            println!(
                "remote_url: {}",
                report.remote_url.unwrap_or_else(|| "<unset>".to_string())
            );
            println!("signing_keys_count: {}", report.signing_keys_count);
            println!(
                "alt_signing_keys_file: {}",
                report
                    .alt_signing_keys_file
                    .unwrap_or_else(|| "<unset>".to_string())
            );
            println!("default_revision: {}", report.default_revision);
            println!("fetch_timeout_secs: {}", report.fetch_timeout_secs);
            println!("update_cooldown_secs: {}", report.update_cooldown_secs);
            println!("update_interval_secs: {}", report.update_interval_secs);
            println!("self_update_enabled: {}", report.self_update_enabled);
            println!("self_update_artifact: {}", report.self_update_artifact);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Update { revision } => {
            println!("{}", agent.update_plugin_json(revision.as_deref())?);
        }
        Commands::Version => {
            let revision = agent
                .current_version()
                .context("failed reading plugin version")?;
            println!("{}", revision);
        }
        Commands::ForceReset => {
            agent
                .force_reset()
                .context("failed resetting plugin working copy")?;
            println!("ok");
        }
        Commands::SelfUpdate => {
            println!("{}", agent.self_update_json()?);
        }
        Commands::Status => {
            println!("{}", agent.status_json()?);
        }
        Commands::Run { once } => {
            let options = build_run_options(once)?;
            agent.run(&options)?;
        }
    }

    Ok(())
}

fn build_run_options(once: bool) -> Result<RunOptions> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        signal_flag.store(true, Ordering::SeqCst);
        eprintln!(
            "{{\"event\":\"agent_signal\",\"signal\":\"interrupt\",\"action\":\"graceful_stop\"}}"
        );
    })?;

    Ok(RunOptions {
        once,
        shutdown: Some(shutdown),
    })
}
