use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{DoctorReport, Settings};
use crate::error::UpdateError;
use crate::observability;
use crate::repo::{GitRepository, RepositoryBackend};
use crate::reporting::MetricsFailureReporter;
use crate::selfupdate::{ExecReplacer, ProcessReplacer, SelfUpdateOutcome, SelfUpdater};
use crate::telemetry::{SelfUpdateRecord, TelemetryStore, UpdateRecord};
use crate::update::{UpdateGuard, UpdateOrchestrator, UpdateReport};

const RUN_LOOP_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub once: bool,
    pub shutdown: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn should_stop(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

pub struct PluginAgent {
    settings: Settings,
    orchestrator: UpdateOrchestrator,
    telemetry: Arc<Mutex<TelemetryStore>>,
    self_updater: SelfUpdater<Box<dyn ProcessReplacer>>,
    current_binary: Option<PathBuf>,
}

impl PluginAgent {
    pub fn new(settings: Settings) -> Result<Self> {
        let repo = GitRepository::new(settings.git_bin.clone()).with_fetch_timeout(
            Duration::from_secs(settings.plugin.fetch_timeout_secs.max(1)),
        );
        Self::with_backend(settings, Arc::new(repo))
    }

    pub fn with_backend(settings: Settings, repo: Arc<dyn RepositoryBackend>) -> Result<Self> {
        let telemetry = Arc::new(Mutex::new(
            TelemetryStore::new(&settings.telemetry_file).with_context(|| {
                format!(
                    "failed opening telemetry store {}",
                    settings.telemetry_file.display()
                )
            })?,
        ));
        let reporter = MetricsFailureReporter::new(settings.hostname.clone())
            .with_telemetry(Arc::clone(&telemetry));
        let guard = Arc::new(UpdateGuard::new(Duration::from_secs(
            settings.plugin.update_cooldown_secs,
        )));
        let orchestrator =
            UpdateOrchestrator::new(settings.plugin.clone(), repo, guard, Arc::new(reporter));

        Ok(Self {
            settings,
            orchestrator,
            telemetry,
            self_updater: SelfUpdater::new(Box::new(ExecReplacer)),
            current_binary: None,
        })
    }

    pub fn with_process_replacer(mut self, replacer: Box<dyn ProcessReplacer>) -> Self {
        self.self_updater = SelfUpdater::new(replacer);
        self
    }

    /// Binary to compare and replace instead of the running executable.
    pub fn with_current_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.current_binary = Some(path.into());
        self
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    pub fn update_plugin(&self, revision: Option<&str>) -> Result<UpdateReport, UpdateError> {
        let started = Instant::now();
        let result = self.orchestrator.update_plugin(revision);
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match &result {
            Ok(_) => "ok",
            Err(err) if err.is_control_signal() => "rejected",
            Err(_) => "failed",
        };
        observability::record_update_attempt(status, latency_ms);

        if !matches!(result, Err(UpdateError::NotEnabled)) {
            let record = UpdateRecord {
                timestamp: Utc::now().to_rfc3339(),
                requested_revision: revision.map(ToString::to_string),
                revision: result.as_ref().ok().map(|report| report.revision.clone()),
                status: status.to_string(),
                error_kind: result.as_ref().err().map(|err| err.kind().to_string()),
                verified: result.as_ref().ok().map(|report| report.verified),
                signing_key: result
                    .as_ref()
                    .ok()
                    .and_then(|report| report.signing_key.clone()),
                alternate_keys: result.as_ref().ok().map(|report| report.alternate_keys),
                error: result.as_ref().err().map(ToString::to_string),
            };
            if let Err(err) = self.telemetry().record_update(record) {
                warn!(error = %err, "failed recording update telemetry");
            }
        }

        result
    }

    pub fn update_plugin_json(&self, revision: Option<&str>) -> Result<String> {
        let payload = match self.update_plugin(revision) {
            Ok(report) => json!({ "status": "ok", "report": report }),
            Err(err) if err.is_control_signal() => json!({
                "status": "rejected",
                "kind": err.kind(),
                "reason": err.to_string(),
            }),
            Err(err) => return Err(anyhow::Error::new(err).context("plugin update failed")),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode update result")
    }

    pub fn current_version(&self) -> Result<String, UpdateError> {
        self.orchestrator.current_revision()
    }

    pub fn force_reset(&self) -> Result<(), UpdateError> {
        self.orchestrator.force_reset()
    }

    /// Returns `None` when self-update is disabled. Only returns
    /// `Replaced` when the process replacer does not actually exec.
    pub fn try_self_update(&self) -> Result<Option<SelfUpdateOutcome>, UpdateError> {
        if !self.settings.self_update.enabled {
            return Ok(None);
        }

        let current = match self.current_binary.clone() {
            Some(path) => path,
            None => env::current_exe().map_err(|source| UpdateError::SelfUpdateIo {
                step: "locate current executable",
                path: PathBuf::from(&self.settings.self_update.artifact_name),
                source,
            })?,
        };
        let candidate = self
            .orchestrator
            .candidate_path(&self.settings.self_update.artifact_name);
        let args = env::args_os().collect::<Vec<OsString>>();
        let envs = env::vars_os().collect::<Vec<(OsString, OsString)>>();

        let result = self.self_updater.try_replace(&current, &candidate, &args, &envs);

        let status = match &result {
            Ok(outcome) => outcome.status(),
            Err(err) => err.kind(),
        };
        observability::record_self_update(status);
        let backup_path = match &result {
            Ok(SelfUpdateOutcome::Replaced { backup_path, .. }) => {
                Some(backup_path.display().to_string())
            }
            _ => None,
        };
        let record = SelfUpdateRecord {
            timestamp: Utc::now().to_rfc3339(),
            status: status.to_string(),
            current_binary: current.display().to_string(),
            candidate_binary: candidate.display().to_string(),
            backup_path,
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(err) = self.telemetry().record_self_update(record) {
            warn!(error = %err, "failed recording self-update telemetry");
        }

        match &result {
            Ok(SelfUpdateOutcome::CandidateMissing) => {}
            Ok(outcome) => info!(status = outcome.status(), "self update checked"),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "self update left the process in an inconsistent state")
            }
            Err(err) => warn!(error = %err, "self update failed"),
        }
        result.map(Some)
    }

    pub fn self_update_json(&self) -> Result<String> {
        let outcome = self
            .try_self_update()
            .map_err(|err| anyhow::Error::new(err).context("self update failed"))?;
        let payload = match outcome {
            Some(outcome) => json!({ "enabled": true, "outcome": outcome }),
            None => json!({ "enabled": false }),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode self-update result")
    }

    pub fn status_json(&self) -> Result<String> {
        let telemetry = self.telemetry();
        let snapshot = telemetry.snapshot();
        let guard = self.orchestrator.guard();
        let payload = json!({
            "plugin": {
                "enabled": self.settings.plugin.enabled,
                "checkout_path": self.settings.plugin.checkout_path.display().to_string(),
                "update_in_flight": guard.is_in_flight(),
                "last_attempt": guard.last_attempt().map(|value| value.to_rfc3339()),
                "cooldown_secs": guard.cooldown().as_secs(),
            },
            "telemetry": {
                "file": telemetry.path().display().to_string(),
                "snapshot": snapshot,
            },
        });

        serde_json::to_string_pretty(&payload).context("failed to encode status")
    }

    /// Periodic update loop. A plugin update that checks out a new revision
    /// is followed by a self-update check. Fatal self-update errors end the
    /// loop with an error; everything else is logged and retried next tick.
    pub fn run(&self, options: &RunOptions) -> Result<()> {
        let interval = Duration::from_secs(self.settings.plugin.update_interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            enabled = self.settings.plugin.enabled,
            "plugin agent started"
        );

        loop {
            if options.should_stop() {
                break;
            }

            match self.update_plugin(None) {
                Ok(report) => {
                    info!(revision = %report.revision, verified = report.verified, "plugin up to date");
                    match self.try_self_update() {
                        Err(err) if err.is_fatal() => {
                            return Err(anyhow::Error::new(err)
                                .context("self update exec failed after binary swap"));
                        }
                        Err(_) | Ok(_) => {}
                    }
                }
                Err(err) if err.is_control_signal() => {
                    info!(reason = %err, "plugin update skipped");
                }
                Err(err) => {
                    warn!(kind = err.kind(), error = %err, "plugin update attempt failed");
                }
            }

            if options.once {
                break;
            }

            let wait_started = Instant::now();
            while wait_started.elapsed() < interval {
                if options.should_stop() {
                    break;
                }
                thread::sleep(RUN_LOOP_TICK.min(interval));
            }
        }

        info!("plugin agent stopped");
        Ok(())
    }

    fn telemetry(&self) -> MutexGuard<'_, TelemetryStore> {
        self.telemetry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
