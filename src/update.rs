use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PluginSettings;
use crate::error::{UpdateError, UpdateStage};
use crate::repo::{ensure_parent_dir, RepositoryBackend};
use crate::reporting::FailureReporter;
use crate::signature::{verify_revision, TrustedKeySet, VerifiedRevision};
use crate::trust::resolve_alternate_keys;

pub const DEFAULT_UPDATE_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, Default)]
struct GuardState {
    in_flight: bool,
    last_attempt: Option<DateTime<Utc>>,
}

/// Single-flight and rate-limit state shared by every trigger of a plugin
/// update (timer, manual command).
#[derive(Debug)]
pub struct UpdateGuard {
    cooldown: Duration,
    state: Mutex<GuardState>,
}

impl Default for UpdateGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_UPDATE_COOLDOWN_SECS))
    }
}

impl UpdateGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.lock().last_attempt
    }

    /// Checks and claims the guard in one critical section. Rejections
    /// leave the state untouched.
    pub fn try_begin(&self, now: DateTime<Utc>) -> Result<UpdatePermit<'_>, UpdateError> {
        let mut state = self.lock();
        if state.in_flight {
            return Err(UpdateError::UpdateInFlight);
        }
        if let Some(last) = state.last_attempt {
            let elapsed = now.signed_duration_since(last).num_seconds().max(0) as u64;
            if elapsed < self.cooldown.as_secs() {
                return Err(UpdateError::UpdateTooRecent {
                    elapsed_secs: elapsed,
                    cooldown_secs: self.cooldown.as_secs(),
                });
            }
        }
        state.in_flight = true;
        Ok(UpdatePermit { guard: self })
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Held for the duration of one attempt; dropping it clears the in-flight
/// flag whichever way the attempt ends.
#[derive(Debug)]
pub struct UpdatePermit<'a> {
    guard: &'a UpdateGuard,
}

impl UpdatePermit<'_> {
    pub fn stamp(&self, now: DateTime<Utc>) {
        self.guard.lock().last_attempt = Some(now);
    }
}

impl Drop for UpdatePermit<'_> {
    fn drop(&mut self) {
        self.guard.lock().in_flight = false;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub revision: String,
    pub checkout_path: String,
    pub verified: bool,
    pub tree_hash: Option<String>,
    pub signing_key: Option<String>,
    pub alternate_keys: usize,
    pub started_at: String,
    pub finished_at: String,
    pub latency_ms: u64,
}

pub struct UpdateOrchestrator {
    settings: PluginSettings,
    repo: Arc<dyn RepositoryBackend>,
    guard: Arc<UpdateGuard>,
    reporter: Arc<dyn FailureReporter>,
}

impl UpdateOrchestrator {
    pub fn new(
        settings: PluginSettings,
        repo: Arc<dyn RepositoryBackend>,
        guard: Arc<UpdateGuard>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            settings,
            repo,
            guard,
            reporter,
        }
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    pub fn guard(&self) -> &UpdateGuard {
        &self.guard
    }

    pub fn checkout_path(&self) -> &Path {
        &self.settings.checkout_path
    }

    /// Runs one update attempt: ensure repo, fetch, resolve trust, verify,
    /// checkout. `revision` defaults to the configured default branch head.
    #[instrument(
        name = "plugin.update",
        skip(self),
        fields(checkout = %self.settings.checkout_path.display())
    )]
    pub fn update_plugin(&self, revision: Option<&str>) -> Result<UpdateReport, UpdateError> {
        if !self.settings.enabled {
            debug!("plugin not enabled, not updating");
            return Err(UpdateError::NotEnabled);
        }

        let permit = self.guard.try_begin(Utc::now()).map_err(|err| {
            debug!(reason = %err, "update rejected by guard");
            err
        })?;

        let started = Instant::now();
        let started_at = Utc::now();
        let revision = revision
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.settings.default_revision.as_str())
            .to_string();
        let path = self.settings.checkout_path.clone();

        self.stage(UpdateStage::EnsuringRepo, || {
            ensure_parent_dir(&path)?;
            self.repo.ensure_repository(&path, &self.settings.remote_url)
        })?;

        info!(revision = %revision, "begin update plugins");
        permit.stamp(Utc::now());
        self.stage(UpdateStage::Fetching, || self.repo.fetch_updates(&path))?;

        let primary = TrustedKeySet::from_entries(&self.settings.signing_keys);
        let mut verification: Option<VerifiedRevision> = None;
        let mut alternate_count = 0;
        if primary.is_empty() {
            warn!("signing keys not configured, signature verification skipped");
        } else {
            let mut keys = primary.clone();
            if let Some(alternates) = self.resolve_alternates(&path, &revision, &primary) {
                alternate_count = alternates.len();
                keys.extend_entries(&alternates);
            }
            let verified = self.stage(UpdateStage::Verifying, || {
                let metadata = self.repo.read_revision_metadata(&path, &revision)?;
                verify_revision(&metadata, &keys)
            })?;
            info!(
                revision = %revision,
                tree = %verified.tree_hash,
                key = %verified.key_identifier,
                "plugin revision signature verified"
            );
            verification = Some(verified);
        }

        self.stage(UpdateStage::CheckingOut, || {
            self.repo.checkout_revision(&path, &revision)
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(revision = %revision, latency_ms, "update plugins complete");
        drop(permit);

        Ok(UpdateReport {
            revision,
            checkout_path: path.display().to_string(),
            verified: verification.is_some(),
            tree_hash: verification.as_ref().map(|value| value.tree_hash.clone()),
            signing_key: verification.map(|value| value.key_identifier),
            alternate_keys: alternate_count,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            latency_ms,
        })
    }

    /// Alternate keys are an enhancement: failures are reported and the
    /// attempt continues with the primary keys only.
    fn resolve_alternates(
        &self,
        path: &Path,
        revision: &str,
        primary: &TrustedKeySet,
    ) -> Option<Vec<String>> {
        let keys_file = self
            .settings
            .alt_signing_keys_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;

        match resolve_alternate_keys(self.repo.as_ref(), path, revision, keys_file, primary) {
            Ok(alternates) => {
                for key in &alternates {
                    debug!(key = %key, "got alternate signing key");
                }
                Some(alternates)
            }
            Err(err) => {
                warn!(error = %err, "failed to get alternate signing keys, using primary keys only");
                self.reporter.report_failure(
                    UpdateStage::ResolvingTrust.failure_subject(),
                    &err.to_string(),
                );
                None
            }
        }
    }

    fn stage<T>(
        &self,
        stage: UpdateStage,
        run: impl FnOnce() -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        run().map_err(|err| {
            error!(stage = %stage, kind = err.kind(), error = %err, "plugin update failed");
            self.reporter
                .report_failure(stage.failure_subject(), &err.to_string());
            err
        })
    }

    /// Commit currently checked out in the working copy.
    pub fn current_revision(&self) -> Result<String, UpdateError> {
        if !self.settings.enabled {
            return Err(UpdateError::NotEnabled);
        }

        let path = &self.settings.checkout_path;
        if !path.exists() {
            let err = UpdateError::RepoMissing(path.clone());
            self.reporter
                .report_failure("plugin-dir-does-not-exist", &err.to_string());
            return Err(err);
        }

        self.repo.current_revision(path).map_err(|err| {
            self.reporter.report_failure("git-fail", &err.to_string());
            err
        })
    }

    /// Out-of-band recovery: discards local modifications in place. A
    /// missing working copy is left alone.
    pub fn force_reset(&self) -> Result<(), UpdateError> {
        if !self.settings.enabled {
            return Err(UpdateError::NotEnabled);
        }

        let path = &self.settings.checkout_path;
        if path.exists() {
            self.repo.force_reset(path)?;
            info!(path = %path.display(), "plugin working copy force reset");
        }
        Ok(())
    }

    pub fn candidate_path(&self, artifact_name: &str) -> PathBuf {
        self.settings.checkout_path.join(artifact_name)
    }
}
