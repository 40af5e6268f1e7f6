use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

const TELEMETRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub timestamp: String,
    pub requested_revision: Option<String>,
    pub revision: Option<String>,
    pub status: String,
    pub error_kind: Option<String>,
    pub verified: Option<bool>,
    pub signing_key: Option<String>,
    pub alternate_keys: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: String,
    pub endpoint: String,
    pub metric: String,
    pub subject: String,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfUpdateRecord {
    pub timestamp: String,
    pub status: String,
    pub current_binary: String,
    pub candidate_binary: String,
    pub backup_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub total_attempts: u64,
    pub ok_attempts: u64,
    pub failed_attempts: u64,
    pub rejected_attempts: u64,
    pub failures_reported: u64,
    pub last_update: Option<UpdateRecord>,
    pub last_failure: Option<FailureRecord>,
    pub last_self_update: Option<SelfUpdateRecord>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            total_attempts: 0,
            ok_attempts: 0,
            failed_attempts: 0,
            rejected_attempts: 0,
            failures_reported: 0,
            last_update: None,
            last_failure: None,
            last_self_update: None,
        }
    }
}

pub struct TelemetryStore {
    path: PathBuf,
    snapshot: TelemetrySnapshot,
}

impl TelemetryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load_snapshot(&path)?;
        Ok(Self { path, snapshot })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    pub fn record_update(&mut self, record: UpdateRecord) -> Result<()> {
        self.touch();
        self.snapshot.total_attempts = self.snapshot.total_attempts.saturating_add(1);
        match record.status.as_str() {
            "ok" => {
                self.snapshot.ok_attempts = self.snapshot.ok_attempts.saturating_add(1);
            }
            "rejected" => {
                self.snapshot.rejected_attempts =
                    self.snapshot.rejected_attempts.saturating_add(1);
            }
            _ => {
                self.snapshot.failed_attempts = self.snapshot.failed_attempts.saturating_add(1);
            }
        }
        self.snapshot.last_update = Some(record);
        self.persist()
    }

    pub fn record_failure(&mut self, record: FailureRecord) -> Result<()> {
        self.touch();
        self.snapshot.failures_reported = self.snapshot.failures_reported.saturating_add(1);
        self.snapshot.last_failure = Some(record);
        self.persist()
    }

    pub fn record_self_update(&mut self, record: SelfUpdateRecord) -> Result<()> {
        self.touch();
        self.snapshot.last_self_update = Some(record);
        self.persist()
    }

    fn touch(&mut self) {
        self.snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
        self.snapshot.updated_at = Utc::now().to_rfc3339();
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating telemetry dir {}", parent.display()))?;
        }

        let payload = serde_json::to_string_pretty(&self.snapshot)
            .context("failed encoding telemetry snapshot")?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, payload).with_context(|| {
            format!(
                "failed writing temporary telemetry file {}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving telemetry snapshot {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<TelemetrySnapshot> {
    if !path.exists() {
        return Ok(TelemetrySnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading telemetry file {}", path.display()))?;
    let mut snapshot: TelemetrySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding telemetry file {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }

    Ok(snapshot)
}
