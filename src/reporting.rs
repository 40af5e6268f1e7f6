use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;

use crate::observability;
use crate::telemetry::{FailureRecord, TelemetryStore};

pub const METRIC_PREFIX: &str = "agent.plugin.";

/// Side-channel sink for update failures. Fire and forget: implementations
/// must never fail or block the update attempt.
pub trait FailureReporter: Send + Sync {
    fn report_failure(&self, subject: &str, description: &str);
}

/// Tags failures with the host endpoint, counts them through OpenTelemetry
/// and keeps the latest one in the telemetry snapshot.
pub struct MetricsFailureReporter {
    endpoint: String,
    telemetry: Option<Arc<Mutex<TelemetryStore>>>,
}

impl MetricsFailureReporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Mutex<TelemetryStore>>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

impl FailureReporter for MetricsFailureReporter {
    fn report_failure(&self, subject: &str, description: &str) {
        let metric = format!("{}{}", METRIC_PREFIX, subject);
        warn!(
            endpoint = %self.endpoint,
            metric = %metric,
            desc = %description,
            "plugin failure reported"
        );
        observability::record_update_failure(subject, &self.endpoint);

        let Some(telemetry) = self.telemetry.as_ref() else {
            return;
        };
        let mut store = telemetry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let record = FailureRecord {
            timestamp: Utc::now().to_rfc3339(),
            endpoint: self.endpoint.clone(),
            metric,
            subject: subject.to_string(),
            desc: description.to_string(),
        };
        if let Err(err) = store.record_failure(record) {
            warn!(error = %err, "failed persisting failure report");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{FailureReporter, MetricsFailureReporter};
    use crate::telemetry::TelemetryStore;

    #[test]
    fn metrics_reporter_records_tagged_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Mutex::new(
            TelemetryStore::new(temp.path().join("latest.json")).expect("telemetry"),
        ));
        let reporter = MetricsFailureReporter::new("agent-01").with_telemetry(Arc::clone(&store));

        reporter.report_failure("signature-fail", "signing key 'rogue' is untrusted");

        let snapshot = store.lock().expect("lock").snapshot();
        let failure = snapshot.last_failure.expect("failure recorded");
        assert_eq!(failure.endpoint, "agent-01");
        assert_eq!(failure.metric, "agent.plugin.signature-fail");
        assert!(failure.desc.contains("rogue"));
    }

    #[test]
    fn telemetry_write_failure_does_not_panic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "file").expect("write blocker");
        let store = Arc::new(Mutex::new(
            TelemetryStore::new(blocker.join("latest.json")).expect("telemetry"),
        ));
        let reporter = MetricsFailureReporter::new("agent-01").with_telemetry(store);

        reporter.report_failure("fetch-fail", "timeout");
    }
}
