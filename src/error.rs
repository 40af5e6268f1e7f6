use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Stage of a plugin update attempt past the guard check. Failures are
/// reported to the metrics sink under the stage's subject so operators can
/// tell them apart. Guard rejections are not stages and are never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    EnsuringRepo,
    Fetching,
    ResolvingTrust,
    Verifying,
    CheckingOut,
}

impl UpdateStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EnsuringRepo => "ensuring_repo",
            Self::Fetching => "fetching",
            Self::ResolvingTrust => "resolving_trust",
            Self::Verifying => "verifying",
            Self::CheckingOut => "checking_out",
        }
    }

    pub const fn failure_subject(self) -> &'static str {
        match self {
            Self::EnsuringRepo => "repo-init-fail",
            Self::Fetching => "fetch-fail",
            Self::ResolvingTrust => "alt-key-fail",
            Self::Verifying => "signature-fail",
            Self::CheckingOut => "checkout-fail",
        }
    }
}

impl Display for UpdateStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("plugin update is not enabled")]
    NotEnabled,
    #[error("plugin working copy does not exist: {}", .0.display())]
    RepoMissing(PathBuf),
    #[error("can't initialize plugin repository {}: {message}", .path.display())]
    RepoInit { path: PathBuf, message: String },
    #[error("update plugins by fetch failed: {message}{}", format_output(.output))]
    Fetch { message: String, output: String },
    #[error("can't read revision '{revision}': {message}")]
    RevisionRead { revision: String, message: String },
    #[error("can't find tree hash in revision metadata")]
    NoTreeHash,
    #[error("signature not found: {0}")]
    NoSignature(String),
    #[error("signing key '{0}' is untrusted")]
    UntrustedKey(String),
    #[error("signature encoding error: {0}")]
    Encoding(String),
    #[error("signature invalid for tree {tree_hash} (key {key_identifier})")]
    SignatureInvalid {
        tree_hash: String,
        key_identifier: String,
    },
    #[error("alternate signing keys file {0} does not exist")]
    KeysFileMissing(String),
    #[error("checkout of '{revision}' failed: {message}{}", format_output(.output))]
    Checkout {
        revision: String,
        message: String,
        output: String,
    },
    #[error("previous update in flight, do nothing")]
    UpdateInFlight,
    #[error(
        "previous update too recent ({elapsed_secs}s ago, cooldown {cooldown_secs}s), do nothing"
    )]
    UpdateTooRecent {
        elapsed_secs: u64,
        cooldown_secs: u64,
    },
    #[error("self-update failed to {step} {}: {source}", .path.display())]
    SelfUpdateIo {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("self-update could not exec {}: {source}", .path.display())]
    SelfUpdateExecFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UpdateError {
    /// Stable machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotEnabled => "not_enabled",
            Self::RepoMissing(_) => "repo_missing",
            Self::RepoInit { .. } => "repo_init_error",
            Self::Fetch { .. } => "fetch_error",
            Self::RevisionRead { .. } => "revision_read_error",
            Self::NoTreeHash => "no_tree_hash",
            Self::NoSignature(_) => "no_signature",
            Self::UntrustedKey(_) => "untrusted_key",
            Self::Encoding(_) => "encoding_error",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::KeysFileMissing(_) => "keys_file_missing",
            Self::Checkout { .. } => "checkout_error",
            Self::UpdateInFlight => "update_in_flight",
            Self::UpdateTooRecent { .. } => "update_too_recent",
            Self::SelfUpdateIo { .. } => "self_update_io_error",
            Self::SelfUpdateExecFailed { .. } => "self_update_exec_failed",
        }
    }

    /// "Try again later" outcomes. They are never reported as incidents.
    pub const fn is_control_signal(&self) -> bool {
        matches!(
            self,
            Self::NotEnabled | Self::UpdateInFlight | Self::UpdateTooRecent { .. }
        )
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SelfUpdateExecFailed { .. })
    }
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::{UpdateError, UpdateStage};

    #[test]
    fn fetch_error_message_includes_captured_output() {
        let err = UpdateError::Fetch {
            message: "exit status 128".to_string(),
            output: "fatal: unable to access remote\n".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("exit status 128"));
        assert!(text.ends_with("fatal: unable to access remote"));
    }

    #[test]
    fn guard_rejections_are_control_signals() {
        assert!(UpdateError::UpdateInFlight.is_control_signal());
        assert!(UpdateError::UpdateTooRecent {
            elapsed_secs: 1,
            cooldown_secs: 300
        }
        .is_control_signal());
        assert!(!UpdateError::NoTreeHash.is_control_signal());
    }

    #[test]
    fn stages_have_distinct_failure_subjects() {
        let stages = [
            UpdateStage::EnsuringRepo,
            UpdateStage::Fetching,
            UpdateStage::ResolvingTrust,
            UpdateStage::Verifying,
            UpdateStage::CheckingOut,
        ];
        let mut subjects = stages
            .iter()
            .map(|stage| stage.failure_subject())
            .collect::<Vec<_>>();
        subjects.sort_unstable();
        subjects.dedup();
        assert_eq!(subjects.len(), stages.len());
    }
}
