//! One-level trust delegation through a signed alternate-keys file.
//!
//! The file is trusted only if the most recent revision that changed it (at
//! or before the target) verifies against the primary keys. Alternate keys
//! never vouch for further alternate keys.

use std::path::Path;

use tracing::debug;

use crate::error::UpdateError;
use crate::repo::RepositoryBackend;
use crate::signature::{verify_revision, TrustedKeySet};

pub fn resolve_alternate_keys(
    repo: &dyn RepositoryBackend,
    working_copy: &Path,
    target_revision: &str,
    keys_file: &str,
    primary_keys: &TrustedKeySet,
) -> Result<Vec<String>, UpdateError> {
    let keys_file = keys_file.trim_start_matches("./");
    if repo
        .read_file_at_revision(working_copy, target_revision, keys_file)?
        .is_none()
    {
        return Err(UpdateError::KeysFileMissing(
            working_copy.join(keys_file).display().to_string(),
        ));
    }

    let introducing = repo.resolve_introducing_revision(working_copy, target_revision, keys_file)?;
    let metadata = repo.read_revision_metadata(working_copy, &introducing)?;
    let verified = verify_revision(&metadata, primary_keys)?;
    debug!(
        revision = %introducing,
        key = %verified.key_identifier,
        "alternate keys file provenance verified"
    );

    // Read the file as of the verified revision so the content is covered by
    // the signature that was just checked.
    let content = repo
        .read_file_at_revision(working_copy, &introducing, keys_file)?
        .ok_or_else(|| {
            UpdateError::KeysFileMissing(working_copy.join(keys_file).display().to_string())
        })?;

    Ok(parse_key_entries(&content))
}

/// Non-blank, non-comment lines, trimmed.
pub fn parse_key_entries(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}
