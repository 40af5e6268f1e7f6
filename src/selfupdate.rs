use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::error::UpdateError;

/// Replaces the running process image. Only returns on failure.
pub trait ProcessReplacer: Send + Sync {
    fn replace(
        &self,
        program: &Path,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> io::Result<()>;
}

impl<T: ProcessReplacer + ?Sized> ProcessReplacer for Box<T> {
    fn replace(
        &self,
        program: &Path,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> io::Result<()> {
        (**self).replace(program, args, envs)
    }
}

/// Re-executes in place through `execve`, keeping the PID.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecReplacer;

impl ProcessReplacer for ExecReplacer {
    #[cfg(unix)]
    fn replace(
        &self,
        program: &Path,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> io::Result<()> {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let mut command = Command::new(program);
        if let Some((arg0, rest)) = args.split_first() {
            command.arg0(arg0).args(rest);
        }
        command
            .env_clear()
            .envs(envs.iter().map(|(key, value)| (key, value)));
        Err(command.exec())
    }

    #[cfg(not(unix))]
    fn replace(
        &self,
        _program: &Path,
        _args: &[OsString],
        _envs: &[(OsString, OsString)],
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-place process replacement requires a unix host",
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SelfUpdateOutcome {
    CandidateMissing,
    UpToDate {
        sha256: String,
    },
    Replaced {
        backup_path: PathBuf,
        previous_sha256: String,
        new_sha256: String,
    },
}

impl SelfUpdateOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::CandidateMissing => "candidate_missing",
            Self::UpToDate { .. } => "up_to_date",
            Self::Replaced { .. } => "replaced",
        }
    }
}

pub struct SelfUpdater<R: ProcessReplacer = ExecReplacer> {
    replacer: R,
}

impl Default for SelfUpdater<ExecReplacer> {
    fn default() -> Self {
        Self::new(ExecReplacer)
    }
}

impl<R: ProcessReplacer> SelfUpdater<R> {
    pub fn new(replacer: R) -> Self {
        Self { replacer }
    }

    /// Swaps `current` for `candidate` when their contents differ, then
    /// re-executes `current` with `args` and `envs`.
    ///
    /// The swap is rename then copy with no rollback: at every point either
    /// the backup or the new binary is a complete executable.
    pub fn try_replace(
        &self,
        current: &Path,
        candidate: &Path,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> Result<SelfUpdateOutcome, UpdateError> {
        if !candidate.exists() {
            return Ok(SelfUpdateOutcome::CandidateMissing);
        }

        let previous_sha256 = hash_step(current)?;
        let new_sha256 = hash_step(candidate)?;
        if previous_sha256 == new_sha256 {
            return Ok(SelfUpdateOutcome::UpToDate {
                sha256: previous_sha256,
            });
        }

        let backup_path = backup_path_for(current, &previous_sha256);
        info!(
            current = %current.display(),
            candidate = %candidate.display(),
            backup = %backup_path.display(),
            "self update: replacing binary"
        );

        match fs::remove_file(&backup_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_error("remove stale backup", &backup_path, source)),
        }
        fs::rename(current, &backup_path)
            .map_err(|source| io_error("move current binary to backup", current, source))?;
        fs::copy(candidate, current)
            .map_err(|source| io_error("copy candidate binary", current, source))?;
        let permissions = fs::metadata(candidate)
            .map_err(|source| io_error("read candidate metadata", candidate, source))?
            .permissions();
        fs::set_permissions(current, permissions)
            .map_err(|source| io_error("set binary permissions", current, source))?;

        if let Err(source) = self.replacer.replace(current, args, envs) {
            error!(
                path = %current.display(),
                error = %source,
                "self update: binary swapped but exec failed"
            );
            return Err(UpdateError::SelfUpdateExecFailed {
                path: current.to_path_buf(),
                source,
            });
        }

        Ok(SelfUpdateOutcome::Replaced {
            backup_path,
            previous_sha256,
            new_sha256,
        })
    }
}

/// `<current>.<sha256 of current>` so successive updates never reuse a name.
pub fn backup_path_for(current: &Path, current_sha256: &str) -> PathBuf {
    let mut name = current.as_os_str().to_os_string();
    name.push(".");
    name.push(current_sha256);
    PathBuf::from(name)
}

pub fn compute_sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_step(path: &Path) -> Result<String, UpdateError> {
    compute_sha256_hex(path).map_err(|source| io_error("hash binary", path, source))
}

fn io_error(step: &'static str, path: &Path, source: io::Error) -> UpdateError {
    UpdateError::SelfUpdateIo {
        step,
        path: path.to_path_buf(),
        source,
    }
}
