use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::UpdateError;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;

/// How long pipe output is still collected once a timed-out command has
/// been killed.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Revision-control operations the update protocol needs against a single
/// local working copy. Knows nothing about trust or self-update.
pub trait RepositoryBackend: Send + Sync {
    /// Initializes `path` with `remote_url` as its only remote when no
    /// repository exists there yet.
    fn ensure_repository(&self, path: &Path, remote_url: &str) -> Result<(), UpdateError>;

    /// Retrieves new history without touching the checked-out tree.
    fn fetch_updates(&self, path: &Path) -> Result<(), UpdateError>;

    /// Raw text of the commit object named by `revision`.
    fn read_revision_metadata(&self, path: &Path, revision: &str) -> Result<String, UpdateError>;

    /// Destructively resets the working tree to `revision`.
    fn checkout_revision(&self, path: &Path, revision: &str) -> Result<(), UpdateError>;

    /// Most recent revision at or before `revision` that modified `file`.
    fn resolve_introducing_revision(
        &self,
        path: &Path,
        revision: &str,
        file: &str,
    ) -> Result<String, UpdateError>;

    /// Discards local modifications without changing revision.
    fn force_reset(&self, path: &Path) -> Result<(), UpdateError>;

    fn current_revision(&self, path: &Path) -> Result<String, UpdateError>;

    /// Content of `file` in the tree of `revision`, or `None` when the file
    /// is not part of that tree.
    fn read_file_at_revision(
        &self,
        path: &Path,
        revision: &str,
        file: &str,
    ) -> Result<Option<String>, UpdateError>;
}

#[derive(Debug, Clone)]
struct GitOutput {
    success: bool,
    timed_out: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// [`RepositoryBackend`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitRepository {
    git_bin: String,
    fetch_timeout: Duration,
}

impl Default for GitRepository {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitRepository {
    pub fn new(git_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout.max(Duration::from_secs(1));
        self
    }

    fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> std::io::Result<GitOutput> {
        let mut command = Command::new(&self.git_bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        if timeout.is_some() {
            use std::os::unix::process::CommandExt;
            // Remote helpers (ssh, git-remote-https) join this group and die with it.
            command.process_group(0);
        }
        debug!(git = %self.git_bin, args = ?args, "running git");

        let child = command.spawn()?;
        match timeout {
            Some(timeout) => wait_with_timeout(child, timeout),
            None => {
                let output = child.wait_with_output()?;
                Ok(GitOutput {
                    success: output.status.success(),
                    timed_out: false,
                    status: output.status.to_string(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.git_bin, args.join(" "))
    }
}

impl RepositoryBackend for GitRepository {
    fn ensure_repository(&self, path: &Path, remote_url: &str) -> Result<(), UpdateError> {
        if path.exists() {
            return Ok(());
        }

        info!(path = %path.display(), "plugin repo does not exist, creating one");
        let path_arg = path.to_string_lossy();
        let init_args = ["init", path_arg.as_ref()];
        let init = self
            .run(None, &init_args, None)
            .map_err(|err| UpdateError::RepoInit {
                path: path.to_path_buf(),
                message: format!("failed running '{}': {}", self.describe(&init_args), err),
            })?;
        if !init.success {
            return Err(UpdateError::RepoInit {
                path: path.to_path_buf(),
                message: format!("git init exited with {}\n{}", init.status, init.combined()),
            });
        }

        let remote_args = ["remote", "add", "origin", remote_url];
        let remote_failure = match self.run(Some(path), &remote_args, None) {
            Ok(output) if output.success => None,
            Ok(output) => Some(format!(
                "git remote add exited with {}\n{}",
                output.status,
                output.combined()
            )),
            Err(err) => Some(format!(
                "failed running '{}': {}",
                self.describe(&remote_args),
                err
            )),
        };

        if let Some(message) = remote_failure {
            if let Err(err) = fs::remove_dir_all(path) {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed removing half-initialized plugin repo"
                );
            }
            return Err(UpdateError::RepoInit {
                path: path.to_path_buf(),
                message: format!("can't set repo remote, aborting: {}", message),
            });
        }

        Ok(())
    }

    fn fetch_updates(&self, path: &Path) -> Result<(), UpdateError> {
        let args = ["fetch"];
        let output = self
            .run(Some(path), &args, Some(self.fetch_timeout))
            .map_err(|err| UpdateError::Fetch {
                message: format!("failed running '{}': {}", self.describe(&args), err),
                output: String::new(),
            })?;

        if output.timed_out {
            return Err(UpdateError::Fetch {
                message: format!(
                    "git fetch timed out after {} seconds and was killed",
                    self.fetch_timeout.as_secs()
                ),
                output: output.combined(),
            });
        }
        if !output.success {
            return Err(UpdateError::Fetch {
                message: format!("git fetch exited with {}", output.status),
                output: output.combined(),
            });
        }
        Ok(())
    }

    fn read_revision_metadata(&self, path: &Path, revision: &str) -> Result<String, UpdateError> {
        let args = ["cat-file", "-p", revision];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| revision_read_error(revision, &self.describe(&args), err))?;
        if !output.success {
            return Err(UpdateError::RevisionRead {
                revision: revision.to_string(),
                message: format!(
                    "can't get content of desired commit ({})\n{}",
                    output.status,
                    output.stderr.trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    fn checkout_revision(&self, path: &Path, revision: &str) -> Result<(), UpdateError> {
        let args = ["reset", "--hard", revision];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| UpdateError::Checkout {
                revision: revision.to_string(),
                message: format!("failed running '{}': {}", self.describe(&args), err),
                output: String::new(),
            })?;
        if !output.success {
            return Err(UpdateError::Checkout {
                revision: revision.to_string(),
                message: format!("git reset --hard exited with {}", output.status),
                output: output.combined(),
            });
        }
        Ok(())
    }

    fn resolve_introducing_revision(
        &self,
        path: &Path,
        revision: &str,
        file: &str,
    ) -> Result<String, UpdateError> {
        let args = ["rev-list", "-1", revision, "--", file];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| revision_read_error(revision, &self.describe(&args), err))?;
        if !output.success {
            return Err(UpdateError::RevisionRead {
                revision: revision.to_string(),
                message: format!(
                    "can't get most recent commit hash of {} ({})\n{}",
                    file,
                    output.status,
                    output.stderr.trim()
                ),
            });
        }

        let hash = output.stdout.trim();
        if hash.is_empty() {
            return Err(UpdateError::RevisionRead {
                revision: revision.to_string(),
                message: format!("no revision at or before '{}' modifies {}", revision, file),
            });
        }
        Ok(hash.to_string())
    }

    fn force_reset(&self, path: &Path) -> Result<(), UpdateError> {
        let args = ["reset", "--hard"];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| UpdateError::Checkout {
                revision: "HEAD".to_string(),
                message: format!("failed running '{}': {}", self.describe(&args), err),
                output: String::new(),
            })?;
        if !output.success {
            return Err(UpdateError::Checkout {
                revision: "HEAD".to_string(),
                message: format!("git reset --hard exited with {}", output.status),
                output: output.combined(),
            });
        }
        Ok(())
    }

    fn current_revision(&self, path: &Path) -> Result<String, UpdateError> {
        let args = ["rev-parse", "HEAD"];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| revision_read_error("HEAD", &self.describe(&args), err))?;
        if !output.success {
            return Err(UpdateError::RevisionRead {
                revision: "HEAD".to_string(),
                message: format!(
                    "git rev-parse exited with {}\n{}",
                    output.status,
                    output.stderr.trim()
                ),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    fn read_file_at_revision(
        &self,
        path: &Path,
        revision: &str,
        file: &str,
    ) -> Result<Option<String>, UpdateError> {
        let object = format!("{}:{}", revision, file);
        let exists_args = ["cat-file", "-e", object.as_str()];
        let exists = self
            .run(Some(path), &exists_args, None)
            .map_err(|err| revision_read_error(revision, &self.describe(&exists_args), err))?;
        if !exists.success {
            return Ok(None);
        }

        let args = ["cat-file", "-p", object.as_str()];
        let output = self
            .run(Some(path), &args, None)
            .map_err(|err| revision_read_error(revision, &self.describe(&args), err))?;
        if !output.success {
            return Err(UpdateError::RevisionRead {
                revision: revision.to_string(),
                message: format!(
                    "can't read {} ({})\n{}",
                    object,
                    output.status,
                    output.stderr.trim()
                ),
            });
        }
        Ok(Some(output.stdout))
    }
}

fn revision_read_error(revision: &str, command: &str, err: std::io::Error) -> UpdateError {
    UpdateError::RevisionRead {
        revision: revision.to_string(),
        message: format!("failed running '{}': {}", command, err),
    }
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> std::io::Result<GitOutput> {
    // Drain pipes on helper threads so a chatty child cannot block on a full pipe.
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let started = Instant::now();
    let (status, timed_out) = loop {
        if let Some(status) = child.try_wait()? {
            break (Some(status), false);
        }
        if started.elapsed() >= timeout {
            kill_process_group(&mut child);
            let status = child.wait().ok();
            break (status, true);
        }
        thread::sleep(Duration::from_millis(50));
    };

    // A helper that escaped the group may still hold the pipes open.
    let collect = |reader: Receiver<String>| {
        if timed_out {
            reader.recv_timeout(KILLED_OUTPUT_GRACE).unwrap_or_default()
        } else {
            reader.recv().unwrap_or_default()
        }
    };
    let stdout = collect(stdout_reader);
    let stderr = collect(stderr_reader);
    Ok(GitOutput {
        success: !timed_out && status.is_some_and(|value| value.success()),
        timed_out,
        status: status
            .map(|value| value.to_string())
            .unwrap_or_else(|| "unknown status".to_string()),
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal. The child was spawned as the
        // leader of its own group and has not been reaped yet, so the group
        // id cannot refer to an unrelated process group.
        #[allow(unsafe_code)]
        let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if result != 0 {
            warn!(
                pgid,
                error = %std::io::Error::last_os_error(),
                "failed killing git process group"
            );
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Receiver<String>
where
    R: Read + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            let _ = sender.send(String::new());
            return;
        };
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = sender.send(String::from_utf8_lossy(&buf).to_string());
    });
    receiver
}

/// Parent directory of the working copy, created on demand before the
/// repository is initialized.
pub fn ensure_parent_dir(path: &Path) -> Result<(), UpdateError> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|err| UpdateError::RepoInit {
        path: path.to_path_buf(),
        message: format!("failed creating parent dir {}: {}", parent.display(), err),
    })
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory [`RepositoryBackend`] used by unit tests.

    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::RepositoryBackend;
    use crate::error::UpdateError;

    #[derive(Debug, Clone, Default)]
    pub struct MemoryCommit {
        pub metadata: String,
        pub files: BTreeMap<String, String>,
        /// file -> revision that last modified it at or before this commit
        pub introduced_by: HashMap<String, String>,
    }

    #[derive(Debug, Default)]
    pub struct MemoryState {
        pub exists: bool,
        pub head: Option<String>,
        pub commits: HashMap<String, MemoryCommit>,
        pub fail_init: bool,
        pub fail_fetch: bool,
        pub fail_checkout: bool,
        pub calls: Vec<String>,
    }

    #[derive(Debug, Default)]
    pub struct MemoryRepository {
        pub state: Mutex<MemoryState>,
    }

    impl MemoryRepository {
        pub fn add_commit(&self, revision: &str, commit: MemoryCommit) {
            let mut state = self.state.lock().expect("lock memory repo");
            state.commits.insert(revision.to_string(), commit);
        }

        pub fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
            let mut state = self.state.lock().expect("lock memory repo");
            f(&mut state)
        }

        pub fn calls(&self) -> Vec<String> {
            self.with_state(|state| state.calls.clone())
        }

        pub fn head(&self) -> Option<String> {
            self.with_state(|state| state.head.clone())
        }

        fn lookup(&self, revision: &str) -> Result<MemoryCommit, UpdateError> {
            self.with_state(|state| state.commits.get(revision).cloned())
                .ok_or_else(|| UpdateError::RevisionRead {
                    revision: revision.to_string(),
                    message: "unknown revision".to_string(),
                })
        }
    }

    impl RepositoryBackend for MemoryRepository {
        fn ensure_repository(&self, path: &Path, _remote_url: &str) -> Result<(), UpdateError> {
            self.with_state(|state| {
                state.calls.push("ensure".to_string());
                if state.exists {
                    return Ok(());
                }
                if state.fail_init {
                    return Err(UpdateError::RepoInit {
                        path: PathBuf::from(path),
                        message: "init refused".to_string(),
                    });
                }
                state.exists = true;
                Ok(())
            })
        }

        fn fetch_updates(&self, _path: &Path) -> Result<(), UpdateError> {
            self.with_state(|state| {
                state.calls.push("fetch".to_string());
                if state.fail_fetch {
                    return Err(UpdateError::Fetch {
                        message: "network unreachable".to_string(),
                        output: String::new(),
                    });
                }
                Ok(())
            })
        }

        fn read_revision_metadata(
            &self,
            _path: &Path,
            revision: &str,
        ) -> Result<String, UpdateError> {
            self.with_state(|state| state.calls.push(format!("read:{}", revision)));
            Ok(self.lookup(revision)?.metadata)
        }

        fn checkout_revision(&self, _path: &Path, revision: &str) -> Result<(), UpdateError> {
            self.with_state(|state| {
                state.calls.push(format!("checkout:{}", revision));
                if state.fail_checkout {
                    return Err(UpdateError::Checkout {
                        revision: revision.to_string(),
                        message: "disk full".to_string(),
                        output: String::new(),
                    });
                }
                state.head = Some(revision.to_string());
                Ok(())
            })
        }

        fn resolve_introducing_revision(
            &self,
            _path: &Path,
            revision: &str,
            file: &str,
        ) -> Result<String, UpdateError> {
            self.lookup(revision)?
                .introduced_by
                .get(file)
                .cloned()
                .ok_or_else(|| UpdateError::RevisionRead {
                    revision: revision.to_string(),
                    message: format!("no revision modifies {}", file),
                })
        }

        fn force_reset(&self, _path: &Path) -> Result<(), UpdateError> {
            self.with_state(|state| state.calls.push("force_reset".to_string()));
            Ok(())
        }

        fn current_revision(&self, _path: &Path) -> Result<String, UpdateError> {
            self.head().ok_or_else(|| UpdateError::RevisionRead {
                revision: "HEAD".to_string(),
                message: "no commits yet".to_string(),
            })
        }

        fn read_file_at_revision(
            &self,
            _path: &Path,
            revision: &str,
            file: &str,
        ) -> Result<Option<String>, UpdateError> {
            Ok(self.lookup(revision)?.files.get(file).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::process::Command;
    use std::time::{Duration, Instant};

    use super::{GitRepository, RepositoryBackend};
    use crate::error::UpdateError;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "warden")
            .env("GIT_AUTHOR_EMAIL", "warden@example.com")
            .env("GIT_COMMITTER_NAME", "warden")
            .env("GIT_COMMITTER_EMAIL", "warden@example.com")
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn upstream_with_commit(root: &Path) -> std::path::PathBuf {
        let upstream = root.join("upstream");
        std::fs::create_dir_all(&upstream).expect("mkdir upstream");
        git(&upstream, &["init"]);
        git(&upstream, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        std::fs::write(upstream.join("keys.txt"), "# keys\n").expect("write keys");
        std::fs::write(upstream.join("check.sh"), "echo ok\n").expect("write plugin");
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "-m", "initial"]);
        upstream
    }

    #[test]
    fn ensure_fetch_and_checkout_against_local_remote() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = upstream_with_commit(temp.path());
        let head = git(&upstream, &["rev-parse", "HEAD"]);
        let checkout = temp.path().join("plugin");
        let repo = GitRepository::default();

        repo.ensure_repository(&checkout, &upstream.display().to_string())
            .expect("ensure");
        assert!(checkout.join(".git").exists());
        assert_eq!(
            git(&checkout, &["remote"]),
            "origin",
            "exactly one remote is registered"
        );

        repo.fetch_updates(&checkout).expect("fetch");
        assert!(
            !checkout.join("check.sh").exists(),
            "fetch must not touch the working tree"
        );

        let metadata = repo
            .read_revision_metadata(&checkout, "origin/master")
            .expect("metadata");
        assert!(metadata.starts_with("tree "));

        repo.checkout_revision(&checkout, "origin/master")
            .expect("checkout");
        assert!(checkout.join("check.sh").exists());
        assert_eq!(repo.current_revision(&checkout).expect("head"), head);

        let introducing = repo
            .resolve_introducing_revision(&checkout, "origin/master", "keys.txt")
            .expect("introducing");
        assert_eq!(introducing, head);
        assert_eq!(
            repo.read_file_at_revision(&checkout, "origin/master", "keys.txt")
                .expect("read file")
                .as_deref(),
            Some("# keys\n")
        );
        assert!(repo
            .read_file_at_revision(&checkout, "origin/master", "missing.txt")
            .expect("read missing")
            .is_none());
    }

    #[test]
    fn force_reset_discards_local_modifications() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = upstream_with_commit(temp.path());
        let repo = GitRepository::default();

        std::fs::write(upstream.join("check.sh"), "tampered\n").expect("tamper");
        repo.force_reset(&upstream).expect("force reset");
        assert_eq!(
            std::fs::read_to_string(upstream.join("check.sh")).expect("read"),
            "echo ok\n"
        );
    }

    #[test]
    fn unknown_revision_is_a_revision_read_error() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let upstream = upstream_with_commit(temp.path());
        let repo = GitRepository::default();

        let err = repo
            .read_revision_metadata(&upstream, "does-not-exist")
            .expect_err("missing revision");
        assert!(matches!(err, UpdateError::RevisionRead { .. }));
    }

    #[test]
    fn fetch_failure_reports_git_output() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let checkout = temp.path().join("plugin");
        let repo = GitRepository::default();
        repo.ensure_repository(&checkout, &temp.path().join("nowhere").display().to_string())
            .expect("ensure");

        let err = repo.fetch_updates(&checkout).expect_err("fetch must fail");
        match err {
            UpdateError::Fetch { output, .. } => assert!(!output.trim().is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    fn fake_git(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-git");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).expect("write fake git");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake git");
        script.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn failed_remote_add_removes_half_initialized_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git_bin = fake_git(
            temp.path(),
            r#"if [ "$1" = "init" ]; then mkdir -p "$2/.git"; exit 0; fi
echo "remote refused" >&2
exit 3"#,
        );
        let checkout = temp.path().join("plugin");
        let repo = GitRepository::new(git_bin);

        let err = repo
            .ensure_repository(&checkout, "https://example.invalid/plugins.git")
            .expect_err("remote add must fail");
        match err {
            UpdateError::RepoInit { message, .. } => {
                assert!(message.contains("can't set repo remote"), "{message}");
                assert!(message.contains("remote refused"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!checkout.exists());
    }

    #[cfg(unix)]
    #[test]
    fn fetch_timeout_kills_helpers_holding_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        // The backgrounded sleep inherits stdout and stderr like a remote helper.
        let git_bin = fake_git(temp.path(), "echo fetching\nsleep 15 &\nwait");
        let repo = GitRepository::new(git_bin).with_fetch_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let err = repo.fetch_updates(temp.path()).expect_err("fetch must time out");
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(5), "fetch took {elapsed:?}");
        match err {
            UpdateError::Fetch { message, .. } => {
                assert!(message.contains("timed out after 1 seconds"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_git_binary_fails_repo_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checkout = temp.path().join("plugin");
        let repo = GitRepository::new("/nonexistent/git-binary");

        let err = repo
            .ensure_repository(&checkout, "https://example.invalid/plugins.git")
            .expect_err("init must fail");
        assert!(matches!(err, UpdateError::RepoInit { .. }));
        assert!(!checkout.exists());
    }
}
