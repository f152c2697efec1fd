//! Subprocess execution with bounded timeouts.
//!
//! Every git invocation goes through [`CommandRunner::run`]. The runner owns
//! the program name and a fixed argument prefix (e.g. `git -C <clone>`), so
//! callers only pass the subcommand.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::GitError;
use crate::Result;

/// Timeout for ordinary git operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the initial clone.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs one external program with a preset argument prefix.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    default_args: Vec<String>,
    envs: Vec<(String, String)>,
    secrets: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    /// Create a runner for `program`, prepending `default_args` to every call.
    pub fn new<I, S>(program: impl Into<String>, default_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandRunner {
            program: program.into(),
            default_args: default_args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
            secrets: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set an environment variable for every spawned process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Mask `secret` wherever it would appear in logs or error messages.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run with the default timeout and return trimmed stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run_with_timeout(args, self.timeout).await
    }

    /// Run with an explicit timeout and return trimmed stdout.
    ///
    /// A timed-out process is killed and reported as [`GitError::TimedOut`];
    /// partial output is discarded.
    pub async fn run_with_timeout<I, S>(&self, args: I, timeout: Duration) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = self
            .default_args
            .iter()
            .cloned()
            .chain(args.into_iter().map(|a| a.as_ref().to_string()))
            .collect();
        let command_line = self.redact(&format!("{} {}", self.program, args.join(" ")));
        debug!(command = %command_line, "running command");

        let start = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => GitError::NotInstalled(self.program.clone()),
                _ => GitError::Io(e),
            })?;

        // Dropping the wait future drops the child, which kill_on_drop turns into SIGKILL.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                let elapsed = start.elapsed();
                warn!(command = %command_line, ?elapsed, "command timed out, killed");
                return Err(GitError::TimedOut {
                    command: command_line,
                    elapsed,
                });
            }
        };

        let stderr = self.redact(String::from_utf8_lossy(&output.stderr).trim());
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: command_line,
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(command = %command_line, output = %stderr, "command finished");
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check that the program exists and answers `arg` with output
    /// starting with `expected` (e.g. `version` / `git version`).
    pub async fn verify(&self, arg: &str, expected: &str) -> Result<()> {
        match self.run([arg]).await {
            Ok(out) if out.starts_with(expected) => Ok(()),
            Ok(out) => {
                debug!(program = %self.program, output = %out, "unexpected version output");
                Err(GitError::NotInstalled(self.program.clone()))
            }
            Err(GitError::CommandFailed { stderr, .. }) => {
                debug!(program = %self.program, %stderr, "version check failed");
                Err(GitError::NotInstalled(self.program.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> CommandRunner {
        CommandRunner::new("sh", ["-c"])
    }

    #[tokio::test]
    async fn run_returns_trimmed_stdout() {
        let out = shell().run(["echo '  hello  '"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr_and_code() {
        let err = shell().run(["echo oops >&2; exit 3"]).await.unwrap_err();
        match err {
            GitError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = shell().with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = runner.run(["sleep 5; echo late"]).await.unwrap_err();
        assert!(matches!(err, GitError::TimedOut { .. }), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_binary_is_not_installed() {
        let runner = CommandRunner::new("cert-shim-definitely-missing-binary", Vec::<String>::new());
        let err = runner.verify("version", "git version").await.unwrap_err();
        assert!(matches!(err, GitError::NotInstalled(_)));
        assert!(err.is_fatal_setup());
    }

    #[tokio::test]
    async fn failing_version_command_is_not_installed() {
        let runner = CommandRunner::new("sh", ["-c", "exit 127"]);
        let err = runner.verify("version", "git version").await.unwrap_err();
        assert!(matches!(err, GitError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn verify_checks_version_prefix() {
        let impostor = CommandRunner::new("sh", ["-c", "echo 'sh: version: command available'"]);
        let err = impostor.verify("version", "git version").await.unwrap_err();
        assert!(matches!(err, GitError::NotInstalled(_)));

        let git_like = CommandRunner::new("sh", ["-c", "echo 'git version 2.43.0'"]);
        git_like.verify("version", "git version").await.unwrap();
    }

    #[tokio::test]
    async fn failure_messages_name_the_command() {
        let err = shell().run(["exit 2"]).await.unwrap_err();
        assert!(err.to_string().contains("sh -c exit 2"), "got {err}");
    }

    #[tokio::test]
    async fn env_is_passed_and_secrets_are_masked() {
        let runner = shell()
            .with_env("CERT_SHIM_TEST_VALUE", "s3cret")
            .with_secret("s3cret");
        let err = runner
            .run(["echo \"token=$CERT_SHIM_TEST_VALUE\" >&2; exit 1"])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("token=***"), "got {msg}");
        assert!(!msg.contains("s3cret"));
    }
}
