// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executing a single test under a given environment.
//!
//! flakeguard doesn't know how to run tests itself. It delegates to a [`TestExecutor`], usually a
//! [`CommandExecutor`] that shells out to the project's own runner.

use crate::{
    errors::{CommandParseError, RunnerInfraError},
    record::{EnvironmentFingerprint, FailureKind, FailureReason, Outcome},
};
use flakeguard_metadata::TestIdentifier;
use std::{future::Future, process::Stdio, sync::Arc, time::Instant};
use tokio::process::Command;
use tracing::trace;

/// Runs one test once.
///
/// An `Ok` outcome is evidence about the test. An `Err` means the runner itself misbehaved and
/// the attempt says nothing about the test.
pub trait TestExecutor: Send + Sync {
    /// Executes `test_id` under `fingerprint`.
    fn execute(
        &self,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> impl Future<Output = Result<Outcome, RunnerInfraError>> + Send;
}

impl<E: TestExecutor> TestExecutor for &E {
    fn execute(
        &self,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> impl Future<Output = Result<Outcome, RunnerInfraError>> + Send {
        (**self).execute(test_id, fingerprint)
    }
}

impl<E: TestExecutor> TestExecutor for Arc<E> {
    fn execute(
        &self,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> impl Future<Output = Result<Outcome, RunnerInfraError>> + Send {
        (**self).execute(test_id, fingerprint)
    }
}

/// The exit code a runner command uses to report a skipped test, by default.
///
/// This matches the convention used by automake and many other test harnesses.
pub const DEFAULT_SKIP_EXIT_CODE: i32 = 77;

/// A [`TestExecutor`] that runs an external command once per execution.
///
/// The command receives the test and environment through environment variables:
///
/// - `FLAKEGUARD_TEST_ID`: the test identifier.
/// - `FLAKEGUARD_CONDITION`: the run condition, e.g. `order-shuffle`.
/// - `FLAKEGUARD_PARALLELISM`, `FLAKEGUARD_SHUFFLE_SEED`, `FLAKEGUARD_THROTTLE_PERCENT`: set only
///   if the fingerprint controls them.
///
/// Exit code 0 is a pass and the skip exit code is a skip. Any other exit, including death by
/// signal, is a failure. Failing to spawn the command at all is an infrastructure error.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    skip_exit_code: i32,
}

impl CommandExecutor {
    /// Parses `command` as a shell-quoted command line.
    pub fn new(command: &str, skip_exit_code: i32) -> Result<Self, CommandParseError> {
        let mut words = shell_words::split(command)
            .map_err(|error| CommandParseError::Split {
                command: command.to_owned(),
                error,
            })?
            .into_iter();
        let program = words.next().ok_or(CommandParseError::Empty)?;
        Ok(Self {
            program,
            args: words.collect(),
            skip_exit_code,
        })
    }

    /// Returns the program that will be run.
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, test_id: &TestIdentifier, fingerprint: &EnvironmentFingerprint) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FLAKEGUARD_TEST_ID", test_id.as_str())
            .env("FLAKEGUARD_CONDITION", fingerprint.condition.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parallelism) = fingerprint.parallelism {
            cmd.env("FLAKEGUARD_PARALLELISM", parallelism.to_string());
        }
        if let Some(seed) = fingerprint.shuffle_seed {
            cmd.env("FLAKEGUARD_SHUFFLE_SEED", seed.to_string());
        }
        if let Some(percent) = fingerprint.throttle_percent {
            cmd.env("FLAKEGUARD_THROTTLE_PERCENT", percent.to_string());
        }
        cmd
    }
}

impl TestExecutor for CommandExecutor {
    async fn execute(
        &self,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> Result<Outcome, RunnerInfraError> {
        let start = Instant::now();
        let output = self
            .command(test_id, fingerprint)
            .output()
            .await
            .map_err(|error| RunnerInfraError::Spawn {
                program: self.program.clone(),
                error,
            })?;
        let duration = start.elapsed();
        trace!(%test_id, %fingerprint, status = %output.status, "runner exited");

        match output.status.code() {
            Some(0) => Ok(Outcome::pass(duration)),
            Some(code) if code == self.skip_exit_code => Ok(Outcome::skipped()),
            Some(code) => {
                let message = last_line(&output.stderr)
                    .unwrap_or_else(|| format!("runner exited with code {code}"));
                Ok(Outcome::fail(
                    duration,
                    Some(FailureReason::new(FailureKind::Assertion, message)),
                ))
            }
            None => Ok(Outcome::fail(
                duration,
                Some(FailureReason::new(
                    FailureKind::Panic,
                    termination_message(&output.status),
                )),
            )),
        }
    }
}

fn last_line(stderr: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

#[cfg(unix)]
fn termination_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => "terminated abnormally".to_owned(),
    }
}

#[cfg(not(unix))]
fn termination_message(_status: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EnvironmentCondition, OutcomeKind};
    use std::num::NonZeroU32;
    use test_case::test_case;

    #[test_case("" ; "empty")]
    #[test_case("   " ; "whitespace")]
    fn empty_command_is_rejected(command: &str) {
        assert!(matches!(
            CommandExecutor::new(command, DEFAULT_SKIP_EXIT_CODE),
            Err(CommandParseError::Empty)
        ));
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        let err = CommandExecutor::new("run 'oops", DEFAULT_SKIP_EXIT_CODE).unwrap_err();
        assert!(matches!(err, CommandParseError::Split { .. }), "{err}");
    }

    #[test]
    fn command_is_split() {
        let executor =
            CommandExecutor::new("cargo nextest run --exact 'a b'", DEFAULT_SKIP_EXIT_CODE)
                .unwrap();
        assert_eq!(executor.program(), "cargo");
        assert_eq!(executor.args, ["nextest", "run", "--exact", "a b"]);
    }

    #[test]
    fn last_line_skips_trailing_blank_lines() {
        assert_eq!(
            last_line(b"compiling\nassertion failed: left == right\n\n  \n").as_deref(),
            Some("assertion failed: left == right"),
        );
        assert_eq!(last_line(b""), None);
    }

    #[cfg(unix)]
    #[test_case("exit 0", OutcomeKind::Pass ; "pass")]
    #[test_case("echo boom >&2; exit 3", OutcomeKind::Fail ; "fail")]
    #[test_case("exit 77", OutcomeKind::Skipped ; "skip")]
    #[test_case("kill -9 $$", OutcomeKind::Fail ; "signal")]
    #[tokio::test]
    async fn shell_exit_status(script: &str, expected: OutcomeKind) {
        let executor = CommandExecutor {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            skip_exit_code: DEFAULT_SKIP_EXIT_CODE,
        };
        let outcome = executor
            .execute(
                &"a::b".parse().unwrap(),
                &EnvironmentFingerprint::baseline(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.kind, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn environment_is_passed_through() {
        let executor = CommandExecutor::new(
            r#"sh -c 'echo "$FLAKEGUARD_TEST_ID $FLAKEGUARD_CONDITION $FLAKEGUARD_PARALLELISM" >&2; exit 1'"#,
            DEFAULT_SKIP_EXIT_CODE,
        )
        .unwrap();
        let fingerprint = EnvironmentFingerprint {
            condition: EnvironmentCondition::ParallelismJitter,
            parallelism: NonZeroU32::new(6),
            shuffle_seed: None,
            throttle_percent: None,
        };
        let outcome = executor
            .execute(&"net::retry".parse().unwrap(), &fingerprint)
            .await
            .unwrap();
        let reason = outcome.reason.expect("failure has a reason");
        assert_eq!(reason.message, "net::retry parallelism-jitter 6");
    }

    #[tokio::test]
    async fn missing_program_is_infra_error() {
        let executor =
            CommandExecutor::new("flakeguard-no-such-program-exists", DEFAULT_SKIP_EXIT_CODE)
                .unwrap();
        let err = executor
            .execute(
                &"a::b".parse().unwrap(),
                &EnvironmentFingerprint::baseline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerInfraError::Spawn { .. }), "{err}");
    }
}
