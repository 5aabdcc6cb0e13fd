// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use flakeguard_metadata::FlakeguardExitCode;
use flakeguard_runner::errors::*;
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An expected error that flakeguard reports and exits with.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine current directory")]
    CurrentDirFailed {
        #[source]
        error: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 {
        #[source]
        error: camino::FromPathBufError,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("runner command error")]
    RunnerCommandError {
        #[source]
        err: CommandParseError,
    },
    #[error("failed to read batch")]
    BatchReadError {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse batch")]
    BatchParseError {
        path: String,
        #[source]
        err: serde_json::Error,
    },
    #[error("result store error")]
    StoreError {
        store_dir: Utf8PathBuf,
        #[source]
        err: StorageError,
    },
    #[error("quarantine state error")]
    StateFileError {
        #[from]
        err: StateFileError,
    },
    #[error("audit write error")]
    AuditWriteError {
        #[from]
        err: AuditWriteError,
    },
    #[error("engine build error")]
    EngineBuildError {
        #[from]
        err: EngineBuildError,
    },
    #[error("evaluation failed")]
    EvaluateFailed {
        #[from]
        err: EvaluateError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
    #[error("error serializing output")]
    SerializeError {
        #[source]
        err: serde_json::Error,
    },
}

impl ExpectedError {
    pub(crate) fn store_error(store_dir: impl Into<Utf8PathBuf>, err: StorageError) -> Self {
        Self::StoreError {
            store_dir: store_dir.into(),
            err,
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::RunnerCommandError { .. }
            | Self::EngineBuildError { .. } => FlakeguardExitCode::SETUP_ERROR,
            Self::BatchReadError { .. } | Self::BatchParseError { .. } => {
                FlakeguardExitCode::INVALID_BATCH
            }
            Self::StoreError { .. } | Self::StateFileError { .. } | Self::AuditWriteError { .. } => {
                FlakeguardExitCode::STORE_ERROR
            }
            Self::EvaluateFailed { err } => match err {
                EvaluateError::StateConflict(_) => FlakeguardExitCode::STATE_CONFLICT,
                _ => FlakeguardExitCode::EVALUATION_CANCELLED,
            },
            Self::WriteOutputError { .. } | Self::SerializeError { .. } => {
                FlakeguardExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDirFailed { error } => {
                error!("could not determine current directory");
                Some(error as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { error } => {
                error!("current directory is not valid UTF-8");
                Some(error as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse flakeguard config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                err.source()
            }
            Self::RunnerCommandError { err } => {
                error!("invalid runner command");
                Some(err as &dyn Error)
            }
            Self::BatchReadError { path, err } => {
                error!("failed to read batch from `{}`", path.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::BatchParseError { path, err } => {
                error!(
                    "batch at `{}` is not a valid list of execution records",
                    path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::StoreError { store_dir, err } => {
                error!(
                    "error accessing result store at `{}`",
                    store_dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::StateFileError { err } => {
                error!("{err}");
                err.source()
            }
            Self::AuditWriteError { err } => {
                error!("{err}");
                err.source()
            }
            Self::EngineBuildError { err } => {
                error!("failed to build decision engine");
                Some(err as &dyn Error)
            }
            Self::EvaluateFailed { err } => match err {
                EvaluateError::Cancelled { reason } => {
                    error!(
                        "evaluation cancelled ({}), no quarantine state was changed",
                        reason.style(styles.warning_text)
                    );
                    None
                }
                EvaluateError::StateConflict(conflict) => {
                    error!(
                        "test `{}` was transitioned twice for batch `{}`",
                        conflict.test_id().style(styles.bold),
                        conflict.batch_id().style(styles.bold),
                    );
                    None
                }
                other => {
                    error!("evaluation failed");
                    Some(other as &dyn Error)
                }
            },
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
            Self::SerializeError { err } => {
                error!("error serializing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flakeguard_runner::signal::CancelReason;

    #[test]
    fn exit_codes_by_category() {
        let cancelled = ExpectedError::from(EvaluateError::Cancelled {
            reason: CancelReason::Interrupt,
        });
        assert_eq!(
            cancelled.process_exit_code(),
            FlakeguardExitCode::EVALUATION_CANCELLED
        );

        let parse = ExpectedError::BatchParseError {
            path: "-".to_owned(),
            err: serde_json::from_str::<Vec<u8>>("{").unwrap_err(),
        };
        assert_eq!(parse.process_exit_code(), FlakeguardExitCode::INVALID_BATCH);

        let store = ExpectedError::store_error(
            "target/flakeguard",
            StorageError::Locked {
                path: "target/flakeguard/lock".into(),
            },
        );
        assert_eq!(store.process_exit_code(), FlakeguardExitCode::STORE_ERROR);
    }
}
