// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by flakeguard.

use crate::signal::CancelReason;
use camino::Utf8PathBuf;
use config::ConfigError;
use flakeguard_metadata::{BatchId, TestIdentifier};
use std::io;
use thiserror::Error;

/// An error that occurred while appending to or reading from a
/// [`ResultStore`](crate::store::ResultStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The batch was already recorded for this test. Nothing was written.
    #[error("batch `{batch_id}` is already recorded for test `{test_id}`")]
    DuplicateBatch {
        /// The test.
        test_id: TestIdentifier,

        /// The batch that was already recorded.
        batch_id: BatchId,
    },

    /// Another process holds the store lock.
    #[error("result store at `{path}` is locked by another process")]
    Locked {
        /// The lock file.
        path: Utf8PathBuf,
    },

    /// An I/O error occurred while accessing the store.
    #[error("error accessing result store at `{path}`")]
    Io {
        /// The path that was being accessed.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A stored record could not be parsed.
    #[error("record on line {line} of `{path}` is malformed")]
    Corrupt {
        /// The path of the record file.
        path: Utf8PathBuf,

        /// The 1-indexed line number.
        line: usize,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A record could not be serialized.
    #[error("error serializing record for test `{test_id}`")]
    Serialize {
        /// The test.
        test_id: TestIdentifier,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

impl StorageError {
    /// Returns true if this error is a rejected duplicate append.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateBatch { .. })
    }
}

/// The external runner failed to execute a test. This is an infrastructure fault, not a test
/// fault.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerInfraError {
    /// The runner process could not be spawned.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The program that was being spawned.
        program: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The runner reported that it could not execute the test.
    #[error("runner unavailable: {message}")]
    Unavailable {
        /// A description of the problem.
        message: String,
    },
}

impl RunnerInfraError {
    /// Creates a new [`Self::Unavailable`] error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// An error that occurred while parsing a runner command.
#[derive(Debug, Error)]
pub enum CommandParseError {
    /// The command was empty.
    #[error("runner command is empty")]
    Empty,

    /// The command could not be split into words.
    #[error("runner command `{command}` could not be parsed")]
    Split {
        /// The command.
        command: String,

        /// The underlying error.
        #[source]
        error: shell_words::ParseError,
    },
}

/// An error that occurred while collecting samples for a test.
#[derive(Debug, Error)]
pub enum SampleError {
    /// Every attempt to execute a sample hit a runner infrastructure failure.
    #[error("runner failed {attempts} consecutive times while sampling `{test_id}`")]
    InfraExhausted {
        /// The test being sampled.
        test_id: TestIdentifier,

        /// The number of attempts made for the sample.
        attempts: u32,

        /// The last error.
        #[source]
        error: RunnerInfraError,
    },
}

/// Two quarantine transitions were attempted for the same test in the same batch.
///
/// Transitions for a test are serialized, so this should never happen. If it does, it is surfaced
/// rather than silently resolved.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("test `{test_id}` was already transitioned for batch `{batch_id}`")]
pub struct StateConflict {
    test_id: TestIdentifier,
    batch_id: BatchId,
}

impl StateConflict {
    pub(crate) fn new(test_id: TestIdentifier, batch_id: BatchId) -> Self {
        Self { test_id, batch_id }
    }

    /// Returns the test that conflicted.
    pub fn test_id(&self) -> &TestIdentifier {
        &self.test_id
    }

    /// Returns the batch for which the conflict occurred.
    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }
}

/// An error returned by [`DecisionEngine::evaluate`](crate::engine::DecisionEngine::evaluate).
///
/// Per-test problems never surface here: they are reported as indeterminate decisions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvaluateError {
    /// The evaluation was cancelled. No quarantine transitions were applied.
    #[error("evaluation cancelled: {reason}")]
    Cancelled {
        /// Why the evaluation was cancelled.
        reason: CancelReason,
    },

    /// A quarantine state conflict occurred.
    #[error(transparent)]
    StateConflict(#[from] StateConflict),
}

/// An error that occurred while building a
/// [`DecisionEngine`](crate::engine::DecisionEngine).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineBuildError {
    /// The async runtime could not be created.
    #[error("error creating tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// Signal handlers could not be installed.
    #[error(transparent)]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse flakeguard config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &camino::Utf8Path {
        &self.config_file
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A profile contains an invalid combination of settings.
    #[error("invalid settings in profile `{profile}`: {message}")]
    InvalidProfile {
        /// The profile.
        profile: String,

        /// What was wrong.
        message: String,
    },
}

/// An error which indicates that a profile was requested but not known to flakeguard.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurred while reading or writing the quarantine state file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateFileError {
    /// The state file could not be read.
    #[error("error reading quarantine state from `{path}`")]
    Read {
        /// The state file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The state file could not be parsed.
    #[error("error parsing quarantine state from `{path}`")]
    Deserialize {
        /// The state file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The state file was written by an incompatible version of flakeguard.
    #[error(
        "quarantine state at `{path}` has format version {found}, \
         but only version {supported} is supported"
    )]
    UnsupportedVersion {
        /// The state file.
        path: Utf8PathBuf,

        /// The version found in the file.
        found: u32,

        /// The version this build understands.
        supported: u32,
    },

    /// The state file could not be written.
    #[error("error writing quarantine state to `{path}`")]
    Write {
        /// The state file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: atomicwrites::Error<io::Error>,
    },
}

/// An error that occurred while writing audit events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditWriteError {
    /// An I/O error occurred.
    #[error("error writing audit events to `{path}`")]
    Io {
        /// The audit log file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// An event could not be serialized.
    #[error("error serializing audit event")]
    Serialize(#[source] serde_json::Error),
}
