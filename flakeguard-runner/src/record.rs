// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution records: what happened when a test ran, and under which conditions.

use chrono::{DateTime, FixedOffset, Local};
use flakeguard_metadata::{BatchId, TestIdentifier};
use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU32, time::Duration};

/// The kind of outcome produced by a single execution of a test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    /// The test passed.
    Pass,

    /// The test failed.
    Fail,

    /// The test could not complete, for example because it timed out.
    Error,

    /// The test was skipped. Skipped executions never count as evidence.
    Skipped,
}

impl OutcomeKind {
    /// Returns true if this outcome counts as a failure when computing fail rates.
    ///
    /// Errors count as failures.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Fail => f.write_str("fail"),
            Self::Error => f.write_str("error"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// The result of a single execution of a test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Outcome {
    /// What happened.
    pub kind: OutcomeKind,

    /// How long the execution took.
    #[serde(default, with = "humantime_serde")]
    pub duration: Duration,

    /// Why the execution failed, if it did and the runner said why.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl Outcome {
    /// Creates a passing outcome.
    pub fn pass(duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::Pass,
            duration,
            reason: None,
        }
    }

    /// Creates a failing outcome.
    pub fn fail(duration: Duration, reason: Option<FailureReason>) -> Self {
        Self {
            kind: OutcomeKind::Fail,
            duration,
            reason,
        }
    }

    /// Creates an error outcome.
    pub fn error(duration: Duration, reason: FailureReason) -> Self {
        Self {
            kind: OutcomeKind::Error,
            duration,
            reason: Some(reason),
        }
    }

    /// Creates a skipped outcome.
    pub fn skipped() -> Self {
        Self {
            kind: OutcomeKind::Skipped,
            duration: Duration::ZERO,
            reason: None,
        }
    }
}

/// A structured reason for a failed or errored execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureReason {
    /// The broad category of the failure.
    pub kind: FailureKind,

    /// A human-readable message.
    pub message: String,
}

impl FailureReason {
    /// Creates a new failure reason.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("timed out after {}", humantime::format_duration(after)),
        )
    }
}

/// The category of a [`FailureReason`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// An assertion in the test failed.
    Assertion,

    /// The test panicked or crashed.
    Panic,

    /// The test exceeded its time budget.
    Timeout,

    /// The execution infrastructure misbehaved.
    Infrastructure,

    /// Any other failure.
    Other,
}

/// The run condition a test was executed under.
///
/// Correlation between failures and environments is computed over conditions, not over the exact
/// knobs in an [`EnvironmentFingerprint`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentCondition {
    /// The normal CI environment.
    #[default]
    Baseline,

    /// The test ran with a varied degree of parallelism.
    ParallelismJitter,

    /// The test ran with a shuffled test order.
    OrderShuffle,

    /// The test ran with throttled CPU or memory.
    ResourceThrottle,
}

impl fmt::Display for EnvironmentCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => f.write_str("baseline"),
            Self::ParallelismJitter => f.write_str("parallelism-jitter"),
            Self::OrderShuffle => f.write_str("order-shuffle"),
            Self::ResourceThrottle => f.write_str("resource-throttle"),
        }
    }
}

/// A description of the conditions under which a test executed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvironmentFingerprint {
    /// The run condition.
    pub condition: EnvironmentCondition,

    /// The number of tests run simultaneously, if it was controlled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<NonZeroU32>,

    /// The seed used to shuffle test order, if the order was shuffled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,

    /// The percentage of resources available to the test, if throttled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_percent: Option<u8>,
}

impl EnvironmentFingerprint {
    /// Returns the fingerprint of the normal CI environment.
    pub fn baseline() -> Self {
        Self::default()
    }
}

impl fmt::Display for EnvironmentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition)?;
        if let Some(parallelism) = self.parallelism {
            write!(f, " parallelism={parallelism}")?;
        }
        if let Some(seed) = self.shuffle_seed {
            write!(f, " seed={seed:016x}")?;
        }
        if let Some(percent) = self.throttle_percent {
            write!(f, " throttle={percent}%")?;
        }
        Ok(())
    }
}

/// One execution of one test. Records are immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionRecord {
    /// The test that ran.
    pub test_id: TestIdentifier,

    /// The batch the execution belongs to.
    pub batch_id: BatchId,

    /// What happened.
    pub outcome: Outcome,

    /// When the execution completed.
    pub timestamp: DateTime<FixedOffset>,

    /// The conditions the test ran under.
    #[serde(default)]
    pub fingerprint: EnvironmentFingerprint,
}

impl ExecutionRecord {
    /// Creates a record for an execution that completed now.
    pub fn new(
        test_id: TestIdentifier,
        batch_id: BatchId,
        outcome: Outcome,
        fingerprint: EnvironmentFingerprint,
    ) -> Self {
        Self {
            test_id,
            batch_id,
            outcome,
            timestamp: Local::now().fixed_offset(),
            fingerprint,
        }
    }

    /// Returns the kind of outcome.
    pub fn kind(&self) -> OutcomeKind {
        self.outcome.kind
    }
}
