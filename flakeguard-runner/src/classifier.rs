// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Statistical classification of a test's recent history.
//!
//! The [`FlakinessClassifier`] looks at the most recent non-skipped records for a test, computes
//! the empirical failure rate, and labels the test:
//!
//! * a window with no failures is [`Stable`](VerdictLabel::Stable);
//! * a window where every execution failed is
//!   [`BrokenDeterministic`](VerdictLabel::BrokenDeterministic);
//! * a mixed window whose failures all happened under one run condition, which also never passed,
//!   is [`BrokenUnderCondition`](VerdictLabel::BrokenUnderCondition);
//! * any other mixed window whose 95% Wilson score interval excludes both 0 and 1 is
//!   [`Flaky`](VerdictLabel::Flaky).
//!
//! Windows shorter than the minimum evidence are [`Indeterminate`](VerdictLabel::Indeterminate),
//! which is a request for more samples rather than a verdict.

use crate::record::{EnvironmentCondition, ExecutionRecord, OutcomeKind};
use flakeguard_metadata::TestIdentifier;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The label assigned to a test by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VerdictLabel {
    /// The test passed every time.
    Stable,

    /// The test passes and fails under unchanged conditions.
    Flaky,

    /// The test failed every time.
    BrokenDeterministic,

    /// The test fails deterministically, but only under one run condition.
    BrokenUnderCondition {
        /// The condition the test fails under.
        condition: EnvironmentCondition,
    },

    /// There isn't enough evidence to classify the test.
    Indeterminate,
}

impl VerdictLabel {
    /// Returns true for labels that describe a deterministic failure.
    ///
    /// Broken tests always gate, whatever their quarantine state.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Self::BrokenDeterministic | Self::BrokenUnderCondition { .. }
        )
    }

    /// Returns the condition for [`Self::BrokenUnderCondition`].
    pub fn condition(self) -> Option<EnvironmentCondition> {
        match self {
            Self::BrokenUnderCondition { condition } => Some(condition),
            _ => None,
        }
    }

    /// Returns a short kebab-case name for this label, without the condition.
    pub fn name(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::BrokenDeterministic => "broken-deterministic",
            Self::BrokenUnderCondition { .. } => "broken-under-condition",
            Self::Indeterminate => "indeterminate",
        }
    }
}

impl fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenUnderCondition { condition } => {
                write!(f, "{} ({condition})", self.name())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// A 95% Wilson score interval for a failure rate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WilsonInterval {
    /// The lower bound, in `[0, 1]`.
    pub lower: f64,

    /// The upper bound, in `[0, 1]`.
    pub upper: f64,
}

impl WilsonInterval {
    /// The two-sided 95% quantile of the standard normal distribution.
    const Z_95: f64 = 1.959963984540054;

    /// Computes the interval for `failures` out of `trials`. Returns `None` if there were no
    /// trials.
    pub fn new(failures: usize, trials: usize) -> Option<Self> {
        if trials == 0 {
            return None;
        }
        let n = trials as f64;
        let p = failures.min(trials) as f64 / n;
        let z2 = Self::Z_95 * Self::Z_95;

        let denom = 1.0 + z2 / n;
        let center = (p + z2 / (2.0 * n)) / denom;
        let half = Self::Z_95 * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;

        Some(Self {
            lower: (center - half).clamp(0.0, 1.0),
            upper: (center + half).clamp(0.0, 1.0),
        })
    }

    /// Returns the width of the interval.
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Returns true if neither 0 nor 1 lies within the interval.
    pub fn excludes_bounds(&self) -> bool {
        self.lower > 0.0 && self.upper < 1.0
    }

    /// Returns the confidence of a verdict based on this interval: one minus its width.
    pub fn confidence(&self) -> f64 {
        (1.0 - self.width()).clamp(0.0, 1.0)
    }
}

/// The result of classifying a test.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationVerdict {
    /// The test that was classified.
    pub test_id: TestIdentifier,

    /// The label.
    pub label: VerdictLabel,

    /// How confident the classifier is in the label, in `[0, 1]`. Zero for indeterminate
    /// verdicts.
    pub confidence: f64,

    /// The records the verdict was computed from, oldest first. Never includes skipped
    /// executions.
    pub evidence: Vec<ExecutionRecord>,

    /// The number of failed executions in the evidence.
    pub failures: usize,

    /// The number of errored executions in the evidence. Errors count as failures for the
    /// failure rate, but are reported separately.
    pub errors: usize,

    /// The Wilson score interval for the failure rate, if there was any evidence.
    pub interval: Option<WilsonInterval>,
}

impl ClassificationVerdict {
    /// Returns an indeterminate verdict with no evidence.
    pub fn indeterminate(test_id: TestIdentifier) -> Self {
        Self {
            test_id,
            label: VerdictLabel::Indeterminate,
            confidence: 0.0,
            evidence: Vec::new(),
            failures: 0,
            errors: 0,
            interval: None,
        }
    }

    /// Returns the number of executions in the evidence window.
    pub fn evidence_len(&self) -> usize {
        self.evidence.len()
    }

    /// Returns the fraction of the evidence that failed or errored, if there was any evidence.
    pub fn fail_rate(&self) -> Option<f64> {
        (!self.evidence.is_empty())
            .then(|| (self.failures + self.errors) as f64 / self.evidence.len() as f64)
    }
}

/// Classifies tests from their recent history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlakinessClassifier {
    min_evidence: usize,
    evidence_window: usize,
}

impl Default for FlakinessClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_EVIDENCE, Self::DEFAULT_EVIDENCE_WINDOW)
    }
}

impl FlakinessClassifier {
    /// The default minimum number of executions needed for a verdict.
    pub const DEFAULT_MIN_EVIDENCE: usize = 8;

    /// The default maximum number of executions considered.
    pub const DEFAULT_EVIDENCE_WINDOW: usize = 50;

    /// Creates a new classifier.
    ///
    /// `evidence_window` is raised to `min_evidence` if it is smaller, and `min_evidence` is at
    /// least 1.
    pub fn new(min_evidence: usize, evidence_window: usize) -> Self {
        let min_evidence = min_evidence.max(1);
        Self {
            min_evidence,
            evidence_window: evidence_window.max(min_evidence),
        }
    }

    /// Returns the minimum number of executions needed for a verdict.
    pub fn min_evidence(&self) -> usize {
        self.min_evidence
    }

    /// Returns the maximum number of executions considered.
    pub fn evidence_window(&self) -> usize {
        self.evidence_window
    }

    /// Classifies `test_id` from `records`, which must be ordered oldest first.
    pub fn classify<'a>(
        &self,
        test_id: &TestIdentifier,
        records: impl IntoIterator<Item = &'a ExecutionRecord>,
    ) -> ClassificationVerdict {
        let mut evidence: Vec<_> = records
            .into_iter()
            .filter(|record| record.kind() != OutcomeKind::Skipped)
            .cloned()
            .collect();
        if evidence.len() > self.evidence_window {
            evidence.drain(..evidence.len() - self.evidence_window);
        }

        let failures = evidence
            .iter()
            .filter(|r| r.kind() == OutcomeKind::Fail)
            .count();
        let errors = evidence
            .iter()
            .filter(|r| r.kind() == OutcomeKind::Error)
            .count();
        let interval = WilsonInterval::new(failures + errors, evidence.len());

        let (label, confidence) = match interval {
            Some(interval) if evidence.len() >= self.min_evidence => {
                let label = label_for(&evidence, failures + errors, &interval);
                let confidence = match label {
                    VerdictLabel::Indeterminate => 0.0,
                    _ => interval.confidence(),
                };
                (label, confidence)
            }
            _ => (VerdictLabel::Indeterminate, 0.0),
        };

        ClassificationVerdict {
            test_id: test_id.clone(),
            label,
            confidence,
            evidence,
            failures,
            errors,
            interval,
        }
    }
}

fn label_for(
    evidence: &[ExecutionRecord],
    failed: usize,
    interval: &WilsonInterval,
) -> VerdictLabel {
    if failed == 0 {
        VerdictLabel::Stable
    } else if failed == evidence.len() {
        VerdictLabel::BrokenDeterministic
    } else if let Some(condition) = correlated_condition(evidence) {
        VerdictLabel::BrokenUnderCondition { condition }
    } else if interval.excludes_bounds() {
        VerdictLabel::Flaky
    } else {
        VerdictLabel::Indeterminate
    }
}

/// Returns the condition that explains every failure in `evidence`, if there is one.
///
/// A condition explains the failures if every failure happened under it, every execution under
/// it failed, and at least one execution under some other condition passed.
fn correlated_condition(evidence: &[ExecutionRecord]) -> Option<EnvironmentCondition> {
    #[derive(Default)]
    struct Tally {
        failed: usize,
        total: usize,
    }

    let mut by_condition: BTreeMap<EnvironmentCondition, Tally> = BTreeMap::new();
    for record in evidence {
        let tally = by_condition.entry(record.fingerprint.condition).or_default();
        tally.total += 1;
        if record.kind().is_failure() {
            tally.failed += 1;
        }
    }

    let mut failing = by_condition.iter().filter(|(_, tally)| tally.failed > 0);
    let (condition, tally) = failing.next()?;
    if failing.next().is_some() || tally.failed != tally.total {
        return None;
    }
    let passed_elsewhere = by_condition
        .iter()
        .any(|(other, tally)| other != condition && tally.failed < tally.total);
    passed_elsewhere.then_some(*condition)
}
