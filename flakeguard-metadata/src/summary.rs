// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{BatchId, TestIdentifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a test's result should block the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatingVerdict {
    /// The test does not block the pipeline.
    Pass,

    /// The test blocks the pipeline.
    Gate,

    /// The test is quarantined as flaky: its failures do not block the pipeline.
    Quarantined,
}

impl GatingVerdict {
    /// Returns true if this verdict blocks the pipeline.
    pub fn is_gate(self) -> bool {
        matches!(self, Self::Gate)
    }
}

impl fmt::Display for GatingVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Gate => f.write_str("gate"),
            Self::Quarantined => f.write_str("quarantined"),
        }
    }
}

/// The quarantine lifecycle state of a test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuarantineState {
    /// The test is treated normally: any failure gates.
    #[default]
    Active,

    /// The test has been classified as flaky once and is being watched.
    UnderObservation,

    /// The test is confirmed flaky. Its flaky failures don't gate.
    Quarantined,

    /// The test has recovered from quarantine. This collapses to `Active` on the next cycle.
    Resolved,
}

impl QuarantineState {
    /// Returns all known states.
    pub fn variants() -> &'static [&'static str] {
        &["active", "under-observation", "quarantined", "resolved"]
    }
}

impl fmt::Display for QuarantineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::UnderObservation => f.write_str("under-observation"),
            Self::Quarantined => f.write_str("quarantined"),
            Self::Resolved => f.write_str("resolved"),
        }
    }
}

/// A summary of a single `flakeguard evaluate` invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EvaluationSummary {
    /// The batches that were evaluated, in order of first appearance.
    pub batches: Vec<BatchId>,

    /// The number of tests that gated the pipeline.
    pub gated: usize,

    /// One decision per test, in batch-arrival order.
    pub decisions: Vec<TestDecisionSummary>,
}

/// The decision made for one test in one evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestDecisionSummary {
    /// The test.
    pub test_id: TestIdentifier,

    /// The gating verdict.
    pub verdict: GatingVerdict,

    /// The classification label, e.g. `flaky` or `broken-under-condition`.
    pub label: String,

    /// The environment condition, for `broken-under-condition` labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// The classifier's confidence, in `[0, 1]`.
    pub confidence: f64,

    /// The number of outcomes the classification was based on.
    pub evidence: usize,

    /// The quarantine state after this evaluation.
    pub state: QuarantineState,

    /// The quarantine transition applied in this evaluation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<TransitionSummary>,
}

/// A quarantine state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransitionSummary {
    /// The state before the transition.
    pub from: QuarantineState,

    /// The state after the transition.
    pub to: QuarantineState,
}
