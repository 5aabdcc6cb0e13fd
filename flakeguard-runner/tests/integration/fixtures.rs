// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use flakeguard_metadata::TestIdentifier;
use flakeguard_runner::{
    config::RetryPolicy,
    engine::EngineSettings,
    errors::RunnerInfraError,
    executor::TestExecutor,
    record::{
        EnvironmentCondition, EnvironmentFingerprint, ExecutionRecord, FailureKind, FailureReason,
        Outcome, OutcomeKind,
    },
    sampler::SamplerSettings,
    signal::CancelHandle,
};
use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Mutex, Once},
    time::Duration,
};

pub(crate) use OutcomeKind::{Fail as F, Pass as P};

/// The history from the flaky test scenario: three failures in eight runs.
pub(crate) const T1_HISTORY: [OutcomeKind; 8] = [P, P, F, P, F, P, P, F];

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().expect("color-eyre installed once");
    });
}

pub(crate) fn test_id(s: &str) -> TestIdentifier {
    s.parse().expect("valid test identifier")
}

fn outcome(kind: OutcomeKind) -> Outcome {
    match kind {
        OutcomeKind::Pass => Outcome::pass(Duration::from_millis(20)),
        OutcomeKind::Fail => Outcome::fail(Duration::from_millis(20), None),
        OutcomeKind::Error => Outcome::error(
            Duration::from_millis(20),
            FailureReason::new(FailureKind::Other, "test harness error"),
        ),
        OutcomeKind::Skipped => Outcome::skipped(),
    }
}

pub(crate) fn record(test: &str, batch: &str, kind: OutcomeKind) -> ExecutionRecord {
    record_under(test, batch, kind, EnvironmentFingerprint::baseline())
}

pub(crate) fn record_under(
    test: &str,
    batch: &str,
    kind: OutcomeKind,
    fingerprint: EnvironmentFingerprint,
) -> ExecutionRecord {
    ExecutionRecord::new(
        test_id(test),
        batch.parse().expect("valid batch id"),
        outcome(kind),
        fingerprint,
    )
}

pub(crate) fn jitter(parallelism: u32) -> EnvironmentFingerprint {
    EnvironmentFingerprint {
        condition: EnvironmentCondition::ParallelismJitter,
        parallelism: NonZeroU32::new(parallelism),
        ..EnvironmentFingerprint::baseline()
    }
}

/// Returns one record per outcome, each in its own `history-N` batch.
pub(crate) fn history(
    test: &str,
    outcomes: impl IntoIterator<Item = OutcomeKind>,
) -> Vec<ExecutionRecord> {
    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, kind)| record(test, &format!("history-{index}"), kind))
        .collect()
}

/// Engine settings with small samples and no retry delays.
pub(crate) fn engine_settings() -> EngineSettings {
    EngineSettings {
        sampler: SamplerSettings {
            sample_size: 10,
            timeout: Duration::from_secs(5),
            retries: RetryPolicy::new_without_delay(1),
            ..Default::default()
        },
        test_threads: 4,
        ..Default::default()
    }
}

/// How a [`ScriptedExecutor`] behaves for one test.
#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// Every execution has this outcome.
    Always(OutcomeKind),

    /// Fails under the given condition, passes otherwise.
    FailUnder(EnvironmentCondition),

    /// The runner is broken.
    InfraFailure,

    /// Cancels the handle, then never completes.
    CancelAndHang(CancelHandle),
}

/// A fake runner that follows a script per test, and counts calls.
#[derive(Debug, Default)]
pub(crate) struct ScriptedExecutor {
    scripts: HashMap<TestIdentifier, Script>,
    calls: Mutex<HashMap<TestIdentifier, usize>>,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, test: &str, script: Script) -> Self {
        self.scripts.insert(test_id(test), script);
        self
    }

    pub(crate) fn calls(&self, test: &str) -> usize {
        let calls = self.calls.lock().unwrap();
        calls.get(&test_id(test)).copied().unwrap_or(0)
    }
}

impl TestExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> Result<Outcome, RunnerInfraError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(test_id.clone())
            .or_default() += 1;

        match self.scripts.get(test_id) {
            None => Err(RunnerInfraError::unavailable(format!(
                "no script for {test_id}"
            ))),
            Some(Script::Always(kind)) => Ok(outcome(*kind)),
            Some(Script::FailUnder(condition)) => {
                if fingerprint.condition == *condition {
                    Ok(outcome(OutcomeKind::Fail))
                } else {
                    Ok(outcome(OutcomeKind::Pass))
                }
            }
            Some(Script::InfraFailure) => Err(RunnerInfraError::unavailable("worker pool lost")),
            Some(Script::CancelAndHang(handle)) => {
                handle.cancel();
                std::future::pending().await
            }
        }
    }
}
