// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repeated execution of a test under varied environments.
//!
//! When a test's history is too short to classify, the [`ExecutionSampler`] runs it `sample-size`
//! more times through a [`TestExecutor`]. Every other sample runs under the varied condition
//! selected by the [`VariationPolicy`], and the rest run under the baseline, so that failures
//! which only happen under one condition can be told apart from true flakiness.
//!
//! Fingerprints are derived from a hash of the test, batch and sample index. Sampling the same
//! test for the same batch therefore always uses the same environments.

use crate::{
    config::{RetryPolicy, VariationPolicy},
    errors::{RunnerInfraError, SampleError},
    executor::TestExecutor,
    record::{EnvironmentCondition, EnvironmentFingerprint, ExecutionRecord, FailureReason, Outcome},
};
use flakeguard_metadata::{BatchId, TestIdentifier};
use rand::{Rng, distr::OpenClosed01};
use std::{num::NonZeroU32, time::Duration};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

/// Throttle levels used for `resource-throttle` samples, as a percentage of normal resources.
const THROTTLE_STEPS: [u8; 3] = [25, 50, 75];

const DEFAULT_MAX_PARALLELISM: NonZeroU32 = NonZeroU32::new(8).unwrap();

/// Settings for an [`ExecutionSampler`].
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerSettings {
    /// The number of executions per sampling cycle.
    pub sample_size: u32,

    /// How the environment varies across executions.
    pub variation: VariationPolicy,

    /// The upper bound for parallelism under `parallelism-jitter`.
    pub max_parallelism: NonZeroU32,

    /// The time budget for a single execution.
    pub timeout: Duration,

    /// How runner infrastructure failures are retried.
    pub retries: RetryPolicy,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            sample_size: 20,
            variation: VariationPolicy::default(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            timeout: Duration::from_secs(120),
            retries: RetryPolicy::default(),
        }
    }
}

/// Collects fresh execution records for a test.
#[derive(Clone, Debug)]
pub struct ExecutionSampler {
    settings: SamplerSettings,
}

impl ExecutionSampler {
    /// Creates a new sampler.
    pub fn new(settings: SamplerSettings) -> Self {
        Self { settings }
    }

    /// Returns the settings for this sampler.
    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Runs a full sampling cycle for `test_id`.
    ///
    /// Records are returned only once every sample has completed, under the derived batch ids
    /// `<batch_id>#sample-<n>`. If the runner keeps failing for any one sample, the whole cycle is
    /// abandoned and [`SampleError::InfraExhausted`] is returned.
    ///
    /// Dropping the returned future cancels every in-flight execution and discards the samples
    /// collected so far.
    pub async fn sample<E: TestExecutor>(
        &self,
        executor: &E,
        test_id: &TestIdentifier,
        batch_id: &BatchId,
    ) -> Result<Vec<ExecutionRecord>, SampleError> {
        let mut records = Vec::with_capacity(self.settings.sample_size as usize);
        for index in 0..self.settings.sample_size {
            let fingerprint = self.fingerprint(test_id, batch_id, index);
            let outcome = self.run_sample(executor, test_id, &fingerprint).await?;
            debug!(
                %test_id,
                sample = index,
                %fingerprint,
                outcome = %outcome.kind,
                "collected sample",
            );
            records.push(ExecutionRecord::new(
                test_id.clone(),
                batch_id.sample(index),
                outcome,
                fingerprint,
            ));
        }
        Ok(records)
    }

    /// Returns the environment that sample `index` of `test_id` runs under for `batch_id`.
    pub fn fingerprint(
        &self,
        test_id: &TestIdentifier,
        batch_id: &BatchId,
        index: u32,
    ) -> EnvironmentFingerprint {
        let condition = self.settings.variation.varied_condition();
        if condition == EnvironmentCondition::Baseline || index % 2 == 0 {
            return EnvironmentFingerprint::baseline();
        }

        let hash = sample_hash(test_id, batch_id, index);
        let mut fingerprint = EnvironmentFingerprint {
            condition,
            ..EnvironmentFingerprint::baseline()
        };
        match condition {
            EnvironmentCondition::Baseline => {}
            EnvironmentCondition::ParallelismJitter => {
                let max = u64::from(self.settings.max_parallelism.get());
                // The result is in 1..=max, so it fits in a u32 and is nonzero.
                fingerprint.parallelism = u32::try_from(hash % max + 1)
                    .ok()
                    .and_then(NonZeroU32::new);
            }
            EnvironmentCondition::OrderShuffle => {
                fingerprint.shuffle_seed = Some(hash);
            }
            EnvironmentCondition::ResourceThrottle => {
                let step = (hash % THROTTLE_STEPS.len() as u64) as usize;
                fingerprint.throttle_percent = Some(THROTTLE_STEPS[step]);
            }
        }
        fingerprint
    }

    async fn run_sample<E: TestExecutor>(
        &self,
        executor: &E,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> Result<Outcome, SampleError> {
        let mut backoff_iter = BackoffIter::new(self.settings.retries);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_once(executor, test_id, fingerprint).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => match backoff_iter.next() {
                    Some(delay) => {
                        warn!(
                            %test_id,
                            attempt,
                            delay = %humantime::format_duration(delay),
                            "runner failed, retrying sample: {error}",
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(SampleError::InfraExhausted {
                            test_id: test_id.clone(),
                            attempts: attempt,
                            error,
                        });
                    }
                },
            }
        }
    }

    async fn execute_once<E: TestExecutor>(
        &self,
        executor: &E,
        test_id: &TestIdentifier,
        fingerprint: &EnvironmentFingerprint,
    ) -> Result<Outcome, RunnerInfraError> {
        let timeout = self.settings.timeout;
        match tokio::time::timeout(timeout, executor.execute(test_id, fingerprint)).await {
            Ok(result) => result,
            // A hung test is evidence about the test, not about the runner.
            Err(_elapsed) => Ok(Outcome::error(timeout, FailureReason::timeout(timeout))),
        }
    }
}

fn sample_hash(test_id: &TestIdentifier, batch_id: &BatchId, index: u32) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(test_id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(batch_id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(&index.to_le_bytes());
    hasher.digest()
}

/// Delays between retries of a sample.
#[derive(Clone, Debug)]
struct BackoffIter {
    policy: RetryPolicy,
    current_factor: f64,
    remaining_attempts: u32,
}

impl BackoffIter {
    const BACKOFF_EXPONENT: f64 = 2.;

    fn new(policy: RetryPolicy) -> Self {
        let remaining_attempts = policy.count();
        Self {
            policy,
            current_factor: 1.,
            remaining_attempts,
        }
    }

    fn next_delay_and_jitter(&mut self) -> (Duration, bool) {
        match self.policy {
            RetryPolicy::Fixed { delay, jitter, .. } => (delay, jitter),
            RetryPolicy::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => {
                let factor = self.current_factor;
                let exp_delay = delay.mul_f64(factor);

                // Stop multiplying the exponential factor once the delay exceeds max_delay.
                if let Some(max_delay) = max_delay
                    && exp_delay > max_delay
                {
                    return (max_delay, jitter);
                }

                self.current_factor *= Self::BACKOFF_EXPONENT;
                (exp_delay, jitter)
            }
        }
    }

    fn apply_jitter(duration: Duration) -> Duration {
        let jitter: f64 = rand::rng().sample(OpenClosed01);
        // Apply jitter in the range (0.5, 1].
        duration.mul_f64(0.5 + jitter / 2.)
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_attempts > 0 {
            let (mut delay, jitter) = self.next_delay_and_jitter();
            if jitter {
                delay = Self::apply_jitter(delay);
            }
            self.remaining_attempts -= 1;
            Some(delay)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OutcomeKind;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };
    use test_case::test_case;

    fn settings(sample_size: u32, variation: VariationPolicy) -> SamplerSettings {
        SamplerSettings {
            sample_size,
            variation,
            retries: RetryPolicy::new_without_delay(1),
            ..SamplerSettings::default()
        }
    }

    /// Passes under the baseline and fails under every varied condition.
    #[derive(Debug, Default)]
    struct ConditionSensitive {
        seen: Mutex<Vec<EnvironmentFingerprint>>,
    }

    impl TestExecutor for ConditionSensitive {
        async fn execute(
            &self,
            _test_id: &TestIdentifier,
            fingerprint: &EnvironmentFingerprint,
        ) -> Result<Outcome, RunnerInfraError> {
            self.seen.lock().unwrap().push(fingerprint.clone());
            if fingerprint.condition == EnvironmentCondition::Baseline {
                Ok(Outcome::pass(Duration::ZERO))
            } else {
                Ok(Outcome::fail(Duration::ZERO, None))
            }
        }
    }

    /// Fails with an infrastructure error for the first `failures` calls.
    #[derive(Debug)]
    struct FlakyRunner {
        failures: u32,
        calls: AtomicU32,
    }

    impl TestExecutor for FlakyRunner {
        async fn execute(
            &self,
            _test_id: &TestIdentifier,
            _fingerprint: &EnvironmentFingerprint,
        ) -> Result<Outcome, RunnerInfraError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RunnerInfraError::unavailable("no executors available"))
            } else {
                Ok(Outcome::pass(Duration::ZERO))
            }
        }
    }

    struct Hangs;

    impl TestExecutor for Hangs {
        async fn execute(
            &self,
            _test_id: &TestIdentifier,
            _fingerprint: &EnvironmentFingerprint,
        ) -> Result<Outcome, RunnerInfraError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn samples_alternate_conditions() {
        let sampler = ExecutionSampler::new(settings(6, VariationPolicy::OrderShuffle));
        let executor = ConditionSensitive::default();
        let test_id: TestIdentifier = "db::migrates".parse().unwrap();
        let batch_id: BatchId = "ci-7".parse().unwrap();

        let records = sampler
            .sample(&executor, &test_id, &batch_id)
            .await
            .unwrap();

        let kinds: Vec<_> = records.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            [
                OutcomeKind::Pass,
                OutcomeKind::Fail,
                OutcomeKind::Pass,
                OutcomeKind::Fail,
                OutcomeKind::Pass,
                OutcomeKind::Fail,
            ]
        );
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.batch_id, batch_id.sample(index as u32));
            assert_eq!(record.test_id, test_id);
        }
        assert!(
            records
                .iter()
                .filter(|r| r.fingerprint.condition == EnvironmentCondition::OrderShuffle)
                .all(|r| r.fingerprint.shuffle_seed.is_some())
        );
        assert_eq!(executor.seen.lock().unwrap().len(), 6);
    }

    #[test_case(VariationPolicy::None ; "none")]
    #[test_case(VariationPolicy::ParallelismJitter ; "parallelism jitter")]
    #[test_case(VariationPolicy::OrderShuffle ; "order shuffle")]
    #[test_case(VariationPolicy::ResourceThrottle ; "resource throttle")]
    fn fingerprints_are_deterministic(variation: VariationPolicy) {
        let sampler = ExecutionSampler::new(settings(20, variation));
        let test_id: TestIdentifier = "db::migrates".parse().unwrap();
        let batch_id: BatchId = "ci-7".parse().unwrap();

        for index in 0..20 {
            let fingerprint = sampler.fingerprint(&test_id, &batch_id, index);
            assert_eq!(
                fingerprint,
                sampler.fingerprint(&test_id, &batch_id, index),
                "fingerprint {index} is stable"
            );
            if let Some(parallelism) = fingerprint.parallelism {
                assert!(parallelism <= sampler.settings().max_parallelism);
            }
            if let Some(percent) = fingerprint.throttle_percent {
                assert!(THROTTLE_STEPS.contains(&percent));
            }
            if variation == VariationPolicy::None || index % 2 == 0 {
                assert_eq!(fingerprint, EnvironmentFingerprint::baseline());
            } else {
                assert_eq!(fingerprint.condition, variation.varied_condition());
            }
        }
    }

    #[tokio::test]
    async fn infra_failure_is_retried() {
        let sampler = ExecutionSampler::new(settings(3, VariationPolicy::None));
        let executor = FlakyRunner {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        let records = sampler
            .sample(&executor, &"a::b".parse().unwrap(), &"b1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn consecutive_infra_failures_abandon_the_cycle() {
        let sampler = ExecutionSampler::new(settings(3, VariationPolicy::None));
        let executor = FlakyRunner {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let err = sampler
            .sample(&executor, &"a::b".parse().unwrap(), &"b1".parse().unwrap())
            .await
            .unwrap_err();
        let SampleError::InfraExhausted { attempts, .. } = err;
        assert_eq!(attempts, 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_recorded_as_error() {
        let sampler = ExecutionSampler::new(SamplerSettings {
            timeout: Duration::from_secs(5),
            ..settings(1, VariationPolicy::None)
        });
        let records = sampler
            .sample(&Hangs, &"a::b".parse().unwrap(), &"b1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), OutcomeKind::Error);
        assert_eq!(
            records[0].outcome.reason,
            Some(FailureReason::timeout(Duration::from_secs(5)))
        );
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let delays: Vec<_> = BackoffIter::new(RetryPolicy::Exponential {
            count: 4,
            delay: Duration::from_secs(1),
            jitter: false,
            max_delay: Some(Duration::from_secs(3)),
        })
        .collect();
        assert_eq!(
            delays,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_secs(4);
        for jittered in BackoffIter::new(RetryPolicy::Fixed {
            count: 16,
            delay,
            jitter: true,
        }) {
            assert!(jittered > delay / 2 && jittered <= delay, "{jittered:?}");
        }
    }
}
