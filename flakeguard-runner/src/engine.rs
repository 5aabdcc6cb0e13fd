// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The decision engine: turns a batch of CI results into gating verdicts.
//!
//! For each test in a batch, the engine:
//!
//! 1. appends the test's records to the [`ResultStore`],
//! 2. classifies the test from its stored history,
//! 3. if the history is too short to classify, samples the test through the [`TestExecutor`] and
//!    classifies it again,
//! 4. applies the verdict to the [`QuarantineManager`], and
//! 5. decides whether the test gates the pipeline.
//!
//! If a test has records from more than one batch, steps 1-4 run once per batch, in the order
//! batches first appear. Steps 1-3 for different tests run concurrently. Step 4 runs once every
//! test has finished, so quarantine state only depends on the sequence of batches and not on how
//! they were grouped into evaluations.

use crate::{
    audit::{AuditEvent, AuditEventKind, AuditLog},
    classifier::{ClassificationVerdict, FlakinessClassifier, VerdictLabel},
    config::get_num_cpus,
    errors::{EngineBuildError, EvaluateError, SampleError},
    executor::TestExecutor,
    quarantine::{QuarantineManager, QuarantinePolicy, Transition},
    record::{ExecutionRecord, OutcomeKind},
    sampler::{ExecutionSampler, SamplerSettings},
    signal::{CancelHandle, CancelReason, SignalHandler, SignalHandlerKind},
    store::{QueryWindow, ResultStore},
};
use chrono::{DateTime, FixedOffset, Local};
use flakeguard_metadata::{
    BatchId, EvaluationSummary, GatingVerdict, QuarantineState, TestDecisionSummary,
    TestIdentifier, TransitionSummary,
};
use future_queue::StreamExt;
use futures::prelude::*;
use indexmap::{IndexMap, IndexSet};
use std::{collections::BTreeMap, fmt};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Settings for a [`DecisionEngine`].
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// The classifier.
    pub classifier: FlakinessClassifier,

    /// Settings for sampling tests with too little history.
    pub sampler: SamplerSettings,

    /// Thresholds for quarantine transitions.
    pub quarantine: QuarantinePolicy,

    /// The number of tests evaluated at the same time.
    pub test_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            classifier: FlakinessClassifier::default(),
            sampler: SamplerSettings::default(),
            quarantine: QuarantinePolicy::default(),
            test_threads: get_num_cpus(),
        }
    }
}

/// Decision engine options.
#[derive(Debug, Default)]
pub struct DecisionEngineBuilder {
    settings: EngineSettings,
    signal_handler: SignalHandlerKind,
    quarantine: Option<QuarantineManager>,
    cancel_handle: Option<CancelHandle>,
}

impl DecisionEngineBuilder {
    /// Creates a new builder with the given settings.
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Sets the kind of signal handling. Defaults to [`SignalHandlerKind::Noop`].
    pub fn set_signal_handler(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler = kind;
        self
    }

    /// Sets the quarantine state to start from, typically loaded with
    /// [`QuarantineManager::load`].
    ///
    /// By default the engine starts with every test active, using the policy in the settings.
    pub fn set_quarantine_manager(&mut self, manager: QuarantineManager) -> &mut Self {
        self.quarantine = Some(manager);
        self
    }

    /// Sets the handle used to cancel evaluations. By default the engine creates its own.
    pub fn set_cancel_handle(&mut self, handle: CancelHandle) -> &mut Self {
        self.cancel_handle = Some(handle);
        self
    }

    /// Creates a new engine.
    ///
    /// If `executor` is `None`, tests with too little history can't be sampled and are reported as
    /// indeterminate.
    pub fn build<S, E>(
        self,
        store: S,
        executor: Option<E>,
    ) -> Result<DecisionEngine<S, E>, EngineBuildError>
    where
        S: ResultStore,
        E: TestExecutor,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("flakeguard-worker")
            .build()
            .map_err(EngineBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = self.signal_handler.build()?;

        let quarantine = self
            .quarantine
            .unwrap_or_else(|| QuarantineManager::new(self.settings.quarantine));

        Ok(DecisionEngine {
            inner: EngineInner {
                store,
                executor,
                classifier: self.settings.classifier,
                sampler: ExecutionSampler::new(self.settings.sampler),
                test_threads: self.settings.test_threads.max(1),
            },
            quarantine,
            audit: AuditLog::new(),
            signal_handler,
            cancel_handle: self.cancel_handle.unwrap_or_default(),
            runtime,
        })
    }
}

/// Evaluates batches of CI results.
///
/// Created using [`DecisionEngineBuilder::build`].
#[derive(Debug)]
pub struct DecisionEngine<S, E> {
    inner: EngineInner<S, E>,
    quarantine: QuarantineManager,
    audit: AuditLog,
    signal_handler: SignalHandler,
    cancel_handle: CancelHandle,
    runtime: Runtime,
}

impl<S: ResultStore, E: TestExecutor> DecisionEngine<S, E> {
    /// Returns the result store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Returns the current quarantine state.
    pub fn quarantine(&self) -> &QuarantineManager {
        &self.quarantine
    }

    /// Returns a handle that can be used to cancel evaluations from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Returns the audit events recorded so far.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Removes and returns the audit events recorded so far.
    pub fn take_audit_events(&mut self) -> Vec<AuditEvent> {
        self.audit.take()
    }

    /// Evaluates a batch of execution records, and returns a decision for every test in it.
    ///
    /// Problems with individual tests, such as a broken runner, are reported as indeterminate
    /// decisions that gate the pipeline. Errors are only returned if the evaluation was cancelled
    /// or quarantine state is inconsistent. An evaluation that returns an error applies no
    /// quarantine transitions and records no audit events.
    pub fn evaluate(
        &mut self,
        batch: Vec<ExecutionRecord>,
    ) -> Result<EvaluationReport, EvaluateError> {
        if let Some(reason) = self.cancel_handle.reason() {
            return Err(EvaluateError::Cancelled { reason });
        }

        let (batches, plans) = plan_tests(batch, &self.quarantine);
        debug!(
            tests = plans.len(),
            batches = batches.len(),
            "evaluating batch"
        );

        let inner = &self.inner;
        let cancel_handle = &self.cancel_handle;
        let signal_handler = &mut self.signal_handler;
        let res = self.runtime.block_on(async move {
            // future_queue starts tests in order, but they may complete in any order.
            let run = futures::stream::iter(plans.into_iter().enumerate())
                .map(|(index, plan)| (1, async move { (index, inner.run_test(plan).await) }))
                .future_queue(inner.test_threads)
                .collect::<Vec<_>>();

            tokio::select! {
                biased;

                reason = cancel_handle.cancelled() => Err(reason),
                reason = wait_for_signal(signal_handler) => Err(reason),
                mut results = run => {
                    results.sort_unstable_by_key(|(index, _)| *index);
                    Ok(results.into_iter().map(|(_, cycles)| cycles).collect::<Vec<_>>())
                }
            }
        });

        let results = match res {
            Ok(results) => results,
            Err(reason) => {
                self.cancel_handle.cancel_with(reason);
                warn!(%reason, "evaluation cancelled, discarding in-flight samples");
                return Err(EvaluateError::Cancelled { reason });
            }
        };

        // Transitions and audit events are staged, and only kept if every cycle applies.
        let now = Local::now().fixed_offset();
        let mut quarantine = self.quarantine.clone();
        let mut audit = AuditLog::new();
        let mut decisions = IndexMap::with_capacity(results.len());
        for cycles in results {
            let mut decision: Option<TestDecision> = None;
            for cycle in cycles {
                let next = apply_cycle(&mut quarantine, &mut audit, cycle, now)?;
                decision = Some(match decision {
                    Some(previous) => previous.followed_by(next),
                    None => next,
                });
            }
            if let Some(decision) = decision {
                decisions.insert(decision.test_id.clone(), decision);
            }
        }

        self.quarantine = quarantine;
        for event in audit.take() {
            self.audit.record(event);
        }
        Ok(EvaluationReport {
            batches: batches.into_iter().collect(),
            decisions,
        })
    }
}

fn apply_cycle(
    quarantine: &mut QuarantineManager,
    audit: &mut AuditLog,
    cycle: CycleResult,
    now: DateTime<FixedOffset>,
) -> Result<TestDecision, EvaluateError> {
    let CycleResult {
        verdict,
        batch_id,
        latest,
        duplicates,
        deferred,
        already_applied,
    } = cycle;
    let test_id = &verdict.test_id;

    for duplicate in &duplicates {
        audit.record(AuditEvent {
            test_id: test_id.clone(),
            timestamp: now,
            kind: AuditEventKind::DuplicateRejected {
                batch_id: duplicate.clone(),
            },
        });
    }

    let transitions = if already_applied {
        debug!(%test_id, %batch_id, "batch already applied, skipping transition");
        Vec::new()
    } else {
        audit.record(AuditEvent {
            test_id: test_id.clone(),
            timestamp: now,
            kind: AuditEventKind::Verdict {
                batch_id: batch_id.clone(),
                label: verdict.label,
                confidence: verdict.confidence,
                evidence: verdict.evidence_len(),
                failures: verdict.failures,
                errors: verdict.errors,
            },
        });
        if let Some(reason) = &deferred {
            audit.record(AuditEvent {
                test_id: test_id.clone(),
                timestamp: now,
                kind: AuditEventKind::Deferred {
                    batch_id: batch_id.clone(),
                    reason: reason.to_string(),
                },
            });
        }

        let seen = quarantine
            .entry(test_id)
            .is_some_and(|entry| entry.last_batch.as_ref() == Some(&batch_id));
        if seen {
            // New records for a batch the state already includes, e.g. after the store was
            // replaced.
            warn!(%test_id, %batch_id, "batch already applied to quarantine state, keeping state");
            Vec::new()
        } else {
            let transitions = quarantine.transition(&verdict, &batch_id, now)?;
            for transition in &transitions {
                audit.record(AuditEvent::from_transition(transition));
            }
            transitions
        }
    };

    let state = quarantine.state(test_id);
    let gating = gating_verdict(verdict.label, state, latest);
    debug!(
        %test_id,
        label = %verdict.label,
        %state,
        verdict = %gating,
        "decided",
    );

    Ok(TestDecision {
        test_id: test_id.clone(),
        verdict: gating,
        label: verdict.label,
        confidence: verdict.confidence,
        evidence: verdict.evidence_len(),
        failures: verdict.failures,
        errors: verdict.errors,
        state,
        latest,
        transitions,
        duplicates: duplicates.len(),
        deferred,
    })
}

/// Decides whether a test gates the pipeline.
///
/// Only a quarantined test classified as flaky is let through despite failing. Anything that
/// couldn't be classified, or that is broken, always gates.
pub fn gating_verdict(
    label: VerdictLabel,
    state: QuarantineState,
    latest: OutcomeKind,
) -> GatingVerdict {
    match label {
        VerdictLabel::Indeterminate => GatingVerdict::Gate,
        label if label.is_broken() => GatingVerdict::Gate,
        VerdictLabel::Flaky if state == QuarantineState::Quarantined => GatingVerdict::Quarantined,
        _ if latest.is_failure() => GatingVerdict::Gate,
        _ => GatingVerdict::Pass,
    }
}

async fn wait_for_signal(signal_handler: &mut SignalHandler) -> CancelReason {
    match signal_handler.recv().await {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

#[derive(Debug)]
struct EngineInner<S, E> {
    store: S,
    executor: Option<E>,
    classifier: FlakinessClassifier,
    sampler: ExecutionSampler,
    test_threads: usize,
}

impl<S: ResultStore, E: TestExecutor> EngineInner<S, E> {
    /// Runs the cycles for one test, one after the other.
    async fn run_test(&self, plan: TestPlan) -> Vec<CycleResult> {
        let TestPlan { test_id, cycles } = plan;
        let mut results = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            results.push(self.run_cycle(&test_id, cycle).await);
        }
        results
    }

    async fn run_cycle(&self, test_id: &TestIdentifier, plan: CyclePlan) -> CycleResult {
        let CyclePlan {
            batch_id,
            records,
            already_applied,
        } = plan;
        let latest = records
            .last()
            .map_or(OutcomeKind::Skipped, ExecutionRecord::kind);

        let mut duplicates = Vec::new();
        let mut accepted = 0;
        for record in records {
            match self.append(record, &mut duplicates) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(reason) => {
                    return CycleResult::deferred(
                        test_id.clone(),
                        batch_id,
                        latest,
                        duplicates,
                        reason,
                    );
                }
            }
        }
        // Only skip if every record was a duplicate and the batch already reached the quarantine
        // state: a cancelled evaluation stores records without applying them.
        let already_applied = already_applied && accepted == 0;

        let mut verdict = match self.classify(test_id) {
            Ok(verdict) => verdict,
            Err(reason) => {
                return CycleResult::deferred(
                    test_id.clone(),
                    batch_id,
                    latest,
                    duplicates,
                    reason,
                );
            }
        };

        let mut deferred = None;
        if verdict.label == VerdictLabel::Indeterminate && !already_applied {
            match self.sample(test_id, &batch_id, &mut duplicates).await {
                Ok(()) => match self.classify(test_id) {
                    Ok(resampled) => verdict = resampled,
                    Err(reason) => deferred = Some(reason),
                },
                Err(reason) => deferred = Some(reason),
            }
            if verdict.label == VerdictLabel::Indeterminate && deferred.is_none() {
                deferred = Some(DeferReason::InsufficientEvidence {
                    evidence: verdict.evidence_len(),
                    required: self.classifier.min_evidence(),
                });
            }
        }
        if let Some(reason) = &deferred {
            warn!(%test_id, %batch_id, %reason, "deferring classification");
        }

        CycleResult {
            verdict,
            batch_id,
            latest,
            duplicates,
            deferred,
            already_applied,
        }
    }

    /// Returns true if the record was stored, false if it was a duplicate.
    fn append(
        &self,
        record: ExecutionRecord,
        duplicates: &mut Vec<BatchId>,
    ) -> Result<bool, DeferReason> {
        let batch_id = record.batch_id.clone();
        match self.store.append(record) {
            Ok(()) => Ok(true),
            Err(error) if error.is_duplicate() => {
                warn!(%batch_id, "{error}");
                duplicates.push(batch_id);
                Ok(false)
            }
            Err(error) => Err(DeferReason::Storage {
                message: error.to_string(),
            }),
        }
    }

    fn classify(&self, test_id: &TestIdentifier) -> Result<ClassificationVerdict, DeferReason> {
        let snapshot =
            self.store
                .query(test_id, QueryWindow::All)
                .map_err(|error| DeferReason::Storage {
                    message: error.to_string(),
                })?;
        Ok(self.classifier.classify(test_id, &snapshot))
    }

    async fn sample(
        &self,
        test_id: &TestIdentifier,
        batch_id: &BatchId,
        duplicates: &mut Vec<BatchId>,
    ) -> Result<(), DeferReason> {
        let Some(executor) = &self.executor else {
            return Err(DeferReason::NoRunner);
        };
        debug!(
            %test_id,
            %batch_id,
            samples = self.sampler.settings().sample_size,
            "sampling",
        );
        let records = self
            .sampler
            .sample(executor, test_id, batch_id)
            .await
            .map_err(|error| match error {
                SampleError::InfraExhausted {
                    attempts, error, ..
                } => DeferReason::RunnerExhausted {
                    attempts,
                    message: error.to_string(),
                },
            })?;
        for record in records {
            self.append(record, duplicates)?;
        }
        Ok(())
    }
}

/// The records for one test in an evaluation, split into one cycle per batch.
#[derive(Debug)]
struct TestPlan {
    test_id: TestIdentifier,
    /// In batch arrival order.
    cycles: Vec<CyclePlan>,
}

/// The records for one test in one batch. Quarantine transitions are keyed by the batch.
#[derive(Debug)]
struct CyclePlan {
    batch_id: BatchId,
    records: Vec<ExecutionRecord>,
    /// Whether this was the last batch applied to the test before the evaluation started.
    already_applied: bool,
}

/// Groups records by test, in order of first appearance, and then by batch, in the order batches
/// first appear in the whole input.
fn plan_tests(
    batch: Vec<ExecutionRecord>,
    quarantine: &QuarantineManager,
) -> (IndexSet<BatchId>, Vec<TestPlan>) {
    let mut batches = IndexSet::new();
    let mut by_test: IndexMap<TestIdentifier, BTreeMap<usize, CyclePlan>> = IndexMap::new();
    for record in batch {
        let (batch_index, _) = batches.insert_full(record.batch_id.clone());
        let batch_id = record.batch_id.clone();
        by_test
            .entry(record.test_id.clone())
            .or_default()
            .entry(batch_index)
            .or_insert_with(|| CyclePlan {
                already_applied: quarantine
                    .entry(&record.test_id)
                    .is_some_and(|entry| entry.last_batch.as_ref() == Some(&batch_id)),
                batch_id,
                records: Vec::new(),
            })
            .records
            .push(record);
    }

    let plans = by_test
        .into_iter()
        .map(|(test_id, cycles)| TestPlan {
            test_id,
            cycles: cycles.into_values().collect(),
        })
        .collect();
    (batches, plans)
}

#[derive(Debug)]
struct CycleResult {
    verdict: ClassificationVerdict,
    batch_id: BatchId,
    latest: OutcomeKind,
    duplicates: Vec<BatchId>,
    deferred: Option<DeferReason>,
    already_applied: bool,
}

impl CycleResult {
    fn deferred(
        test_id: TestIdentifier,
        batch_id: BatchId,
        latest: OutcomeKind,
        duplicates: Vec<BatchId>,
        reason: DeferReason,
    ) -> Self {
        warn!(%test_id, %batch_id, %reason, "deferring classification");
        Self {
            verdict: ClassificationVerdict::indeterminate(test_id),
            batch_id,
            latest,
            duplicates,
            deferred: Some(reason),
            already_applied: false,
        }
    }
}

/// Why a test couldn't be classified in an evaluation cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeferReason {
    /// Sampling completed, but the test still has too little history.
    InsufficientEvidence {
        /// The number of non-skipped executions available.
        evidence: usize,

        /// The number of executions needed.
        required: usize,
    },

    /// The test needed sampling, but no runner is configured.
    NoRunner,

    /// The runner kept failing while sampling.
    RunnerExhausted {
        /// The number of attempts made for the failing sample.
        attempts: u32,

        /// The last runner error.
        message: String,
    },

    /// The result store failed.
    Storage {
        /// The store error.
        message: String,
    },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientEvidence { evidence, required } => {
                write!(f, "insufficient evidence ({evidence} of {required} executions)")
            }
            Self::NoRunner => f.write_str("no runner command configured"),
            Self::RunnerExhausted { attempts, message } => {
                write!(f, "runner failed {attempts} consecutive times: {message}")
            }
            Self::Storage { message } => write!(f, "result store error: {message}"),
        }
    }
}

/// The decision made for one test.
#[derive(Clone, Debug, PartialEq)]
pub struct TestDecision {
    /// The test.
    pub test_id: TestIdentifier,

    /// Whether the test gates the pipeline.
    pub verdict: GatingVerdict,

    /// The classification label.
    pub label: VerdictLabel,

    /// The classifier's confidence.
    pub confidence: f64,

    /// The number of executions the classification was based on.
    pub evidence: usize,

    /// The number of failed executions in the evidence.
    pub failures: usize,

    /// The number of errored executions in the evidence.
    pub errors: usize,

    /// The quarantine state after this evaluation.
    pub state: QuarantineState,

    /// The outcome of the test's last record in its last batch.
    pub latest: OutcomeKind,

    /// The quarantine transitions applied in this evaluation.
    pub transitions: Vec<Transition>,

    /// The number of records rejected as duplicates.
    pub duplicates: usize,

    /// Why the test couldn't be classified, if it couldn't.
    pub deferred: Option<DeferReason>,
}

impl TestDecision {
    /// Combines this decision with the decision for the same test's next batch.
    fn followed_by(mut self, mut next: TestDecision) -> TestDecision {
        self.transitions.append(&mut next.transitions);
        next.transitions = self.transitions;
        next.duplicates += self.duplicates;
        next
    }

    /// Returns a summary of this decision, suitable for machine-readable output.
    pub fn to_summary(&self) -> TestDecisionSummary {
        let transition = match (self.transitions.first(), self.transitions.last()) {
            (Some(first), Some(last)) => Some(TransitionSummary {
                from: first.from,
                to: last.to,
            }),
            _ => None,
        };
        TestDecisionSummary {
            test_id: self.test_id.clone(),
            verdict: self.verdict,
            label: self.label.name().to_owned(),
            condition: self.label.condition().map(|c| c.to_string()),
            confidence: self.confidence,
            evidence: self.evidence,
            state: self.state,
            transition,
        }
    }
}

/// The result of [`DecisionEngine::evaluate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvaluationReport {
    batches: Vec<BatchId>,
    decisions: IndexMap<TestIdentifier, TestDecision>,
}

impl EvaluationReport {
    /// Returns the batches in the evaluation, in order of first appearance.
    pub fn batches(&self) -> &[BatchId] {
        &self.batches
    }

    /// Returns the decision for `test_id`, if it was in the batch.
    pub fn get(&self, test_id: &TestIdentifier) -> Option<&TestDecision> {
        self.decisions.get(test_id)
    }

    /// Returns the gating verdict for `test_id`, if it was in the batch.
    pub fn verdict(&self, test_id: &TestIdentifier) -> Option<GatingVerdict> {
        self.get(test_id).map(|decision| decision.verdict)
    }

    /// Iterates over decisions in the order tests first appeared in the batch.
    pub fn iter(&self) -> impl Iterator<Item = &TestDecision> {
        self.decisions.values()
    }

    /// Returns the number of tests in the report.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// Returns true if the batch was empty.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Returns the number of tests that gate the pipeline.
    pub fn gated(&self) -> usize {
        self.iter().filter(|decision| decision.verdict.is_gate()).count()
    }

    /// Returns a summary of this report, suitable for machine-readable output.
    pub fn to_summary(&self) -> EvaluationSummary {
        EvaluationSummary {
            batches: self.batches.clone(),
            gated: self.gated(),
            decisions: self.iter().map(TestDecision::to_summary).collect(),
        }
    }
}
