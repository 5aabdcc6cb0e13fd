// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenarios where tests have too little history and are sampled.

use crate::fixtures::*;
use color_eyre::eyre::{Result, bail};
use flakeguard_metadata::{GatingVerdict, QuarantineState};
use flakeguard_runner::{
    classifier::VerdictLabel,
    engine::{DecisionEngineBuilder, DeferReason},
    errors::EvaluateError,
    record::EnvironmentCondition,
    signal::{CancelHandle, CancelReason},
    store::{InMemoryStore, QueryWindow, ResultStore},
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn sampling_exposes_condition_failures() -> Result<()> {
    test_init();

    let executor = Arc::new(
        ScriptedExecutor::new().with(
            "io::pool",
            Script::FailUnder(EnvironmentCondition::ParallelismJitter),
        ),
    );
    let mut engine = DecisionEngineBuilder::new(engine_settings())
        .build(InMemoryStore::new(), Some(executor.clone()))?;

    let report = engine.evaluate(vec![record("io::pool", "ci-1", P)])?;
    let decision = report.get(&test_id("io::pool")).unwrap();
    assert_eq!(executor.calls("io::pool"), 10);
    assert_eq!(
        decision.label,
        VerdictLabel::BrokenUnderCondition {
            condition: EnvironmentCondition::ParallelismJitter
        }
    );
    assert_eq!(decision.evidence, 11);
    assert_eq!(decision.failures, 5);
    assert_eq!(decision.verdict, GatingVerdict::Gate);

    let stored = engine
        .store()
        .query(&test_id("io::pool"), QueryWindow::All)?;
    let sampled = stored.iter().filter(|r| r.batch_id.is_sample()).count();
    assert_eq!(sampled, 10, "samples are stored alongside CI results");
    Ok(())
}

#[test]
fn runner_failures_defer_the_cycle() -> Result<()> {
    test_init();

    let executor = Arc::new(ScriptedExecutor::new().with("net::dns", Script::InfraFailure));
    let mut engine = DecisionEngineBuilder::new(engine_settings())
        .build(InMemoryStore::new(), Some(executor.clone()))?;

    let report = engine.evaluate(vec![record("net::dns", "ci-1", F)])?;
    let decision = report.get(&test_id("net::dns")).unwrap();

    // One retry after the first failure, then the cycle is abandoned.
    assert_eq!(executor.calls("net::dns"), 2);
    assert_eq!(decision.label, VerdictLabel::Indeterminate);
    assert_eq!(decision.verdict, GatingVerdict::Gate);
    assert!(
        matches!(
            decision.deferred,
            Some(DeferReason::RunnerExhausted { attempts: 2, .. })
        ),
        "{:?}",
        decision.deferred
    );

    assert!(decision.transitions.is_empty());
    assert_eq!(decision.state, QuarantineState::Active);
    assert!(engine.quarantine().entry(&test_id("net::dns")).is_none());

    let stored = engine
        .store()
        .query(&test_id("net::dns"), QueryWindow::All)?;
    assert_eq!(stored.len(), 1, "no partial samples are kept");
    Ok(())
}

#[test]
fn many_tests_are_sampled_concurrently() -> Result<()> {
    test_init();

    let names: Vec<_> = (0..12).map(|i| format!("suite::case_{i:02}")).collect();
    let executor = names.iter().fold(ScriptedExecutor::new(), |executor, name| {
        executor.with(name, Script::Always(P))
    });
    let mut engine = DecisionEngineBuilder::new(engine_settings())
        .build(InMemoryStore::new(), Some(executor))?;

    let batch = names.iter().rev().map(|name| record(name, "ci-1", P)).collect();
    let report = engine.evaluate(batch)?;

    let order: Vec<_> = report.iter().map(|d| d.test_id.to_string()).collect();
    let expected: Vec<_> = names.iter().rev().cloned().collect();
    assert_eq!(order, expected, "decisions keep arrival order");
    assert!(report.iter().all(|d| d.label == VerdictLabel::Stable));
    assert_eq!(report.gated(), 0);
    Ok(())
}

#[test]
fn cancellation_discards_samples_and_transitions() -> Result<()> {
    test_init();

    let store = Arc::new(InMemoryStore::new());
    let handle = CancelHandle::new();
    let executor = ScriptedExecutor::new().with("ui::render", Script::CancelAndHang(handle.clone()));
    let mut builder = DecisionEngineBuilder::new(engine_settings());
    builder.set_cancel_handle(handle.clone());
    let mut engine = builder.build(store.clone(), Some(executor))?;

    match engine.evaluate(vec![record("ui::render", "ci-1", P)]) {
        Err(EvaluateError::Cancelled {
            reason: CancelReason::Requested,
        }) => {}
        other => bail!("expected cancellation, got {other:?}"),
    }
    assert_eq!(engine.quarantine().entries().count(), 0);
    assert!(engine.audit_log().events().is_empty());
    assert_eq!(
        store.query(&test_id("ui::render"), QueryWindow::All)?.len(),
        1,
        "only the CI result was stored"
    );
    drop(engine);

    // The stored result wasn't applied, so evaluating the batch again completes the cycle.
    let executor = ScriptedExecutor::new().with("ui::render", Script::Always(P));
    let mut engine = DecisionEngineBuilder::new(engine_settings()).build(store, Some(executor))?;
    let report = engine.evaluate(vec![record("ui::render", "ci-1", P)])?;
    let decision = report.get(&test_id("ui::render")).unwrap();
    assert_eq!(decision.duplicates, 1);
    assert_eq!(decision.label, VerdictLabel::Stable);
    assert_eq!(decision.evidence, 11);
    assert_eq!(decision.verdict, GatingVerdict::Pass);
    Ok(())
}
