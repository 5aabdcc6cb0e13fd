// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quarantine lifecycle scenarios driven through the engine.

use crate::fixtures::*;
use chrono::Local;
use color_eyre::eyre::{Result, ensure};
use flakeguard_metadata::{GatingVerdict, QuarantineState};
use flakeguard_runner::{
    audit::AuditEvent,
    classifier::VerdictLabel,
    engine::{DecisionEngine, DecisionEngineBuilder},
    quarantine::{QuarantineEntry, QuarantineManager},
    record::EnvironmentCondition,
    store::{InMemoryStore, QueryWindow, ResultStore},
};
use pretty_assertions::assert_eq;

type Engine = DecisionEngine<InMemoryStore, ScriptedExecutor>;

fn engine_with(store: InMemoryStore, quarantine: Option<QuarantineManager>) -> Result<Engine> {
    let mut builder = DecisionEngineBuilder::new(engine_settings());
    if let Some(quarantine) = quarantine {
        builder.set_quarantine_manager(quarantine);
    }
    Ok(builder.build(store, None)?)
}

fn quarantined(test: &str) -> QuarantineManager {
    let entry = QuarantineEntry {
        test_id: test_id(test),
        state: QuarantineState::Quarantined,
        flaky_streak: 0,
        stable_streak: 0,
        last_batch: Some("history".parse().unwrap()),
        since: Local::now().fixed_offset(),
    };
    QuarantineManager::with_entries(engine_settings().quarantine, [entry])
}

fn audit_kinds(engine: &Engine) -> Vec<&'static str> {
    engine
        .audit_log()
        .events()
        .iter()
        .map(AuditEvent::kind_name)
        .collect()
}

#[test]
fn intermittent_failures_are_flaky() -> Result<()> {
    test_init();

    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY[..7].to_vec()))?;
    let mut engine = engine_with(store, None)?;
    let report = engine.evaluate(vec![record("net::retries", "ci-1", F)])?;

    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.label, VerdictLabel::Flaky);
    assert_eq!(decision.evidence, 8);
    assert_eq!(decision.failures, 3);
    ensure!(
        (0.40..0.50).contains(&decision.confidence),
        "a short window gives low confidence: {}",
        decision.confidence
    );

    // Not confident enough to observe, so the failure gates as usual.
    assert_eq!(decision.state, QuarantineState::Active);
    assert!(decision.transitions.is_empty());
    assert_eq!(decision.verdict, GatingVerdict::Gate);
    Ok(())
}

#[test]
fn confident_flaky_twice_is_quarantined() -> Result<()> {
    test_init();

    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
    let mut engine = engine_with(store, None)?;

    let report = engine.evaluate(vec![record("net::retries", "ci-1", P)])?;
    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.label, VerdictLabel::Flaky);
    ensure!(decision.confidence >= 0.6, "confidence {}", decision.confidence);
    assert_eq!(decision.state, QuarantineState::UnderObservation);
    assert_eq!(decision.verdict, GatingVerdict::Pass);

    let report = engine.evaluate(vec![record("net::retries", "ci-2", F)])?;
    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.label, VerdictLabel::Flaky);
    assert_eq!(decision.state, QuarantineState::Quarantined);
    assert_eq!(
        decision.verdict,
        GatingVerdict::Quarantined,
        "quarantined flaky failures don't gate"
    );
    assert_eq!(report.gated(), 0);

    let path: Vec<_> = decision
        .transitions
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        path,
        [(QuarantineState::UnderObservation, QuarantineState::Quarantined)]
    );
    assert_eq!(
        audit_kinds(&engine),
        ["verdict", "transition", "verdict", "transition"]
    );
    Ok(())
}

#[test]
fn stable_cycles_release_quarantine() -> Result<()> {
    test_init();

    let store = InMemoryStore::with_records(history("db::migrate", [P; 10]))?;
    let mut engine = engine_with(store, Some(quarantined("db::migrate")))?;

    for cycle in 1..=4 {
        let report = engine.evaluate(vec![record("db::migrate", &format!("ci-{cycle}"), P)])?;
        let decision = report.get(&test_id("db::migrate")).unwrap();
        assert_eq!(decision.label, VerdictLabel::Stable);
        assert_eq!(decision.state, QuarantineState::Quarantined, "cycle {cycle}");
        assert_eq!(decision.verdict, GatingVerdict::Pass);
    }

    let report = engine.evaluate(vec![record("db::migrate", "ci-5", P)])?;
    let decision = report.get(&test_id("db::migrate")).unwrap();
    assert_eq!(decision.state, QuarantineState::Resolved);
    assert_eq!(
        decision.to_summary().transition.map(|t| (t.from, t.to)),
        Some((QuarantineState::Quarantined, QuarantineState::Resolved))
    );

    let report = engine.evaluate(vec![record("db::migrate", "ci-6", P)])?;
    let decision = report.get(&test_id("db::migrate")).unwrap();
    assert_eq!(decision.state, QuarantineState::Active);
    assert_eq!(decision.transitions.len(), 1);
    assert_eq!(decision.transitions[0].from, QuarantineState::Resolved);
    Ok(())
}

#[test]
fn condition_failures_gate_despite_quarantine() -> Result<()> {
    test_init();

    let mut records = history("io::pool", [P; 10]);
    records.extend((0..4).map(|i| {
        record_under(
            "io::pool",
            &format!("jitter-{i}"),
            F,
            jitter(2 + i),
        )
    }));
    let store = InMemoryStore::with_records(records)?;
    let mut engine = engine_with(store, Some(quarantined("io::pool")))?;

    let report = engine.evaluate(vec![record_under("io::pool", "ci-1", F, jitter(7))])?;
    let decision = report.get(&test_id("io::pool")).unwrap();
    assert_eq!(
        decision.label,
        VerdictLabel::BrokenUnderCondition {
            condition: EnvironmentCondition::ParallelismJitter
        }
    );
    assert_eq!(decision.evidence, 15);
    assert_eq!(decision.failures, 5);
    assert_eq!(decision.verdict, GatingVerdict::Gate);
    assert_eq!(decision.state, QuarantineState::Quarantined);
    assert!(decision.transitions.is_empty());

    let summary = decision.to_summary();
    assert_eq!(summary.label, "broken-under-condition");
    assert_eq!(summary.condition.as_deref(), Some("parallelism-jitter"));
    Ok(())
}

#[test]
fn replayed_batch_is_not_double_counted() -> Result<()> {
    test_init();

    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
    let mut engine = engine_with(store, None)?;

    let first = engine.evaluate(vec![record("net::retries", "ci-1", P)])?;
    let first = first.get(&test_id("net::retries")).unwrap().clone();
    assert_eq!(first.state, QuarantineState::UnderObservation);

    let replay = engine.evaluate(vec![record("net::retries", "ci-1", P)])?;
    let replay = replay.get(&test_id("net::retries")).unwrap();
    assert_eq!(replay.duplicates, 1);
    assert_eq!(replay.evidence, first.evidence, "not double counted");
    assert!(replay.transitions.is_empty(), "no second transition");
    assert_eq!(replay.state, QuarantineState::UnderObservation);

    let stored = engine
        .store()
        .query(&test_id("net::retries"), QueryWindow::All)?;
    assert_eq!(stored.len(), 41);
    assert_eq!(
        audit_kinds(&engine),
        ["verdict", "transition", "duplicate-rejected"]
    );
    Ok(())
}

#[test]
fn replay_after_new_batch_is_skipped() -> Result<()> {
    test_init();

    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
    let mut engine = engine_with(store, None)?;
    engine.evaluate(vec![record("net::retries", "ci-1", P)])?;

    // The replayed ci-1 record comes after a new batch for the same test.
    let report = engine.evaluate(vec![
        record("a::first", "ci-2", P),
        record("net::retries", "ci-2", F),
        record("net::retries", "ci-1", P),
    ])?;
    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.duplicates, 1);
    assert_eq!(decision.state, QuarantineState::Quarantined);
    let path: Vec<_> = decision
        .transitions
        .iter()
        .map(|t| (t.from, t.to, t.batch_id.as_str()))
        .collect();
    assert_eq!(
        path,
        [(
            QuarantineState::UnderObservation,
            QuarantineState::Quarantined,
            "ci-2"
        )]
    );
    assert_eq!(
        report.get(&test_id("a::first")).unwrap().label,
        VerdictLabel::Indeterminate
    );

    assert_eq!(
        audit_kinds(&engine),
        [
            "verdict",
            "transition",
            "verdict",
            "deferred",
            "verdict",
            "transition",
            "duplicate-rejected",
        ]
    );
    Ok(())
}

#[test]
fn batches_in_one_evaluation_apply_in_order() -> Result<()> {
    test_init();

    let separate = {
        let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
        let mut engine = engine_with(store, None)?;
        engine.evaluate(vec![record("net::retries", "ci-1", P)])?;
        engine.evaluate(vec![record("net::retries", "ci-2", F)])?;
        engine.quarantine().entry(&test_id("net::retries")).cloned()
    };

    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
    let mut engine = engine_with(store, None)?;
    let report = engine.evaluate(vec![
        record("net::retries", "ci-1", P),
        record("net::retries", "ci-2", F),
    ])?;
    let batches: Vec<_> = report.batches().iter().map(|b| b.as_str()).collect();
    assert_eq!(batches, ["ci-1", "ci-2"]);

    let decision = report.get(&test_id("net::retries")).unwrap();
    let path: Vec<_> = decision
        .transitions
        .iter()
        .map(|t| (t.from, t.to, t.batch_id.as_str()))
        .collect();
    assert_eq!(
        path,
        [
            (
                QuarantineState::Active,
                QuarantineState::UnderObservation,
                "ci-1"
            ),
            (
                QuarantineState::UnderObservation,
                QuarantineState::Quarantined,
                "ci-2"
            ),
        ]
    );
    assert_eq!(decision.state, QuarantineState::Quarantined);
    assert_eq!(decision.latest, F);
    assert_eq!(decision.verdict, GatingVerdict::Quarantined);
    assert_eq!(
        audit_kinds(&engine),
        ["verdict", "transition", "verdict", "transition"]
    );

    // Only the time each state was entered may differ.
    let combined = engine
        .quarantine()
        .entry(&test_id("net::retries"))
        .cloned();
    assert_eq!(
        combined.map(|e| (e.state, e.flaky_streak, e.stable_streak, e.last_batch)),
        separate.map(|e| (e.state, e.flaky_streak, e.stable_streak, e.last_batch)),
    );
    Ok(())
}

#[test]
fn replaced_store_does_not_reapply_batch() -> Result<()> {
    test_init();

    let entry = QuarantineEntry {
        test_id: test_id("net::retries"),
        state: QuarantineState::UnderObservation,
        flaky_streak: 1,
        stable_streak: 0,
        last_batch: Some("ci-1".parse()?),
        since: Local::now().fixed_offset(),
    };
    let quarantine = QuarantineManager::with_entries(engine_settings().quarantine, [entry]);
    // The store no longer has ci-1, but the quarantine state already includes it.
    let store = InMemoryStore::with_records(history("net::retries", T1_HISTORY.repeat(5)))?;
    let mut engine = engine_with(store, Some(quarantine))?;

    let report = engine.evaluate(vec![record("net::retries", "ci-1", F)])?;
    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.label, VerdictLabel::Flaky);
    assert!(decision.transitions.is_empty());
    assert_eq!(decision.state, QuarantineState::UnderObservation);
    assert_eq!(
        engine
            .quarantine()
            .entry(&test_id("net::retries"))
            .map(|e| e.flaky_streak),
        Some(1)
    );
    assert_eq!(audit_kinds(&engine), ["verdict"]);
    Ok(())
}
