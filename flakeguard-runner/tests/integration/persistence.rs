// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State carried across engine instances through the file store and the quarantine state file.

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use flakeguard_metadata::{GatingVerdict, QuarantineState};
use flakeguard_runner::{
    audit::{self, AuditEvent},
    engine::DecisionEngineBuilder,
    quarantine::QuarantineManager,
    store::{FileStore, ResultStore},
};
use pretty_assertions::assert_eq;

#[test]
fn quarantine_survives_restarts() -> Result<()> {
    test_init();

    let dir = Utf8TempDir::new()?;
    let state_path = dir.path().join("quarantine.json");
    let audit_path = dir.path().join("audit.jsonl");
    let settings = engine_settings();

    {
        let store = FileStore::open(dir.path())?;
        for record in history("net::retries", T1_HISTORY.repeat(5)) {
            store.append(record)?;
        }
        let quarantine = QuarantineManager::load(&state_path, settings.quarantine)?;
        let mut builder = DecisionEngineBuilder::new(settings.clone());
        builder.set_quarantine_manager(quarantine);
        let mut engine = builder.build(store, None::<ScriptedExecutor>)?;

        let report = engine.evaluate(vec![record("net::retries", "ci-1", F)])?;
        assert_eq!(
            report.verdict(&test_id("net::retries")),
            Some(GatingVerdict::Gate)
        );
        engine.quarantine().save(&state_path)?;
        audit::append_to_file(&audit_path, &engine.take_audit_events())?;
    }

    let store = FileStore::open(dir.path())?;
    let quarantine = QuarantineManager::load(&state_path, settings.quarantine)?;
    assert_eq!(
        quarantine.state(&test_id("net::retries")),
        QuarantineState::UnderObservation
    );
    let mut builder = DecisionEngineBuilder::new(settings);
    builder.set_quarantine_manager(quarantine);
    let mut engine = builder.build(store, None::<ScriptedExecutor>)?;

    let report = engine.evaluate(vec![record("net::retries", "ci-2", F)])?;
    let decision = report.get(&test_id("net::retries")).unwrap();
    assert_eq!(decision.evidence, 42, "history was reloaded from disk");
    assert_eq!(decision.state, QuarantineState::Quarantined);
    assert_eq!(decision.verdict, GatingVerdict::Quarantined);
    audit::append_to_file(&audit_path, &engine.take_audit_events())?;

    let events: Vec<AuditEvent> = std::fs::read_to_string(&audit_path)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    let kinds: Vec<_> = events.iter().map(AuditEvent::kind_name).collect();
    assert_eq!(kinds, ["verdict", "transition", "verdict", "transition"]);
    Ok(())
}
