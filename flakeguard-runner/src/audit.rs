// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured audit events.
//!
//! Every classification, quarantine transition, deferred cycle and rejected duplicate is recorded
//! as an [`AuditEvent`]. Events are kept in memory by an [`AuditLog`] and can be appended to a JSON
//! Lines file.

use crate::{classifier::VerdictLabel, errors::AuditWriteError, quarantine::Transition};
use camino::Utf8Path;
use chrono::{DateTime, FixedOffset};
use flakeguard_metadata::{BatchId, QuarantineState, TestIdentifier};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
};

/// A single audit event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuditEvent {
    /// The test the event is about.
    pub test_id: TestIdentifier,

    /// When the event happened.
    pub timestamp: DateTime<FixedOffset>,

    /// What happened.
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

/// The kind of an [`AuditEvent`], along with its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AuditEventKind {
    /// A test was classified.
    #[serde(rename_all = "kebab-case")]
    Verdict {
        /// The batch being evaluated.
        batch_id: BatchId,

        /// The label.
        label: VerdictLabel,

        /// The confidence.
        confidence: f64,

        /// The number of executions in the evidence window.
        evidence: usize,

        /// The number of failed executions.
        failures: usize,

        /// The number of errored executions.
        errors: usize,
    },

    /// A test's quarantine state changed.
    #[serde(rename_all = "kebab-case")]
    Transition {
        /// The batch being evaluated.
        batch_id: BatchId,

        /// The previous state.
        from: QuarantineState,

        /// The new state.
        to: QuarantineState,

        /// The label of the triggering verdict.
        label: VerdictLabel,

        /// The confidence of the triggering verdict.
        confidence: f64,
    },

    /// A test's cycle was deferred to a later batch.
    #[serde(rename_all = "kebab-case")]
    Deferred {
        /// The batch being evaluated.
        batch_id: BatchId,

        /// Why the cycle was deferred.
        reason: String,
    },

    /// A record was rejected because its batch was already recorded.
    #[serde(rename_all = "kebab-case")]
    DuplicateRejected {
        /// The duplicate batch.
        batch_id: BatchId,
    },
}

impl AuditEvent {
    /// Creates an event for a quarantine transition.
    pub fn from_transition(transition: &Transition) -> Self {
        Self {
            test_id: transition.test_id.clone(),
            timestamp: transition.timestamp,
            kind: AuditEventKind::Transition {
                batch_id: transition.batch_id.clone(),
                from: transition.from,
                to: transition.to,
                label: transition.label,
                confidence: transition.confidence,
            },
        }
    }

    /// Returns the name of this event's kind, as serialized.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            AuditEventKind::Verdict { .. } => "verdict",
            AuditEventKind::Transition { .. } => "transition",
            AuditEventKind::Deferred { .. } => "deferred",
            AuditEventKind::DuplicateRejected { .. } => "duplicate-rejected",
        }
    }
}

/// An ordered, in-memory log of audit events.
#[derive(Clone, Debug, Default)]
pub struct AuditLog {
    events: Vec<AuditEvent>,
}

impl AuditLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn record(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    /// Returns all events, oldest first.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Removes and returns all events.
    pub fn take(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Appends `events` to the JSON Lines file at `path`, creating it if necessary.
pub fn append_to_file(path: &Utf8Path, events: &[AuditEvent]) -> Result<(), AuditWriteError> {
    let io_err = |error| AuditWriteError::Io {
        path: path.to_owned(),
        error,
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    for event in events {
        serde_json::to_writer(&mut writer, event).map_err(AuditWriteError::Serialize)?;
        writer.write_all(b"\n").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}
