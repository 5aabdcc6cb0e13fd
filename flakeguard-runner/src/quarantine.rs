// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The quarantine lifecycle of each test.
//!
//! Every test is in exactly one [`QuarantineState`]. Tests start out `active`. The
//! [`QuarantineManager`] moves tests between states one evaluation cycle at a time, based on the
//! classifier's verdict for that cycle:
//!
//! ```text
//!            flaky (confident)          flaky (confident) x N
//!   active ---------------------> under-observation ------------> quarantined
//!     ^  ^         stable                 |                           |
//!     |  +--------------------------------+                           | stable x N
//!     |                 next cycle                                    v
//!     +--------------------------------------------------------- resolved
//! ```
//!
//! Broken verdicts never move a test between states. Indeterminate verdicts only end a resolved
//! test's resolution.

use crate::{
    classifier::{ClassificationVerdict, VerdictLabel},
    errors::{StateConflict, StateFileError},
};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::Utf8Path;
use chrono::{DateTime, FixedOffset};
use flakeguard_metadata::{BatchId, QuarantineState, TestIdentifier};
use iddqd::{IdOrdItem, IdOrdMap, id_upcast};
use serde::{Deserialize, Serialize};
use std::{fs, io};
use tracing::info;

/// Thresholds for quarantine transitions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuarantinePolicy {
    /// The minimum confidence for a flaky verdict to count towards quarantine.
    pub observe_confidence: f64,

    /// The number of consecutive confident flaky cycles needed to quarantine a test, including
    /// the cycle that put it under observation.
    pub quarantine_after: u32,

    /// The number of consecutive stable cycles needed to release a test from quarantine.
    pub resolve_after: u32,
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        Self {
            observe_confidence: 0.6,
            quarantine_after: 2,
            resolve_after: 5,
        }
    }
}

impl QuarantinePolicy {
    fn is_confident_flaky(&self, verdict: &ClassificationVerdict) -> bool {
        verdict.label == VerdictLabel::Flaky && verdict.confidence >= self.observe_confidence
    }
}

/// The persisted quarantine state of one test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuarantineEntry {
    /// The test.
    pub test_id: TestIdentifier,

    /// The current state.
    pub state: QuarantineState,

    /// The number of consecutive confident flaky cycles seen in the current state.
    #[serde(default)]
    pub flaky_streak: u32,

    /// The number of consecutive stable cycles seen in the current state.
    #[serde(default)]
    pub stable_streak: u32,

    /// The last batch that was applied to this test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_batch: Option<BatchId>,

    /// When the test entered its current state.
    pub since: DateTime<FixedOffset>,
}

impl QuarantineEntry {
    fn new(test_id: TestIdentifier, now: DateTime<FixedOffset>) -> Self {
        Self {
            test_id,
            state: QuarantineState::Active,
            flaky_streak: 0,
            stable_streak: 0,
            last_batch: None,
            since: now,
        }
    }

    fn reset_streaks(&mut self) {
        self.flaky_streak = 0;
        self.stable_streak = 0;
    }
}

impl IdOrdItem for QuarantineEntry {
    type Key<'a> = &'a TestIdentifier;
    fn key(&self) -> Self::Key<'_> {
        &self.test_id
    }
    id_upcast!();
}

/// A change in a test's quarantine state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Transition {
    /// The test.
    pub test_id: TestIdentifier,

    /// The state before the transition.
    pub from: QuarantineState,

    /// The state after the transition.
    pub to: QuarantineState,

    /// The label of the verdict that triggered the transition.
    pub label: VerdictLabel,

    /// The confidence of the verdict that triggered the transition.
    pub confidence: f64,

    /// The batch being evaluated.
    pub batch_id: BatchId,

    /// When the transition happened.
    pub timestamp: DateTime<FixedOffset>,
}

/// Owns the quarantine state of every test.
#[derive(Clone, Debug)]
pub struct QuarantineManager {
    policy: QuarantinePolicy,
    entries: IdOrdMap<QuarantineEntry>,
}

impl QuarantineManager {
    /// The version of the state file format written by this build.
    pub const FORMAT_VERSION: u32 = 1;

    /// Creates a manager where every test is active.
    pub fn new(policy: QuarantinePolicy) -> Self {
        Self {
            policy,
            entries: IdOrdMap::new(),
        }
    }

    /// Creates a manager from existing entries. Later entries for the same test replace earlier
    /// ones.
    pub fn with_entries(
        policy: QuarantinePolicy,
        entries: impl IntoIterator<Item = QuarantineEntry>,
    ) -> Self {
        let mut map = IdOrdMap::new();
        for entry in entries {
            map.insert_overwrite(entry);
        }
        Self {
            policy,
            entries: map,
        }
    }

    /// Loads state from `path`. A missing file means every test is active.
    pub fn load(path: &Utf8Path, policy: QuarantinePolicy) -> Result<Self, StateFileError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::new(policy));
            }
            Err(error) => {
                return Err(StateFileError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };

        let deserialize_err = |error| StateFileError::Deserialize {
            path: path.to_owned(),
            error,
        };
        let version: StateFileVersion = serde_json::from_str(&contents).map_err(deserialize_err)?;
        if version.format_version != Self::FORMAT_VERSION {
            return Err(StateFileError::UnsupportedVersion {
                path: path.to_owned(),
                found: version.format_version,
                supported: Self::FORMAT_VERSION,
            });
        }
        let file: StateFile = serde_json::from_str(&contents).map_err(deserialize_err)?;
        Ok(Self::with_entries(policy, file.entries))
    }

    /// Atomically writes the state to `path`, creating parent directories if necessary.
    pub fn save(&self, path: &Utf8Path) -> Result<(), StateFileError> {
        let write_err = |error| StateFileError::Write {
            path: path.to_owned(),
            error,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|error| write_err(atomicwrites::Error::Internal(error)))?;
        }

        let file = StateFileRef {
            format_version: Self::FORMAT_VERSION,
            entries: &self.entries,
        };
        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| serde_json::to_writer_pretty(f, &file).map_err(io::Error::from))
            .map_err(write_err)
    }

    /// Returns the policy.
    pub fn policy(&self) -> &QuarantinePolicy {
        &self.policy
    }

    /// Returns the current state of `test_id`.
    pub fn state(&self, test_id: &TestIdentifier) -> QuarantineState {
        self.entries
            .get(test_id)
            .map_or(QuarantineState::Active, |entry| entry.state)
    }

    /// Returns the entry for `test_id`, if it has ever been through a cycle.
    pub fn entry(&self, test_id: &TestIdentifier) -> Option<&QuarantineEntry> {
        self.entries.get(test_id)
    }

    /// Iterates over every entry, sorted by test.
    pub fn entries(&self) -> impl Iterator<Item = &QuarantineEntry> {
        self.entries.iter()
    }

    /// Applies the verdict of one evaluation cycle for `batch_id`.
    ///
    /// Returns the transitions that happened, in order. This is usually zero or one transition,
    /// but a resolved test first collapses back to active and can then move again.
    ///
    /// Returns [`StateConflict`] if a verdict was already applied to this test for `batch_id`.
    /// State is left unchanged in that case.
    ///
    /// Indeterminate verdicts only collapse a resolved test back to active. They don't consume
    /// the batch, so a later verdict for the same batch still applies.
    pub fn transition(
        &mut self,
        verdict: &ClassificationVerdict,
        batch_id: &BatchId,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Transition>, StateConflict> {
        let test_id = &verdict.test_id;
        let indeterminate = verdict.label == VerdictLabel::Indeterminate;
        let mut entry = match self.entries.get(test_id) {
            Some(entry) => entry.clone(),
            None if indeterminate => return Ok(Vec::new()),
            None => QuarantineEntry::new(test_id.clone(), now),
        };
        if !indeterminate {
            if entry.last_batch.as_ref() == Some(batch_id) {
                return Err(StateConflict::new(test_id.clone(), batch_id.clone()));
            }
            entry.last_batch = Some(batch_id.clone());
        }

        let mut transitions = Vec::new();
        let mut move_to = |entry: &mut QuarantineEntry, to: QuarantineState| {
            let transition = Transition {
                test_id: test_id.clone(),
                from: entry.state,
                to,
                label: verdict.label,
                confidence: verdict.confidence,
                batch_id: batch_id.clone(),
                timestamp: now,
            };
            info!(
                %test_id,
                from = %transition.from,
                to = %transition.to,
                verdict = %verdict.label,
                confidence = format_args!("{:.2}", verdict.confidence),
                %batch_id,
                "quarantine state changed",
            );
            entry.state = to;
            entry.since = now;
            entry.reset_streaks();
            transitions.push(transition);
        };

        if entry.state == QuarantineState::Resolved {
            move_to(&mut entry, QuarantineState::Active);
        }

        if indeterminate {
            // Only the collapse above applies.
        } else if verdict.label.is_broken() {
            entry.reset_streaks();
        } else {
            let confident_flaky = self.policy.is_confident_flaky(verdict);
            let stable = verdict.label == VerdictLabel::Stable;
            match entry.state {
                QuarantineState::Active => {
                    if confident_flaky {
                        move_to(&mut entry, QuarantineState::UnderObservation);
                        entry.flaky_streak = 1;
                    }
                }
                QuarantineState::UnderObservation => {
                    if stable {
                        move_to(&mut entry, QuarantineState::Active);
                    } else if confident_flaky {
                        entry.flaky_streak += 1;
                        if entry.flaky_streak >= self.policy.quarantine_after {
                            move_to(&mut entry, QuarantineState::Quarantined);
                        }
                    } else {
                        entry.flaky_streak = 0;
                    }
                }
                QuarantineState::Quarantined => {
                    if stable {
                        entry.stable_streak += 1;
                        if entry.stable_streak >= self.policy.resolve_after {
                            move_to(&mut entry, QuarantineState::Resolved);
                        }
                    } else {
                        entry.stable_streak = 0;
                    }
                }
                // Resolved was collapsed above.
                QuarantineState::Resolved => {}
            }
        }

        self.entries.insert_overwrite(entry);
        Ok(transitions)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateFileVersion {
    format_version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateFile {
    entries: Vec<QuarantineEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct StateFileRef<'a> {
    format_version: u32,
    entries: &'a IdOrdMap<QuarantineEntry>,
}
