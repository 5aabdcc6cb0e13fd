// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::InvalidIdentifierError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// The separator between the suite and the case name in a [`TestIdentifier`].
pub const SUITE_SEPARATOR: &str = "::";

/// A stable identifier for a test case: a suite and a case name, joined by `::`.
///
/// This is the primary key for everything flakeguard stores.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "SmolStr")]
pub struct TestIdentifier(SmolStr);

impl TestIdentifier {
    /// Creates a new identifier from a suite and a case name.
    pub fn new(suite: &str, case: &str) -> Result<Self, InvalidIdentifierError> {
        format!("{suite}{SUITE_SEPARATOR}{case}").parse()
    }

    /// Returns the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the suite portion of the identifier, if there is one.
    pub fn suite(&self) -> Option<&str> {
        self.0
            .rsplit_once(SUITE_SEPARATOR)
            .map(|(suite, _)| suite)
    }

    /// Returns the case name.
    pub fn case(&self) -> &str {
        match self.0.rsplit_once(SUITE_SEPARATOR) {
            Some((_, case)) => case,
            None => &self.0,
        }
    }
}

impl FromStr for TestIdentifier {
    type Err = InvalidIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate("test identifier", s)?;
        Ok(Self(s.into()))
    }
}

impl TryFrom<String> for TestIdentifier {
    type Error = InvalidIdentifierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TestIdentifier> for SmolStr {
    fn from(id: TestIdentifier) -> Self {
        id.0
    }
}

impl AsRef<str> for TestIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The marker between a CI batch and the index of a sampled execution.
const SAMPLE_MARKER: &str = "#sample-";

/// Identifies one batch of results: a CI run, or a sampled execution derived from one.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "SmolStr")]
pub struct BatchId(SmolStr);

impl BatchId {
    /// Returns the batch id for the `index`th sampled execution triggered by this batch.
    ///
    /// Sampled batch ids never collide with CI batch ids, since `#` is reserved for them.
    pub fn sample(&self, index: u32) -> Self {
        Self(format!("{}{SAMPLE_MARKER}{index}", self.0).into())
    }

    /// Returns true if this batch id was produced by [`Self::sample`].
    pub fn is_sample(&self) -> bool {
        self.0.contains(SAMPLE_MARKER)
    }

    /// Returns the batch id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BatchId {
    type Err = InvalidIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate("batch id", s)?;
        Ok(Self(s.into()))
    }
}

impl TryFrom<String> for BatchId {
    type Error = InvalidIdentifierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BatchId> for SmolStr {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate(kind: &'static str, input: &str) -> Result<(), InvalidIdentifierError> {
    if input.trim().is_empty() {
        return Err(InvalidIdentifierError::Empty { kind });
    }
    if input.chars().any(char::is_control) {
        return Err(InvalidIdentifierError::ControlCharacter {
            kind,
            input: input.to_owned(),
        });
    }
    Ok(())
}
