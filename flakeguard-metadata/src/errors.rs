// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error returned while parsing an identifier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidIdentifierError {
    /// The input was empty or all whitespace.
    #[error("{kind} must not be empty")]
    Empty {
        /// The kind of identifier that was being parsed.
        kind: &'static str,
    },

    /// The input contained a control character.
    #[error("{kind} `{input}` contains a control character")]
    ControlCharacter {
        /// The kind of identifier that was being parsed.
        kind: &'static str,

        /// The input provided.
        input: String,
    },
}
