// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Structured access to flakeguard's machine-readable output.
//!
//! This crate holds the identifiers every other flakeguard crate keys on, the
//! serializable summaries produced by `flakeguard evaluate --message-format json`,
//! and the documented exit codes of the `flakeguard` binary.

mod errors;
mod exit_codes;
mod ids;
mod summary;

pub use errors::*;
pub use exit_codes::*;
pub use ids::*;
pub use summary::*;
