// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `flakeguard` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum FlakeguardExitCode {}

impl FlakeguardExitCode {
    /// No errors occurred and no test gated the pipeline.
    pub const OK: i32 = 0;

    /// One or more tests gated the pipeline.
    pub const GATED: i32 = 100;

    /// The batch file could not be read or parsed.
    pub const INVALID_BATCH: i32 = 94;

    /// A user issue happened while setting up a flakeguard invocation.
    pub const SETUP_ERROR: i32 = 96;

    /// The result store or the quarantine state file could not be read or written.
    pub const STORE_ERROR: i32 = 97;

    /// The evaluation was cancelled before it completed, for example via Ctrl-C.
    pub const EVALUATION_CANCELLED: i32 = 98;

    /// Two transitions were attempted for the same test in the same batch.
    ///
    /// This indicates a bug in flakeguard.
    pub const STATE_CONFLICT: i32 = 99;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
