// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for flakeguard, a flaky test detector.
//!
//! The basic flow of operations is:
//!
//! 1. CI results arrive as a batch of [`ExecutionRecord`](record::ExecutionRecord)s.
//! 2. The [`DecisionEngine`](engine::DecisionEngine) appends them to a
//!    [`ResultStore`](store::ResultStore).
//! 3. Tests with too little history are run again through the
//!    [`ExecutionSampler`](sampler::ExecutionSampler), under varied environments.
//! 4. The [`FlakinessClassifier`](classifier::FlakinessClassifier) labels each test.
//! 5. The [`QuarantineManager`](quarantine::QuarantineManager) moves tests through their
//!    quarantine lifecycle.
//! 6. Each test gets a gating verdict: whether it should block the pipeline.

pub mod audit;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod quarantine;
pub mod record;
pub mod sampler;
pub mod signal;
pub mod store;
