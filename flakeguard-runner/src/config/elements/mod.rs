// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for flakeguard.

mod retry_policy;
mod test_threads;
mod variation;

pub use retry_policy::*;
pub use test_threads::*;
pub use variation::*;
