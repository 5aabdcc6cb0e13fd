// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for flakeguard.
//!
//! The default configuration is embedded in flakeguard. Repositories can override it through
//! `.config/flakeguard.toml` in the workspace root, or a config file passed in explicitly. Most
//! settings live in profiles: see [`FlakeguardConfig::profile`].

mod core;
mod elements;

pub use self::core::*;
pub use elements::*;

#[cfg(test)]
pub(crate) mod test_helpers;
