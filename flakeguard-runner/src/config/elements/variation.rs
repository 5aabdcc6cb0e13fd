// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::record::EnvironmentCondition;
use serde::Deserialize;
use std::fmt;

/// How the environment is varied across the executions of a sampling cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariationPolicy {
    /// Every sample runs under the baseline environment.
    None,

    /// Samples alternate between the baseline and a randomized degree of parallelism.
    #[default]
    ParallelismJitter,

    /// Samples alternate between the baseline and a shuffled test order.
    OrderShuffle,

    /// Samples alternate between the baseline and reduced CPU or memory.
    ResourceThrottle,
}

impl VariationPolicy {
    /// Returns the condition that samples run under when they aren't baseline samples.
    pub fn varied_condition(self) -> EnvironmentCondition {
        match self {
            Self::None => EnvironmentCondition::Baseline,
            Self::ParallelismJitter => EnvironmentCondition::ParallelismJitter,
            Self::OrderShuffle => EnvironmentCondition::OrderShuffle,
            Self::ResourceThrottle => EnvironmentCondition::ResourceThrottle,
        }
    }
}

impl fmt::Display for VariationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            other => write!(f, "{}", other.varied_condition()),
        }
    }
}
