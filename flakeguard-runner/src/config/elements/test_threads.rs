// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::core::get_num_cpus;
use serde::Deserialize;
use std::fmt;

/// How many tests the engine evaluates at the same time.
///
/// In config this is either a positive number, `"num-cpus"`, or a negative number meaning "this
/// many fewer than the number of CPUs".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTestThreads")]
pub enum TestThreads {
    /// A fixed number of tests.
    Count(usize),

    /// As many tests as there are logical CPUs.
    NumCpus,

    /// This many fewer tests than there are logical CPUs, but at least one.
    FewerThanCpus(usize),
}

impl TestThreads {
    /// Resolves the number of tests for this machine. Always at least one.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count,
            Self::NumCpus => get_num_cpus(),
            Self::FewerThanCpus(fewer) => get_num_cpus().saturating_sub(fewer).max(1),
        }
    }
}

impl fmt::Display for TestThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => f.write_str("num-cpus"),
            Self::FewerThanCpus(fewer) => write!(f, "-{fewer}"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTestThreads {
    // TOML integers are i64.
    Number(i64),
    Keyword(String),
}

impl TryFrom<RawTestThreads> for TestThreads {
    type Error = String;

    fn try_from(raw: RawTestThreads) -> Result<Self, Self::Error> {
        match raw {
            RawTestThreads::Number(n) if n > 0 => Ok(Self::Count(n as usize)),
            RawTestThreads::Number(n) if n < 0 => Ok(Self::FewerThanCpus(n.unsigned_abs() as usize)),
            RawTestThreads::Keyword(keyword) if keyword == "num-cpus" => Ok(Self::NumCpus),
            RawTestThreads::Number(n) => Err(format!(
                "invalid test-threads {n}: expected a nonzero integer or \"num-cpus\""
            )),
            RawTestThreads::Keyword(keyword) => Err(format!(
                "invalid test-threads \"{keyword}\": expected a nonzero integer or \"num-cpus\""
            )),
        }
    }
}
