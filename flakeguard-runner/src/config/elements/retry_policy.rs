// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{
    Deserialize,
    de::{self, MapAccess, Unexpected, Visitor, value::MapAccessDeserializer},
};
use std::{fmt, time::Duration};

/// How runner infrastructure failures are retried while sampling.
///
/// `count` is the number of retries after the first attempt, so a policy with `count = 1` makes
/// two attempts per sample. Once every attempt has failed, the test's cycle is deferred.
///
/// In config, a plain number is shorthand for fixed retries without delay.
#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backoff", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RetryPolicy {
    /// The same delay before every retry.
    #[serde(rename_all = "kebab-case")]
    Fixed {
        /// The number of retries.
        count: u32,

        /// The delay before each retry.
        #[serde(default, with = "humantime_serde")]
        delay: Duration,

        /// Whether to randomly shorten each delay by up to half.
        #[serde(default)]
        jitter: bool,
    },

    /// A delay that doubles before every retry.
    #[serde(rename_all = "kebab-case")]
    Exponential {
        /// The number of retries.
        count: u32,

        /// The delay before the first retry.
        #[serde(with = "humantime_serde")]
        delay: Duration,

        /// Whether to randomly shorten each delay by up to half.
        #[serde(default)]
        jitter: bool,

        /// The longest delay between retries.
        #[serde(default, with = "humantime_serde")]
        max_delay: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    /// A single retry, one second after the first failure.
    fn default() -> Self {
        Self::Exponential {
            count: 1,
            delay: Duration::from_secs(1),
            jitter: false,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that retries `count` times without waiting.
    pub fn new_without_delay(count: u32) -> Self {
        Self::Fixed {
            count,
            delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Returns the number of retries.
    pub fn count(&self) -> u32 {
        match self {
            Self::Fixed { count, .. } | Self::Exponential { count, .. } => *count,
        }
    }

    /// Returns the number of attempts made for each sample, including the first.
    pub fn total_attempts(&self) -> u32 {
        self.count().saturating_add(1)
    }

    fn check(&self) -> Result<(), &'static str> {
        match *self {
            Self::Fixed { delay, jitter, .. } => {
                if jitter && delay.is_zero() {
                    return Err("`jitter` requires a nonzero `delay`");
                }
            }
            Self::Exponential {
                count,
                delay,
                max_delay,
                ..
            } => {
                if count == 0 {
                    return Err("exponential backoff needs a nonzero `count`");
                }
                if delay.is_zero() {
                    return Err("exponential backoff needs a nonzero `delay`");
                }
                match max_delay {
                    Some(max_delay) if max_delay.is_zero() => {
                        return Err("`max-delay` must be nonzero");
                    }
                    Some(max_delay) if max_delay < delay => {
                        return Err("`max-delay` must be at least `delay`");
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Deserializes `infra-retries`, which is either a number or a backoff table.
///
/// This goes through a visitor rather than an untagged enum so that errors inside the table keep
/// their messages.
pub(in crate::config) fn deserialize_retry_policy<'de, D>(
    deserializer: D,
) -> Result<Option<RetryPolicy>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct RetriesVisitor;

    impl<'de> Visitor<'de> for RetriesVisitor {
        type Value = RetryPolicy;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str(
                "a number of retries, or a table like \
                 { backoff = \"exponential\", count = 2, delay = \"1s\" }",
            )
        }

        // TOML integers are i64.
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u32::try_from(v)
                .map(RetryPolicy::new_without_delay)
                .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            u32::try_from(v)
                .map(RetryPolicy::new_without_delay)
                .map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
        }

        fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
            RetryPolicy::deserialize(MapAccessDeserializer::new(map))
        }
    }

    let policy = deserializer.deserialize_any(RetriesVisitor)?;
    policy.check().map_err(de::Error::custom)?;
    Ok(Some(policy))
}
