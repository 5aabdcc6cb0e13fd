// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::elements::{RetryPolicy, TestThreads, VariationPolicy, deserialize_retry_policy};
use crate::{
    classifier::FlakinessClassifier,
    engine::EngineSettings,
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    executor::DEFAULT_SKIP_EXIT_CODE,
    quarantine::QuarantinePolicy,
    sampler::SamplerSettings,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU32,
    sync::LazyLock,
    time::Duration,
};
use tracing::warn;

/// Trait for handling configuration warnings.
///
/// This allows warnings to be logged (the default behavior) or collected for testing purposes.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// Default implementation of [`ConfigWarnings`] that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!(
            "in config file {}, ignoring unknown configuration {unknown_str}",
            config_file
                .strip_prefix(workspace_root)
                .unwrap_or(config_file),
        )
    }
}

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for flakeguard.
///
/// This is the root data structure for flakeguard configuration. Most settings are organized into
/// profiles, which are obtained through [`FlakeguardConfig::profile`].
#[derive(Clone, Debug)]
pub struct FlakeguardConfig {
    workspace_root: Utf8PathBuf,
    store_dir: Utf8PathBuf,
    runner: RunnerConfig,
    profiles: BTreeMap<String, ProfileSettings>,
}

impl FlakeguardConfig {
    /// The default location of the config within the workspace: `.config/flakeguard.toml`.
    pub const CONFIG_PATH: &'static str = ".config/flakeguard.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/flakeguard.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/flakeguard.toml`,
    /// uses the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(workspace_root, config_file, &mut DefaultConfigWarnings)
    }

    /// Load configuration from the given sources with custom warning handling.
    pub fn from_sources_with_warnings(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (deserialized, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &workspace_root, &unknown);
        }

        let FlakeguardConfigDeserialize {
            store,
            runner,
            mut profiles,
        } = deserialized;
        let default_profile = profiles.remove(Self::DEFAULT_PROFILE).unwrap_or_default();
        let default_settings = ProfileSettings::resolve_default(default_profile)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        let mut resolved = BTreeMap::new();
        for (name, custom) in profiles {
            let settings = default_settings.with_overrides(custom);
            settings
                .validate(&name)
                .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
            resolved.insert(name, settings);
        }
        default_settings
            .validate(Self::DEFAULT_PROFILE)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        resolved.insert(Self::DEFAULT_PROFILE.to_owned(), default_settings);

        Ok(Self {
            store_dir: workspace_root.join(store.dir),
            workspace_root,
            runner,
            profiles: resolved,
        })
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the directory where records, quarantine state and audit events are kept.
    pub fn store_dir(&self) -> &Utf8Path {
        &self.store_dir
    }

    /// Returns the runner configuration.
    pub fn runner(&self) -> &RunnerConfig {
        &self.runner
    }

    /// Returns the names of all profiles, sorted.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Returns the profile with the given name, or an error if it isn't known.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<EvaluationProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        match self.profiles.get_key_value(name) {
            Some((name, settings)) => Ok(EvaluationProfile { name, settings }),
            None => Err(ProfileNotFound::new(name, self.profiles.keys())),
        }
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(FlakeguardConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: FlakeguardConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. Drop the key from
                // the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// Settings for the external runner command.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    #[serde(default)]
    command: Option<String>,
    #[serde(default = "default_skip_exit_code")]
    skip_exit_code: i32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: None,
            skip_exit_code: DEFAULT_SKIP_EXIT_CODE,
        }
    }
}

impl RunnerConfig {
    /// Returns the runner command, if one is configured.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Returns the exit code that means the test was skipped.
    pub fn skip_exit_code(&self) -> i32 {
        self.skip_exit_code
    }
}

fn default_skip_exit_code() -> i32 {
    DEFAULT_SKIP_EXIT_CODE
}

/// A flakeguard profile, with settings resolved against the default profile.
///
/// Returned by [`FlakeguardConfig::profile`].
#[derive(Clone, Copy, Debug)]
pub struct EvaluationProfile<'cfg> {
    name: &'cfg str,
    settings: &'cfg ProfileSettings,
}

impl<'cfg> EvaluationProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &'cfg str {
        self.name
    }

    /// Returns the minimum number of executions needed to classify a test.
    pub fn min_evidence(&self) -> usize {
        self.settings.min_evidence
    }

    /// Returns the maximum number of executions considered when classifying a test.
    pub fn evidence_window(&self) -> usize {
        self.settings.evidence_window
    }

    /// Returns the number of executions per sampling cycle.
    pub fn sample_size(&self) -> u32 {
        self.settings.sample_size
    }

    /// Returns the variation policy used while sampling.
    pub fn variation(&self) -> VariationPolicy {
        self.settings.variation
    }

    /// Returns the upper bound on parallelism for `parallelism-jitter`.
    pub fn max_parallelism(&self) -> u32 {
        self.settings.max_parallelism
    }

    /// Returns the time budget for a single sampled execution.
    pub fn sample_timeout(&self) -> Duration {
        self.settings.sample_timeout
    }

    /// Returns the retry policy for runner failures.
    pub fn infra_retries(&self) -> RetryPolicy {
        self.settings.infra_retries
    }

    /// Returns the minimum confidence for a flaky verdict to count towards quarantine.
    pub fn observe_confidence(&self) -> f64 {
        self.settings.observe_confidence
    }

    /// Returns the number of confident flaky cycles needed to quarantine a test.
    pub fn quarantine_after(&self) -> u32 {
        self.settings.quarantine_after
    }

    /// Returns the number of stable cycles needed to release a test from quarantine.
    pub fn resolve_after(&self) -> u32 {
        self.settings.resolve_after
    }

    /// Returns the number of tests evaluated at the same time.
    pub fn test_threads(&self) -> TestThreads {
        self.settings.test_threads
    }

    /// Returns the engine settings described by this profile.
    pub fn engine_settings(&self) -> EngineSettings {
        let settings = self.settings;
        EngineSettings {
            classifier: FlakinessClassifier::new(settings.min_evidence, settings.evidence_window),
            sampler: SamplerSettings {
                sample_size: settings.sample_size,
                variation: settings.variation,
                // Validated to be nonzero on load.
                max_parallelism: NonZeroU32::new(settings.max_parallelism)
                    .unwrap_or(NonZeroU32::MIN),
                timeout: settings.sample_timeout,
                retries: settings.infra_retries,
            },
            quarantine: QuarantinePolicy {
                observe_confidence: settings.observe_confidence,
                quarantine_after: settings.quarantine_after,
                resolve_after: settings.resolve_after,
            },
            test_threads: settings.test_threads.compute(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct ProfileSettings {
    min_evidence: usize,
    evidence_window: usize,
    sample_size: u32,
    variation: VariationPolicy,
    max_parallelism: u32,
    sample_timeout: Duration,
    infra_retries: RetryPolicy,
    observe_confidence: f64,
    quarantine_after: u32,
    resolve_after: u32,
    test_threads: TestThreads,
}

impl ProfileSettings {
    fn resolve_default(p: CustomProfileImpl) -> Result<Self, ConfigParseErrorKind> {
        fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigParseErrorKind> {
            value.ok_or_else(|| ConfigParseErrorKind::InvalidProfile {
                profile: FlakeguardConfig::DEFAULT_PROFILE.to_owned(),
                message: format!("`{key}` must be set in the default profile"),
            })
        }

        Ok(Self {
            min_evidence: required(p.min_evidence, "min-evidence")?,
            evidence_window: required(p.evidence_window, "evidence-window")?,
            sample_size: required(p.sample_size, "sample-size")?,
            variation: required(p.variation, "variation")?,
            max_parallelism: required(p.max_parallelism, "max-parallelism")?,
            sample_timeout: required(p.sample_timeout, "sample-timeout")?,
            infra_retries: required(p.infra_retries, "infra-retries")?,
            observe_confidence: required(p.observe_confidence, "observe-confidence")?,
            quarantine_after: required(p.quarantine_after, "quarantine-after")?,
            resolve_after: required(p.resolve_after, "resolve-after")?,
            test_threads: required(p.test_threads, "test-threads")?,
        })
    }

    fn with_overrides(&self, p: CustomProfileImpl) -> Self {
        Self {
            min_evidence: p.min_evidence.unwrap_or(self.min_evidence),
            evidence_window: p.evidence_window.unwrap_or(self.evidence_window),
            sample_size: p.sample_size.unwrap_or(self.sample_size),
            variation: p.variation.unwrap_or(self.variation),
            max_parallelism: p.max_parallelism.unwrap_or(self.max_parallelism),
            sample_timeout: p.sample_timeout.unwrap_or(self.sample_timeout),
            infra_retries: p.infra_retries.unwrap_or(self.infra_retries),
            observe_confidence: p.observe_confidence.unwrap_or(self.observe_confidence),
            quarantine_after: p.quarantine_after.unwrap_or(self.quarantine_after),
            resolve_after: p.resolve_after.unwrap_or(self.resolve_after),
            test_threads: p.test_threads.unwrap_or(self.test_threads),
        }
    }

    fn validate(&self, profile: &str) -> Result<(), ConfigParseErrorKind> {
        let invalid = |message: String| {
            Err(ConfigParseErrorKind::InvalidProfile {
                profile: profile.to_owned(),
                message,
            })
        };

        for (key, value) in [
            ("min-evidence", self.min_evidence as u64),
            ("sample-size", u64::from(self.sample_size)),
            ("max-parallelism", u64::from(self.max_parallelism)),
            ("quarantine-after", u64::from(self.quarantine_after)),
            ("resolve-after", u64::from(self.resolve_after)),
        ] {
            if value == 0 {
                return invalid(format!("`{key}` must be greater than zero"));
            }
        }
        if self.evidence_window < self.min_evidence {
            return invalid(format!(
                "`evidence-window` ({}) must be at least `min-evidence` ({})",
                self.evidence_window, self.min_evidence,
            ));
        }
        if self.sample_timeout.is_zero() {
            return invalid("`sample-timeout` must be greater than zero".to_owned());
        }
        if !(0.0..=1.0).contains(&self.observe_confidence) {
            return invalid(format!(
                "`observe-confidence` ({}) must be between 0 and 1",
                self.observe_confidence,
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FlakeguardConfigDeserialize {
    store: StoreConfigImpl,
    #[serde(default)]
    runner: RunnerConfig,
    #[serde(rename = "profile")]
    profiles: BTreeMap<String, CustomProfileImpl>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    dir: Utf8PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    min_evidence: Option<usize>,
    #[serde(default)]
    evidence_window: Option<usize>,
    #[serde(default)]
    sample_size: Option<u32>,
    #[serde(default)]
    variation: Option<VariationPolicy>,
    #[serde(default)]
    max_parallelism: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    sample_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    infra_retries: Option<RetryPolicy>,
    #[serde(default)]
    observe_confidence: Option<f64>,
    #[serde(default)]
    quarantine_after: Option<u32>,
    #[serde(default)]
    resolve_after: Option<u32>,
    #[serde(default)]
    test_threads: Option<TestThreads>,
}
