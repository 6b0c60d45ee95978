// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader configuration
//!
//! Layers, lowest priority first:
//!
//! 1. built-in defaults
//! 2. `loader.toml` (`$XDG_CONFIG_HOME/spacey/loader.toml` unless a path is given)
//! 3. `SPACEY_LOADER_*` environment variables
//! 4. explicit overrides (e.g. CLI flags)
//!
//! The fallback policy has no default. Some layer must set it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for config overrides
pub const ENV_PREFIX: &str = "SPACEY_LOADER_";

const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOAD_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;

/// What happens when an import names no handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Only the registry default is used; a miss fails the import
    RegistryOnly,
    /// Registry default first, host native handler on a registry miss
    NativeOnRegistryMiss,
    /// Host native handler whenever one is available, registry otherwise
    PreferNative,
}

impl FallbackPolicy {
    /// Policy name as used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackPolicy::RegistryOnly => "registry-only",
            FallbackPolicy::NativeOnRegistryMiss => "native-on-registry-miss",
            FallbackPolicy::PreferNative => "prefer-native",
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "registry-only" => Ok(FallbackPolicy::RegistryOnly),
            "native-on-registry-miss" => Ok(FallbackPolicy::NativeOnRegistryMiss),
            "prefer-native" => Ok(FallbackPolicy::PreferNative),
            _ => Err(ConfigError::InvalidValue {
                key: "fallback_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for [`ModuleLoader`](crate::loader::ModuleLoader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderConfig {
    /// Native/registry fallback policy
    pub fallback_policy: FallbackPolicy,
    /// Handler execution timeout in milliseconds
    pub handler_timeout_ms: u64,
    /// Retries after a transient fetch failure
    pub load_retries: u32,
    /// Backoff before the first retry, doubled per attempt
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff
    pub max_backoff_ms: u64,
}

impl LoaderConfig {
    /// Config with defaults and the given policy
    pub fn new(fallback_policy: FallbackPolicy) -> Self {
        Self {
            fallback_policy,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
            load_retries: DEFAULT_LOAD_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }

    /// Load from the config file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_layers(path, std::env::vars(), &[])
    }

    /// Load from a config file, environment pairs and explicit overrides.
    ///
    /// An explicit `path` must exist; the default path is skipped when absent.
    pub fn load_layers<I>(
        path: Option<&Path>,
        env: I,
        overrides: &[(&str, &str)],
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut raw = RawConfig::default();

        match path {
            Some(path) => raw.merge(RawConfig::from_file(path)?),
            None => {
                if let Some(default) = default_config_path() {
                    if default.is_file() {
                        raw.merge(RawConfig::from_file(&default)?);
                    }
                }
            }
        }

        for (key, value) in env {
            if let Some(key) = key.strip_prefix(ENV_PREFIX) {
                raw.set(&key.to_ascii_lowercase(), &value)?;
            }
        }

        for (key, value) in overrides {
            raw.set(key, value)?;
        }

        raw.finish()
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        raw.finish()
    }

    /// Set a single value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut raw = RawConfig::from(self.clone());
        raw.set(key, value)?;
        *self = raw.finish()?;
        Ok(())
    }

    /// Handler execution timeout
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Backoff to wait after failed attempt number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("spacey").join("loader.toml"))
}

/// One configuration layer, every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    fallback_policy: Option<FallbackPolicy>,
    handler_timeout_ms: Option<u64>,
    load_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

impl RawConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn merge(&mut self, other: RawConfig) {
        self.fallback_policy = other.fallback_policy.or(self.fallback_policy);
        self.handler_timeout_ms = other.handler_timeout_ms.or(self.handler_timeout_ms);
        self.load_retries = other.load_retries.or(self.load_retries);
        self.retry_backoff_ms = other.retry_backoff_ms.or(self.retry_backoff_ms);
        self.max_backoff_ms = other.max_backoff_ms.or(self.max_backoff_ms);
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let key = key.trim().to_ascii_lowercase().replace('-', "_");
        match key.as_str() {
            "fallback_policy" | "policy" => self.fallback_policy = Some(value.parse()?),
            "handler_timeout_ms" => self.handler_timeout_ms = Some(parse_number(&key, value)?),
            "load_retries" => self.load_retries = Some(parse_number(&key, value)?),
            "retry_backoff_ms" => self.retry_backoff_ms = Some(parse_number(&key, value)?),
            "max_backoff_ms" => self.max_backoff_ms = Some(parse_number(&key, value)?),
            _ => return Err(ConfigError::UnknownKey(key)),
        }
        Ok(())
    }

    fn finish(self) -> Result<LoaderConfig, ConfigError> {
        let policy = self.fallback_policy.ok_or(ConfigError::MissingPolicy)?;
        let mut config = LoaderConfig::new(policy);
        if let Some(ms) = self.handler_timeout_ms {
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "handler_timeout_ms".to_string(),
                    value: ms.to_string(),
                });
            }
            config.handler_timeout_ms = ms;
        }
        if let Some(retries) = self.load_retries {
            config.load_retries = retries;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = ms;
        }
        if let Some(ms) = self.max_backoff_ms {
            config.max_backoff_ms = ms;
        }
        Ok(config)
    }
}

impl From<LoaderConfig> for RawConfig {
    fn from(config: LoaderConfig) -> Self {
        Self {
            fallback_policy: Some(config.fallback_policy),
            handler_timeout_ms: Some(config.handler_timeout_ms),
            load_retries: Some(config.load_retries),
            retry_backoff_ms: Some(config.retry_backoff_ms),
            max_backoff_ms: Some(config.max_backoff_ms),
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
