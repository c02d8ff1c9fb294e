// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::IoError;
use serde::Deserialize;

/// Configuration of the filesystem IO backend.
///
/// Usually read from the `[io]` table of a TOML file:
///
/// ```toml
/// [io]
/// worker_count = 4
/// thread_name = "io thread"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    /// Number of IO worker threads.
    pub worker_count: usize,
    /// Name prefix of the IO worker threads.
    pub thread_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    io: IoConfig,
}

impl IoConfig {
    /// Environment variable overriding [`IoConfig::worker_count`].
    pub const WORKERS_ENV: &'static str = "WEFT_IO_WORKERS";

    /// Parses the `[io]` table of a TOML document, missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Config`] if the document is not valid TOML or the table has
    /// unexpected keys or types.
    pub fn from_toml(source: &str) -> Result<Self, IoError> {
        let file: ConfigFile =
            toml::from_str(source).map_err(|err| IoError::Config(err.to_string()))?;
        Ok(file.io)
    }

    /// Parses `source` like [`IoConfig::from_toml`] and applies the environment overrides.
    ///
    /// # Errors
    ///
    /// See [`IoConfig::from_toml`] and [`IoConfig::with_env_overrides`].
    pub fn load(source: &str) -> Result<Self, IoError> {
        Self::from_toml(source)?.with_env_overrides()
    }

    /// Applies the [`WORKERS_ENV`](Self::WORKERS_ENV) override, if set.
    ///
    /// Backends never read the environment themselves, a config passed to
    /// [`FilesystemIoBackend::new`](crate::FilesystemIoBackend::new) is used as is. Call this
    /// (or [`IoConfig::load`]) to opt in.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Config`] if the variable is set but not a positive integer.
    pub fn with_env_overrides(self) -> Result<Self, IoError> {
        self.with_worker_override(std::env::var(Self::WORKERS_ENV).ok().as_deref())
    }

    fn with_worker_override(mut self, value: Option<&str>) -> Result<Self, IoError> {
        if let Some(value) = value {
            self.worker_count = value
                .trim()
                .parse()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| {
                    IoError::Config(format!(
                        "{} must be a positive integer, got {value:?}",
                        Self::WORKERS_ENV
                    ))
                })?;
            tracing::debug!(worker_count = self.worker_count, "IO worker count overridden");
        }
        Ok(self)
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            thread_name: String::from("io thread"),
        }
    }
}
