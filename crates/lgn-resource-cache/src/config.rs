use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::{Error, Result};

/// The default filename for configuration files.
pub static DEFAULT_FILENAME: &str = "legion.toml";

/// Section of the configuration file holding the cache settings.
pub static SECTION: &str = "resource_cache";

/// The configuration of the resource cache.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceCacheConfig {
    /// Number of background loading threads. With `0`, loads only run on
    /// caller threads through `pump` and `force_load_now`.
    pub worker_count: usize,

    /// Bound on chained type override steps.
    pub max_override_steps: u32,

    /// Loads a caller drains while a full sweep waits on busy resources.
    pub progress_batch: usize,

    /// How long a full sweep waits for a background load before retrying.
    pub progress_wait_ms: u64,
}

impl Default for ResourceCacheConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_override_steps: 16,
            progress_batch: 4,
            progress_wait_ms: 5,
        }
    }
}

impl ResourceCacheConfig {
    /// Create a configuration from a TOML string.
    ///
    /// Useful for tests mostly.
    ///
    /// # Errors
    ///
    /// If the string is not valid TOML or holds invalid values.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::extract(&Figment::new().merge(Toml::string(toml)))
    }

    /// Load the configuration from `legion.toml` in the current working
    /// directory, overridden by `LGN_RESOURCE_CACHE_*` environment variables.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be loaded, an error is returned.
    pub fn load() -> Result<Self> {
        let path = std::env::current_dir()?;

        Self::load_with_current_directory(path)
    }

    /// Load a configuration, using the specified root as the current directory.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be loaded, an error is returned.
    pub fn load_with_current_directory(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref().join(DEFAULT_FILENAME)))
            .merge(
                Env::prefixed("LGN_RESOURCE_CACHE_")
                    .map(|key| format!("{}.{}", SECTION, key).into()),
            );

        Self::extract(&figment)
    }

    fn extract(figment: &Figment) -> Result<Self> {
        if !figment.contains(SECTION) {
            return Ok(Self::default());
        }
        figment
            .extract_inner(SECTION)
            .map_err(|err| Error::Configuration(Box::new(err)))
    }

    /// [`Self::progress_wait_ms`] as a `Duration`.
    pub fn progress_wait(&self) -> Duration {
        Duration::from_millis(self.progress_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_without_section() {
        let config = ResourceCacheConfig::from_toml("[other]\nvalue = 1").unwrap();
        assert_eq!(config, ResourceCacheConfig::default());
    }

    #[test]
    fn partial_section() {
        let config = ResourceCacheConfig::from_toml(
            r#"
            [resource_cache]
            worker_count = 0
            progress_batch = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 0);
        assert_eq!(config.progress_batch, 8);
        assert_eq!(config.max_override_steps, 16);
    }

    #[test]
    fn invalid_value() {
        let result = ResourceCacheConfig::from_toml("[resource_cache]\nworker_count = \"many\"");
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_config_with_environment_variable_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_FILENAME,
                r#"
                [resource_cache]
                worker_count = 4
                max_override_steps = 8
                "#,
            )?;
            jail.set_env("LGN_RESOURCE_CACHE_WORKER_COUNT", "1");

            let config = ResourceCacheConfig::load_with_current_directory(jail.directory())
                .unwrap();
            assert_eq!(config.worker_count, 1);
            assert_eq!(config.max_override_steps, 8);
            assert_eq!(config.progress_wait(), Duration::from_millis(5));

            Ok(())
        });
    }
}
