//! Optional file-based configuration.
//!
//! Settings start from built-in defaults and are amended by an optional TOML
//! file named by the `APIARY_CONF` environment variable (falling back to
//! `config/apiary.toml`). A missing file is not an error; a present but
//! malformed one is.

use std::{env, fs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Lowest record level emitted: trace, debug, info, warning, error or
    /// critical. Anything unparsable falls back to info.
    pub level: String,
    /// Where records go: "stdout", "stderr" or "discard".
    pub destination: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "debug".into(),
            destination: "stdout".into(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            return;
        };
        if let Some(level) = table.get("level").and_then(|v| v.as_str()) {
            self.level = level.to_string();
        }
        if let Some(destination) = table.get("destination").and_then(|v| v.as_str()) {
            self.destination = destination.to_string();
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker threads per framework; zero means one per logical CPU.
    pub thread_count: u32,
    /// Milliseconds between manager-thread passes over the worker pool.
    pub manager_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            thread_count: 16,
            manager_interval_ms: 100,
        }
    }
}

impl SchedulerConfig {
    fn merge(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            return;
        };
        if let Some(count) = table.get("thread_count").and_then(|v| v.as_integer()) {
            self.thread_count = count.max(0) as u32;
        }
        if let Some(interval) = table.get("manager_interval_ms").and_then(|v| v.as_integer()) {
            self.manager_interval_ms = interval.max(1) as u64;
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Size-class pools per envelope cache.
    pub max_pools: u32,
    /// Cached free blocks per pool.
    pub max_blocks: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_pools: crate::alloc::cache::DEFAULT_MAX_POOLS as u32,
            max_blocks: crate::alloc::cache::DEFAULT_MAX_BLOCKS,
        }
    }
}

impl CacheConfig {
    fn merge(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            return;
        };
        if let Some(pools) = table.get("max_pools").and_then(|v| v.as_integer()) {
            self.max_pools = pools.max(2) as u32;
        }
        if let Some(blocks) = table.get("max_blocks").and_then(|v| v.as_integer()) {
            self.max_blocks = blocks.max(0) as u32;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Emit verbose lifecycle diagnostics (worker and actor churn).
    pub debug: bool,
    pub log: LogConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: true,
            log: LogConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    fn merge(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            return;
        };
        if let Some(debug) = table.get("debug").and_then(|v| v.as_bool()) {
            self.debug = debug;
        }
        if let Some(log) = table.get("log") {
            self.log.merge(log);
        }
        if let Some(scheduler) = table.get("scheduler") {
            self.scheduler.merge(scheduler);
        }
        if let Some(cache) = table.get("cache") {
            self.cache.merge(cache);
        }
    }

    /// Loads the configuration, merging the config file over the defaults
    /// if one exists.
    pub fn load() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        let path = env::var("APIARY_CONF").unwrap_or_else(|_| "config/apiary.toml".into());
        if let Ok(contents) = fs::read_to_string(path) {
            let value = toml::from_str::<toml::Value>(&contents)?;
            config.merge(&value);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.debug);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.destination, "stdout");
        assert_eq!(config.scheduler.thread_count, 16);
        assert_eq!(config.scheduler.manager_interval_ms, 100);
        assert_eq!(config.cache.max_pools, 8);
        assert_eq!(config.cache.max_blocks, 16);
    }

    #[test]
    fn merges_partial_tables() {
        let mut config = Config::default();
        let value = toml::from_str::<toml::Value>(
            r#"
            debug = false

            [log]
            level = "error"

            [scheduler]
            thread_count = 4

            [cache]
            max_blocks = 32
            "#,
        )
        .unwrap();

        config.merge(&value);

        assert!(!config.debug);
        assert_eq!(config.log.level, "error");
        assert_eq!(config.log.destination, "stdout");
        assert_eq!(config.scheduler.thread_count, 4);
        assert_eq!(config.scheduler.manager_interval_ms, 100);
        assert_eq!(config.cache.max_blocks, 32);
        assert_eq!(config.cache.max_pools, 8);
    }

    #[test]
    fn ignores_unrelated_tables() {
        let mut config = Config::default();
        let value = toml::from_str::<toml::Value>("[metrics]\nenabled = true\n").unwrap();
        config.merge(&value);
        assert!(config.debug);
        assert_eq!(config.scheduler.thread_count, 16);
    }
}
