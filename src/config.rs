// Configuration module for insights
// Reads from environment variables with sensible defaults

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection pool size (INSIGHTS_POOL_SIZE)
    pub pool_size: u32,

    /// Database connection pool minimum idle connections (INSIGHTS_POOL_MIN_IDLE)
    pub pool_min_idle: u32,

    /// Back-off between polls of an idle transport, in ms (INSIGHTS_IDLE_MS)
    pub idle_ms: u64,

    /// Consecutive empty polls before the transport is treated as closed
    /// (INSIGHTS_MAX_IDLE_POLLS, 0 disables the limit)
    pub max_idle_polls: u32,

    /// Largest frame body accepted from a peer, in bytes (INSIGHTS_MAX_FRAME_BYTES)
    pub max_frame_bytes: usize,

    /// Longest cycle reported by cycle detection (INSIGHTS_CYCLE_MAX_DEPTH)
    pub cycle_max_depth: usize,

    /// Maximum number of cycles reported (INSIGHTS_MAX_CYCLES)
    pub max_cycles: usize,

    /// Hop limit for impact traversals (INSIGHTS_IMPACT_MAX_DEPTH)
    pub impact_max_depth: usize,

    /// Number of critical files reported (INSIGHTS_CRITICAL_LIMIT)
    pub critical_limit: usize,

    /// Command used to enrich chat summaries (INSIGHTS_NARRATOR_CMD)
    pub narrator_cmd: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 4,
            pool_min_idle: 1,
            idle_ms: 25,
            max_idle_polls: 40,
            max_frame_bytes: 16 * 1024 * 1024,
            cycle_max_depth: 10,
            max_cycles: 50,
            impact_max_depth: 5,
            critical_limit: 20,
            narrator_cmd: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        override_from_env("INSIGHTS_POOL_SIZE", &mut config.pool_size);
        override_from_env("INSIGHTS_POOL_MIN_IDLE", &mut config.pool_min_idle);
        override_from_env("INSIGHTS_IDLE_MS", &mut config.idle_ms);
        override_from_env("INSIGHTS_MAX_IDLE_POLLS", &mut config.max_idle_polls);
        override_from_env("INSIGHTS_MAX_FRAME_BYTES", &mut config.max_frame_bytes);
        override_from_env("INSIGHTS_CYCLE_MAX_DEPTH", &mut config.cycle_max_depth);
        override_from_env("INSIGHTS_MAX_CYCLES", &mut config.max_cycles);
        override_from_env("INSIGHTS_IMPACT_MAX_DEPTH", &mut config.impact_max_depth);
        override_from_env("INSIGHTS_CRITICAL_LIMIT", &mut config.critical_limit);

        if let Ok(cmd) = env::var("INSIGHTS_NARRATOR_CMD") {
            if !cmd.trim().is_empty() {
                config.narrator_cmd = Some(cmd);
            }
        }

        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }
}

fn override_from_env<T>(key: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Display,
{
    let Ok(val) = env::var(key) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %val, default = %slot, "invalid config value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.cycle_max_depth, 10);
        assert_eq!(config.max_cycles, 50);
        assert_eq!(config.impact_max_depth, 5);
        assert_eq!(config.critical_limit, 20);
        assert!(config.narrator_cmd.is_none());
    }

    #[test]
    fn test_override_ignores_garbage() {
        let mut depth = 10usize;
        // SAFETY: tests in this module do not read this key concurrently.
        unsafe { env::set_var("INSIGHTS_TEST_DEPTH_GARBAGE", "ten") };
        override_from_env("INSIGHTS_TEST_DEPTH_GARBAGE", &mut depth);
        assert_eq!(depth, 10);

        unsafe { env::set_var("INSIGHTS_TEST_DEPTH_OK", "7") };
        override_from_env("INSIGHTS_TEST_DEPTH_OK", &mut depth);
        assert_eq!(depth, 7);
    }
}
