// ABOUTME: Configuration loading and validation for the hybrid storage layer.
// ABOUTME: Reads INSIGHTDECK_* environment variables for the database path, flush policy, and retry policy.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid non-negative integer: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },

    #[error("INSIGHTDECK_RETRY_MIN_MS ({min}) is greater than INSIGHTDECK_RETRY_MAX_MS ({max})")]
    RetryWindow { min: u64, max: u64 },
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Pending-entry count that triggers a flush.
    pub batch_size: usize,
    /// A pending entry older than this triggers a flush.
    pub max_delay: Duration,
    /// Period of the background flush timer.
    pub flush_interval: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    /// Failed attempts after which an operation is dead-lettered.
    pub max_attempts: u32,
    /// Upper bound on how long shutdown waits for the queue to drain.
    pub shutdown_grace: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("insightdeck.db"),
            batch_size: 10,
            max_delay: Duration::from_millis(1000),
            flush_interval: Duration::from_millis(1000),
            retry_min: Duration::from_millis(1000),
            retry_max: Duration::from_millis(3000),
            max_attempts: 5,
            shutdown_grace: Duration::from_millis(10_000),
        }
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        _ => Ok(default),
    }
}

fn env_nonzero(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = env_u64(var, default)?;
    if value == 0 {
        return Err(ConfigError::Zero { var });
    }
    Ok(value)
}

impl StorageConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - INSIGHTDECK_DATABASE_PATH: SQLite file (default: insightdeck.db)
    /// - INSIGHTDECK_FLUSH_BATCH_SIZE: size trigger (default: 10)
    /// - INSIGHTDECK_FLUSH_MAX_DELAY_MS: age trigger (default: 1000)
    /// - INSIGHTDECK_FLUSH_INTERVAL_MS: timer period (default: 1000)
    /// - INSIGHTDECK_RETRY_MIN_MS / INSIGHTDECK_RETRY_MAX_MS: retry jitter window (default: 1000..3000)
    /// - INSIGHTDECK_RETRY_MAX_ATTEMPTS: attempts before dead-lettering (default: 5)
    /// - INSIGHTDECK_SHUTDOWN_GRACE_MS: drain bound at shutdown (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = std::env::var("INSIGHTDECK_DATABASE_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let batch_size = env_nonzero("INSIGHTDECK_FLUSH_BATCH_SIZE", defaults.batch_size as u64)?;
        let max_delay = env_u64("INSIGHTDECK_FLUSH_MAX_DELAY_MS", 1000)?;
        let flush_interval = env_nonzero("INSIGHTDECK_FLUSH_INTERVAL_MS", 1000)?;
        let retry_min = env_u64("INSIGHTDECK_RETRY_MIN_MS", 1000)?;
        let retry_max = env_u64("INSIGHTDECK_RETRY_MAX_MS", 3000)?;
        let max_attempts = env_nonzero("INSIGHTDECK_RETRY_MAX_ATTEMPTS", defaults.max_attempts as u64)?;
        let shutdown_grace = env_u64("INSIGHTDECK_SHUTDOWN_GRACE_MS", 10_000)?;

        if retry_min > retry_max {
            return Err(ConfigError::RetryWindow {
                min: retry_min,
                max: retry_max,
            });
        }

        Ok(Self {
            database_path,
            batch_size: usize::try_from(batch_size).unwrap_or(usize::MAX),
            max_delay: Duration::from_millis(max_delay),
            flush_interval: Duration::from_millis(flush_interval),
            retry_min: Duration::from_millis(retry_min),
            retry_max: Duration::from_millis(retry_max),
            max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
            shutdown_grace: Duration::from_millis(shutdown_grace),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that manipulate process-wide env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 8] = [
        "INSIGHTDECK_DATABASE_PATH",
        "INSIGHTDECK_FLUSH_BATCH_SIZE",
        "INSIGHTDECK_FLUSH_MAX_DELAY_MS",
        "INSIGHTDECK_FLUSH_INTERVAL_MS",
        "INSIGHTDECK_RETRY_MIN_MS",
        "INSIGHTDECK_RETRY_MAX_MS",
        "INSIGHTDECK_RETRY_MAX_ATTEMPTS",
        "INSIGHTDECK_SHUTDOWN_GRACE_MS",
    ];

    fn clear_env() {
        // SAFETY: test-only code, serialized by ENV_MUTEX
        unsafe {
            for var in VARS {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn config_loads_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = StorageConfig::from_env().unwrap();

        assert_eq!(config.database_path, PathBuf::from("insightdeck.db"));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_delay, Duration::from_secs(1));
        assert_eq!(config.retry_min, Duration::from_secs(1));
        assert_eq!(config.retry_max, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn config_reads_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        // SAFETY: test-only code, serialized by ENV_MUTEX
        unsafe {
            std::env::set_var("INSIGHTDECK_DATABASE_PATH", "/var/lib/insightdeck/data.db");
            std::env::set_var("INSIGHTDECK_FLUSH_BATCH_SIZE", "25");
            std::env::set_var("INSIGHTDECK_RETRY_MAX_ATTEMPTS", "8");
        }

        let config = StorageConfig::from_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/insightdeck/data.db"));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_attempts, 8);
    }

    #[test]
    fn config_rejects_bad_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        // SAFETY: test-only code, serialized by ENV_MUTEX
        unsafe { std::env::set_var("INSIGHTDECK_FLUSH_BATCH_SIZE", "ten") };
        let err = StorageConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("INSIGHTDECK_FLUSH_BATCH_SIZE"), "{err}");

        // SAFETY: test-only code, serialized by ENV_MUTEX
        unsafe { std::env::set_var("INSIGHTDECK_FLUSH_BATCH_SIZE", "0") };
        assert!(matches!(StorageConfig::from_env(), Err(ConfigError::Zero { .. })));

        clear_env();
        // SAFETY: test-only code, serialized by ENV_MUTEX
        unsafe {
            std::env::set_var("INSIGHTDECK_RETRY_MIN_MS", "5000");
            std::env::set_var("INSIGHTDECK_RETRY_MAX_MS", "1000");
        }
        let result = StorageConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::RetryWindow { min: 5000, max: 1000 })));
    }
}
