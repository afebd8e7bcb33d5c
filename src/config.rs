// Region configuration - env-driven, one value set per process

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings for one region.
///
/// `region` is the identity stamped onto outgoing change events and used to
/// discard our own echoes; nothing else in the system knows which region it
/// is running in.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub region: String,
    pub port: u16,
    /// None means an in-memory database (demo and test runs).
    pub database_path: Option<PathBuf>,
    pub log_connect_attempts: u32,
    pub log_connect_delay: Duration,
}

impl RegionConfig {
    /// Defaults for everything except the region identity.
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            port: 8000,
            database_path: None,
            log_connect_attempts: 5,
            log_connect_delay: Duration::from_secs(3),
        }
    }

    /// Read configuration from the environment. `REGION` is required; the
    /// rest fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let region = std::env::var("REGION").context("REGION environment variable is required")?;

        let mut config = Self::new(&region);

        if let Ok(port) = std::env::var("PORT") {
            config.port = port.parse().context("PORT must be a number")?;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(attempts) = std::env::var("LOG_CONNECT_ATTEMPTS") {
            config.log_connect_attempts = attempts
                .parse()
                .context("LOG_CONNECT_ATTEMPTS must be a number")?;
        }
        if let Ok(delay) = std::env::var("LOG_CONNECT_DELAY_SECS") {
            let secs: u64 = delay.parse().context("LOG_CONNECT_DELAY_SECS must be a number")?;
            config.log_connect_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegionConfig::new("us");
        assert_eq!(config.region, "us");
        assert_eq!(config.port, 8000);
        assert!(config.database_path.is_none());
        assert_eq!(config.log_connect_attempts, 5);
        assert_eq!(config.log_connect_delay, Duration::from_secs(3));
    }
}
