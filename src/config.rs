use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Process configuration, read once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub data_dir: PathBuf,
    pub retry_concurrency: usize,
    pub retry_batch_size: usize,
    pub drain_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_port(env::var("PORT").unwrap_or_else(|_| "3000".to_string()))?,
            environment: env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
            data_dir: PathBuf::from(
                env::var("PLEXER_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            retry_concurrency: parse_positive("RETRY_CONCURRENCY", 5)?,
            retry_batch_size: parse_positive("RETRY_BATCH_SIZE", 50)?,
            drain_timeout: Duration::from_millis(parse_positive("DRAIN_TIMEOUT_MS", 5000)? as u64),
        })
    }
}

/// Parse a listen port: whitespace is trimmed, the remainder must be a
/// 1-65535 integer with no residue.
fn parse_port(raw: String) -> Result<u16, ConfigError> {
    let port: u16 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name: "PORT".to_string(),
        reason: format!("'{}' is not an integer in 1-65535", raw.trim()),
    })?;

    if port == 0 {
        return Err(ConfigError::Invalid {
            name: "PORT".to_string(),
            reason: "port 0 is not a usable listen port".to_string(),
        });
    }

    Ok(port)
}

fn parse_positive(name: &str, default: usize) -> Result<usize, ConfigError> {
    let raw = match env::var(name) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };

    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid {
            name: name.to_string(),
            reason: format!("'{}' is not a positive integer", raw.trim()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "HOST",
            "PORT",
            "NODE_ENV",
            "PLEXER_DATA_DIR",
            "RETRY_CONCURRENCY",
            "RETRY_BATCH_SIZE",
            "DRAIN_TIMEOUT_MS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.environment, "development");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.retry_concurrency, 5);
        assert_eq!(cfg.retry_batch_size, 50);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_port_is_trimmed() {
        clear_env();
        env::set_var("PORT", "  8088  ");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8088);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_port_with_residue_is_rejected() {
        clear_env();
        env::set_var("PORT", "8088x");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_port_zero_is_rejected() {
        clear_env();
        env::set_var("PORT", "0");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_out_of_range_port_is_rejected() {
        clear_env();
        env::set_var("PORT", "70000");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_retry_tuning_must_be_positive() {
        clear_env();
        env::set_var("RETRY_CONCURRENCY", "0");
        assert!(Config::from_env().is_err());

        clear_env();
        env::set_var("RETRY_BATCH_SIZE", "-5");
        assert!(Config::from_env().is_err());

        clear_env();
        env::set_var("RETRY_CONCURRENCY", "8");
        env::set_var("RETRY_BATCH_SIZE", "100");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.retry_concurrency, 8);
        assert_eq!(cfg.retry_batch_size, 100);
        clear_env();
    }
}
