//! Pool configuration.
//!
//! Loaded from environment variables:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `GRPC_CONN_TARGETS` | required | `name=address` pairs, comma separated |
//! | `GRPC_CONN_INSECURE` | `false` | Dial without TLS |
//! | `GRPC_CONN_CONNECT_TIMEOUT_MS` | unset | Bound on a single dial |
//! | `GRPC_CONN_RPC_TIMEOUT_MS` | unset | Per-RPC timeout |
//! | `GRPC_CONN_BACKOFF_INITIAL_MS` | `1000` | First retry delay |
//! | `GRPC_CONN_BACKOFF_MAX_MS` | `5000` | Retry delay cap |
//! | `GRPC_CONN_BACKOFF_JITTER` | `0.2` | Jitter ratio |

use crate::backoff::{ExponentialBackoff, DEFAULT_BACKOFF_JITTER};
use crate::errors::ValidationError;
use crate::options::Options;
use crate::pool::Pool;
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const TARGETS_VAR: &str = "GRPC_CONN_TARGETS";
pub const INSECURE_VAR: &str = "GRPC_CONN_INSECURE";
pub const CONNECT_TIMEOUT_VAR: &str = "GRPC_CONN_CONNECT_TIMEOUT_MS";
pub const RPC_TIMEOUT_VAR: &str = "GRPC_CONN_RPC_TIMEOUT_MS";
pub const BACKOFF_INITIAL_VAR: &str = "GRPC_CONN_BACKOFF_INITIAL_MS";
pub const BACKOFF_MAX_VAR: &str = "GRPC_CONN_BACKOFF_MAX_MS";
pub const BACKOFF_JITTER_VAR: &str = "GRPC_CONN_BACKOFF_JITTER";

/// Default first retry delay in milliseconds.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1000;

/// Default retry delay cap in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// One configured connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: String,
}

/// Configuration for a [`Pool`] of supervisors sharing one set of options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections, in the order they were listed.
    pub targets: Vec<Target>,

    /// Dial without TLS (default: false).
    pub insecure: bool,

    /// Bound on a single dial (default: none).
    pub connect_timeout: Option<Duration>,

    /// Per-RPC timeout (default: none).
    pub rpc_timeout: Option<Duration>,

    /// Retry delays between failed dials.
    pub backoff: ExponentialBackoff,
}

impl PoolConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`PoolConfig::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` if no targets are configured, `InvalidValue` for
    /// anything unparsable, `Validation` for an out-of-range backoff.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let targets = parse_targets(
            vars.get(TARGETS_VAR)
                .ok_or_else(|| ConfigError::MissingEnvVar(TARGETS_VAR.to_string()))?,
        )?;

        let insecure = match vars.get(INSECURE_VAR).map(|s| s.trim().to_ascii_lowercase()) {
            None => false,
            Some(value) => match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "{INSECURE_VAR} must be a boolean, got {value:?}"
                    )))
                }
            },
        };

        let connect_timeout = parse_var::<u64>(vars, CONNECT_TIMEOUT_VAR)?.map(Duration::from_millis);
        let rpc_timeout = parse_var::<u64>(vars, RPC_TIMEOUT_VAR)?.map(Duration::from_millis);

        let initial = parse_var::<u64>(vars, BACKOFF_INITIAL_VAR)?
            .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS);
        let max = parse_var::<u64>(vars, BACKOFF_MAX_VAR)?.unwrap_or(DEFAULT_BACKOFF_MAX_MS);
        let jitter = parse_var::<f64>(vars, BACKOFF_JITTER_VAR)?.unwrap_or(DEFAULT_BACKOFF_JITTER);

        let backoff = ExponentialBackoff::new(
            Duration::from_millis(initial),
            Duration::from_millis(max),
            jitter,
        )?;

        Ok(PoolConfig {
            targets,
            insecure,
            connect_timeout,
            rpc_timeout,
            backoff,
        })
    }

    /// Options shared by every supervisor in the pool.
    #[must_use]
    pub fn options(&self) -> Options {
        let mut options = if self.insecure {
            Options::insecure()
        } else {
            Options::secure()
        }
        .with_retry(self.backoff);

        if let Some(timeout) = self.connect_timeout {
            options = options.with_connect_timeout(timeout);
        }
        if let Some(timeout) = self.rpc_timeout {
            options = options.with_rpc_timeout(timeout);
        }
        options
    }

    /// Build an unstarted pool with one supervisor per target.
    ///
    /// # Errors
    ///
    /// `ConfigError::Validation` if a target fails supervisor validation.
    pub fn build_pool(&self) -> Result<Pool, ConfigError> {
        let options = self.options();
        let supervisors = self
            .targets
            .iter()
            .map(|target| Supervisor::new(&target.name, &target.address, [options.clone()]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pool::new(supervisors))
    }
}

fn parse_targets(raw: &str) -> Result<Vec<Target>, ConfigError> {
    let targets = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, address) = entry.split_once('=').ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "{TARGETS_VAR} entry {entry:?} is not name=address"
                ))
            })?;
            Ok(Target {
                name: name.trim().to_string(),
                address: address.trim().to_string(),
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    if targets.is_empty() {
        return Err(ConfigError::MissingEnvVar(TARGETS_VAR.to_string()));
    }
    Ok(targets)
}

fn parse_var<T: FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, ConfigError> {
    vars.get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                ConfigError::InvalidValue(format!("{key} could not be parsed from {raw:?}"))
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::options::TransportSecurity;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            TARGETS_VAR.to_string(),
            "inventory=inventory:50051,billing=https://billing.internal".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = PoolConfig::from_vars(&base_vars()).unwrap();

        assert_eq!(
            config.targets,
            vec![
                Target {
                    name: "inventory".to_string(),
                    address: "inventory:50051".to_string(),
                },
                Target {
                    name: "billing".to_string(),
                    address: "https://billing.internal".to_string(),
                },
            ]
        );
        assert!(!config.insecure);
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.rpc_timeout, None);
        assert_eq!(config.backoff, ExponentialBackoff::default());
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert(INSECURE_VAR.to_string(), "true".to_string());
        vars.insert(CONNECT_TIMEOUT_VAR.to_string(), "2500".to_string());
        vars.insert(RPC_TIMEOUT_VAR.to_string(), "10000".to_string());
        vars.insert(BACKOFF_INITIAL_VAR.to_string(), "200".to_string());
        vars.insert(BACKOFF_MAX_VAR.to_string(), "3000".to_string());
        vars.insert(BACKOFF_JITTER_VAR.to_string(), "0".to_string());

        let config = PoolConfig::from_vars(&vars).unwrap();

        assert!(config.insecure);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.rpc_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.backoff.initial(), Duration::from_millis(200));
        assert_eq!(config.backoff.max(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_targets() {
        let result = PoolConfig::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(ref var)) if var == TARGETS_VAR),
            "Expected MissingEnvVar error, got {result:?}"
        );
    }

    #[test]
    fn test_blank_targets() {
        let vars = HashMap::from([(TARGETS_VAR.to_string(), " , ".to_string())]);
        let result = PoolConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_malformed_target() {
        let vars = HashMap::from([(TARGETS_VAR.to_string(), "inventory:50051".to_string())]);
        let result = PoolConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_numeric_value() {
        let mut vars = base_vars();
        vars.insert(CONNECT_TIMEOUT_VAR.to_string(), "soon".to_string());
        let result = PoolConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains(CONNECT_TIMEOUT_VAR)));
    }

    #[test]
    fn test_invalid_boolean() {
        let mut vars = base_vars();
        vars.insert(INSECURE_VAR.to_string(), "maybe".to_string());
        assert!(matches!(
            PoolConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_backoff_out_of_range() {
        let mut vars = base_vars();
        vars.insert(BACKOFF_INITIAL_VAR.to_string(), "6000".to_string());
        let result = PoolConfig::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::Validation(ValidationError::InvalidBackoff(_)))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let mut vars = base_vars();
        vars.insert(INSECURE_VAR.to_string(), "1".to_string());
        vars.insert(CONNECT_TIMEOUT_VAR.to_string(), "750".to_string());
        vars.insert(RPC_TIMEOUT_VAR.to_string(), "3000".to_string());

        let options = PoolConfig::from_vars(&vars).unwrap().options();

        assert!(matches!(options.dial.security, TransportSecurity::Insecure));
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(750)));
        assert_eq!(options.dial.rpc_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_build_pool() {
        let pool = PoolConfig::from_vars(&base_vars())
            .unwrap()
            .build_pool()
            .unwrap();

        assert_eq!(pool.names(), vec!["billing", "inventory"]);
        assert!(pool.iter().all(|(_, supervisor)| !supervisor.is_started()));
    }

    #[test]
    fn test_build_pool_rejects_bad_address() {
        let vars = HashMap::from([(TARGETS_VAR.to_string(), "inventory=inventory".to_string())]);
        let result = PoolConfig::from_vars(&vars).unwrap().build_pool();
        assert!(matches!(
            result,
            Err(ConfigError::Validation(ValidationError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_build_pool_rejects_empty_name() {
        let vars = HashMap::from([(TARGETS_VAR.to_string(), "=inventory:50051".to_string())]);
        let result = PoolConfig::from_vars(&vars).unwrap().build_pool();
        assert!(matches!(
            result,
            Err(ConfigError::Validation(ValidationError::EmptyName))
        ));
    }
}
