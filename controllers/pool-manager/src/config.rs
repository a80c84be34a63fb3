//! Controller configuration, read from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9386";
const DEFAULT_RECONCILE_CONCURRENCY: u16 = 3;
const DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS: u64 = 300;

/// Runtime configuration of the controller
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address of the `/metrics` and `/healthz` endpoints
    pub metrics_addr: SocketAddr,
    /// Concurrent reconciliations per watched resource
    pub reconcile_concurrency: u16,
    /// Interval between sweeps for blocks of deleted nodes
    pub orphan_sweep_interval: Duration,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let metrics_addr = lookup("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR: {}", e)))?;

        let reconcile_concurrency = match lookup("RECONCILE_CONCURRENCY") {
            Some(value) => value
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("RECONCILE_CONCURRENCY: {}", e)))?,
            None => DEFAULT_RECONCILE_CONCURRENCY,
        };
        if reconcile_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let sweep_secs = match lookup("ORPHAN_SWEEP_INTERVAL_SECS") {
            Some(value) => value
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("ORPHAN_SWEEP_INTERVAL_SECS: {}", e)))?,
            None => DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS,
        };
        if sweep_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "ORPHAN_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            metrics_addr,
            reconcile_concurrency,
            orphan_sweep_interval: Duration::from_secs(sweep_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.metrics_addr, "0.0.0.0:9386".parse().unwrap());
        assert_eq!(config.reconcile_concurrency, 3);
        assert_eq!(config.orphan_sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("METRICS_ADDR", "127.0.0.1:8080"),
            ("RECONCILE_CONCURRENCY", "8"),
            ("ORPHAN_SWEEP_INTERVAL_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.metrics_addr.port(), 8080);
        assert_eq!(config.reconcile_concurrency, 8);
        assert_eq!(config.orphan_sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("METRICS_ADDR", "not-an-address")],
            [("RECONCILE_CONCURRENCY", "0")],
            [("RECONCILE_CONCURRENCY", "many")],
            [("ORPHAN_SWEEP_INTERVAL_SECS", "0")],
        ] {
            assert!(
                matches!(config_from(&vars), Err(ControllerError::InvalidConfig(_))),
                "{:?} should be rejected",
                vars
            );
        }
    }
}
