//! Operator configuration
//!
//! Every setting can be given as a flag or through its `EC2_OPERATOR_*`
//! environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::controller::{ReconcileTimings, RunnerSettings};
use crate::error::{Error, Result};

/// Which cloud backend to reconcile against
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// AWS EC2, credentials from the standard AWS provider chain
    Ec2,
    /// In-memory instances, for local clusters without AWS access
    Simulated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Cloud provider backend
    #[arg(long, env = "EC2_OPERATOR_PROVIDER", value_enum, default_value = "ec2")]
    pub provider: ProviderKind,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "EC2_OPERATOR_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "EC2_OPERATOR_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Requeue delay after launching an instance, in milliseconds
    #[arg(long, env = "EC2_OPERATOR_POST_CREATE_REQUEUE_MS", default_value_t = 1000)]
    pub post_create_requeue_ms: u64,

    /// Health check period for instances in sync, in seconds
    #[arg(long, env = "EC2_OPERATOR_STEADY_STATE_INTERVAL_SECS", default_value_t = 30)]
    pub steady_state_interval_secs: u64,

    /// Timeout for a single cloud provider call, in seconds
    #[arg(long, env = "EC2_OPERATOR_CLOUD_TIMEOUT_SECS", default_value_t = 30)]
    pub cloud_timeout_secs: u64,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "EC2_OPERATOR_BACKOFF_BASE_MS", default_value_t = 1000)]
    pub backoff_base_ms: u64,

    /// Upper bound for retry delays, in seconds
    #[arg(long, env = "EC2_OPERATOR_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Address for the /health and /metrics endpoints
    #[arg(long, env = "EC2_OPERATOR_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Log output format
    #[arg(long, env = "EC2_OPERATOR_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.cloud_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "cloud call timeout must be positive".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::ConfigError(
                "backoff base must be positive".to_string(),
            ));
        }
        if Duration::from_millis(self.backoff_base_ms) > Duration::from_secs(self.backoff_max_secs) {
            return Err(Error::ConfigError(format!(
                "backoff base ({}ms) exceeds backoff max ({}s)",
                self.backoff_base_ms, self.backoff_max_secs
            )));
        }
        Ok(())
    }

    pub fn timings(&self) -> ReconcileTimings {
        ReconcileTimings {
            post_create_requeue: Duration::from_millis(self.post_create_requeue_ms),
            steady_state_interval: Duration::from_secs(self.steady_state_interval_secs),
            cloud_call_timeout: Duration::from_secs(self.cloud_timeout_secs),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            workers: self.workers,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let argv = std::iter::once("ec2-operator").chain(args.iter().copied());
        TestCli::parse_from(argv).config
    }

    #[test]
    fn test_defaults_match_reconciler_defaults() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.timings(), ReconcileTimings::default());
        assert_eq!(config.runner_settings(), RunnerSettings::default());
        assert_eq!(config.http_addr.port(), 8080);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--provider",
            "simulated",
            "--workers",
            "8",
            "--steady-state-interval-secs",
            "60",
            "--log-format",
            "json",
        ]);
        assert_eq!(config.provider, ProviderKind::Simulated);
        assert_eq!(config.workers, 8);
        assert_eq!(config.timings().steady_state_interval, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = parse(&["--workers", "0"]);
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let config = parse(&["--backoff-base-ms", "600000", "--backoff-max-secs", "60"]);
        assert!(config.validate().is_err());
    }
}
