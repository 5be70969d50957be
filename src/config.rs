//! Configuration for the permafrost backup pipeline.
//!
//! All settings come from the environment (or equivalent CLI flags), matching
//! how the service is deployed: one container, one environment.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;
use snafu::prelude::*;

use crate::error::{AddressParseSnafu, ConfigError};

/// 32 GiB - don't try to transfer a DAG that's bigger than this.
pub const DEFAULT_MAX_DAG_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Continuous backup of IPFS DAGs to S3-compatible object storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "permafrost")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Catalog (Postgres) connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// S3 region.
    #[arg(long, env = "S3_REGION")]
    pub s3_region: String,

    /// S3 bucket name.
    #[arg(long, env = "S3_BUCKET_NAME")]
    pub s3_bucket_name: String,

    /// S3 access key id. Falls back to ambient credentials when unset.
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key.
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// Custom S3 endpoint (e.g. a MinIO instance).
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// IPFS daemon RPC endpoint.
    #[arg(long, env = "IPFS_API_URL", default_value = "http://127.0.0.1:5001")]
    pub ipfs_api_url: String,

    /// Comma-separated peer multiaddrs to keep connected (e.g.
    /// /ip4/1.2.3.4/tcp/4001/p2p/12D3Koo...).
    #[arg(long, env = "PEER_ADDRS", value_delimiter = ',')]
    pub peer_addrs: Vec<String>,

    /// Minimum number of configured peers to keep connected.
    /// Defaults to all of them.
    #[arg(long, env = "MIN_CONNECTIONS")]
    pub min_connections: Option<usize>,

    /// Peer connectivity check interval in seconds.
    #[arg(long, env = "PEER_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub peer_check_interval_secs: u64,

    /// Concurrent export+upload attempts within a batch.
    #[arg(long, env = "CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    /// Candidates per batch. A batch is fully awaited (and garbage
    /// collected) before the next one starts.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Skip DAGs whose determinable size exceeds this many bytes.
    #[arg(long, env = "MAX_DAG_SIZE", default_value_t = DEFAULT_MAX_DAG_SIZE)]
    pub max_dag_size: u64,

    /// First day of catalog history to scan.
    #[arg(long, env = "START_DATE", default_value = "1970-01-01")]
    pub start_date: NaiveDate,

    /// Rows per catalog page within a day window.
    #[arg(long, env = "PAGE_SIZE", default_value_t = 10_000)]
    pub page_size: i64,

    /// Optional failure memory (Postgres) connection string. When unset,
    /// no failure bookkeeping occurs and every candidate is admitted.
    #[arg(long, env = "FAILURE_MEMORY_URL")]
    pub failure_memory_url: Option<String>,

    /// Failure codes that remain retryable on later scans. Failures with
    /// any other code cause the candidate to be skipped by the admission
    /// filter until the record is cleared.
    #[arg(
        long,
        env = "RETRYABLE_ERROR_CODES",
        value_delimiter = ',',
        default_value = "ERR_TIMEOUT"
    )]
    pub retryable_error_codes: Vec<String>,

    /// Metrics and health listen address.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Health endpoint reports failure after this many seconds without a
    /// heartbeat (unless the run is done).
    #[arg(long, env = "HEALTH_GRACE_PERIOD_SECS", default_value_t = 300)]
    pub health_grace_period_secs: u64,
}

impl Config {
    /// Validate the configuration. Called once at startup; any error here
    /// is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        if self.s3_bucket_name.is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        for addr in &self.peer_addrs {
            if !addr.contains("/p2p/") {
                return Err(ConfigError::PeerAddrMissingId { addr: addr.clone() });
            }
        }
        self.metrics_socket_addr()?;
        Ok(())
    }

    /// Parse the metrics listen address.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics_addr.parse().context(AddressParseSnafu {
            addr: self.metrics_addr.clone(),
        })
    }

    /// Health heartbeat grace period.
    pub fn health_grace_period(&self) -> Duration {
        Duration::from_secs(self.health_grace_period_secs)
    }

    /// Peer connectivity check interval.
    pub fn peer_check_interval(&self) -> Duration {
        Duration::from_secs(self.peer_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from([
            "permafrost",
            "--database-url",
            "postgresql://localhost/catalog",
            "--s3-region",
            "us-east-1",
            "--s3-bucket-name",
            "backup-test",
        ])
    }

    #[test]
    fn test_defaults() {
        let config = base_config();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.max_dag_size, 32 * 1024 * 1024 * 1024);
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        assert_eq!(config.retryable_error_codes, vec!["ERR_TIMEOUT"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let mut config = base_config();
        config.s3_access_key_id = Some("key".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartialCredentials)
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = base_config();
        config.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConcurrency)));
    }

    #[test]
    fn test_peer_addr_without_id_rejected() {
        let mut config = base_config();
        config.peer_addrs = vec!["/ip4/10.0.0.1/tcp/4001".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PeerAddrMissingId { .. })
        ));
    }

    #[test]
    fn test_bad_metrics_addr_rejected() {
        let mut config = base_config();
        config.metrics_addr = "not-an-addr".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AddressParse { .. })
        ));
    }
}
