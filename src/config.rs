//! Command line and environment configuration.

use crate::services::{RetryPolicy, TrackerClientConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Sprint and team productivity reports over issue tracker data.
#[derive(Parser, Debug, Clone)]
#[command(name = "sprint-reports")]
#[command(about = "Sprint and team productivity reports aggregated from issue trackers")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Directory holding the SQLite database
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Per-request tracker timeout in seconds
    #[arg(long, env = "TRACKER_TIMEOUT_SECS", default_value = "30")]
    pub tracker_timeout_secs: u64,

    /// Attempts per tracker request, including the first
    #[arg(long, env = "TRACKER_RETRY_ATTEMPTS", default_value = "4")]
    pub retry_attempts: u32,

    /// Initial backoff delay in milliseconds
    #[arg(long, env = "TRACKER_RETRY_BASE_MS", default_value = "250")]
    pub retry_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[arg(long, env = "TRACKER_RETRY_MAX_MS", default_value = "10000")]
    pub retry_max_ms: u64,

    /// Items requested per tracker page
    #[arg(long, env = "TRACKER_PAGE_SIZE", default_value = "100")]
    pub page_size: u32,

    /// Create an admin with this name if no admin exists yet
    #[arg(long, env = "BOOTSTRAP_ADMIN")]
    pub bootstrap_admin: Option<String>,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn client_config(&self) -> TrackerClientConfig {
        TrackerClientConfig {
            timeout: Duration::from_secs(self.tracker_timeout_secs.max(1)),
            page_size: self.page_size.clamp(1, 1000),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
                jitter: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["sprint-reports"]);
        assert_eq!(args.listen.port(), 8080);
        assert!(args.bootstrap_admin.is_none());

        let config = args.client_config();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn test_flags_override() {
        let args = Args::parse_from([
            "sprint-reports",
            "--retry-attempts",
            "0",
            "--retry-base-ms",
            "500",
            "--retry-max-ms",
            "100",
            "--page-size",
            "5000",
        ]);
        let config = args.client_config();

        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.max_delay, Duration::from_millis(500));
        assert_eq!(config.page_size, 1000);
    }
}
