//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `TRELLIS_DATABASE_URL`: PostgreSQL connection string (required)
//! - `TRELLIS_POLL_INTERVAL_MS`: Worker poll interval (default: 100)
//! - `TRELLIS_BATCH_SIZE`: Tasks to claim per poll (default: max_concurrent)
//! - `TRELLIS_MAX_CONCURRENT`: Max in-flight handlers per worker (default: num_cpus * 2)
//! - `TRELLIS_LEASE_MARGIN_SECS`: Lease slack past the handler timeout (default: 2)

use std::{env, time::Duration};

use anyhow::{Context, Result};

use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Worker poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Number of tasks to claim per poll cycle
    pub batch_size: usize,

    /// Maximum concurrently executing handlers per worker
    pub max_concurrent: usize,

    /// Seconds added to a task's handler timeout when leasing
    pub lease_margin_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("TRELLIS_DATABASE_URL")
            .context("TRELLIS_DATABASE_URL environment variable is required")?;

        let poll_interval_ms = env::var("TRELLIS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let max_concurrent = env::var("TRELLIS_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get().max(1) * 2);

        // Default batch_size to the concurrency limit (max available slots).
        let batch_size = env::var("TRELLIS_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(max_concurrent);

        let lease_margin_secs = env::var("TRELLIS_LEASE_MARGIN_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        Ok(Self {
            database_url,
            poll_interval_ms,
            batch_size,
            max_concurrent,
            lease_margin_secs,
        })
    }

    /// Worker settings for one flow, derived from this configuration.
    pub fn worker_config(&self, flow_slug: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            flow_slug: flow_slug.into(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            lease_margin_secs: self.lease_margin_secs,
        }
    }
}
