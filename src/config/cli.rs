//! Command-line argument parsing for `cbkv`

use std::time::Duration;

use clap::{Parser, Subcommand};

use super::client_config::{ClientConfig, ServerAddress};
use crate::cluster::config_map::{parse_host_port, DEFAULT_KV_PORT};

/// Key-value command-line client for Couchbase-style clusters
#[derive(Parser, Debug, Clone)]
#[command(name = "cbkv")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
#[allow(clippy::manual_non_exhaustive)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    // ===== Connection Options =====
    /// Seed node, `host` or `host:port` (repeat for several seeds)
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Port for seeds given without one
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_KV_PORT)]
    pub port: u16,

    /// Bucket to select
    #[arg(short = 'b', long = "bucket", default_value = "default")]
    pub bucket: String,

    /// SASL PLAIN username
    #[arg(short = 'u', long = "user")]
    pub username: Option<String>,

    /// SASL PLAIN password (requires --user)
    #[arg(short = 'a', long = "password")]
    pub password: Option<String>,

    /// Per-operation timeout in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 2500)]
    pub timeout_ms: u64,

    /// Hash keys over the seeds instead of fetching a cluster map
    #[arg(long = "ketama")]
    pub ketama: bool,

    // ===== Output Options =====
    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Errors only
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a document
    Get { key: String },
    /// Store a document
    Set {
        key: String,
        value: String,
        /// Expiry in seconds
        #[arg(short = 'e', long = "expiry", default_value_t = 0)]
        expiry: u32,
        /// Only store if unchanged since this CAS
        #[arg(long = "cas", default_value_t = 0)]
        cas: u64,
    },
    /// Remove a document
    Delete { key: String },
    /// Increment a counter
    Incr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
        /// Value stored when the counter does not exist
        #[arg(long = "initial")]
        initial: Option<u64>,
    },
    /// Decrement a counter
    Decr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
        #[arg(long = "initial")]
        initial: Option<u64>,
    },
    /// Print per-node health
    Diag {
        /// Emit JSON instead of a table
        #[arg(long = "json")]
        json: bool,
    },
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.password.is_some() && self.username.is_none() {
            return Err("--password requires --user to be set".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("--timeout must be positive".to_string());
        }
        Ok(())
    }

    /// Build a client configuration; the CLI never polls for new maps
    pub fn to_client_config(&self) -> Result<ClientConfig, String> {
        self.validate()?;

        let seeds = self
            .hosts
            .iter()
            .map(|h| {
                parse_host_port(h, self.port)
                    .map(|a| ServerAddress::new(a.host, a.kv_port))
                    .map_err(|e| e.to_string())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = ClientConfig {
            seeds,
            bucket: self.bucket.clone(),
            kv_timeout: Duration::from_millis(self.timeout_ms),
            config_poll_interval: None,
            ..Default::default()
        };
        if self.ketama {
            config.locator = super::LocatorMode::Ketama;
        }
        if let Some(user) = &self.username {
            config = config.with_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}
