//! CLI for coordination store operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use coordkv::common::{parse_duration, retry_with_backoff};
use coordkv::{
    is_valid_as_key_path, Config, Coordinator, DeleteOptions, GetOptions, LeaseId, WatchOptions,
};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coordctl")]
#[command(about = "coordkv coordination store CLI")]
#[command(version)]
struct Cli {
    /// Config file (json, yaml or toml); defaults plus COORDKV_* env otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store endpoints (comma-separated), overrides the config file
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Dial timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Request timeout in seconds
    #[arg(long)]
    req_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a value
    Put {
        key: String,
        value: String,

        /// Bind the key to a new lease with this TTL (seconds)
        #[arg(long, conflicts_with = "rev")]
        ttl: Option<i64>,

        /// Only write if the key's mod revision still equals this
        #[arg(long)]
        rev: Option<i64>,
    },

    /// Get a key or prefix
    Get {
        key: String,

        #[arg(long)]
        prefix: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a key or prefix
    Del {
        key: String,

        #[arg(long)]
        prefix: bool,
    },

    /// Grant a lease
    Grant {
        /// TTL in seconds
        ttl: i64,
    },

    /// Revoke a lease (hex id as printed by `grant`)
    Revoke {
        #[arg(value_parser = parse_lease_id)]
        id: LeaseId,
    },

    /// Take a distributed lock under a new lease
    Lock {
        name: String,

        /// Lease TTL in seconds; the lock frees itself after this
        #[arg(long, default_value = "10")]
        ttl: i64,

        /// Keep trying for this long (e.g. "30s") if the lock is busy
        #[arg(long, value_parser = parse_wait)]
        wait: Option<Duration>,
    },

    /// Release a distributed lock
    Unlock { name: String },

    /// Stream changes of a key or prefix
    Watch {
        key: String,

        #[arg(long)]
        prefix: bool,

        /// Replay from this revision
        #[arg(long)]
        rev: Option<i64>,
    },
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn parse_lease_id(s: &str) -> Result<LeaseId, String> {
    i64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map(LeaseId)
        .map_err(|e| format!("invalid lease id {:?}: {}", s, e))
}

fn parse_wait(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn give_up_at(wait: Option<Duration>) -> anyhow::Result<tokio::time::Instant> {
    tokio::time::Instant::now()
        .checked_add(wait.unwrap_or_default())
        .context("lock wait is too long")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if !cli.endpoints.is_empty() {
        config.etcd.endpoints = cli.endpoints.clone();
    }
    if let Some(t) = cli.dial_timeout {
        config.etcd.dial_timeout = t;
    }
    if let Some(t) = cli.req_timeout {
        config.etcd.req_timeout = t;
    }
    config.etcd.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let coord = Coordinator::new();
    retry_with_backoff(
        || coord.initialize(&config.etcd),
        3,
        Duration::from_millis(200),
    )
    .await
    .context("connecting to coordination store")?;

    match cli.command {
        Commands::Put {
            key,
            value,
            ttl,
            rev,
        } => {
            let res = match (ttl, rev) {
                (Some(ttl), _) => coord.put_with_lease(&key, value, ttl).await?,
                (None, rev) => coord.put_with_expected_revision(&key, value, rev).await?,
            };
            println!("OK (revision {})", res.revision);
        }

        Commands::Get { key, prefix, json } => {
            let mut opts = GetOptions::new();
            if prefix {
                opts = opts.with_prefix();
            }
            let res = coord.get(&key, opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&res)?);
            } else {
                for kv in &res.kvs {
                    println!("{}", kv.key);
                    println!("{}", kv.value_str());
                }
            }
        }

        Commands::Del { key, prefix } => {
            let mut opts = DeleteOptions::new();
            if prefix {
                opts = opts.with_prefix();
            }
            let res = coord.delete(&key, opts).await?;
            println!("{}", res.deleted);
        }

        Commands::Grant { ttl } => {
            let lease = coord.grant(ttl).await?;
            println!("lease {} granted with TTL({}s)", lease.id, lease.ttl.as_secs());
        }

        Commands::Revoke { id } => {
            coord.revoke(id).await?;
            println!("lease {} revoked", id);
        }

        Commands::Lock { name, ttl, wait } => {
            if !is_valid_as_key_path(&name) {
                bail!("lock name {:?} must not contain '/' or '\\'", name);
            }
            let give_up = give_up_at(wait)?;
            let lease = coord.grant(ttl).await?;
            loop {
                if coord.acquire_lock(&name, lease.id).await? {
                    println!("lock {} acquired (lease {}, TTL {}s)", name, lease.id, ttl);
                    break;
                }
                if tokio::time::Instant::now() + LOCK_POLL_INTERVAL > give_up {
                    // Nothing is bound to the lease; give it back.
                    if let Err(e) = coord.revoke(lease.id).await {
                        tracing::warn!("Failed to revoke unused lease {}: {}", lease.id, e);
                    }
                    bail!("lock {} is held by someone else", name);
                }
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
        }

        Commands::Unlock { name } => {
            if !is_valid_as_key_path(&name) {
                bail!("lock name {:?} must not contain '/' or '\\'", name);
            }
            coord.release_lock(&name).await?;
            println!("lock {} released", name);
        }

        Commands::Watch { key, prefix, rev } => {
            let mut opts = WatchOptions::new();
            if prefix {
                opts = opts.with_prefix();
            }
            if let Some(rev) = rev {
                opts = opts.with_start_revision(rev);
            }
            let mut events = coord.watch(&key, opts).await?;
            while let Some(event) = events.next().await {
                let event = event?;
                println!("{} {} (revision {})", event.kind, event.kv.key, event.kv.mod_revision);
                if !event.kv.value.is_empty() {
                    println!("{}", event.kv.value_str());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lease_id() {
        assert_eq!(parse_lease_id("ff").unwrap(), LeaseId(255));
        assert_eq!(parse_lease_id("0x10").unwrap(), LeaseId(16));
        assert!(parse_lease_id("zz").is_err());
    }

    #[test]
    fn test_give_up_at_rejects_huge_wait() {
        assert!(give_up_at(Some(Duration::MAX)).is_err());
        assert!(give_up_at(None).is_ok());
        assert!(give_up_at(Some(Duration::from_secs(30))).is_ok());
    }

    #[test]
    fn test_cli_parses_lock_command() {
        let cli = Cli::try_parse_from([
            "coordctl",
            "--endpoints",
            "a:2379,b:2379",
            "lock",
            "job-42",
            "--ttl",
            "30",
            "--wait",
            "5s",
        ])
        .unwrap();
        assert_eq!(cli.endpoints, vec!["a:2379", "b:2379"]);
        match cli.command {
            Commands::Lock { name, ttl, wait } => {
                assert_eq!(name, "job-42");
                assert_eq!(ttl, 30);
                assert_eq!(wait, Some(Duration::from_secs(5)));
            }
            _ => panic!("expected lock command"),
        }
    }

    #[test]
    fn test_ttl_and_rev_conflict() {
        let res = Cli::try_parse_from(["coordctl", "put", "k", "v", "--ttl", "5", "--rev", "3"]);
        assert!(res.is_err());
    }
}
