//! cbkv - command-line client for Couchbase-style key-value clusters

use anyhow::{bail, Context, Result};
use tracing::{debug, error, Level};
use tracing_subscriber::FmtSubscriber;

use couchbase_kv::config::{CliArgs, Command};
use couchbase_kv::{KvClient, KvOptions, OperationResult};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn ensure_success(key: &str, result: &OperationResult) -> Result<()> {
    if !result.is_success() {
        match result.error_text() {
            Some(text) => bail!("'{}': {} ({})", key, result.status, text),
            None => bail!("'{}': {}", key, result.status),
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    let config = args
        .to_client_config()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let client = KvClient::connect(config).context("Could not bootstrap from any seed")?;
    let opts = KvOptions::default();

    match &args.command {
        Command::Get { key } => {
            let result = client.get(key, &opts)?;
            ensure_success(key, &result)?;
            debug!("cas={} flags=0x{:08x}", result.cas, result.flags);
            println!("{}", String::from_utf8_lossy(&result.value));
        }
        Command::Set {
            key,
            value,
            expiry,
            cas,
        } => {
            let result = client.upsert(key, value.as_bytes(), 0, &opts.expiry(*expiry).cas(*cas))?;
            ensure_success(key, &result)?;
            println!("OK cas={}", result.cas);
        }
        Command::Delete { key } => {
            let result = client.remove(key, &opts)?;
            ensure_success(key, &result)?;
            println!("OK");
        }
        Command::Incr { key, delta, initial } => {
            let result = client.increment(key, *delta, *initial, &opts)?;
            ensure_success(key, &result)?;
            println!("{}", result.counter_value().unwrap_or_default());
        }
        Command::Decr { key, delta, initial } => {
            let result = client.decrement(key, *delta, *initial, &opts)?;
            ensure_success(key, &result)?;
            println!("{}", result.counter_value().unwrap_or_default());
        }
        Command::Diag { json } => {
            let report = client.diagnostics();
            if *json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", report.render_text());
            }
        }
    }

    client.close();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
