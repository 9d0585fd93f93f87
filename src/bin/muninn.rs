//! muninn: operator CLI for the caching subsystem.
//!
//! Prints the effective configuration as JSON: cache policies, warming
//! schedules, cache keys, and a health snapshot of a freshly built stack.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use muninn::types::params_hash;
use muninn::{CacheKey, Config, Muninn, Params, ServiceType};

/// Muninn cloud API cache
#[derive(Parser)]
#[command(name = "muninn")]
#[command(version)]
#[command(about = "Unified cache and cache warming for cloud API data")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "MUNINN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the effective cache policy of every service type
    Policies,

    /// Show the configured warming schedules
    Schedules,

    /// Compute the cache key of a request
    Key {
        provider: String,
        /// Service type (e.g. pricing, compute, ai_ml)
        service_type: ServiceType,
        region: String,
        /// Request parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Build the services and print cache and warming status
    Check,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref())?.with_env_overrides()?;

    match args.command {
        Command::Policies => {
            let policies: Vec<_> = config
                .policy_table()?
                .entries()
                .into_iter()
                .map(|(service_type, policy)| PolicyRow {
                    service_type,
                    ttl_secs: policy.ttl.as_secs(),
                    strategy: policy.strategy.as_str(),
                })
                .collect();
            print_json(&policies)?;
        }
        Command::Schedules => {
            let services = Muninn::builder().config(config).build()?;
            print_json(&services.warming().schedules())?;
        }
        Command::Key {
            provider,
            service_type,
            region,
            params,
        } => {
            let params: Params = params.into_iter().collect();
            let params = (!params.is_empty()).then_some(params);
            let key = CacheKey::new(&provider, service_type, &region, params.as_ref());
            print_json(&KeyRow {
                key: key.to_string(),
                param_hash: params.as_ref().map(params_hash),
            })?;
        }
        Command::Check => {
            let services = Muninn::builder().config(config).build()?;
            let report = CheckReport {
                cache: services.cache_stats().await,
                warming: services.warming_status(),
            };
            print_json(&report)?;
            services.close().await;
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct PolicyRow {
    service_type: ServiceType,
    ttl_secs: u64,
    strategy: &'static str,
}

#[derive(Serialize)]
struct KeyRow {
    key: String,
    param_hash: Option<String>,
}

#[derive(Serialize)]
struct CheckReport {
    cache: muninn::ManagerStats,
    warming: muninn::WarmingStatus,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
