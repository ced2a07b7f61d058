use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowguard::config::EngineConfig;
use windowguard::ratelimit::{RateLimit, RateLimiter, RequestContext, RouteRules, TooManyRequests};
use windowguard::storage::InMemoryStorage;

/// Dry-run rate limit configurations against an in-memory counter store.
#[derive(Debug, Parser)]
#[command(name = "windowguard", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay requests through the limiter and print one decision per line
    Simulate(SimulateArgs),
    /// Print the discriminator and fingerprint of a vary set
    Fingerprint(FingerprintArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Matched route name
    #[arg(long)]
    route: Option<String>,

    /// HTTP method
    #[arg(long, default_value = "GET")]
    method: String,

    /// Request attribute as name=value (repeatable)
    #[arg(long = "attr", value_parser = parse_pair)]
    attributes: Vec<(String, String)>,

    /// GraphQL operation name
    #[arg(long)]
    graphql_operation: Option<String>,

    /// Number of requests to replay
    #[arg(long, default_value_t = 1)]
    requests: u32,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

#[derive(Debug, Args)]
struct FingerprintArgs {
    /// Vary dimension as key=value, in order (repeatable)
    #[arg(long = "vary", value_parser = parse_pair, required = true)]
    vary: Vec<(String, String)>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got `{}`", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::Fingerprint(args) => fingerprint(args),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    info!(
        limit = config.limit,
        period = config.period,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let rules = RouteRules::from_config(&config);
    let storage = Arc::new(InMemoryStorage::new());
    let mut limiter = RateLimiter::new(storage);
    if let Some(timeout) = config.storage_timeout() {
        limiter = limiter.with_storage_timeout(timeout);
    }

    let mut request = RequestContext::new(args.method);
    request.route = args.route;
    request.graphql_operation = args.graphql_operation;
    request.attributes.extend(args.attributes);

    for n in 1..=args.requests {
        let rate_limit = rules.resolve(&request)?;
        let Some(verdict) = limiter.check(rate_limit.as_ref()).await? else {
            warn!("No rule applies to this request, nothing is limited");
            println!("{}", json!({ "request": n, "decision": "pass" }));
            continue;
        };

        let mut line = json!({
            "request": n,
            "decision": if verdict.is_allowed() { "allow" } else { "deny" },
            "hits": verdict.stored.hits(),
            "limit": verdict.stored.limit(),
            "until": verdict.stored.valid_until_rfc3339(),
        });
        if config.display_headers {
            line["headers"] = json!(verdict.headers(limiter.now()));
        }
        if let Some(rejection) = TooManyRequests::from_verdict(&verdict, config.display_headers) {
            line["status"] = json!(rejection.status);
            line["body"] = rejection.body;
        }
        println!("{}", line);

        if args.interval_ms > 0 && n < args.requests {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    Ok(())
}

fn fingerprint(args: FingerprintArgs) -> anyhow::Result<()> {
    let mut rate_limit = RateLimit::new(0, 0)?;
    for (key, value) in args.vary {
        rate_limit.vary_on(key, value)?;
    }

    println!(
        "{}",
        json!({
            "discriminator": rate_limit.discriminator()?,
            "hash": rate_limit.hash()?.to_hex(),
        })
    );
    Ok(())
}
