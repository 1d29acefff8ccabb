use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{KeyedRateLimiter, RateLimiter, Throttle, Unthrottled, WindowUsage};
use floodgate::simulate::{run_burst, BurstOptions, BurstReport, Dispatcher};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Sliding-window rate limiting for messaging bots")]
struct Cli {
    /// YAML configuration file; built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the operation table
    CheckConfig,
    /// Push a random burst of bot events through the limiter
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Number of inbound events
    #[arg(long, default_value_t = 50)]
    events: usize,

    /// Number of distinct users sending them
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    users: u32,

    /// Operation category the replies are charged to
    #[arg(long, default_value = "send_message")]
    operation: String,

    /// Maximum random arrival delay per event, in milliseconds
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Give up on an event after waiting this long for a slot
    #[arg(long)]
    max_wait_ms: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct SimulationOutput {
    #[serde(flatten)]
    report: BurstReport,
    usage: Vec<WindowUsage>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FloodgateConfig::from_file(path)?,
        None => FloodgateConfig::default(),
    };
    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Using built-in configuration"),
    }

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Simulate(args) => {
            tokio::select! {
                result = simulate(&config, args) => result?,
                _ = shutdown_signal() => warn!("Simulation interrupted"),
            }
        }
    }

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(config: &FloodgateConfig) {
    let limiter = &config.limiter;
    println!("enabled: {}", limiter.enabled);
    println!("response cooldown: {:?}", limiter.response_cooldown());
    println!(
        "client budget: {} per {}s",
        limiter.client_budget.max_requests, limiter.client_budget.window_secs
    );
    for (name, rule) in &limiter.operations {
        println!("{:<20} {} per {}s", name, rule.max_requests, rule.window_secs);
    }
}

async fn simulate(config: &FloodgateConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let limiter = Arc::new(RateLimiter::from_config(&config.limiter)?);
    let budget = Arc::new(KeyedRateLimiter::from_rule(&config.limiter.client_budget));

    if limiter.window(&args.operation).is_none() {
        warn!(operation = %args.operation, "Operation is not limited");
    }

    let throttle: Arc<dyn Throttle> = if config.limiter.enabled {
        limiter.clone()
    } else {
        info!("Rate limiting disabled");
        Arc::new(Unthrottled)
    };

    let dispatcher = Dispatcher::new(
        throttle,
        budget,
        args.operation.clone(),
        config.limiter.response_cooldown(),
    )
    .with_max_wait(args.max_wait_ms.map(Duration::from_millis));

    let options = BurstOptions {
        events: args.events,
        users: args.users,
        jitter: Duration::from_millis(args.jitter_ms),
    };
    let report = run_burst(&dispatcher, &options).await;

    let mut usage: Vec<WindowUsage> = limiter
        .operations()
        .filter_map(|op| limiter.usage(op))
        .collect();
    usage.sort_by(|a, b| a.operation.cmp(&b.operation));

    if args.json {
        let output = SimulationOutput { report, usage };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let tally = &report.tally;
    println!(
        "{} events from {} users on '{}' in {}ms",
        report.events, report.users, report.operation, tally.elapsed_ms
    );
    println!("  sent:        {}", tally.sent);
    println!("  suppressed:  {}", tally.suppressed);
    println!("  over budget: {}", tally.over_budget);
    println!("  timed out:   {}", tally.timed_out);
    for u in &usage {
        println!(
            "  {:<20} {}/{} in window, retry after {}ms",
            u.operation, u.in_window, u.max_requests, u.retry_after_ms
        );
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
