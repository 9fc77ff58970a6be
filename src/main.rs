use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use api_throttle::config::ThrottleConfig;
use api_throttle::gateway;
use api_throttle::telemetry::{self, LogFormat, ThrottleTracer, TracingConfig};
use api_throttle::throttle::ApiThrottler;

#[derive(Parser)]
#[command(
    name = "api-throttle",
    version,
    about = "Per-provider token-bucket throttle for outbound API calls"
)]
struct Cli {
    /// JSON config file; without it, defaults plus environment overrides
    #[arg(long = "config-file", global = true)]
    config_file: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Export spans over OTLP/HTTP to this endpoint
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configured capacity and rates
    Status,
    /// Run acquisitions against one provider and print the wait for each
    Drain {
        #[arg(short, long)]
        provider: String,
        #[arg(short = 'n', long, default_value_t = 12)]
        count: u32,
        /// Give up on a call after this many milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Start the HTTP status gateway
    Gateway {
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Export config JSON schema
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print JSON schema for configuration
    Schema,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ThrottleConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ThrottleConfig::from_json_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(ThrottleConfig::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(cli.log_format);

    let tracer = ThrottleTracer::init(&TracingConfig::from_endpoint(cli.otlp_endpoint.clone()))?;
    tracer.install_global();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Schema => {
                println!("{}", ThrottleConfig::json_schema());
            }
        },
        Commands::Status => {
            let cfg = load_config(cli.config_file.as_ref())?;
            println!("api-throttle status: OK");
            println!("  capacity: {}", cfg.capacity);
            println!("  default_rate: {}", cfg.fallback_rate());
            for (provider, rate) in &cfg.rate_limits {
                println!("  {provider}: {rate} req/s");
            }
        }
        Commands::Drain {
            provider,
            count,
            timeout_ms,
        } => {
            let throttler = ApiThrottler::new(load_config(cli.config_file.as_ref())?)?;
            let timeout = timeout_ms.map(Duration::from_millis);
            for i in 1..=count {
                let mut span = telemetry::trace_acquisition(&provider);
                let started = Instant::now();
                let granted = throttler.acquire_async(&provider, timeout).await;
                let waited_ms = started.elapsed().as_secs_f64() * 1000.0;
                span.set_attribute("throttle.waited_ms", format!("{waited_ms:.1}"));
                span.set_status(granted, "timed out");
                let outcome = if granted { "granted" } else { "timed out" };
                println!("call {i}: {outcome} after {waited_ms:.1} ms");
            }
        }
        Commands::Gateway { bind } => {
            let throttler = Arc::new(ApiThrottler::new(load_config(cli.config_file.as_ref())?)?);
            gateway::run(&bind, throttler).await?;
        }
    }

    tracer.shutdown();
    Ok(())
}
