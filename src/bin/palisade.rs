//! palisade: pipeline diagnostics
//!
//! Validates configuration files and runs the pipeline against simulated
//! providers to show how breakers, retries and fallbacks behave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::info;

use palisade::config::Config;
use palisade::{
    GenerateOptions, GenerateRequest, GenerateResponse, PalisadeError, PipelineBuilder, Provider,
};

/// Palisade resilience pipeline diagnostics
#[derive(Parser)]
#[command(name = "palisade")]
#[command(version = palisade::PKG_VERSION)]
#[command(about = "Inspect and exercise a palisade pipeline configuration")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "PALISADE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the resolved settings
    Check,

    /// Drive simulated providers through the configured pipeline
    Simulate {
        /// Providers as name=failure_rate (e.g. alpha=0.6 beta=0.1)
        #[arg(required = true, value_parser = parse_sim_provider)]
        providers: Vec<(String, f64)>,
        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 50)]
        calls: u32,
        /// Simulated provider latency in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
    },

    /// Print build information
    Version,
}

fn parse_sim_provider(raw: &str) -> Result<(String, f64), String> {
    let (name, rate) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=rate, got {raw:?}"))?;
    let rate: f64 = rate
        .parse()
        .map_err(|e| format!("invalid failure rate {rate:?}: {e}"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("failure rate must be within 0..=1, got {rate}"));
    }
    Ok((name.to_string(), rate))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Version => {
            println!("palisade {}", palisade::version_string());
            println!("branch: {}", palisade::version::GIT_BRANCH);
            println!("built: {}", palisade::version::BUILD_TIMESTAMP);
        }
        Command::Check => {
            let config = Config::load(args.config.as_deref())?;
            println!("configuration ok");
            println!("{config:#?}");
        }
        Command::Simulate {
            providers,
            calls,
            latency_ms,
        } => {
            let config = match args.config.as_deref() {
                Some(path) => Config::load(Some(path))?,
                None => Config::default(),
            };
            simulate(&config, providers, calls, Duration::from_millis(latency_ms)).await?;
        }
    }

    Ok(())
}

async fn simulate(
    config: &Config,
    providers: Vec<(String, f64)>,
    calls: u32,
    latency: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = PipelineBuilder::from_config(config)?;
    if config.pipeline.fallback_providers.is_empty() {
        builder = builder.fallback_providers(providers.iter().skip(1).map(|(n, _)| n.clone()).collect());
    }
    if config.pipeline.primary.is_none()
        && let Some((first, _)) = providers.first()
    {
        builder = builder.primary(first.clone());
    }
    for (name, failure_rate) in providers {
        builder = builder.provider(Arc::new(SimulatedProvider {
            name,
            failure_rate,
            latency,
        }));
    }
    let pipeline = builder.build()?;
    info!(?pipeline, calls, "starting simulation");

    let (mut ok, mut degraded, mut failed) = (0u32, 0u32, 0u32);
    for i in 0..calls {
        let request = GenerateRequest::new(format!("simulated prompt {}", i % 5));
        match pipeline.generate(request, GenerateOptions::default()).await {
            Ok(response) if response.fallback.is_degraded() => degraded += 1,
            Ok(_) => ok += 1,
            Err(e) => {
                failed += 1;
                eprintln!("call {i}: {e}");
            }
        }
    }

    println!("calls: {calls}  ok: {ok}  degraded: {degraded}  failed: {failed}");
    println!();
    let health = pipeline.health();
    for provider in health.all_provider_health(Duration::from_secs(3600)) {
        println!("{}", serde_json::to_string(&provider)?);
    }
    println!("{}", serde_json::to_string(&pipeline.registry().all_metrics())?);
    println!("{}", serde_json::to_string(&pipeline.cache().stats())?);
    Ok(())
}

/// Provider that fails at a fixed rate with rotating transient errors.
struct SimulatedProvider {
    name: String,
    failure_rate: f64,
    latency: Duration,
}

const SIMULATED_ERRORS: &[&str] = &[
    "service unavailable",
    "rate limit exceeded",
    "connection reset by peer",
    "internal server error",
];

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _options: &GenerateOptions,
    ) -> palisade::Result<GenerateResponse> {
        tokio::time::sleep(self.latency).await;
        let (fail, pick) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_bool(self.failure_rate),
                rng.gen_range(0..SIMULATED_ERRORS.len()),
            )
        };
        if fail {
            return Err(PalisadeError::provider(&self.name, SIMULATED_ERRORS[pick]));
        }
        Ok(GenerateResponse::new(
            &self.name,
            format!("{} says: {}", self.name, request.prompt),
        ))
    }
}
