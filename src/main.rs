use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use concilio::cli::{Cli, Commands};
use concilio::config::{default_config_path, AppConfig};
use concilio::{DispatchRequest, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "concilio=debug"
    } else {
        "concilio=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().unwrap()),
        )
        .init();

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => default_config_path()?,
    };
    let config = AppConfig::load(&config_path).await?;

    let dispatcher = Dispatcher::from_config(&config);
    dispatcher.start().await;
    info!("Dispatcher started");

    let outcome = run_command(&dispatcher, &config, cli.command).await;
    dispatcher.shutdown().await;
    outcome
}

async fn run_command(
    dispatcher: &Dispatcher,
    config: &AppConfig,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Query {
            question,
            context,
            caller,
            min_confidence,
            json,
        } => {
            let mut request = DispatchRequest::new(question)
                .with_context(context)
                .with_caller(caller);
            if let Some(floor) = min_confidence {
                request = request.with_min_confidence(floor);
            }

            let result = dispatcher.dispatch(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.text);
                println!();
                println!("confidence:   {:.3}", result.confidence);
                println!("contributors: {}", result.contributors.join(", "));
                if !result.outliers.is_empty() {
                    println!("outliers:     {}", result.outliers.join(", "));
                }
                println!("{}", result.justification);
            }
        }
        Commands::Models => {
            for model in dispatcher.known_models() {
                println!("{}", model);
            }
        }
        Commands::Stats => {
            for stats in dispatcher.pool_stats() {
                println!(
                    "{}: total={} in_use={} acquisitions={} creations={} call_failures={}",
                    stats.backend,
                    stats.total,
                    stats.in_use,
                    stats.acquisitions,
                    stats.creations,
                    stats.call_failures
                );
            }
            let global = dispatcher.global_stats();
            println!(
                "pool: backends={} handles={} acquisitions={}",
                global.backends, global.total_handles, global.total_acquisitions
            );
            for circuit in dispatcher.breaker_snapshot() {
                println!(
                    "breaker {}: failures={} open={}",
                    circuit.key, circuit.failures, circuit.open
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}
