use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tickerhub::cli::{self, Cli, Commands};
use tickerhub::config::AppConfig;
use tickerhub::services::Hub;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config).context("failed to load configuration")?;
    init_logging(&config);

    let hub = Hub::connect(&config).context("failed to start market data hub")?;

    let outcome = match &cli.command {
        Commands::Quote { symbols, priority } => cli::show_quotes(&hub, symbols, *priority).await,
        Commands::Profile { symbol } => cli::show_profile(&hub, symbol).await,
        Commands::Watch {
            symbols,
            stream,
            duration_secs,
        } => cli::watch(&hub, symbols, *stream, duration_secs.map(Duration::from_secs)).await,
        Commands::Status => cli::show_status(&hub).await,
    };

    hub.shutdown().await;
    info!("Exiting");
    outcome.map_err(Into::into)
}

fn init_logging(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tickerhub=debug", config.logging.level))
    });

    // `rolling::daily` panics if it cannot create the file, so check writability first.
    let file_layer = std::env::var("TICKERHUB_LOG_DIR").ok().and_then(|log_dir| {
        let writable = std::fs::create_dir_all(&log_dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(std::path::Path::new(&log_dir).join("tickerhub.log"))
                .is_ok();
        if !writable {
            eprintln!(
                "Warning: Could not write to log directory {}, file logging disabled",
                log_dir
            );
            return None;
        }

        let file_appender = tracing_appender::rolling::daily(&log_dir, "tickerhub.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Kept for the life of the process.
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, text_layer) = if config.logging.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}
