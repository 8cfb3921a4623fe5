use std::{net::SocketAddr, sync::Arc};

use axum::{body::Body, extract::Request, routing::any};
use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use plexus::{
    ExtensionRegistry, Router,
    adapters::HttpClientAdapter,
    config::{GatewayConfigValidator, loader},
    metrics::{Metrics, NopMetrics, TelemetryMetrics},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "plexus.yaml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormat {
    /// Structured JSON output
    Json,
    /// Human-readable console output for development
    Pretty,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "plexus.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "plexus.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_command(&config),
        Some(Commands::Serve { config }) => serve_command(&config, args.log_format).await,
        None => serve_command(&args.config, args.log_format).await,
    }
}

fn validate_command(config_path: &str) -> Result<()> {
    let cfg = loader::load_config(config_path)
        .wrap_err_with(|| format!("cannot load configuration from {config_path}"))?;

    match GatewayConfigValidator::validate(&cfg) {
        Ok(()) => {
            println!("Configuration {config_path} is valid.");
            Ok(())
        }
        Err(e) => Err(eyre!("{e}")),
    }
}

async fn serve_command(config_path: &str, log_format: LogFormat) -> Result<()> {
    match log_format {
        LogFormat::Json => tracing_setup::init_tracing()?,
        LogFormat::Pretty => tracing_setup::init_console_tracing()?,
    }

    let cfg = loader::load_config(config_path)
        .wrap_err_with(|| format!("cannot load configuration from {config_path}"))?;
    GatewayConfigValidator::validate(&cfg).map_err(|e| eyre!("{e}"))?;

    let metrics: Arc<dyn Metrics> = if cfg.server.metrics.enabled {
        TelemetryMetrics::shared()
    } else {
        NopMetrics::shared()
    };

    let registry = ExtensionRegistry::with_builtins();
    let client = Arc::new(HttpClientAdapter::new()?);
    let router = Arc::new(Router::new(
        cfg.router_config_set(),
        &registry,
        client,
        metrics,
    )?);

    let _eviction = router
        .rate_limiter()
        .map(|limiter| limiter.spawn_eviction());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("cannot bind {addr}"))?;

    tracing::info!(%addr, routes = cfg.routes.len(), "plexus listening");

    let gateway = Arc::clone(&router);
    let app = axum::Router::new().fallback(any(move |req: Request<Body>| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle(req).await }
    }));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .wrap_err("server error")?;

    if let Some(limiter) = router.rate_limiter() {
        limiter.stop();
    }

    tracing::info!("plexus stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
