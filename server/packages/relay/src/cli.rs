use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_relay_broker::{MemoryValueStream, NatsValueStream, ValueStream};

use crate::config::{ConfigError, RelayConfig, RuntimeSelection};
use crate::router::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "edge-relay", bin_name = "edge-relay")]
#[command(about = "Streaming chat relay for edge-device assistants", version)]
#[command(arg_required_else_help = true)]
pub struct EdgeRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Override RELAY_HOST.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Override RELAY_PORT.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_edge_relay() -> Result<(), CliError> {
    let cli = EdgeRelayCli::parse();
    init_logging();
    if dotenvy::dotenv().is_err() {
        tracing::debug!("no .env file found, using process environment");
    }
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let mut config = RelayConfig::from_env()?;
    if let Some(host) = &server.host {
        config.host = host.clone();
    }
    if let Some(port) = server.port {
        config.port = port;
    }

    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", config.host, config.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        // Mock mode runs self-contained; everything else samples the broker.
        let stream: Arc<dyn ValueStream> = match &config.runtime {
            RuntimeSelection::Mock => Arc::new(MemoryValueStream::new()),
            _ => Arc::new(NatsValueStream::new(config.broker.clone())),
        };
        let state = AppState::new(config, stream);
        let router = build_router(state).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "edge-relay listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    Ok(cors)
}
