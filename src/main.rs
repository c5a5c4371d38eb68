use anyhow::Context;
use axum::extract::{ConnectInfo, Request};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, ServiceConfig};
use turnstile::ratelimit::{LimitConfig, ReloadableRateLimiter, ResolverRegistry};
use turnstile::reload::{sweep_counters, PolicyWatcher};
use turnstile::{RateLimitLayer, RequestLimit, RequestLimitLayer};

/// In-process rate limiting and admission control in front of an HTTP service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Limit rules file, overrides `limits.config_path`
    #[arg(short, long)]
    limits: Option<String>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Validate the limit rules and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServiceConfig::load(args.config.as_deref())
        .context("Failed to load service configuration")?;
    if let Some(path) = args.limits {
        config.limits.config_path = Some(path);
    }
    if let Some(addr) = args.listen {
        config.server.listen_addr = addr;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limit_config = match &config.limits.config_path {
        Some(path) => LimitConfig::from_file(path)
            .with_context(|| format!("Failed to load limit configuration from {}", path))?,
        None => LimitConfig::default(),
    };
    let policy = limit_config
        .validate()
        .context("Invalid limit configuration")?;

    if args.check {
        info!(enabled = policy.enabled, key = %policy.key_type, "Limit configuration is valid");
        return Ok(());
    }

    let registry = Arc::new(ResolverRegistry::default());
    let rate_limiter = Arc::new(
        ReloadableRateLimiter::new(&limit_config, registry)
            .context("Failed to build rate limiter")?,
    );
    let request_limit = RequestLimit::from_policy(&policy);
    info!(
        concurrent = policy.concurrent_request,
        queue_size = ?policy.queue_size,
        "Request limit initialized"
    );

    let mut tasks = Vec::new();
    if let Some(path) = &config.limits.config_path {
        let watcher = PolicyWatcher::new(
            path.as_str(),
            limit_config,
            rate_limiter.clone(),
            request_limit.clone(),
        );
        let interval = Duration::from_secs(config.limits.reload_interval_secs);
        tasks.push(tokio::spawn(watcher.run(interval)));
    }
    tasks.push(tokio::spawn(sweep_counters(
        rate_limiter.clone(),
        Duration::from_secs(config.limits.sweep_interval_secs),
    )));

    let app = Router::new().fallback(echo).layer(
        ServiceBuilder::new()
            .map_request(|mut request: Request| {
                if let Some(ConnectInfo(addr)) =
                    request.extensions().get::<ConnectInfo<SocketAddr>>().cloned()
                {
                    request.extensions_mut().insert(addr);
                }
                request
            })
            .layer(RequestLimitLayer::new(request_limit.clone()))
            .layer(RateLimitLayer::from_shared(rate_limiter)),
    );

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "Listening for HTTP requests");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        request_limit.close_queue();
    })
    .await?;

    for task in tasks {
        task.abort();
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Demo upstream: reports what it received.
async fn echo(request: Request) -> String {
    format!("{} {}\n", request.method(), request.uri())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
