use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use hicache::config::{Cli, Config};
use hicache::server::{build_router, build_state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "hicache=debug,tower_http=debug"
    } else {
        "hicache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("hicache v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = config.merge_cli(&cli).resolve()?;

    info!(
        page_size = config.cache.page_size,
        hierarchical = config.cache.hierarchical,
        device_capacity = config.cache.device_capacity,
        host_capacity = config.cache.host_capacity,
        write_policy = ?config.cache.write_policy,
        prefetch_policy = ?config.cache.prefetch_policy,
        role = ?config.engine.role,
        "Configuration resolved"
    );

    let state = build_state(&config).await?;
    let space = state.engine.space().clone();
    let app = build_router(state);

    let listener = TcpListener::bind(&config.listen).await?;
    info!("Listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    // Make everything written so far durable before exiting.
    space.drain().await;
    if space.has_backend() {
        match space.flush().await {
            Ok(written) => info!(written, "Flushed cache to storage"),
            Err(e) => warn!(error = %e, "Flush on shutdown incomplete"),
        }
    }

    Ok(())
}
