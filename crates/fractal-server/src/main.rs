//! fractal-server - HTTP surface for the fractal memory agent.
//!
//! Serves the chat fast path and the memory inspection endpoints, and owns
//! the background maintenance supervisor (periodic consolidation and daily
//! garbage collection) for the configured user.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fractal_core::traits::{GraphStore, VolatileStore};
use fractal_core::MemoryOptions;
use fractal_memory::{AgentComponents, FractalAgent, SqliteGraphStore, SqliteVolatileStore};

mod config;
mod error;
mod routes;
mod state;

use config::ServerConfig;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env().add_directive("fractal_server=info".parse()?),
        )
        .init();

    info!("fractal-server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load().context("Failed to load configuration")?;
    let memory_options = MemoryOptions::from_value(config.memory.clone())
        .context("Invalid memory configuration")?;

    // Shared store clients: one per backend, reused by every component
    let volatile: Arc<dyn VolatileStore> = if memory_options.volatile_url.is_empty() {
        Arc::new(SqliteVolatileStore::open_in_memory(memory_options.l0_capacity)?)
    } else {
        Arc::new(SqliteVolatileStore::open(
            &memory_options.volatile_url,
            memory_options.l0_capacity,
        )?)
    };
    let graph: Arc<dyn GraphStore> = if memory_options.graph_uri.is_empty() {
        Arc::new(SqliteGraphStore::open_in_memory()?)
    } else {
        Arc::new(SqliteGraphStore::open(&memory_options.graph_uri)?)
    };

    #[cfg(feature = "embeddings")]
    let embedder: Option<Arc<dyn fractal_core::traits::EmbeddingProvider>> =
        Some(Arc::new(fractal_memory::LocalEmbedder::new()));
    #[cfg(not(feature = "embeddings"))]
    let embedder: Option<Arc<dyn fractal_core::traits::EmbeddingProvider>> = None;

    let agent = FractalAgent::new(
        config.memory.clone(),
        Arc::clone(&volatile),
        Arc::clone(&graph),
        None,
        embedder,
        AgentComponents::default(),
    )?;
    agent.start_background().await;

    let state = AppState::new(Arc::clone(&agent), volatile, graph);
    let app = routes::create_router(state, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Server ready - accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received");
    agent.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
