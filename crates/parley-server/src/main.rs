use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::{AppState, IdentityProvider, JwtIdentity, RemoteIdentity, SqlRepository};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use config::{Config, LogFormat};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley=info,tower_http=info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let (config, notes) = Config::load(&args.config)?;
    init_tracing(config.server.log_format);

    if notes.generated {
        tracing::info!("Generated default config at '{}'", args.config);
    }
    for warning in &notes.warnings {
        tracing::warn!("{warning}");
    }
    if let Some(path) = &config.auth.firebase_credentials_path {
        tracing::info!(path = %path, "identity collaborator credentials configured");
    }

    let pool = parley_db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("failed to open database")?;
    parley_db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("Database ready");

    let identity: Arc<dyn IdentityProvider> = match &config.auth.user_service_addr {
        Some(addr) => {
            tracing::info!(addr = %addr, "Validating tokens through the user service");
            Arc::new(RemoteIdentity::new(addr, config.identity_timeout())?)
        }
        None => {
            tracing::info!("Validating tokens locally");
            Arc::new(JwtIdentity::new(&config.auth.jwt_secret))
        }
    };

    let repo = Arc::new(SqlRepository::new(pool));
    let state = AppState::new(config.core_config(), repo, identity);
    match state.presence.seed().await {
        Ok(count) => tracing::info!(records = count, "presence snapshot seeded"),
        Err(err) => tracing::warn!(error = %err, "presence seed failed, starting empty"),
    }
    let sweeper = state.spawn_sweeper();

    let app = parley_api::build_router()
        .merge(parley_ws::stream_router())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    tracing::info!("Parley listening on {}", config.server.bind_address);

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        let closed = shutdown_state.begin_shutdown();
        tracing::info!(sessions = closed, "Shutting down");
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    state.shutdown.cancel();
    let _ = sweeper.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
