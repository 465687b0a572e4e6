//! ScopeGate Server - Main entry point
//!
//! Serves the management API and the tenant-enforcing observability proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use scopegate_core::{
    api::{self, AppState},
    config::{Config, VerifierKind},
    db::Database,
    middleware::{AuthLayer, IdentityVerifier, JwtVerifier, StaticTokenVerifier},
    observability, proxy,
    rbac::{AuthorizationEngine, RoleAssignmentManager},
    store::{MemoryStore, PgStore, SharedStore},
};

#[derive(Debug, Parser)]
#[command(name = "scopegate-server", version, about)]
struct Args {
    /// Configuration file; `SCOPEGATE__*` variables override it
    #[arg(short, long, env = "SCOPEGATE_CONFIG")]
    config: Option<String>,

    /// Serve from the in-memory store instead of PostgreSQL
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    observability::init(&config.observability)?;
    let metrics = if config.observability.metrics_enabled {
        Some(observability::install_metrics()?)
    } else {
        None
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ScopeGate Server"
    );

    let (store, db): (SharedStore, Option<Database>) = if args.in_memory {
        tracing::warn!("Using the in-memory store; all state is lost on exit");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let db = Database::connect(&config.database).await?;
        if config.database.run_migrations {
            db.migrate().await?;
            tracing::info!("Database migrations applied");
        }
        (Arc::new(PgStore::new(db.clone())), Some(db))
    };

    let engine = AuthorizationEngine::new(store.clone());
    let manager = RoleAssignmentManager::new(store);

    let verifier: Arc<dyn IdentityVerifier> = match config.auth.verifier {
        VerifierKind::Jwt => Arc::new(JwtVerifier::from_settings(&config.auth.jwt)?),
        VerifierKind::Static => {
            tracing::warn!("Using static bearer tokens; do not run this in production");
            Arc::new(StaticTokenVerifier::from_entries(&config.auth.static_tokens))
        }
    };
    let mut auth = AuthLayer::new(verifier);
    if config.auth.reconcile_logins {
        auth = auth.with_reconciliation(manager.clone());
    }

    let proxies = proxy::proxy_router(&config.proxy, engine.clone())?;

    let app = api::build_router(
        AppState {
            engine,
            manager,
            db,
            metrics,
        },
        auth,
        proxies,
        api::cors_layer(&config.server.cors_allowed_origins),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let graceful = {
        let token = shutdown.clone();
        async move { token.cancelled().await }
    };
    let server = axum::serve(listener, app).with_graceful_shutdown(graceful);
    let grace = config.server.shutdown_grace;

    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace = ?grace, "Shutdown grace period elapsed; dropping in-flight requests");
        }
    }

    // Cleanup
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
    token.cancel();
}
