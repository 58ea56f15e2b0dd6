// The cache and resolver expose a fuller API than the server itself calls
// (sets, peeks, identifier parsing).  Allow dead_code crate-wide.
#![allow(dead_code)]

mod cache;
mod config;
mod error;
mod factory;
mod git;
mod health;
mod http;
mod lifecycle;
mod metrics;
mod resolver;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::factory::ResourceFactory;
use crate::git::BareRepoBuilder;
use crate::lifecycle::ExecutionContext;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "packgate", about = "Read-only Git smart-HTTP server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/packgate/config.yaml")]
    config: PathBuf,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
pub struct AppState {
    pub config_path: PathBuf,
    config: RwLock<Config>,
    pub metrics: MetricsRegistry,
    pub context: Arc<ExecutionContext>,
    pub factory: Arc<ResourceFactory<BareRepoBuilder>>,
}

impl AppState {
    /// Build the repository factory from `config` and attach it to a fresh
    /// execution context.
    pub async fn new(config_path: PathBuf, config: Config) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let factory = ResourceFactory::new(
            BareRepoBuilder::new(&config.storage.repos_path),
            config.cache.factory_options(),
            Arc::clone(&metrics.metrics),
        )
        .context("invalid cache configuration")?;
        let factory = Arc::new(factory);

        let context = Arc::new(ExecutionContext::new());
        factory.attach(&context).await;

        Ok(Self {
            config_path,
            config: RwLock::new(config),
            metrics,
            context,
            factory,
        })
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the configuration file and fire a context refresh.
    ///
    /// Cache capacity and build timeout are fixed for the lifetime of the
    /// factory; changes to them are logged and applied on the next restart.
    /// Returns the number of subscribers notified.
    pub async fn reload(&self) -> Result<usize> {
        let fresh = config::load_config(&self.config_path)?;

        {
            let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
            if fresh.cache != current.cache {
                tracing::warn!(
                    old = ?current.cache,
                    new = ?fresh.cache,
                    "cache settings changed; restart to apply"
                );
            }
            if fresh.proxy != current.proxy {
                tracing::warn!(
                    old = %current.proxy.http_listen,
                    new = %fresh.proxy.http_listen,
                    "listen address changed; restart to apply"
                );
            }
            self.factory.builder().set_root(&fresh.storage.repos_path);
            *current = fresh;
        }

        let notified = self.context.refresh().await;
        tracing::info!(
            config_path = %self.config_path.display(),
            notified,
            "configuration reloaded"
        );
        Ok(notified)
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config();
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Reload on SIGHUP
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn run_reload_listener(state: Arc<AppState>) -> Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;

    while hangup.recv().await.is_some() {
        tracing::info!("received SIGHUP");
        if let Err(e) = state.reload().await {
            tracing::error!(error = %format!("{e:#}"), "configuration reload failed");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_reload_listener(_state: Arc<AppState>) -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config.display(), "starting packgate");

    if !config.storage.repos_path.is_dir() {
        tracing::warn!(
            repos_path = %config.storage.repos_path.display(),
            "repository root does not exist yet; requests will 404 until it does"
        );
    }

    // ---- App state ----
    let state = Arc::new(AppState::new(cli.config.clone(), config).await?);

    // ---- Spawn services ----
    let reload_handle = tokio::spawn({
        let s = Arc::clone(&state);
        async move {
            if let Err(e) = run_reload_listener(s).await {
                tracing::error!(error = %e, "reload listener failed");
            }
        }
    });

    // ---- Serve until a shutdown signal ----
    let served = run_http_server(Arc::clone(&state)).await;
    reload_handle.abort();

    // ---- Release cached repositories ----
    let released = state.factory.shutdown().await;
    tracing::info!(released, "packgate shut down cleanly");

    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::bare_repo::tests::fake_bare_repo;
    use crate::resolver::resolve;

    fn write_config(path: &std::path::Path, repos: &std::path::Path, max_size: usize) {
        std::fs::write(
            path,
            format!(
                "storage:\n  repos_path: {}\ncache:\n  max_size: {max_size}\n",
                repos.display()
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reload_moves_root_and_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let old_root = tmp.path().join("old");
        let new_root = tmp.path().join("new");
        fake_bare_repo(&old_root.join("widgets.git"));
        fake_bare_repo(&new_root.join("widgets.git"));

        let config_path = tmp.path().join("config.yaml");
        write_config(&config_path, &old_root, 4);
        let state = AppState::new(config_path.clone(), config::load_config(&config_path).unwrap())
            .await
            .unwrap();

        let id = resolve(Some("/widgets.git")).unwrap();
        let before = state.factory.get(&id).await.unwrap();
        assert_eq!(before.path(), old_root.join("widgets.git"));

        // Capacity changes are restart-only; the root moves immediately.
        write_config(&config_path, &new_root, 8);
        assert_eq!(state.reload().await.unwrap(), 1);

        assert!(before.is_released());
        let after = state.factory.get(&id).await.unwrap();
        assert_eq!(after.path(), new_root.join("widgets.git"));
        assert_eq!(state.config().cache.max_size, 8);
        assert_eq!(state.factory.stats().await.capacity, 4);
    }

    #[tokio::test]
    async fn failed_reload_keeps_current_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.yaml");
        write_config(&config_path, tmp.path(), 4);
        let state = AppState::new(config_path.clone(), config::load_config(&config_path).unwrap())
            .await
            .unwrap();

        std::fs::write(&config_path, "cache:\n  max_size: 0\n").unwrap();
        assert!(state.reload().await.is_err());
        assert_eq!(state.config().cache.max_size, 4);
        assert_eq!(state.context.state().epoch, 0);
    }

    #[test]
    fn cli_defaults_config_path() {
        let cli = Cli::parse_from(["packgate"]);
        assert_eq!(cli.config, PathBuf::from("/etc/packgate/config.yaml"));
    }
}
