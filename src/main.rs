use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{routing::get, Router};
use chrono::Duration as ChronoDuration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bridge;
mod config;
mod error;
mod handlers;
mod services;

use config::BridgeConfig;
use services::{
    CredentialStore, Credentials, FileCredentialStore, GoogleOAuth, IdentityProvider,
    MemoryCredentialStore, RefreshGuard, SessionStore, ShellLauncher,
};

/// How long shutdown waits for open terminals to close and reap their shells.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared dependencies, handed to every handler through axum state.
#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    sessions: Arc<SessionStore>,
    credentials: Credentials,
    provider: Arc<dyn IdentityProvider>,
    refresh: RefreshGuard,
    launcher: ShellLauncher,
    shutdown: CancellationToken,
    /// Upgraded terminal connections, which axum's graceful shutdown no longer sees.
    tracker: TaskTracker,
}

impl AppState {
    fn new(
        config: Arc<BridgeConfig>,
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let credentials = Credentials::new(store, config.store_timeout);
        let margin = ChronoDuration::from_std(config.refresh_margin)
            .unwrap_or_else(|_| ChronoDuration::minutes(1));
        let refresh = RefreshGuard::new(provider.clone(), credentials.clone(), margin);
        let launcher = ShellLauncher::new(
            config.shell_command.clone(),
            config.shell_token_env.clone(),
            config.pty_cols,
            config.pty_rows,
        );

        Self {
            sessions: Arc::new(SessionStore::new(config.session_ttl)),
            started_at: Instant::now(),
            config,
            credentials,
            provider,
            refresh,
            launcher,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::auth::login_page))
        .route("/login", get(handlers::auth::start_login))
        .route("/auth/google", get(handlers::auth::start_login))
        .route("/auth/google/callback", get(handlers::auth::callback))
        .route("/logout", get(handlers::auth::logout))
        .route("/terminal/", get(handlers::terminal::terminal_page))
        .route("/ws", get(handlers::terminal::ws_handler))
        .route("/health", get(handlers::health_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudshell_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!(%error, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn CredentialStore> = match &config.credentials_path {
        Some(path) => {
            info!(path = %path.display(), "using file credential store");
            Arc::new(FileCredentialStore::new(path))
        }
        None => {
            warn!("BRIDGE_CREDENTIALS_PATH not set; credentials are kept in memory only");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let provider = match GoogleOAuth::new(
        config.client_id.clone(),
        config.client_secret.clone(),
        config.redirect_uri(),
        config.oauth_endpoints.clone(),
    ) {
        Ok(provider) => Arc::new(provider),
        Err(error) => {
            error!(%error, "failed to build OAuth client");
            std::process::exit(1);
        }
    };

    if config.secure_cookies {
        info!("session cookies are marked Secure");
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        provider,
        shutdown.clone(),
    ));
    let tracker = state.tracker.clone();
    let app = router(state);

    let bind_addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, addr = %bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(
        addr = %bind_addr,
        program = config.shell_command.program(),
        shell = %config.shell_command.display(),
        "cloudshell-bridge listening"
    );

    let signal = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutting down, closing terminal sessions");
        signal.cancel();
    });

    if let Err(error) = serve.await {
        error!(%error, "server error");
        std::process::exit(1);
    }

    shutdown.cancel();
    drain_terminals(&tracker, DRAIN_TIMEOUT).await;
}

/// Waits for every tracked terminal connection to finish its teardown.
async fn drain_terminals(tracker: &TaskTracker, limit: Duration) -> bool {
    tracker.close();
    if tracker.is_empty() {
        return true;
    }

    info!(open = tracker.len(), "waiting for terminal sessions to close");
    match tokio::time::timeout(limit, tracker.wait()).await {
        Ok(()) => {
            info!("terminal sessions closed");
            true
        }
        Err(_) => {
            warn!(open = tracker.len(), "terminal sessions still open at shutdown");
            false
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
