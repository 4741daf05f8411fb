use crate::config::Config;
use crate::settings::{JsonFileSettings, SettingsProvider, StaticSettings};
use crate::streaming::{start_cleanup_task, HlsPublisher, SessionConfig, SessionManager};
use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamrelay_av::{resolve_tool_path, ProfileRegistry, StreamProber};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

pub mod routes_api;
pub mod routes_stream;

/// Response header carrying the id of the session serving a stream
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub profiles: Arc<ProfileRegistry>,
    pub sessions: SessionManager,
    pub publisher: Arc<HlsPublisher>,
    pub prober: Arc<StreamProber>,
    /// Stream preferences used when a request does not pick a format
    pub settings: Arc<dyn SettingsProvider>,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let profiles = Arc::new(ProfileRegistry::standard());
        let sessions = SessionManager::new(SessionConfig::from_config(&config), profiles.clone());
        let publisher = Arc::new(HlsPublisher::new(&config.hls));
        let prober = Arc::new(
            StreamProber::new(resolve_tool_path(&config.tools.ffprobe))
                .with_timeout(config.relay.probe_timeout()),
        );
        let settings: Arc<dyn SettingsProvider> = match config.settings.path {
            Some(ref path) => Arc::new(JsonFileSettings::new(path)),
            None => Arc::new(StaticSettings::default()),
        };

        Self {
            config: Arc::new(config),
            profiles,
            sessions,
            publisher,
            prober,
            settings,
            started_at: Instant::now(),
        }
    }

    /// Replace the settings source
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = settings;
        self
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    // Published playlists and segments, straight from the HLS root
    let hls_files = ServeDir::new(ctx.publisher.root());
    let mount_path = ctx.publisher.mount_path().to_string();

    Router::new()
        .merge(routes_api::api_routes())
        .merge(routes_stream::stream_routes())
        .nest_service(&mount_path, hls_files)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Starting server on {}", addr);

    serve(listener, AppContext::new(config), shutdown_signal()).await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Serve `ctx` on `listener` until `shutdown` resolves.
///
/// Live sessions are cancelled as soon as shutdown starts; streaming
/// responses only end once their session does.
pub async fn serve<F>(listener: TcpListener, ctx: AppContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::fs::create_dir_all(ctx.publisher.root())
        .await
        .with_context(|| format!("Failed to create HLS root {:?}", ctx.publisher.root()))?;

    let cleanup = start_cleanup_task(ctx.sessions.clone(), Duration::from_secs(10));

    let sessions = ctx.sessions.clone();
    let publisher = ctx.publisher.clone();
    let app = create_router(ctx);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            sessions.shutdown().await;
        })
        .await;

    cleanup.abort();
    publisher.shutdown();

    result.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
}
