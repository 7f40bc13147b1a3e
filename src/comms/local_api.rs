//! Local-network HTTP endpoint for direct command delivery.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::stream;
use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::agent::config::Settings;
use crate::agent::worker::{BackgroundWorker, Lifecycle};
use crate::commands::router::CommandRouter;
use crate::transport::controller::COMMAND_PATH;

type SharedState = Arc<AppState>;
type ServeFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

// Sleep between iterations when nothing could be bound.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<CommandRouter>,
    pub redirect_url: String,
}

impl AppState {
    pub fn new(router: Arc<CommandRouter>, redirect_url: impl Into<String>) -> Self {
        Self {
            router,
            redirect_url: redirect_url.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalServerOptions {
    pub bind_address: String,
    pub port: u16,
    pub fallback_port: u16,
    pub document_root: PathBuf,
    pub redirect_url: String,
    pub poll_wait: Duration,
}

impl LocalServerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_address: settings.bind_address.clone(),
            port: settings.local_port,
            fallback_port: settings.local_port_fallback,
            document_root: settings.document_root.clone(),
            redirect_url: settings.redirect_url.clone(),
            poll_wait: settings.poll_wait(),
        }
    }
}

// Run a command and stream the JSON result back as a chunked body.
// Dispatch may write the config file and call the listener, so it runs on
// the blocking pool.
async fn command_handler(State(state): State<SharedState>, body: Bytes) -> Response {
    let router = Arc::clone(&state.router);
    let result = match tokio::task::spawn_blocking(move || router.dispatch(&body)).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "local command dispatch aborted");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let json = result.to_json_string();
    debug!(bytes = json.len(), "local command handled");

    let chunks = stream::once(async move { Ok::<_, Infallible>(json) });
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn redirect_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, state.redirect_url.clone())],
    )
}

pub fn create_router(state: SharedState, document_root: impl Into<PathBuf>) -> Router {
    Router::new()
        .route(COMMAND_PATH, any(command_handler))
        .nest_service("/local", ServeDir::new(document_root.into()))
        .fallback(redirect_handler)
        .with_state(state)
}

async fn bind_with_fallback(options: &LocalServerOptions) -> Option<TcpListener> {
    for port in [options.port, options.fallback_port] {
        match TcpListener::bind((options.bind_address.as_str(), port)).await {
            Ok(listener) => return Some(listener),
            Err(e) => warn!(port, error = %e, "failed to bind local server port"),
        }
    }
    None
}

/// HTTP listener for commands from the local network, driven as a
/// [`BackgroundWorker`].
pub struct LocalServer {
    lifecycle: Lifecycle,
    serve: tokio::sync::Mutex<Option<ServeFuture>>,
    local_addr: Option<SocketAddr>,
    poll_wait: Duration,
}

impl LocalServer {
    /// Bind the preferred port, then the fallback. When neither can be bound
    /// the server stays uninitialized and its loop only idles.
    pub async fn setup(router: Arc<CommandRouter>, options: &LocalServerOptions) -> Self {
        let listener = match bind_with_fallback(options).await {
            Some(listener) => listener,
            None => {
                error!(
                    port = options.port,
                    fallback_port = options.fallback_port,
                    "no local port available, local server disabled"
                );
                return Self::uninitialized(options.poll_wait);
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "bound listener has no local address, local server disabled");
                return Self::uninitialized(options.poll_wait);
            }
        };
        info!(addr = %local_addr, "local server listening");

        let state = Arc::new(AppState::new(router, options.redirect_url.clone()));
        let app = create_router(state, options.document_root.clone());
        let serve: ServeFuture = Box::pin(axum::serve(listener, app).into_future());

        Self {
            lifecycle: Lifecycle::new(),
            serve: tokio::sync::Mutex::new(Some(serve)),
            local_addr: Some(local_addr),
            poll_wait: options.poll_wait,
        }
    }

    fn uninitialized(poll_wait: Duration) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            serve: tokio::sync::Mutex::new(None),
            local_addr: None,
            poll_wait,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }
}

#[async_trait]
impl BackgroundWorker for LocalServer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn name(&self) -> &'static str {
        "local-server"
    }

    async fn do_work(&self) -> bool {
        let mut serve = self.serve.lock().await;
        if serve.is_none() {
            drop(serve);
            tokio::time::sleep(IDLE_SLEEP).await;
            return true;
        }

        let outcome = match serve.as_mut() {
            Some(fut) => tokio::time::timeout(self.poll_wait, fut.as_mut()).await,
            None => return true,
        };

        match outcome {
            // Bounded wait elapsed with the server still running.
            Err(_) => {}
            Ok(Ok(())) => {
                warn!("local server stopped accepting connections");
                *serve = None;
            }
            Ok(Err(e)) => {
                error!(error = %e, "local server failed");
                *serve = None;
            }
        }
        true
    }
}
