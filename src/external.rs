//! External HTTP server: one-click subscription import plus a static page

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::AppState;

/// Running external server
pub struct ExternalServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ExternalServer {
    /// Bind `addr` and serve until [`ExternalServer::stop`]
    pub async fn start(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind external server on {}", addr))?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();

        let app = router(state);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = served {
                error!("External server failed: {}", e);
            }
        });

        info!("External server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        info!("External server on {} stopped", self.addr);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download_sub", get(download_sub))
        .fallback(serve_static)
        .with_state(state)
}

async fn download_sub(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(link) = params.get("link").filter(|link| !link.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "missing link" })),
        )
            .into_response();
    };

    let outcome = state.download_subscription(link).await;
    if outcome.success {
        (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": outcome.error })),
        )
            .into_response()
    }
}

/// Files under the external directory; directories and extension-less misses
/// resolve to their `index.html`
async fn serve_static(State(state): State<AppState>, uri: Uri) -> Response {
    let relative = uri.path().trim_start_matches('/');
    let relative_path = Path::new(relative);
    if relative_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut path = state.paths.external_dir().join(relative_path);
    if path.is_dir() || (!path.exists() && path.extension().is_none()) {
        path = path.join("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(body) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.to_string())], body).into_response()
        }
        Err(e) => {
            debug!("Static file {:?} not served: {}", path, e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
