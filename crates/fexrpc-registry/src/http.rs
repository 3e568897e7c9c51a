//! HTTP surface of the registry, served with axum.
//!
//! The protocol rides entirely in headers so that both sides stay
//! body-free: `GET` answers with `X-Fexrpc-Servers`, `POST` reads
//! `X-Fexrpc-Server`. Method routing is axum's, which answers unmatched
//! methods on the path with `405 Method Not Allowed`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use fexrpc_common::{Result, DEFAULT_REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};

use crate::registry::Registry;

impl Registry {
    /// Builds a router exposing this registry at `path`.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        info!(%path, "rpc registry: mounting http surface");
        Router::new()
            .route(path, get(get_servers).post(post_server))
            .with_state(self)
    }

    /// Serves the registry at the default path until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let router = self.router(DEFAULT_REGISTRY_PATH);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn get_servers(State(registry): State<Arc<Registry>>) -> (HeaderMap, ()) {
    let alive = registry.alive_servers().join(",");
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&alive) {
        Ok(value) => {
            headers.insert(SERVERS_HEADER, value);
        }
        Err(err) => warn!(error = %err, "rpc registry: unencodable server list"),
    }
    (headers, ())
}

async fn post_server(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    match headers.get(SERVER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(addr) if !addr.is_empty() => {
            registry.put_server(addr);
            StatusCode::OK
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
