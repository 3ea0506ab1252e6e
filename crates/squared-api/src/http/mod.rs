pub mod error;
pub mod health;
pub mod resources;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Router, serve};
use squared_core::{Catalog, ResourceKey};
use tokio::net::TcpListener;

pub use error::ApiError;

/// Shared by every handler. Core calls block on registry I/O, so handlers go
/// through [`ServerState::blocking`].
#[derive(Clone)]
pub struct ServerState {
    pub catalog: Arc<Catalog>,
    pub namespace: Arc<str>,
    pub request_timeout: Duration,
}

impl ServerState {
    pub fn new(
        catalog: Arc<Catalog>,
        namespace: impl Into<Arc<str>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            namespace: namespace.into(),
            request_timeout,
        }
    }

    pub fn key(&self, name: &str) -> Result<ResourceKey, ApiError> {
        ResourceKey::new(&*self.namespace, name).map_err(ApiError::from)
    }

    /// Run `op` on the blocking pool under the request deadline. `op` gets
    /// the deadline too: the response is abandoned when it passes, and core
    /// mutations stop before their next registry write, so a timed-out
    /// request never commits.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Catalog, Instant) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = Arc::clone(&self.catalog);
        let deadline = Instant::now() + self.request_timeout;
        let task = tokio::task::spawn_blocking(move || op(&catalog, deadline));
        match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ApiError::Internal(format!("catalog task failed: {join}"))),
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/api/v1/resources",
            get(resources::list).post(resources::create),
        )
        .route(
            "/api/v1/resources/{name}",
            get(resources::get).delete(resources::delete),
        )
        .route("/api/v1/resources/{name}/versions", get(resources::versions))
        .route("/healthz", get(health::handler))
        .with_state(state)
}

pub struct HttpServer {
    addr: SocketAddr,
    router: Router,
    state: ServerState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: ServerState) -> Self {
        Self {
            addr,
            router: router(state.clone()),
            state,
        }
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!(
            addr = %self.addr,
            namespace = %self.state.namespace,
            resources = self.state.catalog.len(),
            "starting api server"
        );
        serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .context("api server terminated")?;
        Ok(())
    }
}
