//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with a catch-all dispatch handler
//! - Wire up middleware (tracing, timeout)
//! - Run requests through the configured middleware chain
//! - Forward requests to the upstream server
//! - Rebuild the chain on config reload

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{
        uri::{Authority, InvalidUri, PathAndQuery, Scheme},
        Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::{service_fn, ServiceExt};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::http::middleware::{build_chain, BoxHandler, ChainError, MiddlewareRegistry};

type UpstreamClient = Client<HttpConnector, Body>;

/// Errors raised while setting up the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("invalid upstream address `{address}`: {source}")]
    Upstream {
        address: String,
        #[source]
        source: InvalidUri,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<ArcSwap<BoxHandler>>,
}

/// HTTP server hosting the middleware chain.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    registry: Arc<MiddlewareRegistry>,
    client: UpstreamClient,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server, assembling the chain from `config`.
    pub fn new(config: ProxyConfig, registry: Arc<MiddlewareRegistry>) -> Result<Self, ServerError> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let chain = assemble(&config, &registry, &client)?;
        let state = AppState {
            chain: Arc::new(ArcSwap::from_pointee(chain)),
        };

        let router = Self::build_router(&config, state.clone());
        Ok(Self {
            router,
            config,
            registry,
            client,
            state,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires, applying config updates as they
    /// arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.address,
            middlewares = self.config.middlewares.len(),
            "HTTP server starting"
        );

        let registry = self.registry.clone();
        let client = self.client.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(new_config) = config_updates.recv().await {
                match assemble(&new_config, &registry, &client) {
                    Ok(chain) => {
                        state.chain.store(Arc::new(chain));
                        tracing::info!(
                            middlewares = new_config.middlewares.len(),
                            "Middleware chain reloaded"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "Failed to rebuild middleware chain, keeping current chain"
                        );
                    }
                }
            }
        });

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the middleware chain in front of an upstream forwarder.
fn assemble(
    config: &ProxyConfig,
    registry: &MiddlewareRegistry,
    client: &UpstreamClient,
) -> Result<BoxHandler, ServerError> {
    let upstream = Authority::from_str(config.upstream.address.trim()).map_err(|source| {
        ServerError::Upstream {
            address: config.upstream.address.clone(),
            source,
        }
    })?;

    let client = client.clone();
    let terminal = BoxHandler::new(service_fn(move |request: Request<Body>| {
        forward(client.clone(), upstream.clone(), request)
    }));

    Ok(build_chain(registry, &config.middlewares, terminal)?)
}

/// Run the request through the current chain.
async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let chain = BoxHandler::clone(&state.chain.load_full());
    match chain.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Forward a request to the upstream server.
async fn forward(
    client: UpstreamClient,
    upstream: Authority,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (mut parts, body) = request.into_parts();

    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.scheme = Some(Scheme::HTTP);
    uri_parts.authority = Some(upstream);
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = match Uri::from_parts(uri_parts) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(error = %e, "Could not build upstream URI");
            return Ok((StatusCode::BAD_REQUEST, "Invalid request URI").into_response());
        }
    };

    tracing::debug!(method = %parts.method, uri = %parts.uri, "Forwarding request");

    match client.request(Request::from_parts(parts, body)).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, Body::new(body)))
        }
        Err(e) => {
            tracing::error!(error = %e, "Upstream error");
            Ok((StatusCode::BAD_GATEWAY, "Upstream request failed").into_response())
        }
    }
}
