//! Gateway server: HTTP surface, configuration builder, background tasks

use crate::{
    cache::{CacheWriteQueue, EdgeCache, ResolverCache},
    contracts::ContractClassifier,
    health::HealthService,
    metrics::Metrics,
    networks::Networks,
    rate_limit::{RateLimiter, RateLimiterConfig},
    rpc::{create_error_response, RpcHandler},
    types::{RpcId, RpcPayload, FALLBACK_REQUEST_ID},
    utils::{client_identity, generate_request_cache_key, is_request_cacheable, DEFAULT_CACHE_TTL},
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::Result;
use lockrpc_common::env::{
    read_env, read_env_u64_or, CACHE_DURATION_SECONDS, GATEWAY_ORIGIN, GATEWAY_SECRET,
};
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// Builder for configuring a [`ProxyServer`] with sensible defaults
///
/// Unset values fall back to the environment and then to built-in defaults;
/// configuration mistakes degrade, they never fail a call.
#[derive(Debug, Clone, Default)]
pub struct ProxyServerBuilder {
    networks: Option<Networks>,
    cache_ttl_seconds: Option<u64>,
    gateway_secret: Option<String>,
    forward_origin: Option<String>,
    resolver_cache_path: Option<PathBuf>,
    edge_max_items: Option<usize>,
    limiter_config: Option<RateLimiterConfig>,
    cache_save_interval: Option<u64>,
}

impl ProxyServerBuilder {
    /// Creates a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the network table explicitly (defaults + env overrides otherwise)
    pub fn networks(mut self, networks: Networks) -> Self {
        self.networks = Some(networks);
        self
    }

    /// Sets the edge cache TTL in seconds
    pub fn cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.cache_ttl_seconds = Some(seconds);
        self
    }

    /// Sets the trusted-caller shared secret
    pub fn gateway_secret(mut self, secret: impl Into<String>) -> Self {
        self.gateway_secret = Some(secret.into());
        self
    }

    /// Sets the `Origin` header value sent on forwarded requests
    pub fn forward_origin(mut self, origin: impl Into<String>) -> Self {
        self.forward_origin = Some(origin.into());
        self
    }

    /// Sets the resolver cache persistence file
    pub fn resolver_cache_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.resolver_cache_path = Some(path.into());
        self
    }

    /// Sets the maximum number of edge cache entries
    pub fn edge_max_items(mut self, max_items: usize) -> Self {
        self.edge_max_items = Some(max_items);
        self
    }

    /// Sets the rate limiter tier configuration
    pub fn limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.limiter_config = Some(config);
        self
    }

    /// Sets the resolver cache save interval in minutes (0 = save only on shutdown)
    pub fn cache_save_interval(mut self, minutes: u64) -> Self {
        self.cache_save_interval = Some(minutes);
        self
    }

    /// Builds the server with the configured settings
    pub async fn build(self) -> Result<ProxyServer> {
        let networks =
            self.networks.unwrap_or_else(|| Networks::defaults().apply_env_overrides());
        let cache_ttl_seconds = self
            .cache_ttl_seconds
            .unwrap_or_else(|| read_env_u64_or(CACHE_DURATION_SECONDS, DEFAULT_CACHE_TTL));
        let gateway_secret = self.gateway_secret.or_else(|| read_env(GATEWAY_SECRET));
        let forward_origin = self.forward_origin.or_else(|| read_env(GATEWAY_ORIGIN));

        ProxyServer::new(
            networks,
            cache_ttl_seconds,
            gateway_secret,
            forward_origin,
            self.resolver_cache_path,
            self.edge_max_items.unwrap_or(10240),
            self.limiter_config.unwrap_or_default(),
            self.cache_save_interval.unwrap_or(5),
        )
        .await
    }
}

/// The assembled gateway: request handler, caches, health, and HTTP surface
#[derive(Clone)]
pub struct ProxyServer {
    /// Request classification and reassembly engine
    pub rpc_handler: Arc<RpcHandler>,
    /// Supported-network table
    pub networks: Arc<Networks>,
    /// Full-body response cache served at the HTTP boundary
    pub edge_cache: Arc<EdgeCache>,
    /// Health reporting service
    pub health_service: Arc<HealthService>,
    /// Request flow counters
    pub metrics: Arc<Metrics>,
    cache_ttl: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Clone)]
struct AppState {
    proxy: ProxyServer,
}

impl ProxyServer {
    #[allow(clippy::too_many_arguments)]
    async fn new(
        networks: Networks,
        cache_ttl_seconds: u64,
        gateway_secret: Option<String>,
        forward_origin: Option<String>,
        resolver_cache_path: Option<PathBuf>,
        edge_max_items: usize,
        limiter_config: RateLimiterConfig,
        cache_save_interval: u64,
    ) -> Result<Self> {
        info!("Starting lockrpc gateway with {} supported networks", networks.len());
        for network in networks.iter() {
            info!("  - network {} -> {}", network.id, network.upstream_url);
        }

        let networks = Arc::new(networks);
        let edge_cache = Arc::new(EdgeCache::new(edge_max_items));
        let resolver_cache = Arc::new(ResolverCache::new(resolver_cache_path));
        let write_queue = CacheWriteQueue::spawn(edge_cache.clone(), resolver_cache.clone());
        let rate_limiter = Arc::new(RateLimiter::new(limiter_config, gateway_secret));
        let classifier = Arc::new(ContractClassifier::new()?);
        let metrics = Arc::new(Metrics::new());
        let health_service = Arc::new(HealthService::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let rpc_handler = Arc::new(RpcHandler::new(
            resolver_cache.clone(),
            rate_limiter.clone(),
            classifier,
            write_queue,
            metrics.clone(),
            forward_origin,
        )?);

        // Periodic resolver cache persistence (if enabled)
        if cache_save_interval > 0 {
            let resolver_cache_clone = resolver_cache.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(cache_save_interval * 60));
                interval.tick().await; // First tick completes immediately
                loop {
                    interval.tick().await;
                    if let Err(e) = resolver_cache_clone.save_to_disk().await {
                        warn!("Failed to save resolver cache periodically: {}", e);
                    } else {
                        debug!("Resolver cache saved to disk (periodic save)");
                    }
                }
            });
        }

        // Periodic limiter window sweep
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await;
            loop {
                interval.tick().await;
                let swept = rate_limiter.sweep();
                if swept > 0 {
                    debug!("Swept {} stale rate limiter windows", swept);
                }
            }
        });

        Ok(Self {
            rpc_handler,
            networks,
            edge_cache,
            health_service,
            metrics,
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
            shutdown_tx,
        })
    }

    /// Signals the server to shut down gracefully
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Starts the gateway listening on `addr`
    ///
    /// Routes: `POST /{network_id}` for JSON-RPC traffic and `GET /health`
    /// for monitoring. CORS headers are attached to every response, errors
    /// included; panics anywhere in the pipeline are converted to the
    /// JSON-RPC error shape rather than tearing the connection down.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let resolver_cache_for_shutdown = self.rpc_handler.resolver_cache().clone();

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/{network_id}", post(handle_rpc).fallback(handle_unsupported_method))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::POST, Method::GET])
                    .allow_headers(Any)
                    .allow_origin(Any),
            )
            .with_state(AppState { proxy: self });

        let listener = TcpListener::bind(addr).await?;
        info!("lockrpc gateway listening on {}", addr);

        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, saving resolver cache and stopping gracefully");

            if let Err(e) = resolver_cache_for_shutdown.save_to_disk().await {
                warn!("Failed to save resolver cache during shutdown: {}", e);
            }
        });

        server.await?;

        Ok(())
    }
}

async fn handle_rpc(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let proxy = &state.proxy;
    proxy.metrics.bump(&proxy.metrics.calls);

    // Network validation happens before the body is even parsed.
    let Some(network) = proxy.networks.get(&network_id) else {
        proxy.metrics.bump(&proxy.metrics.client_errors);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": format!("Unsupported network ID: {network_id}")})),
        );
    };

    let payload: RpcPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            proxy.metrics.bump(&proxy.metrics.client_errors);
            warn!("Rejecting unparseable request body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(create_error_response(
                    RpcId::Number(FALLBACK_REQUEST_ID),
                    -32603,
                    "Internal JSON-RPC error",
                    "Invalid JSON in request body",
                )),
            );
        }
    };

    // Edge cache consult. Batches key off their first element; a mixed-method
    // batch therefore shares that element's key. Documented approximation.
    let edge_key = payload
        .first()
        .filter(|first| is_request_cacheable(network, first))
        .map(|first| generate_request_cache_key(&network_id, first));

    if let Some(key) = &edge_key {
        if let Some(cached) = proxy.edge_cache.get(key).await {
            proxy.metrics.bump(&proxy.metrics.edge_cache_hits);
            return (StatusCode::OK, Json(cached));
        }
    }

    let identity = client_identity(&headers, &format!("/{network_id}"), "POST");
    let provided_secret = query.get("secret").map(String::as_str);

    let result =
        proxy.rpc_handler.process_and_forward(payload, network, &identity, provided_secret).await;

    let status = result
        .error
        .as_ref()
        .map(|e| StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .unwrap_or(StatusCode::OK);

    // Re-project to the wire shape the caller used: array in, array out.
    let response_body = if result.is_batch {
        Value::Array(result.responses)
    } else {
        result.responses.into_iter().next().unwrap_or_else(|| {
            create_error_response(
                RpcId::Number(FALLBACK_REQUEST_ID),
                -32603,
                "Internal JSON-RPC error",
                "Empty processing result",
            )
        })
    };

    // Successful cacheable responses refill the edge cache off the response path.
    if status == StatusCode::OK {
        if let Some(key) = edge_key {
            proxy.rpc_handler.write_queue().write_edge(
                key,
                response_body.clone(),
                proxy.cache_ttl,
            );
        }
    }

    (status, Json(response_body))
}

async fn handle_unsupported_method(method: Method) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"message": format!("Method {method} not supported")})),
    )
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let proxy = &state.proxy;

    let mut info = proxy.health_service.info();
    info["networks"] = json!(proxy.networks.len());
    info["metrics"] = proxy.metrics.snapshot();
    info["edge_cache_entries"] = json!(proxy.edge_cache.len().await);
    info["resolver_cache_entries"] = json!(proxy.rpc_handler.resolver_cache().len().await);

    Json(info)
}

fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown error".to_string()
    };

    warn!("Recovered from panic in request pipeline: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(create_error_response(
            RpcId::Number(FALLBACK_REQUEST_ID),
            -32603,
            "Internal JSON-RPC error",
            "Unexpected error in RPC request handling",
        )),
    )
        .into_response()
}
