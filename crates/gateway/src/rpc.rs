//! Request classification, dispatch, and order-preserving response reassembly

use crate::{
    cache::{CacheWriteQueue, ResolverCache},
    contracts::{ContractClassifier, ContractKind},
    forward::forward_requests,
    metrics::Metrics,
    networks::Network,
    rate_limit::RateLimiter,
    types::{
        BatchProcessingResult, ProcessedRequest, ProcessingError, ProcessingResult, RpcId,
        RpcPayload, RpcRequest, RpcResponse, FALLBACK_REQUEST_ID,
    },
    utils::{contract_address, generate_request_cache_key, is_request_cacheable},
};
use eyre::Result;
use futures::future::join_all;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

/// Creates a standardized JSON-RPC error response object
pub fn create_error_response(id: RpcId, code: i64, message: &str, data: &str) -> Value {
    json!({
        "id": id,
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message,
            "data": data,
        },
    })
}

/// The per-request decision engine and response combiner
///
/// For each element of an inbound call the handler decides: answer locally,
/// answer from the resolver cache, record a rate-limit verdict and forward,
/// or just forward. All elements of a batch are classified concurrently and
/// the consolidated forward set costs exactly one upstream round trip.
pub struct RpcHandler {
    upstream_client: reqwest::Client,
    resolver_cache: Arc<ResolverCache>,
    rate_limiter: Arc<RateLimiter>,
    classifier: Arc<ContractClassifier>,
    write_queue: CacheWriteQueue,
    metrics: Arc<Metrics>,
    forward_origin: Option<String>,
}

impl RpcHandler {
    /// Creates a handler over the shared gateway collaborators
    pub fn new(
        resolver_cache: Arc<ResolverCache>,
        rate_limiter: Arc<RateLimiter>,
        classifier: Arc<ContractClassifier>,
        write_queue: CacheWriteQueue,
        metrics: Arc<Metrics>,
        forward_origin: Option<String>,
    ) -> Result<Self> {
        let upstream_client =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build()?;

        Ok(Self {
            upstream_client,
            resolver_cache,
            rate_limiter,
            classifier,
            write_queue,
            metrics,
            forward_origin,
        })
    }

    /// Returns a reference to the resolver cache
    pub fn resolver_cache(&self) -> &Arc<ResolverCache> {
        &self.resolver_cache
    }

    /// Returns a reference to the cache write queue
    pub fn write_queue(&self) -> &CacheWriteQueue {
        &self.write_queue
    }

    /// Classifies one request and produces its processing record
    ///
    /// Decision order, first match wins: locally computable chain-id query,
    /// cacheable name-resolution call, rate-limit evaluation, plain forward.
    pub async fn process_single_request(
        &self,
        request: RpcRequest,
        network: &Network,
        identity: &str,
        provided_secret: Option<&str>,
    ) -> ProcessedRequest {
        self.metrics.bump(&self.metrics.requests);

        // Chain-id queries never leave the gateway. Method matching is
        // case/whitespace-insensitive; clients are sloppy here.
        if request.method.trim().to_lowercase() == "eth_chainid" {
            debug!("Answering chain-id query locally for network {}", network.id);
            self.metrics.bump(&self.metrics.local_responses);
            let response = json!({
                "id": request.effective_id(),
                "jsonrpc": "2.0",
                "result": network.chain_id_hex(),
            });
            return ProcessedRequest::answered(request, response, false);
        }

        if is_request_cacheable(network, &request) {
            let key = generate_request_cache_key(&network.id, &request);

            if let Some(result) = self.resolver_cache.get(&key).await {
                self.metrics.bump(&self.metrics.resolver_cache_hits);
                let response = json!({
                    "id": request.effective_id(),
                    "jsonrpc": "2.0",
                    "result": result,
                });
                return ProcessedRequest::answered(request, response, true);
            }

            // Miss: forward, and have the combiner cache the upstream result.
            return ProcessedRequest::forwarded(request, false, true);
        }

        let rate_limited = self.is_rate_limited(&request, network, identity, provided_secret).await;
        if rate_limited {
            self.metrics.bump(&self.metrics.rate_limited_observed);
            // Enforcement is observational for now: log and forward anyway.
            info!(
                "RATE_LIMIT_WOULD_BLOCK: identity={}, network={}, id={}, method={}",
                identity,
                network.id,
                request.effective_id(),
                request.method
            );
        }

        ProcessedRequest::forwarded(request, rate_limited, false)
    }

    /// Evaluates the rate limiter for one request
    ///
    /// Traffic against protocol contracts is exempt; an unclassifiable
    /// address is NOT treated as protocol traffic.
    async fn is_rate_limited(
        &self,
        request: &RpcRequest,
        network: &Network,
        identity: &str,
        provided_secret: Option<&str>,
    ) -> bool {
        let contract = contract_address(&request.method, &request.params);

        if let Some(address) = &contract {
            if self.classifier.classify(address, network).await
                == Some(ContractKind::ProtocolContract)
            {
                debug!("Protocol contract traffic exempt from rate limiting: {}", address);
                return false;
            }
        }

        let allowed = self.rate_limiter.check_rate_limit(
            identity,
            &request.method,
            contract.as_deref(),
            provided_secret,
        );

        !allowed
    }

    /// Classifies a whole batch concurrently, preserving input order
    pub async fn process_batch(
        &self,
        requests: Vec<RpcRequest>,
        network: &Network,
        identity: &str,
        provided_secret: Option<&str>,
    ) -> BatchProcessingResult {
        let processed_requests = join_all(
            requests
                .into_iter()
                .map(|request| self.process_single_request(request, network, identity, provided_secret)),
        )
        .await;

        let requests_to_forward: Vec<RpcRequest> = processed_requests
            .iter()
            .filter(|processed| processed.should_forward)
            .map(|processed| processed.request.clone())
            .collect();

        BatchProcessingResult { processed_requests, requests_to_forward }
    }

    /// Merges local and upstream responses back into original order
    ///
    /// Correlation is by request id, never by arrival order. A forwarded
    /// request whose id is absent from the upstream answer gets a synthesized
    /// internal error; a matched response flagged for resolution caching is
    /// written through the detached queue.
    pub fn combine_responses(
        &self,
        processed_requests: &[ProcessedRequest],
        upstream_responses: Option<&[RpcResponse]>,
        network_id: &str,
    ) -> Vec<RpcResponse> {
        let mut response_map: HashMap<RpcId, &RpcResponse> = HashMap::new();
        if let Some(responses) = upstream_responses {
            for response in responses {
                let Some(id_value) = response.get("id") else { continue };
                if let Ok(id) = serde_json::from_value::<RpcId>(id_value.clone()) {
                    response_map.insert(id, response);
                }
            }
        }

        processed_requests
            .iter()
            .map(|processed| {
                if !processed.should_forward {
                    return processed.response.clone().unwrap_or_else(|| {
                        create_error_response(
                            processed.request.effective_id(),
                            -32603,
                            "Internal JSON-RPC error",
                            "No local response recorded for this request",
                        )
                    });
                }

                match response_map.get(&processed.request.effective_id()) {
                    Some(response) => {
                        if processed.should_cache_resolution && response.get("error").is_none() {
                            if let Some(result) = response.get("result") {
                                let key =
                                    generate_request_cache_key(network_id, &processed.request);
                                self.write_queue.write_resolver(key, result.clone());
                            }
                        }
                        (*response).clone()
                    }
                    None => create_error_response(
                        processed.request.effective_id(),
                        -32603,
                        "Internal JSON-RPC error",
                        "No response received from provider for this request",
                    ),
                }
            })
            .collect()
    }

    /// Runs the complete processing flow for one inbound call
    ///
    /// Classification, the single consolidated forward, and reassembly. The
    /// result always carries one response per inbound request, in order; a
    /// forwarding failure surfaces per affected request while co-batched
    /// local answers still succeed.
    pub async fn process_and_forward(
        &self,
        payload: RpcPayload,
        network: &Network,
        identity: &str,
        provided_secret: Option<&str>,
    ) -> ProcessingResult {
        let is_batch = payload.is_batch();
        if is_batch {
            self.metrics.bump(&self.metrics.batch_calls);
        }
        let requests = payload.into_requests();

        let batch_result =
            self.process_batch(requests, network, identity, provided_secret).await;

        if batch_result.requests_to_forward.is_empty() {
            let responses =
                self.combine_responses(&batch_result.processed_requests, None, &network.id);
            return ProcessingResult { responses, is_batch, error: None };
        }

        self.metrics.add(&self.metrics.forwarded, batch_result.requests_to_forward.len() as u64);

        match forward_requests(
            &self.upstream_client,
            &network.upstream_url,
            self.forward_origin.as_deref(),
            &batch_result.requests_to_forward,
        )
        .await
        {
            Ok(upstream_responses) => {
                let responses = self.combine_responses(
                    &batch_result.processed_requests,
                    Some(&upstream_responses),
                    &network.id,
                );
                ProcessingResult { responses, is_batch, error: None }
            }
            Err(failure) => {
                self.metrics.bump(&self.metrics.upstream_errors);
                warn!("Upstream forwarding failed for network {}: {}", network.id, failure);

                // The first forwarded request carries the specific failure;
                // the rest correlate to per-id synthesized errors.
                let error_id = batch_result
                    .requests_to_forward
                    .first()
                    .map(RpcRequest::effective_id)
                    .unwrap_or(RpcId::Number(FALLBACK_REQUEST_ID));
                let error_response = create_error_response(
                    error_id,
                    -32603,
                    "Internal JSON-RPC error",
                    &failure.message,
                );

                let responses = self.combine_responses(
                    &batch_result.processed_requests,
                    Some(std::slice::from_ref(&error_response)),
                    &network.id,
                );

                ProcessingResult {
                    responses,
                    is_batch,
                    error: Some(ProcessingError {
                        message: failure.message,
                        original_error: failure.original_error.to_string(),
                        status: 500,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiterConfig;
    use lockrpc_common::logging::ensure_test_logging;
    use std::time::Duration;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const RESOLVER: &str = "0x4444444444444444444444444444444444444444";

    fn test_network(upstream_url: String) -> Network {
        Network {
            id: "1".to_string(),
            chain_id: 1,
            upstream_url,
            lock_registry: None,
            known_contracts: vec!["0x3333333333333333333333333333333333333333".parse().unwrap()],
            name_resolvers: vec![RESOLVER.parse().unwrap()],
        }
    }

    fn test_handler(limiter_config: RateLimiterConfig) -> RpcHandler {
        let resolver_cache = Arc::new(ResolverCache::new(None));
        let edge_cache = Arc::new(crate::cache::EdgeCache::new(100));
        let write_queue = CacheWriteQueue::spawn(edge_cache, resolver_cache.clone());

        RpcHandler::new(
            resolver_cache,
            Arc::new(RateLimiter::new(limiter_config, None)),
            Arc::new(ContractClassifier::new().unwrap()),
            write_queue,
            Arc::new(Metrics::new()),
            None,
        )
        .unwrap()
    }

    fn request(value: Value) -> RpcRequest {
        serde_json::from_value(value).unwrap()
    }

    fn resolution_request(id: i64) -> RpcRequest {
        request(json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{"to": RESOLVER, "data": "0x3b3b57de00000000000000000000000000000000000000000000000000000000"}, "latest"]
        }))
    }

    #[tokio::test]
    async fn test_chain_id_answered_locally() {
        ensure_test_logging(None);

        // An unreachable upstream proves no network call is made.
        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        for spelling in ["eth_chainId", "ETH_CHAINID", "  eth_chainid  "] {
            let processed = handler
                .process_single_request(
                    request(json!({"id": 1, "method": spelling, "params": []})),
                    &network,
                    "1.2.3.4",
                    None,
                )
                .await;

            assert!(!processed.should_forward);
            assert_eq!(
                processed.response,
                Some(json!({"id": 1, "jsonrpc": "2.0", "result": "0x1"}))
            );
        }
    }

    #[tokio::test]
    async fn test_default_requests_are_forwarded() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let processed = handler
            .process_single_request(
                request(json!({"id": 1, "method": "eth_blockNumber", "params": []})),
                &network,
                "1.2.3.4",
                None,
            )
            .await;

        assert!(processed.should_forward);
        assert!(processed.response.is_none());
        assert!(!processed.rate_limited);
        assert!(!processed.should_cache_resolution);
    }

    #[tokio::test]
    async fn test_resolver_cache_hit_restamps_id() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let key = generate_request_cache_key(&network.id, &resolution_request(1));
        handler.resolver_cache().put(key, json!("0xcachedresult")).await;

        // The live request has a different id than whatever was cached under
        let processed = handler
            .process_single_request(resolution_request(99), &network, "1.2.3.4", None)
            .await;

        assert!(processed.from_cache);
        assert_eq!(
            processed.response,
            Some(json!({"id": 99, "jsonrpc": "2.0", "result": "0xcachedresult"}))
        );
    }

    #[tokio::test]
    async fn test_resolver_cache_miss_marks_for_caching() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let processed = handler
            .process_single_request(resolution_request(1), &network, "1.2.3.4", None)
            .await;

        assert!(processed.should_forward);
        assert!(processed.should_cache_resolution);
        assert!(!processed.rate_limited);
    }

    #[tokio::test]
    async fn test_rate_limited_requests_still_forward() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig {
            fine_limit: 1,
            fine_window: Duration::from_secs(10),
            coarse_limit: 100,
            coarse_window: Duration::from_secs(60),
        });

        let make = || request(json!({"id": 1, "method": "eth_gasPrice", "params": []}));

        let first = handler.process_single_request(make(), &network, "1.2.3.4", None).await;
        assert!(!first.rate_limited);

        let second = handler.process_single_request(make(), &network, "1.2.3.4", None).await;
        assert!(second.rate_limited);
        // Observational policy: the request is still forwarded
        assert!(second.should_forward);
    }

    #[tokio::test]
    async fn test_known_protocol_contract_is_not_limited() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig {
            fine_limit: 1,
            fine_window: Duration::from_secs(10),
            coarse_limit: 1,
            coarse_window: Duration::from_secs(60),
        });

        let make = || {
            request(json!({
                "id": 1,
                "method": "eth_call",
                "params": [{"to": "0x3333333333333333333333333333333333333333", "data": "0x01"}, "latest"]
            }))
        };

        for _ in 0..5 {
            let processed = handler.process_single_request(make(), &network, "1.2.3.4", None).await;
            assert!(!processed.rate_limited);
        }
    }

    #[tokio::test]
    async fn test_batch_order_and_forward_subset() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let requests = vec![
            request(json!({"id": 10, "method": "eth_chainId", "params": []})),
            request(json!({"id": 20, "method": "eth_blockNumber", "params": []})),
            request(json!({"id": 30, "method": "eth_chainId", "params": []})),
            request(json!({"id": 40, "method": "eth_getBalance", "params": ["0xdead", "latest"]})),
        ];

        let batch = handler.process_batch(requests, &network, "1.2.3.4", None).await;

        let ids: Vec<RpcId> =
            batch.processed_requests.iter().map(|p| p.request.effective_id()).collect();
        assert_eq!(ids, vec![10.into(), 20.into(), 30.into(), 40.into()]);

        let forward_ids: Vec<RpcId> =
            batch.requests_to_forward.iter().map(RpcRequest::effective_id).collect();
        assert_eq!(forward_ids, vec![20.into(), 40.into()]);
    }

    #[tokio::test]
    async fn test_combine_preserves_order_and_synthesizes_missing() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let requests = vec![
            request(json!({"id": 1, "method": "eth_chainId", "params": []})),
            request(json!({"id": 2, "method": "eth_blockNumber", "params": []})),
            request(json!({"id": 3, "method": "eth_gasPrice", "params": []})),
        ];
        let batch = handler.process_batch(requests, &network, "1.2.3.4", None).await;

        // Upstream answered out of order and dropped id 3 entirely
        let upstream = vec![json!({"jsonrpc": "2.0", "id": 2, "result": "0x10"})];
        let combined =
            handler.combine_responses(&batch.processed_requests, Some(&upstream), &network.id);

        assert_eq!(combined.len(), 3);
        assert_eq!(combined[0]["id"], 1);
        assert_eq!(combined[0]["result"], "0x1");
        assert_eq!(combined[1]["id"], 2);
        assert_eq!(combined[1]["result"], "0x10");
        assert_eq!(combined[2]["id"], 3);
        assert_eq!(combined[2]["error"]["code"], -32603);
        assert_eq!(
            combined[2]["error"]["data"],
            "No response received from provider for this request"
        );
    }

    #[tokio::test]
    async fn test_process_and_forward_caches_resolution_results() {
        ensure_test_logging(None);

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"jsonrpc": "2.0", "id": 1, "result": "0xresolved"}
            ])))
            .expect(1) // The second call must be served from cache
            .mount(&mock_server)
            .await;

        let network = test_network(mock_server.uri());
        let handler = test_handler(RateLimiterConfig::default());

        let first = handler
            .process_and_forward(
                RpcPayload::Single(resolution_request(1)),
                &network,
                "1.2.3.4",
                None,
            )
            .await;
        assert!(first.error.is_none());
        assert_eq!(first.responses[0]["result"], "0xresolved");

        // Let the detached write land before the second request
        handler.write_queue().flush().await;

        let second = handler
            .process_and_forward(
                RpcPayload::Single(resolution_request(2)),
                &network,
                "1.2.3.4",
                None,
            )
            .await;
        assert!(second.error.is_none());
        assert_eq!(second.responses[0]["id"], 2);
        assert_eq!(second.responses[0]["result"], "0xresolved");
    }

    #[tokio::test]
    async fn test_forwarding_failure_isolates_local_answers() {
        ensure_test_logging(None);

        // Unreachable upstream: forwarding fails, local answers survive
        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let payload = RpcPayload::Batch(vec![
            request(json!({"id": 1, "method": "eth_chainId", "params": []})),
            request(json!({"id": 2, "method": "eth_blockNumber", "params": []})),
        ]);

        let result = handler.process_and_forward(payload, &network, "1.2.3.4", None).await;

        assert!(result.is_batch);
        assert_eq!(result.responses.len(), 2);
        assert_eq!(result.responses[0]["result"], "0x1");
        assert_eq!(result.responses[1]["error"]["code"], -32603);

        let error = result.error.unwrap();
        assert_eq!(error.status, 500);
        assert_eq!(error.message, "Failed to forward requests to provider");
    }

    #[tokio::test]
    async fn test_all_local_batch_skips_upstream() {
        ensure_test_logging(None);

        let network = test_network("http://127.0.0.1:9".to_string());
        let handler = test_handler(RateLimiterConfig::default());

        let payload = RpcPayload::Batch(vec![
            request(json!({"id": 1, "method": "eth_chainId", "params": []})),
            request(json!({"id": 2, "method": "eth_chainId", "params": []})),
        ]);

        let result = handler.process_and_forward(payload, &network, "1.2.3.4", None).await;
        assert!(result.error.is_none());
        assert_eq!(result.responses.len(), 2);
        assert_eq!(result.responses[1], json!({"id": 2, "jsonrpc": "2.0", "result": "0x1"}));
    }

    #[test]
    fn test_create_error_response_shape() {
        let response = create_error_response(
            RpcId::Number(7),
            -32603,
            "Internal JSON-RPC error",
            "details",
        );
        assert_eq!(response["id"], 7);
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(response["error"]["message"], "Internal JSON-RPC error");
        assert_eq!(response["error"]["data"], "details");
    }
}
