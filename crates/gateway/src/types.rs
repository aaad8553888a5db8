//! Request and processing-record types shared across the gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON-RPC response body, passed through verbatim wherever possible
pub type RpcResponse = Value;

/// Sentinel request id used when no real id can be recovered from the call
pub const FALLBACK_REQUEST_ID: i64 = 42;

/// A JSON-RPC request id
///
/// Ids are numbers in practice but strings are legal on the wire; correlation
/// between forwarded requests and upstream responses is done by id, so both
/// shapes must hash and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric id
    Number(i64),
    /// String id
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A single JSON-RPC request
///
/// Deserialization is deliberately lenient: the gateway routes requests, it
/// does not validate them, so every field defaults rather than rejecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Request id, used for response correlation within one batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    /// Protocol version tag, echoed back in responses
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Method name
    #[serde(default)]
    pub method: String,
    /// Method parameters, kept as raw JSON
    #[serde(default)]
    pub params: Value,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

impl RpcRequest {
    /// Returns the request id, or the fallback sentinel when absent
    pub fn effective_id(&self) -> RpcId {
        self.id.clone().unwrap_or(RpcId::Number(FALLBACK_REQUEST_ID))
    }

    /// Returns the params as an array slice, if they are an array
    pub fn params_array(&self) -> Option<&Vec<Value>> {
        self.params.as_array()
    }
}

/// An inbound JSON-RPC payload: one request object or an array of them
///
/// The wire shape is remembered so the response can be re-projected to the
/// same tag at the boundary; everything in between operates on a request list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcPayload {
    /// An array of requests answered together
    Batch(Vec<RpcRequest>),
    /// A single request object
    Single(RpcRequest),
}

impl RpcPayload {
    /// True if the payload arrived as an array
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// Normalizes the payload to a request list for uniform processing
    pub fn into_requests(self) -> Vec<RpcRequest> {
        match self {
            Self::Batch(requests) => requests,
            Self::Single(request) => vec![request],
        }
    }

    /// Returns the first request of the payload, if any
    pub fn first(&self) -> Option<&RpcRequest> {
        match self {
            Self::Batch(requests) => requests.first(),
            Self::Single(request) => Some(request),
        }
    }
}

/// The outcome of classifying one request
///
/// Exactly one of `response.is_some()` or `should_forward` holds after
/// classification.
#[derive(Debug, Clone)]
pub struct ProcessedRequest {
    /// The original request
    pub request: RpcRequest,
    /// Locally produced response, if the request was answered without upstream
    pub response: Option<RpcResponse>,
    /// Whether this request must be sent upstream
    pub should_forward: bool,
    /// Whether the rate limiter reported a would-block verdict
    pub rate_limited: bool,
    /// Whether the response was served from cache
    pub from_cache: bool,
    /// Whether the eventual upstream result should be written to the
    /// persistent resolver cache
    pub should_cache_resolution: bool,
}

impl ProcessedRequest {
    /// A request answered locally (or from cache)
    pub fn answered(request: RpcRequest, response: RpcResponse, from_cache: bool) -> Self {
        Self {
            request,
            response: Some(response),
            should_forward: false,
            rate_limited: false,
            from_cache,
            should_cache_resolution: false,
        }
    }

    /// A request that must be forwarded upstream
    pub fn forwarded(request: RpcRequest, rate_limited: bool, should_cache_resolution: bool) -> Self {
        Self {
            request,
            response: None,
            should_forward: true,
            rate_limited,
            from_cache: false,
            should_cache_resolution,
        }
    }
}

/// The classification result for one whole batch
///
/// `requests_to_forward` is exactly the order-preserving sub-sequence of
/// `processed_requests` with `should_forward == true`.
#[derive(Debug, Clone)]
pub struct BatchProcessingResult {
    /// Per-request classification outcomes, in original order
    pub processed_requests: Vec<ProcessedRequest>,
    /// The subset of requests that must go upstream
    pub requests_to_forward: Vec<RpcRequest>,
}

/// Failure captured while forwarding to the upstream provider
#[derive(Debug)]
pub struct ForwardingFailure {
    /// Short human-readable description used in error responses
    pub message: String,
    /// The underlying transport or parse error
    pub original_error: eyre::Report,
}

impl fmt::Display for ForwardingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.original_error)
    }
}

/// The forwarder's outcome: upstream responses or a captured failure
pub type ForwardingResult = Result<Vec<RpcResponse>, ForwardingFailure>;

/// Error context attached to a [`ProcessingResult`]
#[derive(Debug)]
pub struct ProcessingError {
    /// Short human-readable description
    pub message: String,
    /// The underlying error, stringified for logging
    pub original_error: String,
    /// HTTP status the outer handler should assign
    pub status: u16,
}

/// The final outcome of processing one inbound call
///
/// `responses.len()` always equals the number of requests in the original
/// call, in the original order.
#[derive(Debug)]
pub struct ProcessingResult {
    /// Responses in original request order
    pub responses: Vec<RpcResponse>,
    /// Whether the inbound payload was an array
    pub is_batch: bool,
    /// Present when a failure occurred that should drive the HTTP status
    pub error: Option<ProcessingError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_id_roundtrip() {
        let num: RpcId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(num, RpcId::Number(7));

        let text: RpcId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(text, RpcId::String("abc".to_string()));

        assert_eq!(serde_json::to_value(&num).unwrap(), json!(7));
        assert_eq!(serde_json::to_value(&text).unwrap(), json!("abc"));
    }

    #[test]
    fn test_payload_shape_detection() {
        let single: RpcPayload =
            serde_json::from_value(json!({"id": 1, "method": "eth_chainId", "params": []}))
                .unwrap();
        assert!(!single.is_batch());
        assert_eq!(single.into_requests().len(), 1);

        let batch: RpcPayload = serde_json::from_value(json!([
            {"id": 1, "method": "eth_chainId", "params": []},
            {"id": 2, "method": "eth_blockNumber", "params": []}
        ]))
        .unwrap();
        assert!(batch.is_batch());
        assert_eq!(batch.into_requests().len(), 2);
    }

    #[test]
    fn test_lenient_request_defaults() {
        let request: RpcRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.id, None);
        assert_eq!(request.effective_id(), RpcId::Number(FALLBACK_REQUEST_ID));
        assert_eq!(request.jsonrpc, "2.0");
        assert_eq!(request.method, "");
        assert!(request.params.is_null());
    }

    #[test]
    fn test_processed_request_invariant() {
        let request: RpcRequest =
            serde_json::from_value(json!({"id": 1, "method": "eth_chainId"})).unwrap();

        let answered = ProcessedRequest::answered(request.clone(), json!({"result": "0x1"}), false);
        assert!(answered.response.is_some() && !answered.should_forward);

        let forwarded = ProcessedRequest::forwarded(request, false, false);
        assert!(forwarded.response.is_none() && forwarded.should_forward);
    }
}
