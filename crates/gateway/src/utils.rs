//! Shared request heuristics: cache keys, client identity, contract addresses

use crate::networks::Network;
use crate::types::RpcRequest;
use alloy_primitives::Address;
use axum::http::HeaderMap;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default edge cache TTL in seconds (one hour)
pub const DEFAULT_CACHE_TTL: u64 = 3600;

/// RPC methods whose responses are eligible for caching
///
/// Only `eth_call` qualifies, and only when the call data matches a
/// name-resolution signature (see [`is_name_resolution_request`]).
pub const CACHEABLE_METHODS: &[&str] = &["eth_call"];

/// 4-byte selectors of the name-resolution lookups worth caching
///
/// addr(bytes32), addr(bytes32,uint256), name(bytes32), text(bytes32,string)
pub const NAME_RESOLVER_METHOD_SIGNATURES: &[&str] =
    &["0x3b3b57de", "0xf1cb7e06", "0x691f3431", "0x59d1d43c"];

/// Serializes a JSON value with object keys sorted recursively
///
/// Cache keys must not depend on the field order a client happened to send.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), stable_stringify(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Generates the cache key for a request: `network:method:params`
///
/// Params are rendered element-wise with stable object serialization so that
/// semantically identical calls share a key.
pub fn generate_request_cache_key(network_id: &str, request: &RpcRequest) -> String {
    let params_str = match request.params_array() {
        Some(params) => params
            .iter()
            .map(|param| match param {
                Value::Null => "null".to_string(),
                Value::String(s) => s.clone(),
                other => stable_stringify(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        None => String::new(),
    };

    format!("{}:{}:{}", network_id, request.method, params_str)
}

/// Extracts a client identity from trusted proxy headers
///
/// Priority order: explicit client-IP header, forwarded-for first hop, the
/// per-connection ray id, and finally a rough fingerprint of URL + method +
/// timestamp. Preferring a real IP and degrading to a fingerprint keeps the
/// limiter keyed on something rather than failing the request.
pub fn client_identity(headers: &HeaderMap, url: &str, method: &str) -> String {
    if let Some(ip) = header_value(headers, "cf-connecting-ip") {
        return ip;
    }

    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        // The first hop is the client; later entries are proxies.
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(ray) = header_value(headers, "cf-ray") {
        return format!("unknown-ip-{ray}");
    }

    let timestamp =
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let fingerprint = format!("{url}-{method}-{timestamp}");
    format!("unknown-ip-{}", fingerprint.chars().take(32).collect::<String>())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Extracts the contract address a request interacts with, if any
///
/// Supports the common method families: transaction-shaped params with a
/// `to` field, log filters with an `address` field, and account-state
/// queries whose first param is the address.
pub fn contract_address(method: &str, params: &Value) -> Option<String> {
    let params = params.as_array()?;
    if params.is_empty() {
        return None;
    }

    match method {
        "eth_call" | "eth_estimateGas" | "eth_sendTransaction" => {
            params[0].get("to").and_then(Value::as_str).map(str::to_string)
        }
        "eth_getLogs" | "eth_getFilterLogs" => {
            params[0].get("address").and_then(Value::as_str).map(str::to_string)
        }
        "eth_getCode" | "eth_getBalance" | "eth_getTransactionCount" | "eth_getStorageAt" => {
            params[0].as_str().map(str::to_string)
        }
        _ => None,
    }
}

/// Detects whether a request is a name-resolution lookup on this network
///
/// True only for `eth_call` against one of the network's known resolver
/// contracts with call data starting with a known lookup selector.
pub fn is_name_resolution_request(network: &Network, request: &RpcRequest) -> bool {
    if network.name_resolvers.is_empty() || request.method != "eth_call" {
        return false;
    }

    let Some(params) = request.params_array() else { return false };
    let (Some(to), Some(data)) = (
        params.first().and_then(|p| p.get("to")).and_then(Value::as_str),
        params.first().and_then(|p| p.get("data")).and_then(Value::as_str),
    ) else {
        return false;
    };

    let Ok(to_address) = to.parse::<Address>() else {
        warn!("Unparseable 'to' address in eth_call: {}", to);
        return false;
    };

    if !network.name_resolvers.contains(&to_address) {
        return false;
    }

    let data = data.to_lowercase();
    NAME_RESOLVER_METHOD_SIGNATURES.iter().any(|signature| data.starts_with(signature))
}

/// Whether a request is eligible for the cache tiers at all
pub fn is_request_cacheable(network: &Network, request: &RpcRequest) -> bool {
    CACHEABLE_METHODS.contains(&request.method.as_str())
        && is_name_resolution_request(network, request)
}

/// Checks a caller-provided secret against the configured shared secret
///
/// No configured secret means no caller is trusted.
pub fn has_valid_gateway_secret(provided: Option<&str>, configured: Option<&str>) -> bool {
    match (provided, configured) {
        (Some(provided), Some(configured)) if !configured.is_empty() => provided == configured,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::Networks;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn request(method: &str, params: Value) -> RpcRequest {
        serde_json::from_value(json!({"id": 1, "method": method, "params": params})).unwrap()
    }

    #[test]
    fn test_stable_stringify_sorts_keys() {
        let a = json!({"b": 2, "a": 1, "nested": {"y": true, "x": false}});
        let b = json!({"nested": {"x": false, "y": true}, "a": 1, "b": 2});
        assert_eq!(stable_stringify(&a), stable_stringify(&b));
    }

    #[test]
    fn test_cache_key_ignores_param_field_order() {
        let first = request("eth_call", json!([{"to": "0xabc", "data": "0x1234"}, "latest"]));
        let second = request("eth_call", json!([{"data": "0x1234", "to": "0xabc"}, "latest"]));
        assert_eq!(
            generate_request_cache_key("1", &first),
            generate_request_cache_key("1", &second)
        );
    }

    #[test]
    fn test_cache_key_differs_by_network() {
        let req = request("eth_call", json!([{"to": "0xabc"}, "latest"]));
        assert_ne!(generate_request_cache_key("1", &req), generate_request_cache_key("137", &req));
    }

    #[test]
    fn test_client_identity_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.2.3.4"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("5.6.7.8, 9.9.9.9"));
        headers.insert("cf-ray", HeaderValue::from_static("ray-abc"));
        assert_eq!(client_identity(&headers, "/1", "POST"), "1.2.3.4");

        headers.remove("cf-connecting-ip");
        assert_eq!(client_identity(&headers, "/1", "POST"), "5.6.7.8");

        headers.remove("x-forwarded-for");
        assert_eq!(client_identity(&headers, "/1", "POST"), "unknown-ip-ray-abc");

        headers.remove("cf-ray");
        let identity = client_identity(&headers, "/1", "POST");
        assert!(identity.starts_with("unknown-ip-"));
    }

    #[test]
    fn test_contract_address_extraction() {
        let call = request("eth_call", json!([{"to": "0xCafe", "data": "0x"}, "latest"]));
        assert_eq!(contract_address(&call.method, &call.params), Some("0xCafe".to_string()));

        let logs = request("eth_getLogs", json!([{"address": "0xBeef"}]));
        assert_eq!(contract_address(&logs.method, &logs.params), Some("0xBeef".to_string()));

        let balance = request("eth_getBalance", json!(["0xDead", "latest"]));
        assert_eq!(contract_address(&balance.method, &balance.params), Some("0xDead".to_string()));

        let block = request("eth_blockNumber", json!([]));
        assert_eq!(contract_address(&block.method, &block.params), None);

        let malformed = request("eth_call", json!([{"to": 42}]));
        assert_eq!(contract_address(&malformed.method, &malformed.params), None);
    }

    #[test]
    fn test_name_resolution_detection() {
        let networks = Networks::defaults();
        let mainnet = networks.get("1").unwrap();
        let resolver = format!("{:?}", mainnet.name_resolvers[0]);

        let lookup = request(
            "eth_call",
            json!([{"to": resolver, "data": "0x3b3b57deffffffffffffffffffffffffffffffffffffffffffffffffffffffff"}, "latest"]),
        );
        assert!(is_name_resolution_request(mainnet, &lookup));
        assert!(is_request_cacheable(mainnet, &lookup));

        // Unknown selector
        let other = request("eth_call", json!([{"to": resolver, "data": "0xdeadbeef"}, "latest"]));
        assert!(!is_name_resolution_request(mainnet, &other));

        // Unknown contract
        let elsewhere = request(
            "eth_call",
            json!([{"to": "0x000000000000000000000000000000000000dEaD", "data": "0x3b3b57de"}, "latest"]),
        );
        assert!(!is_name_resolution_request(mainnet, &elsewhere));

        // Network without resolvers
        let gnosis = networks.get("100").unwrap();
        assert!(!is_name_resolution_request(gnosis, &lookup));

        // Non-eth_call is never a resolution request
        let balance = request("eth_getBalance", json!(["0xDead", "latest"]));
        assert!(!is_request_cacheable(mainnet, &balance));
    }

    #[test]
    fn test_gateway_secret_check() {
        assert!(has_valid_gateway_secret(Some("s3cret"), Some("s3cret")));
        assert!(!has_valid_gateway_secret(Some("wrong"), Some("s3cret")));
        assert!(!has_valid_gateway_secret(None, Some("s3cret")));
        assert!(!has_valid_gateway_secret(Some("anything"), None));
        assert!(!has_valid_gateway_secret(Some(""), Some("")));
    }
}
