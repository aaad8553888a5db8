//! Upstream forwarding: one batched round trip per inbound call

use crate::types::{ForwardingFailure, ForwardingResult, RpcRequest};
use eyre::Result;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Forwards a set of requests to the network's upstream provider
///
/// The requests are sent as one JSON array even when there is only one of
/// them; the upstream accepts both shapes and a single code path is simpler.
/// The upstream's answer — object or array — is normalized to an array.
/// Transport and parse failures are captured in the result, never thrown.
pub async fn forward_requests(
    client: &reqwest::Client,
    upstream_url: &str,
    origin: Option<&str>,
    requests: &[RpcRequest],
) -> ForwardingResult {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    debug!("Forwarding {} request(s) to {}", requests.len(), upstream_url);

    let mut builder = client
        .post(upstream_url)
        .header("Accept", "*/*")
        .header("Content-Type", "application/json")
        .json(requests);

    if let Some(origin) = origin {
        builder = builder.header("Origin", origin);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Error forwarding requests to provider: {}", e);
            return Err(ForwardingFailure {
                message: "Failed to forward requests to provider".to_string(),
                original_error: e.into(),
            });
        }
    };

    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Error parsing provider response: {}", e);
            return Err(ForwardingFailure {
                message: "Failed to parse provider response".to_string(),
                original_error: e.into(),
            });
        }
    };

    // The upstream may answer a single-element batch with a bare object.
    let responses = match body {
        Value::Array(responses) => responses,
        other => vec![other],
    };

    Ok(responses)
}

/// Resolves the final URL behind a chain of HTTP redirects
///
/// Bounded by `max_hops` and a hard `timeout`; past the timeout the chase is
/// aborted with a distinct error instead of hanging the caller. Used at
/// startup to canonicalize configured upstream URLs.
pub async fn resolve_redirects(url: &str, max_hops: usize, timeout: Duration) -> Result<String> {
    let chase = async {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;

        let mut current: reqwest::Url = url.parse()?;

        for _ in 0..max_hops {
            let response = client.get(current.clone()).send().await?;

            if !response.status().is_redirection() {
                return Ok::<String, eyre::Report>(current.to_string());
            }

            let location = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| eyre::eyre!("Redirect without a Location header from {current}"))?;

            current = current.join(location)?;
            debug!("Following redirect to {}", current);
        }

        eyre::bail!("Too many redirects resolving {url} (max {max_hops})")
    };

    match tokio::time::timeout(timeout, chase).await {
        Ok(result) => result,
        Err(_) => Err(eyre::eyre!(
            "Redirect resolution timed out after {}s for {url}",
            timeout.as_secs()
        )),
    }
}
