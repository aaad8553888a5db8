//! Lock classification: is an address a protocol-managed contract?
//!
//! The verdict feeds the rate limiter — traffic against protocol contracts is
//! not throttled. Classification is best-effort: every failure collapses to
//! "unknown", which callers must treat as "cannot classify", never as "not a
//! protocol contract".

use crate::networks::Network;
use alloy_primitives::{hex, Address};
use alloy_sol_types::{sol, SolCall};
use eyre::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

sol! {
    /// Minimal surface of the lock registry used for verification
    interface ILockRegistry {
        function locks(address lock) external view returns (bool deployed, uint256 totalSales, uint256 yieldedDiscountTokens);
    }
}

/// Classification verdict for a contract address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    /// No code is deployed at the address
    NotDeployed,
    /// The address is a contract managed by the protocol
    ProtocolContract,
    /// The address is a contract outside the protocol
    OtherContract,
}

/// Classifies addresses against the per-network registry
///
/// Static known-address tables answer without a network call; everything else
/// costs one `eth_getCode` probe and, when code exists, one registry read.
/// Verdicts are memoized per network so repeat traffic stays cheap.
pub struct ContractClassifier {
    client: reqwest::Client,
    verdicts: RwLock<HashMap<String, ContractKind>>,
}

impl ContractClassifier {
    /// Creates a classifier with its own HTTP client
    pub fn new() -> Result<Self> {
        let client =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build()?;

        Ok(Self { client, verdicts: RwLock::new(HashMap::new()) })
    }

    /// Classifies `address` on `network`
    ///
    /// Returns `None` when classification is impossible (bad address, RPC
    /// failure, no registry on this network); errors are logged, never thrown.
    pub async fn classify(&self, address: &str, network: &Network) -> Option<ContractKind> {
        let parsed: Address = match address.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Unclassifiable address {}: {}", address, e);
                return None;
            }
        };

        if network.known_contracts.contains(&parsed) {
            return Some(ContractKind::ProtocolContract);
        }

        let memo_key = format!("{}_{}", network.id, address.to_lowercase());
        if let Some(kind) = self.verdicts.read().await.get(&memo_key) {
            debug!("Classifier memo hit for {}: {:?}", memo_key, kind);
            return Some(*kind);
        }

        match self.classify_onchain(parsed, network).await {
            Ok(kind) => {
                self.verdicts.write().await.insert(memo_key, kind);
                Some(kind)
            }
            Err(e) => {
                warn!("Failed to classify {} on network {}: {}", address, network.id, e);
                None
            }
        }
    }

    async fn classify_onchain(&self, address: Address, network: &Network) -> Result<ContractKind> {
        let code = self
            .rpc_call(network, "eth_getCode", json!([address.to_string(), "latest"]))
            .await?;
        let code = code.as_str().ok_or_else(|| eyre::eyre!("Non-string eth_getCode result"))?;

        if code == "0x" || code == "0x0" {
            return Ok(ContractKind::NotDeployed);
        }

        let registry = network
            .lock_registry
            .ok_or_else(|| eyre::eyre!("No lock registry configured for network {}", network.id))?;

        let call_data = ILockRegistry::locksCall { lock: address }.abi_encode();
        let result = self
            .rpc_call(
                network,
                "eth_call",
                json!([
                    {
                        "to": registry.to_string(),
                        "data": format!("0x{}", hex::encode(call_data)),
                    },
                    "latest"
                ]),
            )
            .await?;

        let raw = result.as_str().ok_or_else(|| eyre::eyre!("Non-string eth_call result"))?;
        let bytes = hex::decode(raw.trim_start_matches("0x"))?;
        let decoded = ILockRegistry::locksCall::abi_decode_returns(&bytes)?;

        if decoded.deployed {
            Ok(ContractKind::ProtocolContract)
        } else {
            Ok(ContractKind::OtherContract)
        }
    }

    async fn rpc_call(&self, network: &Network, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&network.upstream_url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let body: Value = response.json().await?;

        if let Some(error) = body.get("error") {
            eyre::bail!("Upstream returned error for {}: {}", method, error);
        }

        body.get("result").cloned().ok_or_else(|| eyre::eyre!("No result in {} response", method))
    }
}
