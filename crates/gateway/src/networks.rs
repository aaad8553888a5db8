//! Supported-network table: upstream endpoints and per-network contract data
//!
//! The table is built from defaults plus environment/CLI overrides and handed
//! to the server at construction time; nothing here is process-global.

use alloy_primitives::{address, Address};
use lockrpc_common::env::{read_env, GATEWAY_UPSTREAM_PREFIX};
use std::collections::HashMap;
use tracing::info;

/// Configuration for one supported network
#[derive(Debug, Clone)]
pub struct Network {
    /// Decimal network id, as it appears in the request path
    pub id: String,
    /// Numeric chain id (answers local chain-id queries)
    pub chain_id: u64,
    /// Upstream RPC endpoint for this network
    pub upstream_url: String,
    /// The protocol's lock registry (factory) contract, when deployed here
    pub lock_registry: Option<Address>,
    /// Contract addresses known to belong to the protocol on this network
    pub known_contracts: Vec<Address>,
    /// Name-resolver contracts whose lookups are cacheable on this network
    pub name_resolvers: Vec<Address>,
}

impl Network {
    /// Chain id formatted as the hex quantity returned by chain-id queries
    pub fn chain_id_hex(&self) -> String {
        format!("0x{:x}", self.chain_id)
    }
}

/// The set of supported networks, keyed by decimal network id
#[derive(Debug, Clone, Default)]
pub struct Networks {
    networks: HashMap<String, Network>,
}

impl Networks {
    /// Builds the default network table
    ///
    /// Upstreams default to free public endpoints; production deployments
    /// override them per network via `GATEWAY_UPSTREAM_<id>` or the CLI.
    pub fn defaults() -> Self {
        let mut networks = HashMap::new();

        for network in default_networks() {
            networks.insert(network.id.clone(), network);
        }

        Self { networks }
    }

    /// Applies `GATEWAY_UPSTREAM_<id>` environment overrides to the table
    pub fn apply_env_overrides(mut self) -> Self {
        for (id, network) in self.networks.iter_mut() {
            if let Some(url) = read_env(&format!("{GATEWAY_UPSTREAM_PREFIX}{id}")) {
                info!("Upstream override for network {}: {}", id, url);
                network.upstream_url = url;
            }
        }
        self
    }

    /// Replaces the upstream URL for one network, adding the network if the
    /// id is numeric and unknown
    pub fn set_upstream(&mut self, id: &str, url: String) {
        if let Some(network) = self.networks.get_mut(id) {
            network.upstream_url = url;
        } else if let Ok(chain_id) = id.parse::<u64>() {
            self.networks.insert(
                id.to_string(),
                Network {
                    id: id.to_string(),
                    chain_id,
                    upstream_url: url,
                    lock_registry: None,
                    known_contracts: Vec::new(),
                    name_resolvers: Vec::new(),
                },
            );
        }
    }

    /// Looks up a network by its decimal id
    pub fn get(&self, id: &str) -> Option<&Network> {
        self.networks.get(id)
    }

    /// Iterates over all configured networks
    pub fn iter(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Number of configured networks
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// True when no network is configured
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn default_networks() -> Vec<Network> {
    vec![
        Network {
            id: "1".to_string(),
            chain_id: 1,
            upstream_url: "https://ethereum-rpc.publicnode.com".to_string(),
            lock_registry: Some(address!("3d5409cce1d45233de1d4e5ad1aa7a54bb8c36f4")),
            known_contracts: vec![address!("3d5409cce1d45233de1d4e5ad1aa7a54bb8c36f4")],
            name_resolvers: vec![
                // ENS registry and public resolver
                address!("00000000000c2e074ec69a0dfb2997ba6c7d2e1e"),
                address!("4976fb03c32e5b8cfe2b6ccb31c09ba78ebaba41"),
            ],
        },
        Network {
            id: "10".to_string(),
            chain_id: 10,
            upstream_url: "https://optimism-rpc.publicnode.com".to_string(),
            lock_registry: Some(address!("99b1348a9129ac49c6de7f11245773de2f51fb0c")),
            known_contracts: vec![address!("99b1348a9129ac49c6de7f11245773de2f51fb0c")],
            name_resolvers: Vec::new(),
        },
        Network {
            id: "100".to_string(),
            chain_id: 100,
            upstream_url: "https://gnosis-rpc.publicnode.com".to_string(),
            lock_registry: Some(address!("1bc53f4303c711cc693f6ec3477b83703dcb317f")),
            known_contracts: vec![address!("1bc53f4303c711cc693f6ec3477b83703dcb317f")],
            name_resolvers: Vec::new(),
        },
        Network {
            id: "137".to_string(),
            chain_id: 137,
            upstream_url: "https://polygon-bor-rpc.publicnode.com".to_string(),
            lock_registry: Some(address!("e8e5cd156f89f7bdb267eabd5c43af3d5af2a78f")),
            known_contracts: vec![address!("e8e5cd156f89f7bdb267eabd5c43af3d5af2a78f")],
            name_resolvers: Vec::new(),
        },
        Network {
            id: "8453".to_string(),
            chain_id: 8453,
            upstream_url: "https://base-rpc.publicnode.com".to_string(),
            lock_registry: Some(address!("d0b14797b9d08493392865647384974470202a78")),
            known_contracts: vec![address!("d0b14797b9d08493392865647384974470202a78")],
            name_resolvers: vec![
                // Basenames L2 resolver
                address!("c6d566a56a1aff6508b41f6c90ff131615583bcd"),
            ],
        },
    ]
}
