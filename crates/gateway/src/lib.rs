//! lockrpc Gateway Library
//!
//! A caching JSON-RPC batching gateway that sits between clients and the
//! per-network upstream RPC endpoints of a lock protocol deployment. Each
//! inbound call (single request or batch) is classified per element — answered
//! locally, served from cache, rate-limit-checked, or forwarded upstream —
//! and the responses are reassembled in the original order with the original
//! request ids.

pub mod cache;
pub mod contracts;
pub mod forward;
pub mod health;
pub mod metrics;
pub mod networks;
pub mod proxy;
pub mod rate_limit;
pub mod rpc;
pub mod types;
pub mod utils;

pub use networks::{Network, Networks};
pub use proxy::{ProxyServer, ProxyServerBuilder};
pub use types::{RpcId, RpcPayload, RpcRequest};
