//! Fexrpc Registry
//!
//! In-memory service registry with heartbeat-based liveness. Servers POST
//! their own `protocol@address` on a fixed cadence; clients GET the alive
//! list and load-balance over it. State lives only in memory: a restarted
//! registry repopulates from the next round of heartbeats.
//!
//! # HTTP surface
//!
//! Mounted at [`DEFAULT_REGISTRY_PATH`](fexrpc_common::DEFAULT_REGISTRY_PATH)
//! by default:
//!
//! - `GET` returns the sorted alive list in the `X-Fexrpc-Servers` header
//! - `POST` upserts the address in the `X-Fexrpc-Server` header
//! - any other method is answered with `405 Method Not Allowed`

pub mod heartbeat;
pub mod http;
pub mod registry;

pub use heartbeat::heartbeat;
pub use registry::{Registry, DEFAULT_TIMEOUT};
