//! Fexrpc Protocol Definitions
//!
//! The records exchanged on every connection, plus the error type used
//! throughout the system.
//!
//! - [`Opt`]: the handshake record sent first on every connection
//! - [`Header`]: prefixes every call frame in either direction
//! - [`RpcError`]: crate-wide error enum with a [`Result`] alias

pub mod error;
pub mod header;
pub mod option;

pub use error::{RpcError, Result};
pub use header::{split_service_method, Header};
pub use option::{Opt, OptEncoding, MAGIC_NUMBER};

/// Path the RPC server accepts `CONNECT` tunnels on.
pub const DEFAULT_RPC_PATH: &str = "/_fexrpc_/";

/// Path of the human-readable service listing.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/fexrpc";

/// Path the registry mounts its HTTP surface on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_fexrpc_/registry";

/// Status line body confirming an accepted `CONNECT` tunnel.
pub const CONNECTED: &str = "200 Connected to Fex RPC";

/// Response header carrying the registry's alive list, comma-joined.
pub const SERVERS_HEADER: &str = "X-Fexrpc-Servers";

/// Request header carrying one server address in a heartbeat.
pub const SERVER_HEADER: &str = "X-Fexrpc-Server";
