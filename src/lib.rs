//! Fexrpc
//!
//! An RPC framework over connection-oriented transports. One connection
//! carries many concurrent calls correlated by sequence number; servers
//! expose methods from registered services; the high-level client adds
//! service discovery, load balancing across replicas and broadcast.
//!
//! This crate is a façade over the workspace members:
//!
//! - [`common`]: protocol records, error type and the framed codec
//! - [`server`]: service adapter and per-connection dispatch engine
//! - [`client`]: multiplexed client, discovery and [`XClient`]
//! - [`registry`]: heartbeat-based service registry
//!
//! # Quick start
//!
//! ```no_run
//! use fexrpc::{Client, Opt, Server, Service};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct FooArgs { num1: i64, num2: i64 }
//!
//! # #[tokio::main]
//! # async fn main() -> fexrpc::Result<()> {
//! let server = Server::new();
//! server.register(
//!     Service::new("FooSvc").method("Sum", |args: FooArgs, reply: &mut i64| {
//!         *reply = args.num1 + args.num2;
//!         Ok(())
//!     }),
//! )?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?.to_string();
//! tokio::spawn(async move { server.serve(listener).await });
//!
//! let client = Client::dial(&addr, Opt::default()).await?;
//! let sum: i64 = client.call("FooSvc.Sum", &FooArgs { num1: 3, num2: 9 }).await?;
//! assert_eq!(sum, 12);
//! # Ok(())
//! # }
//! ```

pub use fexrpc_client as client;
pub use fexrpc_common as common;
pub use fexrpc_registry as registry;
pub use fexrpc_server as server;

pub use fexrpc_client::{
    Call, Client, Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode, XClient,
};
pub use fexrpc_common::{CodecKind, Header, Opt, OptEncoding, Result, RpcError};
pub use fexrpc_registry::{heartbeat, Registry};
pub use fexrpc_server::{Server, Service};
