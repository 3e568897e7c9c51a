//! Fexrpc Client
//!
//! This crate provides the client side of fexrpc at two levels:
//!
//! - [`Client`]: one connection, many concurrent in-flight calls. Requests
//!   are correlated with responses by sequence number; a dedicated receive
//!   task demultiplexes the stream and completes pending calls.
//! - [`XClient`]: a façade layering service discovery, endpoint selection,
//!   connection caching and broadcast on top of [`Client`].
//!
//! # Usage
//!
//! ```no_run
//! use fexrpc_client::Client;
//! use fexrpc_common::Opt;
//!
//! # #[derive(serde::Serialize)]
//! # struct Args { a: i64, b: i64 }
//! # #[tokio::main]
//! # async fn main() -> fexrpc_common::Result<()> {
//! let client = Client::dial("127.0.0.1:9530", Opt::default()).await?;
//! let sum: i64 = client.call("Arith.Sum", &Args { a: 3, b: 9 }).await?;
//! assert_eq!(sum, 12);
//! # Ok(())
//! # }
//! ```
//!
//! Endpoints are addressed as `protocol@address`; [`Client::x_dial`] picks
//! the transport (`tcp`, `unix`, or the `http` CONNECT tunnel).

pub mod call;
pub mod client;
pub mod discovery;
pub mod xclient;

pub use call::Call;
pub use client::Client;
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use xclient::XClient;
