//! Fexrpc Server
//!
//! This crate provides the server side of fexrpc: a [`Service`] adapter that
//! turns user closures into invocable, codec-agnostic methods, and the
//! [`Server`] engine driving the per-connection protocol.
//!
//! # Per-connection protocol
//!
//! Every connection starts with one `Opt` handshake record; the server
//! validates the magic number, selects the codec it names and then loops:
//! read a header, read the body, resolve `Service.Method` and spawn a
//! handler task. Handlers run concurrently; a shared sending lock keeps
//! their response frames from interleaving. Dispatch and invocation errors
//! are scoped to their call; framing errors end the connection.
//!
//! # Usage
//!
//! ```no_run
//! use fexrpc_server::{Server, Service};
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Args { a: i64, b: i64 }
//! # #[tokio::main]
//! # async fn main() -> fexrpc_common::Result<()> {
//! let server = Server::new();
//! server.register(
//!     Service::new("Arith").method("Sum", |args: Args, reply: &mut i64| {
//!         *reply = args.a + args.b;
//!         Ok(())
//!     }),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! server.serve(listener).await
//! # }
//! ```

pub mod http;
pub mod server;
pub mod service;

pub use server::Server;
pub use service::{MethodType, Service};
