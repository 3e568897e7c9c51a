//! Fexrpc Common Types and Codec
//!
//! This crate provides the core protocol definitions and the framed codec
//! layer shared by every fexrpc component.
//!
//! # Overview
//!
//! Fexrpc is an RPC framework over connection-oriented transports. One
//! connection carries many concurrent calls, correlated by sequence number.
//! This crate contains the pieces both ends agree on:
//!
//! - **Protocol layer**: the [`Opt`](protocol::Opt) handshake record, the
//!   per-call [`Header`](protocol::Header), and the shared
//!   [`RpcError`](protocol::RpcError) type
//! - **Codec layer**: length-prefixed framing plus the pluggable payload
//!   serializers ([`CodecKind`](codec::CodecKind))
//!
//! # Wire format
//!
//! ```text
//! | Opt | Header 1 | Body 1 | Header 2 | Body 2 | ...
//! ```
//!
//! The `Opt` record is exchanged once per connection and selects the codec
//! used for everything after it. Each header and each body is one frame:
//! a 4-byte big-endian length followed by the encoded payload.

pub mod codec;
pub mod protocol;

pub use codec::{CodecKind, FrameReader, FrameWriter};
pub use protocol::{
    Header, Opt, OptEncoding, RpcError, Result, CONNECTED, DEFAULT_DEBUG_PATH,
    DEFAULT_REGISTRY_PATH, DEFAULT_RPC_PATH, SERVERS_HEADER, SERVER_HEADER,
};
