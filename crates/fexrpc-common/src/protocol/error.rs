use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Returned once a client is closing or has shut down.
    #[error("connection is shut down")]
    ShutDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary codec: {0}")]
    Binary(#[from] postcard::Error),

    /// Bad magic number, unknown codec id or a broken Opt envelope.
    /// Fatal to the connection, reported locally and never sent to the peer.
    #[error("rpc handshake: {0}")]
    Handshake(String),

    /// Malformed frame or I/O failure mid-stream. Fatal to the connection.
    #[error("rpc protocol: {0}")]
    Protocol(String),

    #[error("rpc: service already registered: {0}")]
    AlreadyRegistered(String),

    /// Error text transported from the peer, verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("rpc client: connect timeout: expected within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    #[error("rpc discovery: {0}")]
    Discovery(String),

    #[error("rpc registry: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
