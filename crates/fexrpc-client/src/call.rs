//! One in-flight invocation.

use std::sync::Weak;

use tokio::sync::oneshot;

use fexrpc_common::{Result, RpcError};

use crate::client::ClientInner;

/// Handle to one in-flight call.
///
/// The call is owned by the caller and borrowed into the client's pending
/// table by sequence number. Its completion signal fires exactly once: when
/// the response arrives, when the connection dies, or when the send failed.
/// Dropping the handle before completion withdraws the call from the
/// pending table, so a response that arrives later is silently discarded by
/// the receive loop. That is how caller-side cancellation works: wrap
/// [`done`](Call::done) in a timeout and let the loser drop.
pub struct Call<R> {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Result<R>>,
    client: Weak<ClientInner>,
}

impl<R> Call<R> {
    pub(crate) fn new(
        seq: u64,
        service_method: String,
        rx: oneshot::Receiver<Result<R>>,
        client: Weak<ClientInner>,
    ) -> Self {
        Call {
            seq,
            service_method,
            rx,
            client,
        }
    }

    /// Sequence number assigned at registration; 0 when registration failed.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Waits for the completion signal and returns the call's outcome.
    pub async fn done(mut self) -> Result<R> {
        match (&mut self.rx).await {
            Ok(result) => result,
            // The completer can only disappear without firing if the client
            // was torn down underneath us.
            Err(_) => Err(RpcError::ShutDown),
        }
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        // Withdraw from the pending table if still registered. Completed
        // calls were already removed by the receive loop; sequence numbers
        // are never reused, so a stale remove can't hit a newer call.
        if let Some(client) = self.client.upgrade() {
            client.remove_call(self.seq);
        }
    }
}
