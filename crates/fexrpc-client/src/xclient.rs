//! Discovery-backed client façade.
//!
//! [`XClient`] combines a [`Discovery`] source, a [`SelectMode`] and a
//! connection cache: one [`Client`] per endpoint, reused while available
//! and replaced when stale. Unicast picks one endpoint; broadcast fans the
//! same call out to all of them with fail-fast cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::debug;

use fexrpc_common::{Opt, Result, RpcError};

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};

pub struct XClient<D> {
    inner: Arc<XClientInner<D>>,
}

// Derived Clone would demand D: Clone; the handle only clones the Arc.
impl<D> Clone for XClient<D> {
    fn clone(&self) -> Self {
        XClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct XClientInner<D> {
    discovery: D,
    mode: SelectMode,
    opt: Opt,
    /// Endpoint -> cached connection. The lock spans lookup and insertion
    /// so concurrent callers cannot dial one endpoint twice.
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, opt: Opt) -> Self {
        XClient {
            inner: Arc::new(XClientInner {
                discovery,
                mode,
                opt,
                clients: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a usable connection to `addr`, reusing the cache when the
    /// cached client is still available and replacing it when it is not.
    async fn dial(&self, addr: &str) -> Result<Client> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!(%addr, "rpc xclient: evicting stale connection");
            let stale = clients.remove(addr).expect("checked above");
            let _ = stale.close().await;
        }
        let client = Client::x_dial(addr, self.inner.opt).await?;
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(&self, addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let client = self.dial(addr).await?;
        client.call(service_method, args).await
    }

    /// Unicast: selects one endpoint and invokes the method on it.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let addr = self.inner.discovery.get(self.inner.mode).await?;
        self.call_addr(&addr, service_method, args).await
    }

    /// Unicast raced against a deadline.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::CallFailed("deadline has elapsed".to_string())),
        }
    }

    /// Invokes the method on every discovered endpoint concurrently, each
    /// sub-call decoding into its own fresh reply slot.
    ///
    /// The first error wins and aborts the remaining sub-calls; the first
    /// success is kept. Any error surfaces as the overall result, even when
    /// other endpoints succeeded.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: A) -> Result<R>
    where
        A: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.inner.discovery.get_all().await?;
        let args = Arc::new(args);
        let mut calls = JoinSet::new();
        for addr in servers {
            let xclient = self.clone();
            let service_method = service_method.to_string();
            let args = Arc::clone(&args);
            calls.spawn(async move {
                xclient
                    .call_addr::<A, R>(&addr, &service_method, &args)
                    .await
            });
        }

        let mut first_error: Option<RpcError> = None;
        let mut reply: Option<R> = None;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        // Fail fast: peers in flight are cancelled and their
                        // late responses discarded by the receive loops.
                        calls.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(RpcError::CallFailed(join_err.to_string()));
                        calls.abort_all();
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => reply.ok_or_else(|| RpcError::Discovery("no available servers".to_string())),
        }
    }

    /// Broadcast raced against a deadline; losing cancels every sub-call.
    pub async fn broadcast_timeout<A, R>(
        &self,
        service_method: &str,
        args: A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        match tokio::time::timeout(timeout, self.broadcast(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::CallFailed("deadline has elapsed".to_string())),
        }
    }

    /// Closes and removes every cached connection.
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.inner.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
        Ok(())
    }
}
