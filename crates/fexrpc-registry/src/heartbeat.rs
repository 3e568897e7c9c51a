//! Heartbeat helper for servers.

use std::time::Duration;

use tracing::{debug, warn};

use fexrpc_common::{Result, RpcError, SERVER_HEADER};

use crate::registry::DEFAULT_TIMEOUT;

/// Announces `addr` to the registry now, then keeps refreshing it on a
/// fixed cadence from a background task. The task stops on the first
/// network error; a zero `period` selects the default cadence of
/// TTL minus one minute, leaving the registry time to see a beat before
/// the previous one expires.
///
/// The immediate first beat is sent inline so the caller knows the
/// registry was reachable at startup.
pub async fn heartbeat(
    registry: impl Into<String>,
    addr: impl Into<String>,
    period: Duration,
) -> Result<()> {
    let registry = registry.into();
    let addr = addr.into();
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    let http = reqwest::Client::new();
    send_heartbeat(&http, &registry, &addr).await?;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick of an interval completes immediately and the
        // inline beat already covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&http, &registry, &addr).await {
                warn!(error = %err, %addr, "rpc server: heartbeat stopped");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(http: &reqwest::Client, registry: &str, addr: &str) -> Result<()> {
    debug!(%addr, %registry, "rpc server: sending heartbeat");
    http.post(registry)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|err| RpcError::Registry(format!("heart beat error: {err}")))?;
    Ok(())
}
