//! Service discovery and endpoint selection.
//!
//! A [`Discovery`] source produces endpoints in `protocol@address` form.
//! Two implementations ship with the crate: a static list and a
//! registry-backed variant that lazily refreshes its cache.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use fexrpc_common::{Result, RpcError, SERVERS_HEADER};

/// How `get` picks among the known endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniform over the current list.
    Random,
    /// Cursor advances modulo the current list length.
    RoundRobin,
}

/// Source of `protocol@address` endpoints.
pub trait Discovery: Send + Sync + 'static {
    /// Replaces the endpoint list.
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<()>> + Send;
    /// Picks one endpoint according to `mode`.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send;
    /// Returns every known endpoint.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

struct Endpoints {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a fixed endpoint list.
///
/// The round-robin cursor is seeded randomly at construction so that fresh
/// instances don't all start on the same endpoint; it is reduced modulo the
/// current list length on every pick, which also clamps it when the list
/// shrinks.
pub struct MultiServerDiscovery {
    endpoints: Mutex<Endpoints>,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..u32::MAX as usize);
        MultiServerDiscovery {
            endpoints: Mutex::new(Endpoints { servers, index }),
        }
    }

    fn replace(&self, servers: Vec<String>) {
        let mut endpoints = self.endpoints.lock().expect("discovery state poisoned");
        endpoints.servers = servers;
    }

    fn pick(&self, mode: SelectMode) -> Result<String> {
        let mut endpoints = self.endpoints.lock().expect("discovery state poisoned");
        let n = endpoints.servers.len();
        if n == 0 {
            return Err(RpcError::Discovery("no available servers".to_string()));
        }
        let server = match mode {
            SelectMode::Random => endpoints.servers[rand::thread_rng().gen_range(0..n)].clone(),
            SelectMode::RoundRobin => {
                let server = endpoints.servers[endpoints.index % n].clone();
                endpoints.index = (endpoints.index + 1) % n;
                server
            }
        };
        Ok(server)
    }

    fn all(&self) -> Vec<String> {
        let endpoints = self.endpoints.lock().expect("discovery state poisoned");
        endpoints.servers.clone()
    }
}

impl Discovery for MultiServerDiscovery {
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<()>> + Send {
        self.replace(servers);
        std::future::ready(Ok(()))
    }

    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send {
        std::future::ready(self.pick(mode))
    }

    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send {
        std::future::ready(Ok(self.all()))
    }
}

/// Default staleness bound on a registry-backed endpoint cache.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by a fexrpc registry.
///
/// Every `get`/`get_all` consults the cached list unless it has gone stale,
/// in which case the registry is queried first. The refresh lock is held
/// across the query so concurrent callers don't stampede the registry.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    refresh_timeout: Duration,
    last_update: tokio::sync::Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `refresh_timeout` of zero selects [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry: impl Into<String>, refresh_timeout: Duration) -> Self {
        let refresh_timeout = if refresh_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            refresh_timeout
        };
        RegistryDiscovery {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry.into(),
            refresh_timeout,
            last_update: tokio::sync::Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if let Some(at) = *last_update {
            if at.elapsed() < self.refresh_timeout {
                return Ok(());
            }
        }
        debug!(registry = %self.registry, "rpc registry: refreshing servers");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|err| RpcError::Discovery(format!("refresh error: {err}")))?;
        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(String::from)
            .collect();
        self.servers.replace(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }
}

impl Discovery for RegistryDiscovery {
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.servers.replace(servers);
            *self.last_update.lock().await = Some(Instant::now());
            Ok(())
        }
    }

    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send {
        async move {
            self.refresh().await?;
            self.servers.pick(mode)
        }
    }

    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send {
        async move {
            self.refresh().await?;
            Ok(self.servers.all())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tcp@server-{i}:9530")).collect()
    }

    #[tokio::test]
    async fn round_robin_visits_every_endpoint_evenly() {
        let discovery = MultiServerDiscovery::new(endpoints(3));
        let mut counts = std::collections::HashMap::new();
        for _ in 0..300 {
            let server = discovery.get(SelectMode::RoundRobin).await.unwrap();
            *counts.entry(server).or_insert(0u32) += 1;
        }
        for server in endpoints(3) {
            assert_eq!(counts[&server], 100);
        }
    }

    #[tokio::test]
    async fn random_only_returns_known_endpoints() {
        let discovery = MultiServerDiscovery::new(endpoints(4));
        let known = endpoints(4);
        for _ in 0..50 {
            let server = discovery.get(SelectMode::Random).await.unwrap();
            assert!(known.contains(&server));
        }
    }

    #[tokio::test]
    async fn empty_list_is_an_error() {
        let discovery = MultiServerDiscovery::new(Vec::new());
        let err = discovery.get(SelectMode::RoundRobin).await.unwrap_err();
        assert!(err.to_string().contains("no available servers"));
        assert!(discovery.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_survives_a_shrinking_list() {
        let discovery = MultiServerDiscovery::new(endpoints(5));
        for _ in 0..4 {
            discovery.get(SelectMode::RoundRobin).await.unwrap();
        }
        discovery.update(endpoints(2)).await.unwrap();
        // The clamped cursor must keep cycling the remaining endpoints.
        let picked = [
            discovery.get(SelectMode::RoundRobin).await.unwrap(),
            discovery.get(SelectMode::RoundRobin).await.unwrap(),
        ];
        assert_ne!(picked[0], picked[1]);
    }

    #[tokio::test]
    async fn update_replaces_the_list() {
        let discovery = MultiServerDiscovery::new(endpoints(2));
        discovery
            .update(vec!["tcp@replacement:1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            discovery.get_all().await.unwrap(),
            vec!["tcp@replacement:1".to_string()]
        );
        assert_eq!(
            discovery.get(SelectMode::Random).await.unwrap(),
            "tcp@replacement:1"
        );
    }
}
