//! The in-memory server table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default heartbeat TTL: an address not refreshed within this window is
/// swept on the next read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Address table with heartbeat timestamps.
///
/// Liveness is enforced lazily: [`alive_servers`](Registry::alive_servers)
/// sweeps expired entries while building its answer, so the table needs no
/// background reaper. A TTL of zero disables eviction entirely.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts an address, stamping the current time.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().expect("registry table poisoned");
        servers.insert(addr.to_string(), Instant::now());
    }

    /// Returns the alive addresses in sorted order, deleting expired
    /// entries along the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().expect("registry table poisoned");
        let timeout = self.timeout;
        servers.retain(|_, start| timeout.is_zero() || start.elapsed() <= timeout);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_servers_are_sorted() {
        let registry = Registry::default();
        registry.put_server("tcp@host-b:2");
        registry.put_server("tcp@host-a:1");
        registry.put_server("tcp@host-c:3");
        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@host-a:1", "tcp@host-b:2", "tcp@host-c:3"]
        );
    }

    #[test]
    fn put_is_an_upsert() {
        let registry = Registry::default();
        registry.put_server("tcp@host:1");
        registry.put_server("tcp@host:1");
        assert_eq!(registry.alive_servers().len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let registry = Registry::new(Duration::from_millis(100));
        registry.put_server("tcp@old:1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.put_server("tcp@fresh:2");
        tokio::time::sleep(Duration::from_millis(60)).await;

        // old is ~120ms stale, fresh only ~60ms.
        assert_eq!(registry.alive_servers(), vec!["tcp@fresh:2"]);
        // The sweep deleted old entirely, not merely hidden it.
        let table = registry.servers.lock().unwrap();
        assert!(!table.contains_key("tcp@old:1"));
    }

    #[tokio::test]
    async fn zero_ttl_disables_eviction() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@eternal:1");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(registry.alive_servers(), vec!["tcp@eternal:1"]);
    }

    #[test]
    fn refreshed_heartbeat_extends_liveness() {
        let registry = Registry::new(Duration::from_secs(60));
        registry.put_server("tcp@host:1");
        registry.put_server("tcp@host:1");
        assert_eq!(registry.alive_servers(), vec!["tcp@host:1"]);
    }
}
