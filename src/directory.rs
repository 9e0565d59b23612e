//! Endpoint directory - the NAT mapping table
//!
//! Two separate stores, deliberately unreconciled:
//! - [`EndpointDirectory`]: client id -> last UDP-observed source address.
//!   Written by the relay receive loop, swept by the expiry reaper. This is
//!   the authoritative table for relay routing.
//! - [`AdvertisedDirectory`]: client id -> the endpoint the client claimed
//!   over TCP. A hint only; behind NAT it is usually a private address, so
//!   it is never used to route relay traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Configuration for the endpoint directory and its reaper
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Inactivity window after which a mapping is evicted
    pub ttl: Duration,
    /// How often the reaper sweeps for expired mappings
    pub sweep_interval: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// One client's last observed endpoint
#[derive(Debug, Clone, Copy)]
pub struct EndpointRecord {
    pub endpoint: std::net::SocketAddr,
    pub last_seen: Instant,
}

/// Concurrent map of client id -> observed endpoint.
///
/// Writes for distinct ids never contend; upsert/lookup on the same id are
/// linearizable (DashMap shard locking). A new observation overwrites the
/// previous record in full.
pub struct EndpointDirectory {
    config: DirectoryConfig,
    entries: DashMap<String, EndpointRecord>,
}

impl EndpointDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Set or overwrite the mapping for `client_id`, refreshing last_seen
    pub fn upsert(&self, client_id: &str, endpoint: std::net::SocketAddr) {
        self.entries.insert(
            client_id.to_string(),
            EndpointRecord {
                endpoint,
                last_seen: Instant::now(),
            },
        );
    }

    /// The endpoint currently mapped for `client_id`, if any
    pub fn lookup(&self, client_id: &str) -> Option<std::net::SocketAddr> {
        self.entries.get(client_id).map(|r| r.endpoint)
    }

    /// Remove every record last refreshed strictly before `cutoff`.
    /// Returns the number of evicted records.
    pub fn evict_older_than(&self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| record.last_seen >= cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the background expiry reaper.
    ///
    /// Sweeps every `sweep_interval`, evicting mappings idle longer than
    /// `ttl`. The caller aborts the handle at shutdown.
    pub fn start_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        let ttl = self.config.ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately; skip it so a sweep
            // never runs before one full interval has elapsed
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Instant::now() - ttl;
                let evicted = self.evict_older_than(cutoff);
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted expired NAT mappings");
                }
            }
        })
    }
}

/// TCP-advertised endpoints, owned by the coordinator.
///
/// Routing never consults this table; it records what clients claim so
/// operators can compare claimed vs. observed addresses.
#[derive(Default)]
pub struct AdvertisedDirectory {
    entries: DashMap<String, std::net::SocketAddr>,
}

impl AdvertisedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, client_id: &str, endpoint: std::net::SocketAddr) {
        self.entries.insert(client_id.to_string(), endpoint);
    }

    pub fn get(&self, client_id: &str) -> Option<std::net::SocketAddr> {
        self.entries.get(client_id).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
