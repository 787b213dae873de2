//! In-process storage hosts
//!
//! A `SimulatedNetwork` stands in for a set of host daemons so the transfer
//! engine can be exercised without sockets. Hosts can be taken offline, made
//! to fail transiently, or have their stored shards corrupted or deleted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::transport::{Announcement, ShardTransport, StoreRequest};
use super::TransferError;
use crate::identity::{NodeIdentity, PublicKeys, SealedBox};
use crate::ledger::{PriceSheet, ResourceType};

struct SimHost {
    keys: PublicKeys,
    prices: PriceSheet,
    shards: HashMap<(String, usize), String>,
    offline: bool,
    /// Calls that will fail with a network error before the host recovers
    transient_failures: u32,
    store_calls: usize,
}

/// The simulated "network": endpoint string -> host state.
pub struct SimulatedNetwork {
    hosts: Mutex<HashMap<String, SimHost>>,
}

impl SimulatedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Register a host with a fresh identity; returns its endpoint.
    pub async fn add_host(&self, node_id: &str) -> String {
        let identity = NodeIdentity::generate(node_id);
        self.add_host_with_keys(identity.public_keys()).await
    }

    pub async fn add_host_with_keys(&self, keys: PublicKeys) -> String {
        let endpoint = format!("sim://{}", keys.node_id);
        let host = SimHost {
            keys,
            prices: PriceSheet::default(),
            shards: HashMap::new(),
            offline: false,
            transient_failures: 0,
            store_calls: 0,
        };
        self.hosts.lock().await.insert(endpoint.clone(), host);
        endpoint
    }

    pub async fn set_prices(&self, endpoint: &str, prices: PriceSheet) {
        if let Some(host) = self.hosts.lock().await.get_mut(endpoint) {
            host.prices = prices;
        }
    }

    pub async fn set_offline(&self, endpoint: &str, offline: bool) {
        if let Some(host) = self.hosts.lock().await.get_mut(endpoint) {
            host.offline = offline;
        }
    }

    /// Make the next `count` calls to `endpoint` fail transiently.
    pub async fn fail_next(&self, endpoint: &str, count: u32) {
        if let Some(host) = self.hosts.lock().await.get_mut(endpoint) {
            host.transient_failures = count;
        }
    }

    /// Flip one ciphertext byte of a stored shard. Returns false if absent.
    pub async fn corrupt_shard(&self, endpoint: &str, asset_id: &str, index: usize) -> bool {
        let mut hosts = self.hosts.lock().await;
        let Some(stored) = hosts
            .get_mut(endpoint)
            .and_then(|h| h.shards.get_mut(&(asset_id.to_string(), index)))
        else {
            return false;
        };
        let Ok(mut sealed) = SealedBox::from_b64(stored) else {
            return false;
        };
        let Ok(mut ciphertext) = crate::identity::decode_b64(&sealed.ciphertext) else {
            return false;
        };
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0x01;
        }
        sealed.ciphertext = crate::identity::encode_b64(&ciphertext);
        match sealed.to_b64() {
            Ok(data) => {
                *stored = data;
                true
            }
            Err(_) => false,
        }
    }

    pub async fn remove_shard(&self, endpoint: &str, asset_id: &str, index: usize) -> bool {
        self.hosts
            .lock()
            .await
            .get_mut(endpoint)
            .and_then(|h| h.shards.remove(&(asset_id.to_string(), index)))
            .is_some()
    }

    /// Shards currently held by `endpoint`.
    pub async fn stored_count(&self, endpoint: &str) -> usize {
        self.hosts
            .lock()
            .await
            .get(endpoint)
            .map(|h| h.shards.len())
            .unwrap_or(0)
    }

    /// Successful `store` calls served by `endpoint`.
    pub async fn store_calls(&self, endpoint: &str) -> usize {
        self.hosts
            .lock()
            .await
            .get(endpoint)
            .map(|h| h.store_calls)
            .unwrap_or(0)
    }

    /// Look up a reachable host, consuming one pending transient failure.
    fn reachable<'a>(
        hosts: &'a mut HashMap<String, SimHost>,
        endpoint: &str,
    ) -> Result<&'a mut SimHost, TransferError> {
        let host = hosts
            .get_mut(endpoint)
            .ok_or_else(|| TransferError::Network(format!("no route to {}", endpoint)))?;
        if host.offline {
            return Err(TransferError::Network(format!("{} is offline", endpoint)));
        }
        if host.transient_failures > 0 {
            host.transient_failures -= 1;
            return Err(TransferError::Network(format!("{} reset the connection", endpoint)));
        }
        Ok(host)
    }
}

#[async_trait]
impl ShardTransport for SimulatedNetwork {
    async fn public_keys(&self, endpoint: &str) -> Result<PublicKeys, TransferError> {
        let mut hosts = self.hosts.lock().await;
        Ok(Self::reachable(&mut hosts, endpoint)?.keys.clone())
    }

    async fn store(&self, endpoint: &str, request: &StoreRequest) -> Result<(), TransferError> {
        let mut hosts = self.hosts.lock().await;
        let host = Self::reachable(&mut hosts, endpoint)?;
        host.shards
            .insert((request.asset_id.clone(), request.index), request.data_b64.clone());
        host.store_calls += 1;
        Ok(())
    }

    async fn fetch(&self, endpoint: &str, asset_id: &str, index: usize) -> Result<String, TransferError> {
        let mut hosts = self.hosts.lock().await;
        let host = Self::reachable(&mut hosts, endpoint)?;
        host.shards
            .get(&(asset_id.to_string(), index))
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("{}:{} on {}", asset_id, index, endpoint)))
    }

    async fn announce(&self, endpoint: &str) -> Result<Announcement, TransferError> {
        let mut hosts = self.hosts.lock().await;
        let host = Self::reachable(&mut hosts, endpoint)?;
        Ok(Announcement {
            node_id: host.keys.node_id.clone(),
            active: true,
            prices: host.prices.clone(),
        })
    }

    async fn quote(&self, endpoint: &str, resource_type: &str, size: f64) -> Result<f64, TransferError> {
        let mut hosts = self.hosts.lock().await;
        let host = Self::reachable(&mut hosts, endpoint)?;
        Ok(resource_type
            .parse::<ResourceType>()
            .map(|resource| host.prices.rate_for(resource) * size)
            .unwrap_or(0.0))
    }
}
