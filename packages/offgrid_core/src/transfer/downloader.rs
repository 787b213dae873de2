//! Parallel shard download and reconstruction

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::asset::{AssetRecord, AssetStore};
use super::placement::StorageMode;
use super::retry::RetryPolicy;
use super::transport::ShardTransport;
use super::uploader::ShardFailure;
use super::{TransferError, DEFAULT_WINDOW};
use crate::erasure;
use crate::identity::{shard_aad, NodeIdentity, SealedBox, SessionKey};
use crate::reputation::ReputationBook;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadReport {
    pub asset_id: String,
    pub fetched: usize,
    pub needed: usize,
    pub failed: Vec<ShardFailure>,
}

pub struct Downloader {
    identity: Arc<NodeIdentity>,
    transport: Arc<dyn ShardTransport>,
    assets: AssetStore,
    reputation: Option<Arc<ReputationBook>>,
    retry: RetryPolicy,
    window: usize,
}

impl Downloader {
    pub fn new(identity: Arc<NodeIdentity>, transport: Arc<dyn ShardTransport>, assets: AssetStore) -> Self {
        Self {
            identity,
            transport,
            assets,
            reputation: None,
            retry: RetryPolicy::download(),
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_reputation(mut self, reputation: Arc<ReputationBook>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Fetch and rebuild `asset_id` from the endpoints recorded at upload.
    ///
    /// Workers stop taking new shards once enough have been opened. Fails
    /// with `InsufficientShards` when every endpoint has been tried and too
    /// few shards came back.
    pub async fn download(&self, asset_id: &str) -> Result<(Vec<u8>, DownloadReport), TransferError> {
        let record = self.assets.load(asset_id)?;
        let needed = record.meta.mode.needed();

        let run = DownloadRun {
            downloader: self,
            record: &record,
            needed,
            queue: Mutex::new((0..record.endpoints.len()).collect()),
            opened: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        };
        join_all((0..self.window.min(needed.max(1))).map(|_| run.work())).await;

        let mut opened = run.opened.into_inner().unwrap_or_default();
        let mut failed = run.failures.into_inner().unwrap_or_default();
        failed.sort_by_key(|f| f.index);
        opened.sort_by_key(|(index, _)| *index);

        if opened.len() < needed {
            log::warn!("{}: fetched={}/{} shards, cannot rebuild", asset_id, opened.len(), needed);
            return Err(TransferError::InsufficientShards {
                have: opened.len(),
                need: needed,
            });
        }

        let fetched = opened.len();
        let data = match &record.meta.mode {
            StorageMode::Erasure(_) => {
                let meta = record
                    .meta
                    .erasure
                    .as_ref()
                    .ok_or_else(|| TransferError::InvalidAsset(format!("{} has no erasure metadata", asset_id)))?;
                let (indices, payloads): (Vec<usize>, Vec<Vec<u8>>) = opened.iter().cloned().unzip();
                erasure::decode(&payloads, &indices, meta)?
            }
            StorageMode::Replication { .. } => {
                let (_, copy) = opened.swap_remove(0);
                if copy.len() != record.meta.orig_len {
                    return Err(TransferError::InvalidResponse(format!(
                        "replica of {} has {} bytes, expected {}",
                        asset_id,
                        copy.len(),
                        record.meta.orig_len
                    )));
                }
                copy
            }
        };

        log::info!("{}: fetched={}/{} bytes={}", asset_id, fetched, needed, data.len());
        Ok((
            data,
            DownloadReport {
                asset_id: asset_id.to_string(),
                fetched,
                needed,
                failed,
            },
        ))
    }

    fn record_reputation(&self, endpoint: &str, hit: bool) {
        if let Some(book) = &self.reputation {
            let result = if hit {
                book.record_hit(endpoint)
            } else {
                book.record_miss(endpoint)
            };
            if let Err(e) = result {
                log::debug!("reputation for {} not recorded: {}", endpoint, e);
            }
        }
    }
}

struct DownloadRun<'a> {
    downloader: &'a Downloader,
    record: &'a AssetRecord,
    needed: usize,
    queue: Mutex<VecDeque<usize>>,
    opened: Mutex<Vec<(usize, Vec<u8>)>>,
    failures: Mutex<Vec<ShardFailure>>,
}

impl DownloadRun<'_> {
    fn next_index(&self) -> Option<usize> {
        let have = self.opened.lock().map(|o| o.len()).unwrap_or(0);
        if have >= self.needed {
            return None;
        }
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    async fn work(&self) {
        let asset_id = self.record.asset_id.as_str();
        while let Some(index) = self.next_index() {
            let endpoint = &self.record.endpoints[index];
            match self.fetch_shard(endpoint, index).await {
                Ok(payload) => {
                    log::debug!("fetched shard {} of {} <- {}", index, asset_id, endpoint);
                    self.downloader.record_reputation(endpoint, true);
                    if let Ok(mut opened) = self.opened.lock() {
                        opened.push((index, payload));
                    }
                }
                Err(e) => {
                    if matches!(e, TransferError::AuthenticationFailed(_)) {
                        log::warn!("security: shard {} of {} from {} rejected: {}", index, asset_id, endpoint, e);
                    } else {
                        log::warn!("shard {} of {} <- {} failed: {}", index, asset_id, endpoint, e);
                    }
                    self.downloader.record_reputation(endpoint, false);
                    if let Ok(mut failures) = self.failures.lock() {
                        failures.push(ShardFailure {
                            index,
                            endpoint: endpoint.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Fetch one shard and open it with the key shared with its host.
    async fn fetch_shard(&self, endpoint: &str, index: usize) -> Result<Vec<u8>, TransferError> {
        let downloader = self.downloader;
        let asset_id = self.record.asset_id.as_str();

        let peer = downloader
            .retry
            .run(&format!("pubkeys {}", endpoint), || downloader.transport.public_keys(endpoint))
            .await?;
        let data_b64 = downloader
            .retry
            .run(&format!("fetch {}:{} <- {}", asset_id, index, endpoint), || {
                downloader.transport.fetch(endpoint, asset_id, index)
            })
            .await?;

        let sealed = SealedBox::from_b64(&data_b64)
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))?;
        let session = SessionKey::for_peer(&downloader.identity, &peer)?;
        Ok(session.open(&sealed, shard_aad(asset_id, index).as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::ErasureParams;
    use crate::transfer::{SimulatedNetwork, Uploader};

    struct Fixture {
        _dir: tempfile::TempDir,
        net: Arc<SimulatedNetwork>,
        endpoints: Vec<String>,
        identity: Arc<NodeIdentity>,
        assets: AssetStore,
    }

    async fn fixture(hosts: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let net = SimulatedNetwork::new();
        let mut endpoints = Vec::new();
        for i in 0..hosts {
            endpoints.push(net.add_host(&format!("host-{}", i)).await);
        }
        Fixture {
            assets: AssetStore::new(dir.path().join("assets")),
            _dir: dir,
            net,
            endpoints,
            identity: Arc::new(NodeIdentity::generate("client")),
        }
    }

    async fn put(f: &Fixture, data: &[u8], mode: StorageMode) -> String {
        let report = Uploader::new(f.identity.clone(), f.net.clone(), f.assets.clone())
            .with_retry(RetryPolicy::immediate(2))
            .upload(data, &mode, None, &f.endpoints)
            .await
            .unwrap();
        assert!(report.is_complete());
        report.asset_id
    }

    fn downloader(f: &Fixture) -> Downloader {
        Downloader::new(f.identity.clone(), f.net.clone(), f.assets.clone()).with_retry(RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_round_trip_with_hosts_down() {
        let f = fixture(6).await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        let id = put(&f, &data, StorageMode::Erasure(ErasureParams::new(4, 6, 128).unwrap())).await;

        f.net.set_offline(&f.endpoints[0], true).await;
        f.net.set_offline(&f.endpoints[4], true).await;

        let (restored, report) = downloader(&f).download(&id).await.unwrap();
        assert_eq!(restored, data);
        assert_eq!(report.needed, 4);
        assert!(report.fetched >= 4);
    }

    #[tokio::test]
    async fn test_too_many_losses_fail() {
        let f = fixture(4).await;
        let id = put(&f, b"some bytes", StorageMode::Erasure(ErasureParams::new(3, 4, 4).unwrap())).await;
        f.net.remove_shard(&f.endpoints[1], &id, 1).await;
        f.net.set_offline(&f.endpoints[2], true).await;

        let err = downloader(&f).download(&id).await.unwrap_err();
        assert!(matches!(err, TransferError::InsufficientShards { have: 2, need: 3 }));
    }

    #[tokio::test]
    async fn test_tampered_shard_is_rejected_and_skipped() {
        let f = fixture(3).await;
        let data = b"bound to its slot".to_vec();
        let id = put(&f, &data, StorageMode::Erasure(ErasureParams::new(2, 3, 8).unwrap())).await;
        assert!(f.net.corrupt_shard(&f.endpoints[0], &id, 0).await);

        let (restored, report) = downloader(&f).with_window(1).download(&id).await.unwrap();
        assert_eq!(restored, data);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("Authentication"));
    }

    #[tokio::test]
    async fn test_replication_needs_one_copy() {
        let f = fixture(3).await;
        let data = b"whole object".to_vec();
        let id = put(&f, &data, StorageMode::Replication { copies: 3 }).await;
        f.net.set_offline(&f.endpoints[0], true).await;
        f.net.set_offline(&f.endpoints[1], true).await;

        let (restored, report) = downloader(&f).download(&id).await.unwrap();
        assert_eq!(restored, data);
        assert_eq!(report.needed, 1);
    }

    #[tokio::test]
    async fn test_unknown_asset() {
        let f = fixture(1).await;
        assert!(matches!(
            downloader(&f).download("asset-missing").await,
            Err(TransferError::InvalidAsset(_))
        ));
    }
}
