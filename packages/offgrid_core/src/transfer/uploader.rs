//! Encrypted, resumable shard upload

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use super::asset::{default_asset_id, validate_asset_id, AssetMeta, AssetRecord, AssetStore};
use super::manifest::UploadManifest;
use super::placement::{plan_assignments, StorageMode};
use super::retry::RetryPolicy;
use super::transport::{ShardTransport, StoreRequest};
use super::{TransferError, DEFAULT_WINDOW};
use crate::erasure;
use crate::identity::{shard_aad, NodeIdentity, PublicKeys, SessionKey};
use crate::quorum::{QuorumEngine, QuorumKind};
use crate::reputation::ReputationBook;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub index: usize,
    pub endpoint: String,
    pub error: String,
}

/// Outcome of one upload run. `stored` counts every shard confirmed so far,
/// including those stored by earlier runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub asset_id: String,
    pub stored: usize,
    pub total: usize,
    pub failed: Vec<ShardFailure>,
    pub durable: bool,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.stored == self.total
    }
}

pub struct Uploader {
    identity: Arc<NodeIdentity>,
    transport: Arc<dyn ShardTransport>,
    assets: AssetStore,
    quorum: Option<Arc<QuorumEngine>>,
    reputation: Option<Arc<ReputationBook>>,
    retry: RetryPolicy,
    window: usize,
    required: Option<f64>,
}

impl Uploader {
    pub fn new(identity: Arc<NodeIdentity>, transport: Arc<dyn ShardTransport>, assets: AssetStore) -> Self {
        Self {
            identity,
            transport,
            assets,
            quorum: None,
            reputation: None,
            retry: RetryPolicy::upload(),
            window: DEFAULT_WINDOW,
            required: None,
        }
    }

    pub fn with_quorum(mut self, quorum: Arc<QuorumEngine>) -> Self {
        self.quorum = Some(quorum);
        self
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

    /// Override the durability weight an upload must reach.
    pub fn with_required(mut self, required: f64) -> Self {
        self.required = Some(required);
        self
    }

    /// Store `data` across `endpoints`.
    ///
    /// Shards already recorded in the asset's manifest are skipped, so
    /// re-running a partially failed upload only sends what is missing.
    /// Per-shard failures are reported, not returned as errors.
    pub async fn upload(
        &self,
        data: &[u8],
        mode: &StorageMode,
        asset_id: Option<&str>,
        endpoints: &[String],
    ) -> Result<UploadReport, TransferError> {
        let asset_id = match asset_id {
            Some(id) => id.to_string(),
            None => default_asset_id(data),
        };
        validate_asset_id(&asset_id)?;

        let (payloads, erasure_meta) = match mode {
            StorageMode::Erasure(params) => {
                let (shards, meta) = erasure::encode(data, params)?;
                (shards, Some(meta))
            }
            StorageMode::Replication { copies } => (vec![data.to_vec(); *copies], None),
        };

        let manifest_path = self.assets.manifest_path(&asset_id);
        let mut manifest = UploadManifest::load(&manifest_path, &asset_id)?;

        // resume against the plan the stored shards were sent to
        let record = match self.assets.load(&asset_id) {
            Ok(existing) if existing.meta.mode == *mode && existing.meta.orig_len == data.len() => existing,
            _ => {
                if !manifest.done.is_empty() {
                    log::info!("{}: placement changed, restarting upload", asset_id);
                    manifest = UploadManifest::new(asset_id.as_str());
                }
                let record = AssetRecord {
                    asset_id: asset_id.clone(),
                    meta: AssetMeta {
                        mode: *mode,
                        orig_len: data.len(),
                        erasure: erasure_meta,
                    },
                    endpoints: plan_assignments(mode, endpoints)?,
                    created_ts: chrono::Utc::now().timestamp(),
                };
                self.assets.save(&record)?;
                record
            }
        };
        let assignments = record.endpoints;
        let total = payloads.len();

        let required = self
            .required
            .unwrap_or_else(|| mode.durability_quorum(&assignments) as f64);
        if let Some(quorum) = &self.quorum {
            quorum.create_or_get(
                &asset_id,
                &QuorumKind::Upload,
                required,
                serde_json::json!({ "asset_id": asset_id, "endpoints": assignments }),
            )?;
        }

        let run = UploadRun {
            uploader: self,
            asset_id: &asset_id,
            assignments: &assignments,
            payloads: &payloads,
            manifest_path: &manifest_path,
            queue: StdMutex::new((0..total).filter(|i| !manifest.is_done(*i)).collect()),
            manifest: Mutex::new(manifest),
            failures: StdMutex::new(Vec::new()),
            keys: Mutex::new(HashMap::new()),
        };
        join_all((0..self.window.min(total.max(1))).map(|_| run.work())).await;

        let stored = run.manifest.lock().await.done.len();
        let mut failed = run.failures.into_inner().unwrap_or_default();
        failed.sort_by_key(|f| f.index);

        let durable = match &self.quorum {
            Some(quorum) => quorum.is_finalized(&asset_id, &QuorumKind::Upload)?,
            None => stored as f64 >= required,
        };

        log::info!("{}: stored={}/{} durable={}", asset_id, stored, total, durable);
        Ok(UploadReport {
            asset_id,
            stored,
            total,
            failed,
            durable,
        })
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

/// State shared by the workers of one upload.
struct UploadRun<'a> {
    uploader: &'a Uploader,
    asset_id: &'a str,
    assignments: &'a [String],
    payloads: &'a [Vec<u8>],
    manifest_path: &'a Path,
    queue: StdMutex<VecDeque<usize>>,
    manifest: Mutex<UploadManifest>,
    failures: StdMutex<Vec<ShardFailure>>,
    /// endpoint -> published keys, fetched once per run
    keys: Mutex<HashMap<String, PublicKeys>>,
}

impl UploadRun<'_> {
    fn next_index(&self) -> Option<usize> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    /// Drain the queue until it is empty.
    async fn work(&self) {
        let total = self.payloads.len();
        while let Some(index) = self.next_index() {
            let endpoint = &self.assignments[index];
            match self.store_shard(endpoint, index).await {
                Ok(peer) => {
                    {
                        let mut manifest = self.manifest.lock().await;
                        manifest.mark_done(index);
                        if let Err(e) = manifest.save(self.manifest_path) {
                            log::warn!("{}: manifest not saved: {}", self.asset_id, e);
                        }
                    }
                    log::info!("stored shard {}/{} -> {}", index + 1, total, endpoint);
                    if let Some(quorum) = &self.uploader.quorum {
                        if let Err(e) = quorum.add_ack(self.asset_id, &QuorumKind::Upload, &peer.node_id) {
                            log::warn!("{}: durability ack from {} lost: {}", self.asset_id, peer.node_id, e);
                        }
                    }
                    self.uploader.record_reputation(endpoint, true);
                }
                Err(e) => {
                    if matches!(e, TransferError::AuthenticationFailed(_)) {
                        log::warn!("security: shard {} of {} at {}: {}", index, self.asset_id, endpoint, e);
                    } else {
                        log::warn!("shard {} of {} -> {} failed: {}", index, self.asset_id, endpoint, e);
                    }
                    self.uploader.record_reputation(endpoint, false);
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

    /// Seal one shard for its endpoint and store it, with retry. Returns the
    /// peer's published keys.
    async fn store_shard(&self, endpoint: &str, index: usize) -> Result<PublicKeys, TransferError> {
        let uploader = self.uploader;
        let peer = self.peer_keys(endpoint).await?;
        let session = SessionKey::for_peer(&uploader.identity, &peer)?;
        let sealed = session.seal(&self.payloads[index], shard_aad(self.asset_id, index).as_bytes())?;
        let request = StoreRequest {
            asset_id: self.asset_id.to_string(),
            index,
            data_b64: sealed.to_b64()?,
        };
        let label = format!("store {}:{} -> {}", self.asset_id, index, endpoint);
        uploader
            .retry
            .run(&label, || uploader.transport.store(endpoint, &request))
            .await?;
        Ok(peer)
    }

    async fn peer_keys(&self, endpoint: &str) -> Result<PublicKeys, TransferError> {
        if let Some(cached) = self.keys.lock().await.get(endpoint) {
            return Ok(cached.clone());
        }
        let uploader = self.uploader;
        let label = format!("pubkeys {}", endpoint);
        let fetched = uploader
            .retry
            .run(&label, || uploader.transport.public_keys(endpoint))
            .await?;
        self.keys.lock().await.insert(endpoint.to_string(), fetched.clone());
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::ErasureParams;
    use crate::quorum::PolicyStore;
    use crate::transfer::SimulatedNetwork;

    struct Fixture {
        _dir: tempfile::TempDir,
        net: Arc<SimulatedNetwork>,
        endpoints: Vec<String>,
        assets: AssetStore,
        quorum: Arc<QuorumEngine>,
    }

    async fn fixture(hosts: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let net = SimulatedNetwork::new();
        let mut endpoints = Vec::new();
        for i in 0..hosts {
            endpoints.push(net.add_host(&format!("host-{}", i)).await);
        }
        let quorum = Arc::new(QuorumEngine::new(
            dir.path().join("quorum.json"),
            dir.path().join("quorum_log.json"),
            PolicyStore::new(dir.path().join("quorum_policy.json")),
        ));
        Fixture {
            assets: AssetStore::new(dir.path().join("assets")),
            _dir: dir,
            net,
            endpoints,
            quorum,
        }
    }

    fn uploader(f: &Fixture) -> Uploader {
        Uploader::new(
            Arc::new(NodeIdentity::generate("client")),
            f.net.clone(),
            f.assets.clone(),
        )
        .with_quorum(f.quorum.clone())
        .with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_upload_places_every_shard_and_reaches_quorum() {
        let f = fixture(5).await;
        let mode = StorageMode::Erasure(ErasureParams::new(3, 5, 64).unwrap());
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let report = uploader(&f).upload(&data, &mode, None, &f.endpoints).await.unwrap();

        assert_eq!(report.stored, 5);
        assert_eq!(report.total, 5);
        assert!(report.failed.is_empty());
        assert!(report.durable);
        assert_eq!(report.asset_id, default_asset_id(&data));
        for ep in &f.endpoints {
            assert_eq!(f.net.stored_count(ep).await, 1);
        }
        let record = f.quorum.get_record(&report.asset_id, &QuorumKind::Upload).unwrap().unwrap();
        assert_eq!(record.required, 3.0);
        assert_eq!(record.acks.len(), 5);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_progress_and_resumes() {
        let f = fixture(4).await;
        let mode = StorageMode::Erasure(ErasureParams::new(2, 4, 32).unwrap());
        let data = vec![7u8; 300];
        f.net.set_offline(&f.endpoints[3], true).await;

        let first = uploader(&f)
            .upload(&data, &mode, Some("asset-x"), &f.endpoints)
            .await
            .unwrap();
        assert_eq!(first.stored, 3);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].index, 3);
        assert!(first.durable);

        f.net.set_offline(&f.endpoints[3], false).await;
        let second = uploader(&f)
            .upload(&data, &mode, Some("asset-x"), &f.endpoints)
            .await
            .unwrap();
        assert!(second.is_complete());
        // only the missing shard was sent again
        for ep in &f.endpoints {
            assert_eq!(f.net.store_calls(ep).await, 1);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(3).await;
        let mode = StorageMode::Replication { copies: 3 };
        f.net.fail_next(&f.endpoints[1], 2).await;

        let report = uploader(&f)
            .upload(b"replicated", &mode, Some("rep-1"), &f.endpoints)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert!(report.durable);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_an_error() {
        let f = fixture(0).await;
        let mode = StorageMode::Replication { copies: 1 };
        let err = uploader(&f).upload(b"x", &mode, None, &[]).await.unwrap_err();
        assert!(matches!(err, TransferError::NoEndpoints(_)));
    }
}
