//! Settlement of usage receipts into rewards
//!
//! `settle_from_batch` prices each receipt with its host's published price
//! sheet and credits the host (net) and the system account (reserve)
//! directly. `Settler::run_cycle` additionally records the batch in the
//! local DAG and emits matching mint transactions into the witnessed pool.
//! Every step is keyed by the batch's merkle root, so a cycle that failed
//! part way can be rerun without paying twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Account, BalanceBook, LedgerBlock, LedgerError, LocalDag, ReceiptBatch, ReceiptStore};
use super::{FinalizeOutcome, Ledger, ResourceType, Transaction};
use crate::config::SettlementConfig;
use crate::identity::NodeIdentity;
use crate::persist;
use crate::transfer::ShardTransport;

fn default_per_mtoken_infer() -> f64 {
    0.03
}

fn default_per_gb_hour() -> f64 {
    0.02
}

fn default_per_gb_transfer() -> f64 {
    0.005
}

/// Unit prices a host advertises in `/announce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSheet {
    #[serde(default = "default_per_mtoken_infer")]
    pub per_mtoken_infer: f64,
    #[serde(default = "default_per_gb_hour")]
    pub per_gb_hour: f64,
    #[serde(default = "default_per_gb_transfer")]
    pub per_gb_transfer: f64,
}

impl Default for PriceSheet {
    fn default() -> Self {
        Self {
            per_mtoken_infer: default_per_mtoken_infer(),
            per_gb_hour: default_per_gb_hour(),
            per_gb_transfer: default_per_gb_transfer(),
        }
    }
}

impl PriceSheet {
    /// Every price must be finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("per_mtoken_infer", self.per_mtoken_infer),
            ("per_gb_hour", self.per_gb_hour),
            ("per_gb_transfer", self.per_gb_transfer),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, value));
            }
        }
        Ok(())
    }

    pub fn rate_for(&self, resource: ResourceType) -> f64 {
        match resource {
            ResourceType::Compute => self.per_mtoken_infer,
            ResourceType::Storage => self.per_gb_hour,
            ResourceType::Transfer => self.per_gb_transfer,
        }
    }
}

/// Where settlement looks up a host's prices. `None` means the host is
/// unknown and its receipts are skipped.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price_sheet(&self, node_id: &str) -> Option<PriceSheet>;
}

/// Fixed prices, optionally per node.
#[derive(Debug, Clone, Default)]
pub struct StaticPrices {
    pub sheets: HashMap<String, PriceSheet>,
    pub fallback: Option<PriceSheet>,
}

impl StaticPrices {
    /// The same sheet for every node.
    pub fn uniform(sheet: PriceSheet) -> Self {
        Self {
            sheets: HashMap::new(),
            fallback: Some(sheet),
        }
    }
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn price_sheet(&self, node_id: &str) -> Option<PriceSheet> {
        self.sheets.get(node_id).cloned().or_else(|| self.fallback.clone())
    }
}

/// Prices fetched live from each host's `/announce`.
pub struct AnnouncePrices {
    /// node id -> endpoint
    hosts: HashMap<String, String>,
    transport: Arc<dyn ShardTransport>,
}

impl AnnouncePrices {
    pub fn new(hosts: HashMap<String, String>, transport: Arc<dyn ShardTransport>) -> Self {
        Self { hosts, transport }
    }
}

#[async_trait]
impl PriceSource for AnnouncePrices {
    async fn price_sheet(&self, node_id: &str) -> Option<PriceSheet> {
        let endpoint = self.hosts.get(node_id)?;
        match self.transport.announce(endpoint).await {
            Ok(announcement) => match announcement.prices.validate() {
                Ok(()) => Some(announcement.prices),
                Err(e) => {
                    log::warn!("security: {} announced invalid prices: {}; using default prices", endpoint, e);
                    Some(PriceSheet::default())
                }
            },
            Err(e) => {
                // the host is known, so fall back to list prices
                log::warn!("announce from {} failed: {}; using default prices", endpoint, e);
                Some(PriceSheet::default())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub account: Account,
    pub gross: f64,
    pub reserve: f64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub items: Vec<SettlementItem>,
    pub host_reserve_rate: f64,
}

/// Price a batch and credit hosts and the system reserve directly.
///
/// The credits are applied in one write keyed by the batch root; settling
/// the same batch again returns the report without crediting.
pub async fn settle_from_batch(
    batch: &ReceiptBatch,
    prices: &dyn PriceSource,
    reserve_rate: f64,
    balances: &BalanceBook,
) -> Result<SettlementReport, LedgerError> {
    let mut sheets: HashMap<String, Option<PriceSheet>> = HashMap::new();
    let mut gross_by_node: BTreeMap<String, f64> = BTreeMap::new();

    for receipt in &batch.items {
        if let Err(e) = receipt.verify() {
            log::warn!("security: skipping receipt {}: {}", receipt.body.job_id, e);
            continue;
        }
        let node_id = &receipt.body.node_id;
        if !sheets.contains_key(node_id) {
            let sheet = prices.price_sheet(node_id).await.filter(|sheet| match sheet.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("security: ignoring prices for node {}: {}", node_id, e);
                    false
                }
            });
            sheets.insert(node_id.clone(), sheet);
        }
        let Some(Some(sheet)) = sheets.get(node_id) else {
            log::debug!("no prices for node {}, receipt {} skipped", node_id, receipt.body.job_id);
            continue;
        };
        let gross = receipt.body.units * sheet.rate_for(receipt.body.resource_type);
        *gross_by_node.entry(node_id.clone()).or_insert(0.0) += gross;
    }

    let mut items = Vec::with_capacity(gross_by_node.len());
    let mut credits = Vec::with_capacity(gross_by_node.len() + 1);
    let mut total_reserve = 0.0;
    for (node_id, gross) in gross_by_node {
        let reserve = gross * reserve_rate;
        let net = gross - reserve;
        let account = Account::named(node_id);
        credits.push((account.clone(), net));
        total_reserve += reserve;
        items.push(SettlementItem {
            account,
            gross,
            reserve,
            net,
        });
    }
    credits.push((Account::System, total_reserve));
    if !balances.credit_once(&settlement_key(&batch.root), &credits)? {
        log::info!("batch {} already credited", batch.root);
    }

    Ok(SettlementReport {
        items,
        host_reserve_rate: reserve_rate,
    })
}

fn settlement_key(batch_root: &str) -> String {
    format!("settlement:{}", batch_root)
}

/// Summary of one settlement cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub batch_root: String,
    pub block: LedgerBlock,
    pub settlement: SettlementReport,
    pub transactions: Vec<String>,
    pub finalized: Vec<String>,
}

pub struct Settler {
    receipts: ReceiptStore,
    dag: LocalDag,
    ledger: Arc<Ledger>,
    identity: Arc<NodeIdentity>,
    prices: Arc<dyn PriceSource>,
    config: SettlementConfig,
    /// Roots of batches already settled (`settled_batches.json`)
    seen_path: PathBuf,
}

impl Settler {
    pub fn new(
        receipts: ReceiptStore,
        dag: LocalDag,
        ledger: Arc<Ledger>,
        identity: Arc<NodeIdentity>,
        prices: Arc<dyn PriceSource>,
        config: SettlementConfig,
        seen_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            receipts,
            dag,
            ledger,
            identity,
            prices,
            config,
            seen_path: seen_path.into(),
        }
    }

    /// Settle the pending receipts, if any. `None` when there was nothing new.
    pub async fn run_cycle(&self) -> Result<Option<CycleReport>, LedgerError> {
        let batch = self.receipts.export_batch(self.config.batch_limit)?;
        if batch.count == 0 {
            return Ok(None);
        }

        let mut seen: Vec<String> = persist::read_json_or(&self.seen_path, Vec::new)?;
        if seen.contains(&batch.root) {
            log::debug!("batch {} already settled", batch.root);
            self.receipts.archive(&batch)?;
            return Ok(None);
        }

        let settlement = settle_from_batch(
            &batch,
            self.prices.as_ref(),
            self.config.reserve_rate,
            self.ledger.balances(),
        )
        .await?;
        let block = match self.dag.find_block(&batch.root)? {
            Some(block) => {
                log::info!("resuming batch {} at block {}", batch.root, block.hash);
                block
            }
            None => self.dag.append_block(&batch.root, batch.count)?,
        };

        let transactions = self.mint_transactions(&batch.root, &block, &settlement)?;

        let mut finalized = Vec::new();
        if self.config.quorum_m <= 1 {
            for id in &transactions {
                if let FinalizeOutcome::Finalized { id } = self.ledger.finalize(id, self.config.quorum_m)? {
                    finalized.push(id);
                }
            }
        }

        seen.push(batch.root.clone());
        persist::write_json_atomic(&self.seen_path, &seen)?;
        self.receipts.archive(&batch)?;

        log::info!(
            "settled batch {}: {} hosts, {} transactions",
            batch.root,
            settlement.items.len(),
            transactions.len()
        );
        Ok(Some(CycleReport {
            batch_root: batch.root,
            block,
            settlement,
            transactions,
            finalized,
        }))
    }

    /// Ids of the mint transactions for a batch. Ones already pooled or
    /// logged by an earlier attempt are reused, otherwise they are created
    /// and pooled in a single write.
    fn mint_transactions(
        &self,
        batch_root: &str,
        block: &LedgerBlock,
        settlement: &SettlementReport,
    ) -> Result<Vec<String>, LedgerError> {
        let own_key = self.identity.verify_key_b64();
        let mut existing: Vec<String> = Vec::new();
        for tx in self.ledger.pool()?.into_iter().chain(self.ledger.log()?) {
            let ours = tx.witnesses.first().map(|w| &w.verify_key) == Some(&own_key);
            let for_batch = tx.body.meta.get("batch").and_then(|v| v.as_str()) == Some(batch_root);
            if ours && for_batch && !existing.contains(&tx.id) {
                existing.push(tx.id);
            }
        }
        if !existing.is_empty() {
            return Ok(existing);
        }

        let mut nonce = chrono::Utc::now().timestamp().max(0) as u64;
        let mut pending = Vec::new();
        for item in &settlement.items {
            let net_tx = Transaction::create_signed(
                &self.identity,
                Account::Mint,
                item.account.clone(),
                item.net,
                0.0,
                nonce,
                serde_json::json!({"type": "settlement", "batch": batch_root, "block": block.hash}),
            )?;
            pending.push(net_tx);

            if item.reserve > 0.0 {
                let reserve_tx = Transaction::create_signed(
                    &self.identity,
                    Account::Mint,
                    Account::System,
                    item.reserve,
                    0.0,
                    nonce + 1,
                    serde_json::json!({"type": "reserve", "batch": batch_root, "block": block.hash}),
                )?;
                pending.push(reserve_tx);
            }
            nonce += 2;
        }

        let ids = pending.iter().map(|tx| tx.id.clone()).collect();
        self.ledger.pool_extend(pending)?;
        Ok(ids)
    }

    /// Run `run_cycle` forever on the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_cycle().await {
                log::warn!("settlement cycle failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ResourceType;

    struct Fixture {
        _dir: tempfile::TempDir,
        receipts: ReceiptStore,
        balances: BalanceBook,
        host: NodeIdentity,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let receipts = ReceiptStore::new(dir.path().join("receipts"), "cluster-local");
        let balances = BalanceBook::new(dir.path().join("balances.json"));
        Fixture {
            _dir: dir,
            receipts,
            balances,
            host: NodeIdentity::generate("host-a"),
        }
    }

    #[tokio::test]
    async fn test_settle_splits_reserve() {
        let f = fixture();
        f.receipts
            .create_usage_receipt(&f.host, "host-a", "j1", ResourceType::Compute, 10.0, serde_json::json!({}))
            .unwrap();
        f.receipts
            .create_usage_receipt(&f.host, "host-a", "j2", ResourceType::Storage, 5.0, serde_json::json!({}))
            .unwrap();
        let batch = f.receipts.export_batch(100).unwrap();

        let prices = StaticPrices::uniform(PriceSheet::default());
        let report = settle_from_batch(&batch, &prices, 0.01, &f.balances).await.unwrap();

        assert_eq!(report.items.len(), 1);
        let item = &report.items[0];
        // 10 * 0.03 + 5 * 0.02
        assert!((item.gross - 0.4).abs() < 1e-9);
        assert!((item.reserve - 0.004).abs() < 1e-9);
        assert!((item.net - 0.396).abs() < 1e-9);
        assert!((f.balances.balance(&Account::named("host-a")).unwrap() - 0.396).abs() < 1e-9);
        assert!((f.balances.balance(&Account::System).unwrap() - 0.004).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_hosts_are_skipped() {
        let f = fixture();
        f.receipts
            .create_usage_receipt(&f.host, "host-a", "j1", ResourceType::Transfer, 100.0, serde_json::json!({}))
            .unwrap();
        let batch = f.receipts.export_batch(100).unwrap();

        let report = settle_from_batch(&batch, &StaticPrices::default(), 0.01, &f.balances)
            .await
            .unwrap();
        assert!(report.items.is_empty());
        assert_eq!(f.balances.balance(&Account::named("host-a")).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_settling_a_batch_again_credits_once() {
        let f = fixture();
        f.receipts
            .create_usage_receipt(&f.host, "host-a", "j1", ResourceType::Compute, 10.0, serde_json::json!({}))
            .unwrap();
        let batch = f.receipts.export_batch(100).unwrap();
        let prices = StaticPrices::uniform(PriceSheet::default());

        let first = settle_from_batch(&batch, &prices, 0.01, &f.balances).await.unwrap();
        let second = settle_from_batch(&batch, &prices, 0.01, &f.balances).await.unwrap();
        assert_eq!(first, second);
        assert!((f.balances.balance(&Account::named("host-a")).unwrap() - 0.297).abs() < 1e-9);
        assert!((f.balances.balance(&Account::System).unwrap() - 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_price_sheet_is_ignored() {
        let f = fixture();
        f.receipts
            .create_usage_receipt(&f.host, "host-a", "j1", ResourceType::Storage, 10.0, serde_json::json!({}))
            .unwrap();
        let batch = f.receipts.export_batch(100).unwrap();

        let prices = StaticPrices::uniform(PriceSheet {
            per_gb_hour: -5.0,
            ..PriceSheet::default()
        });
        let report = settle_from_batch(&batch, &prices, 0.01, &f.balances).await.unwrap();
        assert!(report.items.is_empty());
        assert_eq!(f.balances.balance(&Account::named("host-a")).unwrap(), 0.0);
    }

    #[test]
    fn test_price_sheet_validation() {
        assert!(PriceSheet::default().validate().is_ok());
        let negative = PriceSheet {
            per_mtoken_infer: -0.01,
            ..PriceSheet::default()
        };
        assert!(negative.validate().unwrap_err().contains("per_mtoken_infer"));
        let infinite = PriceSheet {
            per_gb_transfer: f64::INFINITY,
            ..PriceSheet::default()
        };
        assert!(infinite.validate().is_err());
    }

    #[test]
    fn test_price_sheet_partial_json_uses_defaults() {
        let sheet: PriceSheet = serde_json::from_str(r#"{"per_gb_hour": 0.5}"#).unwrap();
        assert_eq!(sheet.per_gb_hour, 0.5);
        assert_eq!(sheet.rate_for(ResourceType::Compute), 0.03);
        assert_eq!(sheet.rate_for(ResourceType::Transfer), 0.005);
    }
}
