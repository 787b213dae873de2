//! warp routes of the host shard service

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::{HostError, ShardStore};
use crate::config::HostConfig;
use crate::identity::{decode_b64, encode_b64, NodeIdentity};
use crate::ledger::{PriceSheet, ReceiptStore, ResourceType};
use crate::transfer::{Announcement, StoreRequest};

const EXPORT_LIMIT: usize = 500;

pub struct HostState {
    identity: Arc<NodeIdentity>,
    active: AtomicBool,
    prices: RwLock<PriceSheet>,
    shards: ShardStore,
    receipts: ReceiptStore,
    permits: Arc<Semaphore>,
    retry_after_secs: u64,
}

impl HostState {
    pub fn new(identity: Arc<NodeIdentity>, config: &HostConfig, shards: ShardStore, receipts: ReceiptStore) -> Self {
        Self {
            identity,
            active: AtomicBool::new(true),
            prices: RwLock::new(config.prices.clone()),
            shards,
            receipts,
            permits: Arc::new(Semaphore::new(config.max_concurrent_stores.max(1))),
            retry_after_secs: config.retry_after_secs,
        }
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    /// Write slots for `/store`. Exhausting them makes the host answer busy.
    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn announcement(&self) -> Announcement {
        Announcement {
            node_id: self.node_id().to_string(),
            active: self.is_active(),
            prices: self.prices.read().await.clone(),
        }
    }

    pub async fn quote(&self, resource_type: &str, size: f64) -> f64 {
        match resource_type.parse::<ResourceType>() {
            Ok(resource) => self.prices.read().await.rate_for(resource) * size,
            Err(_) => 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    asset_id: String,
    index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct FetchReply {
    asset_id: String,
    index: usize,
    data_b64: String,
}

fn default_quote_type() -> String {
    "compute".to_string()
}

fn default_quote_size() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    #[serde(rename = "type", default = "default_quote_type")]
    kind: String,
    #[serde(default = "default_quote_size")]
    size: f64,
}

/// Partial price update accepted by `POST /announce`.
#[derive(Debug, Default, Deserialize)]
struct PriceUpdate {
    per_mtoken_infer: Option<f64>,
    per_gb_hour: Option<f64>,
    per_gb_transfer: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct AnnounceUpdate {
    #[serde(default)]
    prices: Option<PriceUpdate>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    #[serde(default = "default_active")]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    job_id: Option<String>,
    #[serde(default = "default_quote_type")]
    resource_type: String,
    units: Option<f64>,
    #[serde(default)]
    metrics: serde_json::Value,
}

pub fn routes(state: Arc<HostState>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let store = warp::path("store")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_store);

    let fetch = warp::path("fetch")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<FetchQuery>())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_fetch);

    let pubkeys = warp::path("pubkeys")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_pubkeys);

    let announce = warp::path("announce")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_announce);

    let update_announce = warp::path("announce")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_update_announce);

    let quote = warp::path("quote")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<QuoteQuery>())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_quote);

    let toggle = warp::path("toggle")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_toggle);

    let run = warp::path("run")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_run);

    let export = warp::path("receipts")
        .and(warp::path("export"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_export);

    store
        .or(fetch)
        .unify()
        .or(pubkeys)
        .unify()
        .or(announce)
        .unify()
        .or(update_announce)
        .unify()
        .or(quote)
        .unify()
        .or(toggle)
        .unify()
        .or(run)
        .unify()
        .or(export)
        .unify()
}

fn with_state(state: Arc<HostState>) -> impl Filter<Extract = (Arc<HostState>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

fn error_reply(status: StatusCode, message: impl std::fmt::Display) -> Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message.to_string() })),
        status,
    )
    .into_response()
}

fn host_error_reply(e: HostError) -> Response {
    let status = match &e {
        HostError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        HostError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("host request failed: {}", e);
    }
    error_reply(status, e)
}

fn busy_reply(retry_after_secs: u64) -> Response {
    warp::reply::with_header(
        warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": "busy" })),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        "Retry-After",
        retry_after_secs.to_string(),
    )
    .into_response()
}

async fn handle_store(request: StoreRequest, state: Arc<HostState>) -> Result<Response, Rejection> {
    let _permit = match Arc::clone(&state.permits).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            log::warn!("store of {}:{} refused, host busy", request.asset_id, request.index);
            return Ok(busy_reply(state.retry_after_secs));
        }
    };

    let data = match decode_b64(&request.data_b64) {
        Ok(data) => data,
        Err(e) => return Ok(error_reply(StatusCode::BAD_REQUEST, e)),
    };

    let shards = state.shards.clone();
    let StoreRequest { asset_id, index, .. } = request;
    let stored = tokio::task::spawn_blocking(move || shards.put(&asset_id, index, &data))
        .await
        .map_err(|e| HostError::Io(e.to_string()))
        .and_then(|result| result);

    Ok(match stored {
        Ok(()) => warp::reply::json(&serde_json::json!({ "ok": true })).into_response(),
        Err(e) => host_error_reply(e),
    })
}

async fn handle_fetch(query: FetchQuery, state: Arc<HostState>) -> Result<Response, Rejection> {
    Ok(match state.shards.get(&query.asset_id, query.index) {
        Ok(Some(data)) => warp::reply::json(&FetchReply {
            data_b64: encode_b64(&data),
            asset_id: query.asset_id,
            index: query.index,
        })
        .into_response(),
        Ok(None) => host_error_reply(HostError::NotFound(format!(
            "shard {} of {}",
            query.index, query.asset_id
        ))),
        Err(e) => host_error_reply(e),
    })
}

async fn handle_pubkeys(state: Arc<HostState>) -> Result<Response, Rejection> {
    Ok(warp::reply::json(&state.identity.public_keys()).into_response())
}

async fn handle_announce(state: Arc<HostState>) -> Result<Response, Rejection> {
    Ok(warp::reply::json(&state.announcement().await).into_response())
}

async fn handle_update_announce(update: AnnounceUpdate, state: Arc<HostState>) -> Result<Response, Rejection> {
    if let Some(patch) = update.prices {
        let mut prices = state.prices.write().await;
        let mut next = prices.clone();
        if let Some(p) = patch.per_mtoken_infer {
            next.per_mtoken_infer = p;
        }
        if let Some(p) = patch.per_gb_hour {
            next.per_gb_hour = p;
        }
        if let Some(p) = patch.per_gb_transfer {
            next.per_gb_transfer = p;
        }
        if let Err(e) = next.validate() {
            log::warn!("rejected price update: {}", e);
            return Ok(error_reply(StatusCode::BAD_REQUEST, e));
        }
        *prices = next;
        log::info!("prices updated: {:?}", *prices);
    }
    let announcement = state.announcement().await;
    Ok(warp::reply::json(&serde_json::json!({ "ok": true, "state": announcement })).into_response())
}

async fn handle_quote(query: QuoteQuery, state: Arc<HostState>) -> Result<Response, Rejection> {
    let kind = query.kind.to_lowercase();
    let quote = state.quote(&kind, query.size).await;
    Ok(warp::reply::json(&serde_json::json!({
        "type": kind,
        "size": query.size,
        "quote": quote,
    }))
    .into_response())
}

async fn handle_toggle(request: ToggleRequest, state: Arc<HostState>) -> Result<Response, Rejection> {
    state.active.store(request.active, Ordering::SeqCst);
    log::info!("host {} active={}", state.node_id(), request.active);
    Ok(warp::reply::json(&serde_json::json!({ "active": request.active })).into_response())
}

async fn handle_run(request: RunRequest, state: Arc<HostState>) -> Result<Response, Rejection> {
    let resource = match request.resource_type.to_lowercase().parse::<ResourceType>() {
        Ok(resource) => resource,
        Err(e) => return Ok(error_reply(StatusCode::BAD_REQUEST, e)),
    };
    let job_id = request
        .job_id
        .unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4()));
    let units = request
        .units
        .or_else(|| request.metrics.get("compute_tokens_m").and_then(|v| v.as_f64()))
        .unwrap_or(0.0);

    let receipt = state.receipts.create_usage_receipt(
        &state.identity,
        state.node_id(),
        &job_id,
        resource,
        units,
        request.metrics,
    );
    Ok(match receipt {
        Ok(receipt) => warp::reply::json(&serde_json::json!({ "ok": true, "receipt": receipt })).into_response(),
        Err(e) => host_error_reply(match e {
            crate::ledger::LedgerError::InvalidName(m) | crate::ledger::LedgerError::InvalidAmount(m) => {
                HostError::InvalidRequest(m)
            }
            other => HostError::Ledger(other),
        }),
    })
}

async fn handle_export(state: Arc<HostState>) -> Result<Response, Rejection> {
    Ok(match state.receipts.export_batch(EXPORT_LIMIT) {
        Ok(batch) => warp::reply::json(&batch).into_response(),
        Err(e) => host_error_reply(HostError::Ledger(e)),
    })
}
