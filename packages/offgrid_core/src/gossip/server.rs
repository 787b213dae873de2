//! warp routes a node exposes to gossip peers

use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::state::GossipState;
use super::GossipError;
use crate::ledger::{Balances, LedgerBlock, LedgerError, Transaction};
use crate::reputation::ReputationTable;

#[derive(Debug, Deserialize)]
struct BlockQuery {
    name: String,
}

/// All `/gossip/*` endpoints over one shared state.
pub fn routes(state: Arc<GossipState>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let gossip = warp::path("gossip");

    let blocks = gossip
        .and(warp::path("blocks"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_blocks);

    let block = gossip
        .and(warp::path("block"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<BlockQuery>())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_block);

    let balances = gossip
        .and(warp::path("balances"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_balances);

    let rep = gossip
        .and(warp::path("rep"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_rep);

    let tx_pool = gossip
        .and(warp::path("tx_pool"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_tx_pool);

    let append_block = gossip
        .and(warp::path("append_block"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_append_block);

    let merge_balances = gossip
        .and(warp::path("merge_balances"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_merge_balances);

    let merge_rep = gossip
        .and(warp::path("merge_rep"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_merge_rep);

    let tx_witness = gossip
        .and(warp::path("tx_witness"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_tx_witness);

    blocks
        .or(block)
        .unify()
        .or(balances)
        .unify()
        .or(rep)
        .unify()
        .or(tx_pool)
        .unify()
        .or(append_block)
        .unify()
        .or(merge_balances)
        .unify()
        .or(merge_rep)
        .unify()
        .or(tx_witness)
        .unify()
}

fn with_state(state: Arc<GossipState>) -> impl Filter<Extract = (Arc<GossipState>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

fn error_reply(status: StatusCode, message: impl std::fmt::Display) -> Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message.to_string() })),
        status,
    )
    .into_response()
}

fn gossip_error_reply(e: GossipError) -> Response {
    let status = match &e {
        GossipError::Ledger(
            LedgerError::InvalidBlock(_)
            | LedgerError::InvalidName(_)
            | LedgerError::HashMismatch { .. }
            | LedgerError::InvalidSignature(_),
        ) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("gossip request failed: {}", e);
    } else {
        log::warn!("gossip request rejected: {}", e);
    }
    error_reply(status, e)
}

fn json_or_error<T: serde::Serialize>(result: Result<T, GossipError>) -> Result<Response, Rejection> {
    Ok(match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => gossip_error_reply(e),
    })
}

async fn handle_blocks(state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(
        state
            .block_names()
            .map(|names| serde_json::json!({ "blocks": names })),
    )
}

async fn handle_block(query: BlockQuery, state: Arc<GossipState>) -> Result<Response, Rejection> {
    match state.block_names() {
        Ok(names) if !names.contains(&query.name) => {
            return Ok(error_reply(StatusCode::NOT_FOUND, format!("no block {}", query.name)))
        }
        Err(e) => return Ok(gossip_error_reply(e)),
        Ok(_) => {}
    }
    json_or_error(state.block(&query.name))
}

async fn handle_balances(state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(state.balances())
}

async fn handle_rep(state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(state.reputation())
}

async fn handle_tx_pool(state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(state.tx_pool())
}

async fn handle_append_block(block: LedgerBlock, state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(
        state
            .append_block(&block)
            .map(|ok| serde_json::json!({ "ok": ok })),
    )
}

async fn handle_merge_balances(remote: Balances, state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(state.merge_balances(&remote).map(|report| report.balances))
}

async fn handle_merge_rep(remote: ReputationTable, state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(state.merge_reputation(&remote).map(|(table, _)| table))
}

async fn handle_tx_witness(tx: Transaction, state: Arc<GossipState>) -> Result<Response, Rejection> {
    json_or_error(
        state
            .tx_witness(tx)
            .map(|result| serde_json::json!({ "ok": true, "result": result })),
    )
}
