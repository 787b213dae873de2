//! offgrid: command-line front end for an offgrid storage node

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use offgrid::erasure::{ErasureParams, PlacementTarget};
use offgrid::gossip::GossipClient;
use offgrid::host;
use offgrid::ledger::{Account, FinalizeOutcome, ResourceType, Transaction};
use offgrid::quorum::{KindPolicy, QuorumKind};
use offgrid::transfer::{StorageMode, TransportKind};
use offgrid::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Erasure-coded storage, witnessing and settlement for offgrid nodes")]
struct Cli {
    /// Node configuration (JSON); defaults apply when missing
    #[arg(short, long, global = true, default_value = "offgrid.json")]
    config: PathBuf,

    /// Overrides `data_dir` from the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve shards, keys, prices and receipts over HTTP
    Host {
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Upload a file across storage hosts
    Put {
        file: PathBuf,
        #[arg(long)]
        asset_id: Option<String>,
        /// Host endpoints; defaults to the discovery directory, best first
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,
        /// Store whole copies instead of erasure shards
        #[arg(long)]
        replicas: Option<usize>,
        /// Pick (k, n) from the number of endpoints: fast, balanced or durable
        #[arg(long)]
        target: Option<PlacementTarget>,
    },
    /// Download and rebuild an asset
    Get {
        asset_id: String,
        #[arg(short, long)]
        out: PathBuf,
    },
    #[command(subcommand)]
    Quorum(QuorumCommand),
    #[command(subcommand)]
    Tx(TxCommand),
    /// Record a usage receipt for a job this node ran
    Receipt {
        #[arg(long)]
        job_id: String,
        #[arg(long = "type", default_value = "compute")]
        resource_type: String,
        #[arg(long)]
        units: f64,
    },
    /// Settle pending receipts into rewards
    Settle {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Finalize pooled transactions as their witness quorums close
    Finalizer {
        #[arg(long)]
        once: bool,
    },
    /// Serve gossip routes and pull peers on an interval
    Gossip {
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Pull every peer once and exit without serving
        #[arg(long)]
        once: bool,
    },
    #[command(subcommand)]
    Discover(DiscoverCommand),
}

#[derive(Subcommand, Debug)]
enum QuorumCommand {
    /// List records with their current weight
    Status {
        #[arg(long)]
        kind: Option<String>,
    },
    /// Acknowledge a record as `signer`
    Ack {
        id: String,
        #[arg(long, default_value = "upload")]
        kind: String,
        #[arg(long)]
        signer: String,
        /// Threshold used if the record does not exist yet
        #[arg(long, default_value_t = 1.0)]
        required: f64,
    },
    /// Show or patch the weighting policy
    Policy {
        /// Patch this kind's overrides instead of the global section
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        weight_default: Option<f64>,
        #[arg(long)]
        half_life: Option<f64>,
        #[arg(long)]
        max_age: Option<f64>,
        /// signer=weight, repeatable
        #[arg(long = "weight", value_parser = parse_weight)]
        weights: Vec<(String, f64)>,
    },
}

#[derive(Subcommand, Debug)]
enum TxCommand {
    /// Create a signed transaction from this node's account and pool it
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: f64,
        #[arg(long, default_value_t = 0.0)]
        fee: f64,
        /// Source account; `mint` issues new supply
        #[arg(long)]
        from: Option<String>,
        /// Push to the configured gossip peers for witnessing
        #[arg(long)]
        push: bool,
    },
    /// Add this node's witness signature to a pooled transaction
    Witness {
        id: String,
        #[arg(long)]
        push: bool,
    },
    Finalize {
        id: String,
        /// Required witnesses; defaults to the configured quorum
        #[arg(long)]
        m: Option<usize>,
    },
    List {
        /// Show the finalized log instead of the pool
        #[arg(long)]
        finalized: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DiscoverCommand {
    /// Record a host sighting in the endpoint directory
    Add {
        endpoint: String,
        #[arg(long)]
        node_id: String,
        #[arg(long, default_value = "udp")]
        via: String,
    },
    List,
}

fn parse_weight(s: &str) -> std::result::Result<(String, f64), String> {
    let (signer, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected signer=weight, got {}", s))?;
    let weight: f64 = weight.parse().map_err(|e| format!("{}: {}", weight, e))?;
    Ok((signer.to_string(), weight))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_node(cli: &Cli) -> Result<Node> {
    let mut config = NodeConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    let fallback = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "offgrid-node".to_string());
    Ok(Node::open(config, &fallback)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let node = open_node(&cli)?;
    log::debug!("node {} at {}", node.node_id(), node.layout.root().display());

    match &cli.command {
        Command::Host { bind } => run_host(&node, *bind).await,
        Command::Put {
            file,
            asset_id,
            endpoints,
            replicas,
            target,
        } => put(&node, file, asset_id.as_deref(), endpoints, *replicas, *target).await,
        Command::Get { asset_id, out } => get(&node, asset_id, out).await,
        Command::Quorum(cmd) => quorum(&node, cmd),
        Command::Tx(cmd) => tx(&node, cmd).await,
        Command::Receipt {
            job_id,
            resource_type,
            units,
        } => {
            let resource: ResourceType = resource_type.parse()?;
            let receipt = node.receipts().create_usage_receipt(
                &node.identity,
                node.node_id(),
                job_id,
                resource,
                *units,
                serde_json::json!({}),
            )?;
            print_json(&receipt)
        }
        Command::Settle { once } => {
            let settler = node.settler(node.http_transport()?)?;
            if *once {
                match settler.run_cycle().await? {
                    Some(report) => print_json(&report),
                    None => {
                        println!("nothing to settle");
                        Ok(())
                    }
                }
            } else {
                settler.run().await;
                Ok(())
            }
        }
        Command::Finalizer { once } => {
            let finalizer = node.finalizer();
            if *once {
                print_json(&finalizer.tick()?)
            } else {
                finalizer.run().await;
                Ok(())
            }
        }
        Command::Gossip { bind, once } => {
            let daemon = node.gossip_daemon()?;
            if *once {
                return print_json(&daemon.pull_all().await);
            }
            let bind = match bind {
                Some(addr) => *addr,
                None => node.config.gossip.bind.parse().context("gossip.bind")?,
            };
            daemon.run(bind).await?;
            Ok(())
        }
        Command::Discover(DiscoverCommand::Add { endpoint, node_id, via }) => {
            let via: TransportKind = via.parse().unwrap_or(TransportKind::Unknown);
            let entry = node.directory.merge_entry(endpoint, node_id, via, None)?;
            print_json(&entry)
        }
        Command::Discover(DiscoverCommand::List) => {
            print_json(&node.directory.ranked(chrono::Utc::now().timestamp())?)
        }
    }
}

async fn run_host(node: &Node, bind: Option<SocketAddr>) -> Result<()> {
    let bind = match bind {
        Some(addr) => addr,
        None => node.config.host.bind.parse().context("host.bind")?,
    };
    let state = Arc::new(node.host_state());
    let (addr, server) = warp::serve(host::routes(state))
        .try_bind_ephemeral(bind)
        .with_context(|| format!("binding {}", bind))?;
    log::info!("host {} serving shards on http://{}", node.node_id(), addr);

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => log::info!("shutting down"),
    }
    Ok(())
}

async fn put(
    node: &Node,
    file: &PathBuf,
    asset_id: Option<&str>,
    endpoints: &[String],
    replicas: Option<usize>,
    target: Option<PlacementTarget>,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let endpoints = if endpoints.is_empty() {
        node.directory.endpoints()?
    } else {
        endpoints.to_vec()
    };
    if endpoints.is_empty() {
        bail!("no endpoints: pass --endpoint or run `offgrid discover add`");
    }

    let transfer = &node.config.transfer;
    let mode = match (replicas, target) {
        (Some(copies), _) => StorageMode::Replication { copies },
        (None, Some(target)) => StorageMode::for_hosts(endpoints.len(), target, transfer.shard_size)?,
        (None, None) => StorageMode::Erasure(ErasureParams::new(transfer.k, transfer.n, transfer.shard_size)?),
    };

    let report = node
        .uploader(node.http_transport()?)
        .upload(&data, &mode, asset_id, &endpoints)
        .await?;
    log::info!("stored={}/{} durable={}", report.stored, report.total, report.durable);
    print_json(&report)?;
    if !report.is_complete() {
        bail!("upload incomplete; rerun the same command to resume");
    }
    Ok(())
}

async fn get(node: &Node, asset_id: &str, out: &PathBuf) -> Result<()> {
    let (data, report) = node.downloader(node.http_transport()?).download(asset_id).await?;
    std::fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;
    log::info!("{}: {} bytes -> {}", asset_id, data.len(), out.display());
    print_json(&report)
}

fn quorum(node: &Node, cmd: &QuorumCommand) -> Result<()> {
    match cmd {
        QuorumCommand::Status { kind } => {
            let kind = kind.as_deref().map(QuorumKind::from);
            print_json(&node.quorum.list_records(kind.as_ref())?)
        }
        QuorumCommand::Ack {
            id,
            kind,
            signer,
            required,
        } => {
            let kind = QuorumKind::from(kind.as_str());
            node.quorum.create_or_get(id, &kind, *required, serde_json::Value::Null)?;
            print_json(&node.quorum.add_ack(id, &kind, signer)?)
        }
        QuorumCommand::Policy {
            kind,
            weight_default,
            half_life,
            max_age,
            weights,
        } => {
            let weights: BTreeMap<String, f64> = weights.iter().cloned().collect();
            let policy = match kind {
                Some(kind) => node.quorum.policy().set_kind_policy(
                    &QuorumKind::from(kind.as_str()),
                    KindPolicy {
                        weight_default: *weight_default,
                        weights,
                        decay_half_life_s: *half_life,
                        max_age_s: *max_age,
                    },
                )?,
                None if weight_default.is_none() && half_life.is_none() && max_age.is_none() && weights.is_empty() => {
                    node.quorum.policy().load()?
                }
                None => node
                    .quorum
                    .policy()
                    .set_policy(*weight_default, *half_life, *max_age, &weights)?,
            };
            print_json(&policy)
        }
    }
}

async fn push_to_peers(node: &Node, tx: &Transaction) -> Result<()> {
    let gossip = &node.config.gossip;
    if gossip.peers.is_empty() {
        log::warn!("no gossip peers configured; transaction stays local");
        return Ok(());
    }
    let client = GossipClient::new(std::time::Duration::from_secs(gossip.timeout_secs.max(1)))?;
    for peer in &gossip.peers {
        match client.push_tx(peer, tx).await {
            Ok(result) => log::info!("pushed {} to {}: {:?}", tx.id, peer, result),
            Err(e) => log::warn!("push of {} to {} failed: {}", tx.id, peer, e),
        }
    }
    Ok(())
}

async fn tx(node: &Node, cmd: &TxCommand) -> Result<()> {
    match cmd {
        TxCommand::Send {
            to,
            amount,
            fee,
            from,
            push,
        } => {
            let src = match from {
                Some(account) => Account::named(account.as_str()),
                None => Account::named(node.node_id()),
            };
            let nonce = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let tx = Transaction::create_signed(
                &node.identity,
                src,
                Account::named(to.as_str()),
                *amount,
                *fee,
                nonce,
                serde_json::json!({"type": "transfer"}),
            )?;
            node.ledger.pool_add_or_update(tx.clone())?;
            if *push {
                push_to_peers(node, &tx).await?;
            }
            print_json(&tx)
        }
        TxCommand::Witness { id, push } => {
            let tx = node.ledger.witness(id, &node.identity)?;
            if *push {
                push_to_peers(node, &tx).await?;
            }
            println!("{}: {} witness(es)", tx.id, tx.valid_witness_count());
            Ok(())
        }
        TxCommand::Finalize { id, m } => {
            let m = m.unwrap_or(node.config.quorum.tx_quorum_m);
            let outcome = node.ledger.finalize(id, m)?;
            match &outcome {
                FinalizeOutcome::Finalized { id } => println!("finalized {}", id),
                FinalizeOutcome::AlreadyFinalized => println!("already finalized"),
                FinalizeOutcome::QuorumNotMet { .. } => {
                    return Err(anyhow!(
                        "not finalized: {}",
                        outcome.reason().unwrap_or_default()
                    ))
                }
            }
            Ok(())
        }
        TxCommand::List { finalized } => {
            let txs = if *finalized { node.ledger.log()? } else { node.ledger.pool()? };
            for tx in &txs {
                let ts = chrono::DateTime::from_timestamp_millis(tx.body.ts)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {} -> {}  {}  witnesses={}",
                    tx.id,
                    ts,
                    tx.body.src,
                    tx.body.dst,
                    tx.body.amount,
                    tx.witnesses.len()
                );
            }
            Ok(())
        }
    }
}
