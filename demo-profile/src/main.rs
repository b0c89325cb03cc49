//! Simple profiler that pushes advertisements through a nekoclient [Client].
//!
//! The compiled binary spawns `-i` in-memory [IndexerServer]s, then runs `-n` rounds of `-c`
//! concurrent announcements spread round-robin across them. Every request goes through the same
//! [Client], so the rounds exercise per-peer serialization and stream reuse. `--drop-every` makes
//! the indexers hang up periodically to show the client renegotiating.
mod indexer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use futures::future;
use tokio::sync::RwLock;
use tracing::info_span;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use nekoclient::memory::{MemoryHost, MemoryNetwork};
use nekoclient::{CancellationToken, Client, ClientConfig, Host};

use indexer::{Advertisement, IndexerRequest, IndexerResponse, IndexerServer, INGEST_PROTOCOL};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of indexers to announce to
    #[arg(short, long, default_value_t = 4)]
    indexers: usize,

    /// Number of concurrent announcements per round
    #[arg(short, long, default_value_t = 1)]
    concurrent: usize,

    /// Number of request rounds to run
    #[arg(short, long, default_value_t = 500)]
    num_requests: usize,

    /// TOML file with [ClientConfig] overrides
    #[arg(long)]
    config: Option<String>,

    /// Have indexers hang up after every this many requests on a stream
    #[arg(long)]
    drop_every: Option<usize>,
}

/// Sets-up [Args::indexers] indexers and a [Client], then runs [Args::num_requests] rounds of
/// [Args::concurrent] announcements each
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.indexers > 0, "need at least one indexer");

    let config = match &args.config {
        Some(path) => ClientConfig::from_toml_str(&tokio::fs::read_to_string(path).await?)?,
        None => ClientConfig::default(),
    };
    let drop_every = args.drop_every.filter(|n| *n > 0);

    println!("Welcome to the nekoclient profiler!");
    println!("Starting {0} indexers", args.indexers);

    let network = MemoryNetwork::new();
    let indexers: Vec<_> = (0..args.indexers)
        .map(|_| IndexerServer::spawn(&network, drop_every, config.max_message_size))
        .collect();

    let host = Arc::new(MemoryHost::new(&network));
    let span = info_span!("profiler", client = %host.id());
    let client = Client::new(host, INGEST_PROTOCOL, config)?.with_span(span);
    let cancel = CancellationToken::new();
    println!(
        "Client {0} ready, speaking {1:?} with a {2:?} read timeout",
        client.local_id(),
        client.protocols(),
        client.config().read_timeout
    );

    // For each round, announce once per concurrent slot
    println!("Starting runs!");
    let durations = Arc::new(RwLock::new(Vec::new()));
    let mut errors = 0;
    for i in 0..args.num_requests {
        let results = future::join_all((0..args.concurrent).map(|j| {
            let d = Arc::clone(&durations);
            let target = indexers[(i * args.concurrent + j) % indexers.len()].id();
            let ad = Advertisement {
                id: Uuid::new_v4(),
                provider: client.local_id(),
                context_id: format!("{}k.bin", j % 10 + 1),
                entries: vec![format!("bafy{i}-{j}")],
            };
            let client = &client;
            let cancel = &cancel;
            async move {
                let now = Instant::now();
                let ack = client
                    .send_request(cancel, &target, &IndexerRequest::Announce(ad), IndexerResponse::ack)
                    .await;
                let elapsed = now.elapsed();
                {
                    d.write().await.push(elapsed);
                }
                match ack {
                    Ok(_) => {
                        println!("Run {}: {:0.2?}", i, elapsed);
                        true
                    }
                    Err(e) => {
                        println!("Run {}: failed after {:0.2?}: {}", i, elapsed, e);
                        false
                    }
                }
            }
        }))
        .await;
        errors += results.into_iter().filter(|ok| !ok).count();
    }

    let durations = durations.read().await;
    if !durations.is_empty() {
        let average = durations
            .iter()
            .sum::<Duration>()
            .div_f64(durations.len() as f64);
        println!("Average time: {:0.2?}", average);
    }
    println!("Failed requests: {errors}");
    println!("Streams opened: {0}", network.streams_opened());

    // Check every indexer saw the client
    for indexer in indexers.iter() {
        let providers = client
            .send_request(
                &cancel,
                &indexer.id(),
                &IndexerRequest::Search("1k.bin".to_owned()),
                IndexerResponse::providers,
            )
            .await;
        match providers {
            Ok(p) => println!(
                "Indexer {0}: {1} contexts, 1k.bin provided by {2:?}",
                indexer.id(),
                indexer.contexts(),
                p
            ),
            Err(e) => println!("Indexer {0}: search failed: {e}", indexer.id()),
        }
    }

    Ok(())
}
