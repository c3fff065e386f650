//! BlockIO Bench - drive the client and store data paths in one process
//!
//! Starts a loopback cluster of stores holding one replicated volume, opens
//! it with a client and runs a random read/write mix at a fixed queue depth.

use anyhow::{Context, Result, bail};
use blockio_client::{ClientContext, ClientVolume, IoOp, MetadataService, StaticMetadata};
use blockio_common::config::EngineKind;
use blockio_common::{Config, Error, SECTOR_SIZE};
use blockio_server::replica::Shard;
use blockio_server::{ServerVolume, StoreServer};
use blockio_transport::{LoopbackNetwork, Transport};
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VOLUME_ID: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "blockio-bench")]
#[command(about = "BlockIO in-process data path benchmark")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replicas per shard (stores in the cluster)
    #[arg(long, default_value = "3")]
    replicas: u8,

    /// Volume size in MiB
    #[arg(long, default_value = "256")]
    volume_mb: u64,

    /// Bytes per request, a multiple of 512
    #[arg(long, default_value = "4096")]
    io_size: usize,

    /// Total requests
    #[arg(long, default_value = "20000")]
    ops: usize,

    /// Requests kept in flight
    #[arg(long, default_value = "16")]
    queue_depth: usize,

    /// Percentage of reads in the mix
    #[arg(long, default_value = "30")]
    read_pct: u8,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    ops: usize,
    reads: usize,
    writes: usize,
    errors: usize,
    retries: u64,
    elapsed_ms: u128,
    iops: f64,
    mib_per_sec: f64,
    p50_us: u128,
    p99_us: u128,
    max_us: u128,
}

#[derive(Default)]
struct WorkerResult {
    latencies: Vec<Duration>,
    reads: usize,
    errors: usize,
    retries: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.replicas == 0 || usize::from(args.replicas) > blockio_common::MAX_SUBTASK_CNT {
        bail!(
            "--replicas must be in 1..={}",
            blockio_common::MAX_SUBTASK_CNT
        );
    }
    if args.io_size == 0 || args.io_size % SECTOR_SIZE as usize != 0 {
        bail!("--io-size must be a non-zero multiple of {SECTOR_SIZE}");
    }

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let volume_size = args.volume_mb << 20;
    let net = LoopbackNetwork::new();
    let stores = start_cluster(&config, &net, args.replicas, volume_size)?;

    let meta = Arc::new(StaticMetadata::new());
    meta.insert(StaticMetadata::simple_volume(
        "bench",
        VOLUME_ID,
        volume_size,
        &["store0"],
    ));
    let ctx = ClientContext::new(
        &config,
        meta as Arc<dyn MetadataService>,
        Arc::clone(&net) as Arc<dyn Transport>,
    );
    let volume = Arc::new(ClientVolume::open("bench", None, &ctx)?);
    info!(
        "Opened volume bench ({} MiB, {} replicas)",
        args.volume_mb, args.replicas
    );

    let report = run(&args, &volume, volume_size).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&args, &report);
    }

    drop(volume);
    drop(stores);
    Ok(())
}

/// Store `store0` is primary and forwards to the others
fn start_cluster(
    config: &Config,
    net: &Arc<LoopbackNetwork>,
    replicas: u8,
    volume_size: u64,
) -> Result<Vec<StoreServer>> {
    let mut stores = Vec::with_capacity(usize::from(replicas));
    for i in 0..replicas {
        let name = format!("store{i}");
        let mut store_config = config.clone();
        store_config.server.engine_capacity = store_config.server.engine_capacity.max(volume_size);
        if store_config.server.engine == EngineKind::File {
            // engine_path names a directory holding one image per store
            let dir = config
                .server
                .engine_path
                .clone()
                .context("server.engine_path is required for the file engine")?;
            store_config.server.engine_path = Some(dir.join(format!("{name}.img")));
        }
        let store = StoreServer::start(&name, &store_config, Arc::clone(net) as Arc<dyn Transport>)?;
        store.listen_on(net, &name);
        stores.push(store);
    }

    let primary = ServerVolume {
        volume_id: VOLUME_ID,
        size: volume_size,
        meta_ver: 0,
        shards: (0..shard_count(volume_size))
            .map(|index| Shard {
                index,
                replicas: (0..replicas)
                    .map(|r| {
                        if r == 0 {
                            stores[0].local_replica(0, shard_base(index))
                        } else {
                            stores[0].remote_replica(r, &format!("store{r}"))
                        }
                    })
                    .collect(),
            })
            .collect(),
    };
    stores[0].register_volume(&primary)?;
    for (i, store) in stores.iter().enumerate().skip(1) {
        let rep_index = u8::try_from(i)?;
        let peer = ServerVolume {
            shards: primary
                .shards
                .iter()
                .map(|s| Shard {
                    index: s.index,
                    replicas: vec![store.local_replica(rep_index, shard_base(s.index))],
                })
                .collect(),
            ..primary.clone()
        };
        store.register_volume(&peer)?;
    }
    Ok(stores)
}

fn shard_count(volume_size: u64) -> usize {
    usize::try_from(volume_size.div_ceil(1 << blockio_common::SHARD_SIZE_ORDER))
        .unwrap_or(1)
        .max(1)
}

/// Shards are laid out back to back on each engine
const fn shard_base(index: usize) -> u64 {
    (index as u64) << blockio_common::SHARD_SIZE_ORDER
}

async fn run(args: &Args, volume: &Arc<ClientVolume>, volume_size: u64) -> Result<Report> {
    let depth = args.queue_depth.max(1);
    let per_task = args.ops.div_ceil(depth);
    let payload: Arc<[u8]> = (0..args.io_size).map(|i| (i % 251) as u8).collect();
    let slots = (volume_size / args.io_size as u64).max(1);

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(depth);
    for _ in 0..depth {
        let volume = Arc::clone(volume);
        let payload = Arc::clone(&payload);
        let read_pct = args.read_pct;
        let io_size = args.io_size;
        tasks.push(tokio::spawn(async move {
            let mut result = WorkerResult::default();
            for _ in 0..per_task {
                let (offset, is_read) = {
                    let mut rng = rand::thread_rng();
                    (
                        rng.gen_range(0..slots) * io_size as u64,
                        rng.gen_range(0..100) < read_pct,
                    )
                };
                let op = if is_read {
                    IoOp::Read(io_size)
                } else {
                    IoOp::Write(&payload)
                };
                let begin = Instant::now();
                match submit_one(&volume, offset, op, &mut result.retries).await {
                    Ok(()) => result.latencies.push(begin.elapsed()),
                    Err(e) => {
                        warn!("I/O at {} failed: {}", offset, e);
                        result.errors += 1;
                    }
                }
                if is_read {
                    result.reads += 1;
                }
            }
            result
        }));
    }

    let mut latencies = Vec::with_capacity(args.ops);
    let mut report = Report::default();
    for task in tasks {
        let result = task.await?;
        latencies.extend(result.latencies);
        report.reads += result.reads;
        report.errors += result.errors;
        report.retries += result.retries;
    }
    let elapsed = started.elapsed();

    latencies.sort_unstable();
    report.ops = latencies.len() + report.errors;
    report.writes = report.ops - report.reads;
    report.elapsed_ms = elapsed.as_millis();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    report.iops = latencies.len() as f64 / secs;
    report.mib_per_sec = report.iops * args.io_size as f64 / f64::from(1u32 << 20);
    report.p50_us = percentile(&latencies, 50).as_micros();
    report.p99_us = percentile(&latencies, 99).as_micros();
    report.max_us = latencies.last().copied().unwrap_or_default().as_micros();
    Ok(report)
}

/// Submit one request and wait for its completion, retrying on TryAgain
async fn submit_one(
    volume: &ClientVolume,
    offset: u64,
    op: IoOp<'_>,
    retries: &mut u64,
) -> blockio_common::Result<()> {
    loop {
        let (tx, rx) = tokio::sync::oneshot::channel();
        match volume.submit(offset, op, move |res| {
            let _ = tx.send(res);
        }) {
            Ok(()) => {
                return rx
                    .await
                    .map_err(|_| Error::internal("completion dropped"))?
                    .map(|_| ());
            }
            Err(e) if e.is_retryable() => {
                *retries += 1;
                tokio::time::sleep(Duration::from_micros(50)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (sorted.len() * pct).div_ceil(100).clamp(1, sorted.len());
    sorted[rank - 1]
}

fn print_report(args: &Args, report: &Report) {
    println!(
        "{} ops ({} reads, {} writes) of {} bytes at depth {}",
        report.ops, report.reads, report.writes, args.io_size, args.queue_depth
    );
    println!(
        "  {:.0} IOPS, {:.1} MiB/s in {} ms",
        report.iops, report.mib_per_sec, report.elapsed_ms
    );
    println!(
        "  latency p50 {} us, p99 {} us, max {} us",
        report.p50_us, report.p99_us, report.max_us
    );
    if report.errors > 0 || report.retries > 0 {
        println!("  {} errors, {} retries", report.errors, report.retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_micros).collect();
        assert_eq!(percentile(&sorted, 50), Duration::from_micros(50));
        assert_eq!(percentile(&sorted, 99), Duration::from_micros(99));
        assert_eq!(percentile(&[], 99), Duration::ZERO);
    }

    #[test]
    fn test_shard_layout() {
        assert_eq!(shard_count(1 << 20), 1);
        assert_eq!(shard_count((1 << 36) + 1), 2);
        assert_eq!(shard_base(1), 1 << 36);
    }
}
