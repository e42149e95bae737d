//! Kumora cache server entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kumora_artifact::ArtifactCache;
use kumora_core::config::{EngineConfig, FsyncMode, TierConfig};
use kumora_core::metrics::Metrics;
use kumora_engine::{policy_by_name, Engine};
use kumora_server::{serve, Dispatcher, ServerLimits};

#[derive(Parser)]
#[command(name = "kumora-server")]
#[command(about = "Latency-critical cache sidecar for AI inference pipelines")]
struct Args {
    #[arg(long, default_value_t = 6379)]
    port: u16,

    /// RAM ceiling in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    memory: usize,

    /// Eviction policy: lru, lfu or pomai_cost.
    #[arg(long, default_value = "pomai_cost")]
    policy: String,

    /// Policy parameter file, loaded best-effort at startup.
    #[arg(long, default_value = "config/policy_params.json")]
    params: PathBuf,

    #[arg(long = "data-dir", default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long = "ssd-enabled", default_value_t = false)]
    ssd_enabled: bool,

    #[arg(long = "ssd-value-min-bytes", default_value_t = 32 * 1024)]
    ssd_value_min_bytes: usize,

    #[arg(long = "ssd-max-bytes", default_value_t = 2 * 1024 * 1024 * 1024)]
    ssd_max_bytes: usize,

    #[arg(long = "promotion-hits", default_value_t = 3)]
    promotion_hits: u64,

    #[arg(long = "demotion-pressure", default_value_t = 0.90)]
    demotion_pressure: f64,

    #[arg(long = "ssd-read-mb-s", default_value_t = 256)]
    ssd_read_mb_s: usize,

    #[arg(long = "ssd-write-mb-s", default_value_t = 256)]
    ssd_write_mb_s: usize,

    /// Fsync mode: never, everysec or always.
    #[arg(long, default_value = "never")]
    fsync: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let fsync: FsyncMode = args.fsync.parse().context("invalid --fsync mode")?;

    let cfg = EngineConfig {
        memory_limit_bytes: args.memory,
        data_dir: args.data_dir.clone(),
        fsync,
        tier: TierConfig {
            ssd_enabled: args.ssd_enabled,
            ssd_value_min_bytes: args.ssd_value_min_bytes,
            ssd_max_bytes: args.ssd_max_bytes,
            ram_max_bytes: args.memory,
            promotion_hits: args.promotion_hits,
            demotion_pressure: args.demotion_pressure,
            ssd_max_read_mb_s: args.ssd_read_mb_s,
            ssd_max_write_mb_s: args.ssd_write_mb_s,
            ..TierConfig::default()
        },
        ..EngineConfig::default()
    };

    let mut engine =
        Engine::new(cfg, policy_by_name(&args.policy)).context("engine startup failed")?;
    if let Err(e) = engine.reload_params(&args.params) {
        warn!(path = %args.params.display(), error = %e, "initial params load skipped");
    }

    let metrics = Metrics::new();
    let dispatcher = Dispatcher::new(engine, ArtifactCache::new(), metrics.clone());

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .context("bind/listen failed")?;
    info!(port = args.port, policy = %args.policy, ssd = args.ssd_enabled, "kumora listening");

    serve(listener, dispatcher, metrics, ServerLimits::default()).await?;
    info!("clean shutdown");
    Ok(())
}
