//! Groundwork CLI
//!
//! - `demo`: ingest synthetic compaction passes into an in-process cluster
//!   and run every summary query over them
//! - `division`: print the division a tile belongs to
//! - `config`: print the default configuration file

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use groundwork::affinity::{ClusterNode, SpatialAffinity};
use groundwork::buffers::ClientLeafFactory;
use groundwork::cluster::{Cluster, ComputeNode};
use groundwork::config::{generate_default_config, Config, LoggingConfig, TierKind};
use groundwork::pipeline::{QueryFilter, QueryKind, QueryRequest, QueryService};
use groundwork::storage::{
    CellCoord, FileTier, Pass, PassEvents, SegmentStore, TileAddress, VibrationState,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "groundwork")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Spatially indexed compaction measurement store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest synthetic passes and run each summary query
    Demo {
        /// Tiles per side of the synthetic site
        #[arg(long, default_value = "4")]
        tiles: u32,
        /// Passes per cell
        #[arg(long, default_value = "5")]
        passes: u32,
    },

    /// Print the division of a tile
    Division {
        x: u32,
        y: u32,
        /// Partition count (default: from config)
        #[arg(short, long)]
        partitions: Option<u32>,
    },

    /// Print the default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Demo { tiles, passes } => run_demo(&config, tiles, passes).await?,
        Commands::Division { x, y, partitions } => {
            let partitions = partitions.unwrap_or(config.cluster.partition_count);
            let affinity = SpatialAffinity::new(partitions)?;
            println!("{}", affinity.division_of(TileAddress::new(x, y)));
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{content}"),
            }
        }
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("groundwork={}", logging.level)));
    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer.pretty()).init();
    }
    Ok(())
}

fn build_cluster(config: &Config) -> anyhow::Result<Cluster> {
    let cluster_config = config.cluster_config()?;
    if config.storage.tier == TierKind::Memory {
        return Ok(Cluster::new(cluster_config)?);
    }

    let root = config.storage.data_path();
    let affinity = SpatialAffinity::for_role(cluster_config.partition_count, cluster_config.role)?;
    let cells_per_tile = cluster_config.store.geometry.cells_per_tile();
    let mut nodes = Vec::new();
    for replica in 0..cluster_config.replicas {
        for division in 0..cluster_config.partition_count {
            let dir = root.join(format!("division-{division:04}-{replica}"));
            let tier = FileTier::open(&dir, config.storage.compress_blobs)
                .with_context(|| format!("opening {}", dir.display()))?;
            let store = SegmentStore::open(cluster_config.store.clone(), Arc::new(tier))?;
            nodes.push(ComputeNode::new(
                ClusterNode::new(cluster_config.role).with_division(division),
                store,
                Arc::new(ClientLeafFactory::with_defaults(
                    cells_per_tile,
                    cluster_config.max_pooled_leaves_per_type,
                )),
                cluster_config.worker_threads,
            ));
        }
    }
    Ok(Cluster::from_nodes(affinity, nodes))
}

async fn run_demo(config: &Config, tiles: u32, passes: u32) -> anyhow::Result<()> {
    let cluster = Arc::new(build_cluster(config)?);
    let dimension = cluster.geometry().dimension();
    let start = Utc::now().timestamp_millis();

    let mut appended = 0u64;
    for x in 0..tiles {
        for y in 0..tiles {
            let tile = TileAddress::new(x, y);
            for cx in 0..dimension {
                for cy in 0..dimension {
                    for pass in 0..passes {
                        cluster.append(tile, CellCoord::new(cx, cy), synthetic_pass(start, x, cx, cy, pass))?;
                        appended += 1;
                    }
                }
            }
        }
    }
    tracing::info!(appended, tiles = tiles * tiles, "Synthetic site ingested");

    let service = QueryService::with_cell_size(Arc::clone(&cluster), config.query.cell_size);
    let kinds = [
        QueryKind::PassCountSummary { target_override: None },
        QueryKind::CmvSummary {
            target_override: None,
            min_percent: 80,
            max_percent: 130,
        },
        QueryKind::TemperatureSummary {
            min_temperature: 1_000,
            max_temperature: 1_500,
        },
        QueryKind::ElevationStatistics,
        QueryKind::CutFill {
            reference_elevation: 100.0,
            band_edges: vec![-0.1, -0.05, 0.05, 0.1],
        },
    ];
    for kind in kinds {
        let handle = service.submit(QueryRequest::new(QueryFilter::default(), kind))?;
        let response = service.await_result(handle).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    if config.storage.tier == TierKind::File {
        let flushed = cluster.flush()?;
        tracing::info!(
            segments = flushed.segments_written,
            bytes = flushed.bytes_written,
            "Flushed demo site"
        );
    }
    Ok(())
}

/// A roller working strips along x, lifting the surface a little per pass
fn synthetic_pass(start: i64, tile_x: u32, cx: u16, cy: u16, pass: u32) -> Pass {
    let time = start + (pass as i64 * 60_000) + (tile_x as i64 * 1_000) + cx as i64 * 10 + cy as i64;
    let height = 99.9 + pass as f32 * 0.03 + (cx % 4) as f32 * 0.01;
    let events = PassEvents {
        vibration: VibrationState::On,
        target_cmv: 400,
        target_pass_count: 4,
        ..PassEvents::default()
    };
    Pass::new(time, height)
        .machine((tile_x % 3) as u16)
        .cmv(250 + (pass as i16 * 40) + (cy % 8) as i16)
        .temperature(1_100 + (pass as u16 * 60))
        .events(events)
}
