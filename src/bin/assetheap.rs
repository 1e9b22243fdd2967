//! assetheap replay tool
//!
//! Replays a sequence of lock/unlock requests against a directory of assets
//! and reports heap and cache statistics.

use anyhow::{Context, Result};
use assetheap::{CacheBuilder, CacheConfig, CacheKey, DirSource, EntryHandle};
use clap::Parser;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "assetheap")]
#[command(about = "Replay asset requests through a size-bounded cache")]
struct Args {
    /// Directory holding `<key>.<ext>` asset files
    #[arg(short = 'd', long)]
    dir: PathBuf,

    /// Asset file extension
    #[arg(short = 'e', long, default_value = "frm")]
    ext: String,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Cache size in bytes (overrides the config file)
    #[arg(short = 'm', long)]
    max_size: Option<usize>,

    /// Number of most recent pins to keep while replaying
    #[arg(long, default_value = "0")]
    hold: usize,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Keys to request, in order
    #[arg(required = true)]
    keys: Vec<CacheKey>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => CacheConfig::default(),
    };
    if let Some(max_size) = args.max_size {
        config.max_size = max_size;
    }

    info!("Assets directory: {:?}", args.dir);
    info!("Cache size: {} bytes", config.max_size);

    let mut cache = CacheBuilder::with_config(config)
        .build(DirSource::new(&args.dir, &args.ext))
        .context("Failed to create cache")?;

    let mut held: VecDeque<EntryHandle> = VecDeque::with_capacity(args.hold + 1);
    let mut failures = 0usize;

    for &key in &args.keys {
        let handle = match cache.lock(key) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Request for {} failed: {}", key, e);
                failures += 1;
                continue;
            }
        };

        info!("Locked {} ({} bytes)", key, cache.data(handle)?.len());

        held.push_back(handle);
        while held.len() > args.hold {
            if let Some(handle) = held.pop_front() {
                cache.unlock(handle)?;
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&cache.stats())?);
    } else {
        let stats = cache.stats();
        println!("{}", cache.heap().print_stats());
        print!("{}", cache.print_stats());
        println!(
            "Entries: {} ({} pinned), {} / {} bytes, hit rate {:.1}%",
            stats.entries,
            stats.referenced_entries,
            stats.total_size,
            stats.max_size,
            stats.hit_rate()
        );
    }

    cache
        .heap()
        .validate()
        .context("Heap failed validation after replay")?;

    if failures > 0 {
        anyhow::bail!("{} of {} requests failed", failures, args.keys.len());
    }

    Ok(())
}
