//! rangecache CLI
//!
//! Reads a byte range (or the tail) of a URL or local file through a block
//! cache and writes the bytes to stdout or a file.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         rangecache                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────┐  │
//! │  │   Backend   │───▶│ Block Cache  │───▶│     Origin      │  │
//! │  │ (range →    │    │ (LRU or      │    │ (HTTP ranges or │  │
//! │  │   blocks)   │    │  two-tier)   │    │   local file)   │  │
//! │  └─────────────┘    └──────────────┘    └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::Parser;
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rangecache::cache::{CacheMetrics, LruCacheConfig, MetricsSnapshot};
use rangecache::{
    BackendOptions, BlockAnchor, BlockCache, ByteRangeSource, CachedByteRangeBackend, Error,
    FileSource, FsBlobStore, HttpRangeSource, HttpSourceConfig, LruBlockCache,
    PersistentBlockCache, PersistentCacheConfig, Result, RetryPolicy, SourceIdentity,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Read byte ranges through a block cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL (http/https) or local file path
    input: String,

    /// First byte to read
    #[arg(long, default_value = "0")]
    offset: u64,

    /// Bytes to read; defaults to the rest of the source
    #[arg(long, conflicts_with = "tail")]
    size: Option<u64>,

    /// Read the trailing N bytes instead of a range
    #[arg(long)]
    tail: Option<u64>,

    /// Number of times to repeat the read
    #[arg(long, default_value = "1")]
    repeat: u32,

    /// Cache block size in bytes
    #[arg(long, env = "RANGECACHE_BLOCK_SIZE", default_value = "65536")]
    block_size: u64,

    /// Directory for the persistent cache; in-memory LRU when unset
    #[arg(long, env = "RANGECACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// LRU capacity in blocks
    #[arg(long, env = "RANGECACHE_MAX_BLOCKS", default_value = "1024")]
    max_blocks: usize,

    /// Persistent cache budget in bytes
    #[arg(long, env = "RANGECACHE_MAX_BYTES", default_value = "1073741824")]
    max_bytes: u64,

    /// Memory tier lifetime in milliseconds
    #[arg(long, env = "RANGECACHE_MEMORY_TTL_MS", default_value = "1000")]
    memory_ttl_ms: u64,

    /// Maximum concurrent origin fetches of the persistent cache
    #[arg(long, env = "RANGECACHE_MAX_FETCHES", default_value = "10")]
    max_fetches: usize,

    /// Maximum blocks requested in parallel per read
    #[arg(long)]
    parallel: Option<usize>,

    /// Retries per origin request
    #[arg(long, env = "RANGECACHE_RETRIES", default_value = "2")]
    retries: u32,

    /// Per-attempt timeout in milliseconds
    #[arg(long, env = "RANGECACHE_TIMEOUT_MS", default_value = "30000")]
    timeout_ms: u64,

    /// Skip If-Match / If-Unmodified-Since on range requests
    #[arg(long)]
    no_validate: bool,

    /// Write bytes to this file instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Print cache metrics in Prometheus text format to stderr
    #[arg(long)]
    print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let cache = CliCache::build(&args).await?;
    let (source, identity) = open_source(&args).await?;
    info!(input = %args.input, %identity, "source opened");

    let anchor = if args.tail.is_some() {
        BlockAnchor::End
    } else {
        BlockAnchor::Start
    };
    let backend = CachedByteRangeBackend::new(source, cache.shared(), identity, anchor)
        .with_options(BackendOptions {
            max_parallel_blocks: args.parallel,
        });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling read");
            ctrl_c.cancel();
        }
    });

    let mut data = Bytes::new();
    for round in 0..args.repeat.max(1) {
        let started = Instant::now();
        data = read_once(&args, &backend, &cancel).await?;
        info!(
            round,
            bytes = data.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "read complete"
        );
    }

    match &args.output {
        Some(path) => tokio::fs::write(path, &data).await?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }

    if let CliCache::Persistent(cache) = &cache {
        let stats = cache.stats().await?;
        info!(
            entries = stats.persistent_entries,
            bytes = stats.persistent_bytes,
            max_bytes = stats.max_bytes,
            "persistent cache"
        );
    }

    if args.print_metrics {
        eprint!("{}", render_metrics(&cache.metrics().snapshot())?);
    }

    backend.close().await
}

async fn read_once(
    args: &Args,
    backend: &CachedByteRangeBackend,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    if let Some(tail) = args.tail {
        let (data, len) = backend.get_bytes_from_end(tail).await?;
        info!(len, "source length");
        return Ok(data);
    }

    let len = backend.count().await?;
    let size = match args.size {
        Some(size) => size,
        None => len.checked_sub(args.offset).ok_or(Error::OutOfRange {
            offset: args.offset,
            size: 0,
            len,
        })?,
    };
    if size == 0 {
        return Ok(Bytes::new());
    }
    backend.get_bytes_cancellable(args.offset, size, cancel).await
}

// =============================================================================
// Origin & Cache Setup
// =============================================================================

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

async fn open_source(args: &Args) -> Result<(Arc<dyn ByteRangeSource>, SourceIdentity)> {
    if is_url(&args.input) {
        let mut config = HttpSourceConfig::new(&args.input);
        config.validate = !args.no_validate;
        config.timeout = Duration::from_millis(args.timeout_ms);
        config.retry = RetryPolicy {
            max_retries: args.retries,
            ..RetryPolicy::default()
        };

        let source = HttpRangeSource::new(config)?;
        let identity = source.identity().await?;
        return Ok((Arc::new(source), identity));
    }

    // Local files are versioned by modification time
    let path = tokio::fs::canonicalize(&args.input).await?;
    let modified: DateTime<Utc> = tokio::fs::metadata(&path).await?.modified()?.into();
    let location = path.to_string_lossy();
    let identity = SourceIdentity::new(&location, Some(&modified.to_rfc3339()), None);
    Ok((Arc::new(FileSource::new(&path)), identity))
}

enum CliCache {
    Lru(LruBlockCache),
    Persistent(PersistentBlockCache),
}

impl CliCache {
    async fn build(args: &Args) -> Result<Self> {
        let Some(dir) = &args.cache_dir else {
            let cache = LruBlockCache::with_config(LruCacheConfig {
                block_size: args.block_size,
                max_blocks: args.max_blocks,
                ..Default::default()
            })?;
            return Ok(Self::Lru(cache));
        };

        let store = FsBlobStore::open(dir).await?;
        let config = PersistentCacheConfig {
            block_size: args.block_size,
            memory_ttl: Duration::from_millis(args.memory_ttl_ms),
            max_bytes: args.max_bytes,
            max_concurrent_fetches: args.max_fetches,
            ..Default::default()
        };
        info!(dir = %store.root().display(), max_bytes = config.max_bytes, "persistent cache");
        Ok(Self::Persistent(PersistentBlockCache::with_config(
            Arc::new(store),
            config,
        )?))
    }

    fn shared(&self) -> Arc<dyn BlockCache> {
        match self {
            Self::Lru(cache) => Arc::new(cache.clone()),
            Self::Persistent(cache) => Arc::new(cache.clone()),
        }
    }

    fn metrics(&self) -> &CacheMetrics {
        match self {
            Self::Lru(cache) => cache.metrics(),
            Self::Persistent(cache) => cache.metrics(),
        }
    }
}

// =============================================================================
// Metrics
// =============================================================================

fn render_metrics(snapshot: &MetricsSnapshot) -> Result<String> {
    let registry = Registry::new();
    let counters = [
        ("memory_hits", "Blocks served from memory", snapshot.memory_hits),
        ("persistent_hits", "Blocks served from the persistent store", snapshot.persistent_hits),
        ("misses", "Blocks fetched from the origin", snapshot.misses),
        ("coalesced", "Lookups that joined an in-flight fetch", snapshot.coalesced),
        ("fetch_errors", "Failed origin fetches", snapshot.fetch_errors),
        ("evictions", "Blocks evicted", snapshot.evictions),
        ("evicted_bytes", "Bytes evicted", snapshot.evicted_bytes),
    ];

    for (name, help, value) in counters {
        let counter = IntCounter::new(format!("rangecache_cache_{}_total", name), help)
            .map_err(metrics_error)?;
        counter.inc_by(value);
        registry
            .register(Box::new(counter))
            .map_err(metrics_error)?;
    }

    let ratio = Gauge::new("rangecache_cache_hit_ratio", "Share of lookups served without an origin fetch")
        .map_err(metrics_error)?;
    ratio.set(snapshot.hit_ratio);
    registry.register(Box::new(ratio)).map_err(metrics_error)?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(metrics_error)?;
    String::from_utf8(buffer).map_err(|e| Error::Config(format!("metrics encoding: {}", e)))
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Config(format!("metrics registry: {}", e))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so they never mix with the payload on stdout
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
