//! Tessera -- multipart upload client for S3-compatible storage backends.
//!
//! Every startup is a recovery: the upload registry lives in memory, so a
//! restart forgets open uploads and the stale upload cleanup is the only
//! background task.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera::config::{Config, LoggingConfig};
use tessera::multipart::{CompletePart, MultipartEngine, UploadRegistry};

/// Command-line arguments for Tessera.
#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Multipart upload engine for S3-compatible object storage"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override `logging.level` from the configuration.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a bucket on the configured backend.
    MakeBucket {
        bucket: String,
    },
    /// Upload a file as a multipart object.
    Upload {
        #[arg(long)]
        bucket: String,

        #[arg(long)]
        key: String,

        #[arg(long)]
        file: String,

        /// Part size in bytes.
        #[arg(long, default_value_t = 8 * 1024 * 1024)]
        part_size: u64,

        /// Maximum parts in flight.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Create the bucket first if it does not exist.
        #[arg(long)]
        create_bucket: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => tessera::config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    if config.observability.metrics {
        tessera::metrics::init_metrics(&config.observability.metrics_listen)?;
        info!(
            "Prometheus metrics exporter listening on {}",
            config.observability.metrics_listen
        );
    }

    let backend = tessera::storage::build_backend(&config)?;
    let engine = Arc::new(MultipartEngine::new(UploadRegistry::new(), backend));

    let cleanup = config.multipart.stale_upload_max_age().map(|max_age| {
        let interval = config.multipart.cleanup_interval();
        Arc::clone(&engine).spawn_stale_upload_cleanup(interval, max_age)
    });

    let result = match cli.command {
        Command::MakeBucket { bucket } => make_bucket(&engine, &bucket).await,
        Command::Upload {
            bucket,
            key,
            file,
            part_size,
            concurrency,
            create_bucket,
        } => {
            if create_bucket {
                make_bucket(&engine, &bucket).await?;
            }
            upload(&engine, &bucket, &key, &file, part_size, concurrency).await
        }
    };

    if let Some(handle) = cleanup {
        handle.abort();
    }
    result
}

async fn make_bucket(engine: &MultipartEngine, bucket: &str) -> anyhow::Result<()> {
    tessera::naming::validate_bucket_name(bucket)?;
    if engine.backend().bucket_exists(bucket).await? {
        info!("Bucket {} already exists", bucket);
        return Ok(());
    }
    engine.backend().make_bucket(bucket).await?;
    info!("Bucket {} created", bucket);
    Ok(())
}

async fn upload(
    engine: &Arc<MultipartEngine>,
    bucket: &str,
    key: &str,
    path: &str,
    part_size: u64,
    concurrency: usize,
) -> anyhow::Result<()> {
    anyhow::ensure!(part_size > 0, "--part-size must be positive");
    let file_size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {path}"))?
        .len();

    let mut metadata = HashMap::new();
    metadata.insert("source-file".to_string(), path.to_string());
    let upload_id = engine.new_multipart_upload(bucket, key, metadata).await?;

    match upload_parts(engine, bucket, key, &upload_id, path, file_size, part_size, concurrency)
        .await
    {
        Ok(parts) => {
            let info = engine
                .complete_multipart_upload(bucket, key, &upload_id, &parts)
                .await;
            match info {
                Ok(info) => {
                    println!("{}", info.etag);
                    Ok(())
                }
                Err(e) => {
                    abort_quietly(engine, bucket, key, &upload_id).await;
                    Err(e.into())
                }
            }
        }
        Err(e) => {
            abort_quietly(engine, bucket, key, &upload_id).await;
            Err(e)
        }
    }
}

async fn abort_quietly(engine: &MultipartEngine, bucket: &str, key: &str, upload_id: &str) {
    if let Err(e) = engine.abort_multipart_upload(bucket, key, upload_id).await {
        warn!(upload_id, "failed to abort upload after error: {e}");
    }
}

/// Stream `path` to the upload in `part_size` chunks, at most `concurrency`
/// at a time. Returns the completion list in part order.
#[allow(clippy::too_many_arguments)]
async fn upload_parts(
    engine: &Arc<MultipartEngine>,
    bucket: &str,
    key: &str,
    upload_id: &str,
    path: &str,
    file_size: u64,
    part_size: u64,
    concurrency: usize,
) -> anyhow::Result<Vec<CompletePart>> {
    let part_count = file_size.div_ceil(part_size).max(1);
    anyhow::ensure!(
        part_count <= u64::from(tessera::multipart::MAX_PART_NUMBER),
        "{path} needs {part_count} parts; raise --part-size"
    );

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for index in 0..part_count {
        let permit = Arc::clone(&permits).acquire_owned().await?;
        let engine = Arc::clone(engine);
        let (bucket, key, upload_id, path) = (
            bucket.to_string(),
            key.to_string(),
            upload_id.to_string(),
            path.to_string(),
        );
        tasks.spawn(async move {
            let _permit = permit;
            let offset = index * part_size;
            let size = part_size.min(file_size - offset);
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut reader = file.take(size);
            let part_number = index as u32 + 1;
            let info = engine
                .put_object_part(&bucket, &key, &upload_id, part_number, size, &mut reader, "")
                .await?;
            anyhow::Ok(CompletePart::new(info.part_number, info.etag))
        });
    }

    let mut parts = Vec::with_capacity(part_count as usize);
    while let Some(joined) = tasks.join_next().await {
        parts.push(joined??);
    }
    parts.sort_by_key(|p| p.part_number);
    Ok(parts)
}
