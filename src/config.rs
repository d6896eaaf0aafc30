use crate::{
    models::digest::DigestAlgorithm,
    services::{
        blob_store::{BlobStoreOptions, RangeEndPolicy},
        ingest::IngestLimits,
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_upload_bytes: u64,
    pub max_thumbnail_bytes: u64,
    pub idle_timeout_secs: u64,
    pub chunk_size: usize,
    pub digest_algorithm: DigestAlgorithm,
    pub write_retries: u32,
    pub range_end_policy: RangeEndPolicy,
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Sweep,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-addressed media store with byte-range streaming")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides MEDIA_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest accepted primary payload in bytes
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Largest accepted thumbnail in bytes
    #[arg(long)]
    pub max_thumbnail_bytes: Option<u64>,

    /// Seconds an upload may stall before it is aborted
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Read chunk size for streamed responses
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Digest algorithm for new blobs: sha256 or md5
    #[arg(long)]
    pub digest: Option<DigestAlgorithm>,

    /// Attempts for the final blob rename
    #[arg(long)]
    pub write_retries: Option<u32>,

    /// Range end past the object size: clamp or reject
    #[arg(long)]
    pub range_end: Option<RangeEndPolicy>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Collect unreferenced blobs and stale staging files, then exit
    #[arg(long, conflicts_with = "migrate")]
    pub sweep: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();
        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep {
            RunMode::Sweep
        } else {
            RunMode::Serve
        };
        Ok((Self::merge(args, |key| env::var(key))?, mode))
    }

    /// Merge CLI args over environment values over defaults.
    pub fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let string = |key: &str, default: &str| -> Result<String> {
            match lookup(key) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.into()),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => string("MEDIA_STORE_HOST", "0.0.0.0")?,
            },
            port: pick(args.port, &lookup, "MEDIA_STORE_PORT", 3000)?,
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => string("MEDIA_STORE_STORAGE_DIR", "./data/blobs")?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => string(
                    "MEDIA_STORE_DATABASE_URL",
                    "sqlite://./data/meta/media_store.db",
                )?,
            },
            max_upload_bytes: pick(
                args.max_upload_bytes,
                &lookup,
                "MEDIA_STORE_MAX_UPLOAD_BYTES",
                2 * 1024 * 1024 * 1024,
            )?,
            max_thumbnail_bytes: pick(
                args.max_thumbnail_bytes,
                &lookup,
                "MEDIA_STORE_MAX_THUMBNAIL_BYTES",
                10 * 1024 * 1024,
            )?,
            idle_timeout_secs: pick(
                args.idle_timeout_secs,
                &lookup,
                "MEDIA_STORE_IDLE_TIMEOUT_SECS",
                30,
            )?,
            chunk_size: pick(args.chunk_size, &lookup, "MEDIA_STORE_CHUNK_SIZE", 64 * 1024)?,
            digest_algorithm: pick(
                args.digest,
                &lookup,
                "MEDIA_STORE_DIGEST",
                DigestAlgorithm::Sha256,
            )?,
            write_retries: pick(args.write_retries, &lookup, "MEDIA_STORE_WRITE_RETRIES", 3)?,
            range_end_policy: pick(
                args.range_end,
                &lookup,
                "MEDIA_STORE_RANGE_END",
                RangeEndPolicy::Clamp,
            )?,
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        if cfg.idle_timeout_secs == 0 {
            anyhow::bail!("idle timeout must be greater than zero");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn blob_store_options(&self) -> BlobStoreOptions {
        BlobStoreOptions {
            algorithm: self.digest_algorithm,
            chunk_size: self.chunk_size,
            write_retries: self.write_retries,
            end_policy: self.range_end_policy,
        }
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_upload_bytes: self.max_upload_bytes,
            max_thumbnail_bytes: self.max_thumbnail_bytes,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Request body ceiling for the multipart upload route: both payload
    /// limits plus room for the form fields.
    pub fn body_limit(&self) -> usize {
        let total = self
            .max_upload_bytes
            .saturating_add(self.max_thumbnail_bytes)
            .saturating_add(1024 * 1024);
        usize::try_from(total).unwrap_or(usize::MAX)
    }
}

/// CLI value if given, else the parsed env value, else `default`.
fn pick<T, F>(cli: Option<T>, lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", key, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
