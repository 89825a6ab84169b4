use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::{net::SocketAddr, path::PathBuf};
use tagsmith_core::{
    DEFAULT_BARCODE_BUCKET, DEFAULT_MAX_QUANTITY, DEFAULT_QR_BUCKET, DEFAULT_QUALITY, IdScheme,
    PipelineSettings, PoolSettings, RetryPolicy, Symbology,
};

/// Runtime configuration for the `tagsmith-server` binary.
///
/// Every option can be given on the command line or through the environment
/// (a `.env` file is loaded first). Storage credentials have no defaults.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tagsmith-server",
    version,
    about = "Generates barcode and QR artifacts, publishes them and records them in Postgres"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:5001"))]
    pub server_addr: String,

    /// Root URL of the Supabase project, e.g. `https://abc.supabase.co`.
    ///
    /// Environment variable: `SUPABASE_URL`
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: String,

    /// Service key used for storage uploads.
    ///
    /// Environment variable: `SUPABASE_KEY`
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    pub supabase_key: String,

    /// Bucket for barcode artifacts.
    ///
    /// Environment variable: `BARCODE_BUCKET`
    #[arg(long, env = "BARCODE_BUCKET", default_value_t = String::from(DEFAULT_BARCODE_BUCKET))]
    pub barcode_bucket: String,

    /// Bucket for QR artifacts.
    ///
    /// Environment variable: `QR_BUCKET`
    #[arg(long, env = "QR_BUCKET", default_value_t = String::from(DEFAULT_QR_BUCKET))]
    pub qr_bucket: String,

    /// Environment variable: `DB_HOST`
    #[arg(long, env = "DB_HOST", default_value_t = String::from("localhost"))]
    pub db_host: String,

    /// Environment variable: `DB_PORT`
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Environment variable: `DB_USER`
    #[arg(long, env = "DB_USER", default_value_t = String::from("postgres"))]
    pub db_user: String,

    /// Environment variable: `DB_PASSWORD`
    #[arg(long, env = "DB_PASSWORD", default_value_t = String::new(), hide_env_values = true)]
    pub db_password: String,

    /// Environment variable: `DB_NAME`
    #[arg(long, env = "DB_NAME", default_value_t = String::from("postgres"))]
    pub db_name: String,

    /// Upper bound on open database connections.
    ///
    /// Requests beyond this wait up to `DB_ACQUIRE_TIMEOUT_MS` for a
    /// connection and then fail with a pool-exhausted error.
    ///
    /// Environment variable: `DB_POOL_SIZE`
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 10)]
    pub db_pool_size: u32,

    /// Environment variable: `DB_ACQUIRE_TIMEOUT_MS`
    #[arg(long, env = "DB_ACQUIRE_TIMEOUT_MS", default_value_t = 5000)]
    pub db_acquire_timeout_ms: u64,

    /// Directory for intermediate PNG and JPEG files. Defaults to the system
    /// temp directory.
    ///
    /// Environment variable: `SCRATCH_DIR`
    #[arg(long, env = "SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Linear symbology for barcodes: `code128` or `ean13`.
    ///
    /// EAN-13 only encodes digits and requires `ID_SCHEME=numeric`.
    ///
    /// Environment variable: `SYMBOLOGY`
    #[arg(long, env = "SYMBOLOGY", default_value_t = Symbology::Code128)]
    pub symbology: Symbology,

    /// Identifier scheme: `ulid`, `numeric`, `seed-millis` or `digest-millis`.
    ///
    /// Environment variable: `ID_SCHEME`
    #[arg(long, env = "ID_SCHEME", default_value_t = IdScheme::Ulid)]
    pub id_scheme: IdScheme,

    /// JPEG quality for uploaded artifacts (1-100).
    ///
    /// Environment variable: `JPEG_QUALITY`
    #[arg(long, env = "JPEG_QUALITY", default_value_t = DEFAULT_QUALITY)]
    pub jpeg_quality: u8,

    /// Largest `quantity` accepted by the bulk endpoints.
    ///
    /// Environment variable: `MAX_QUANTITY`
    #[arg(long, env = "MAX_QUANTITY", default_value_t = DEFAULT_MAX_QUANTITY)]
    pub max_quantity: u32,

    /// Attempts per publish or persist call, first attempt included.
    ///
    /// Environment variable: `RETRY_ATTEMPTS`
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Environment variable: `RETRY_BACKOFF_MS`
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 200)]
    pub retry_backoff_ms: u64,

    /// Per-attempt timeout for uploads and database calls.
    ///
    /// Environment variable: `STAGE_TIMEOUT_SECS`
    #[arg(long, env = "STAGE_TIMEOUT_SECS", default_value_t = 30)]
    pub stage_timeout_secs: u64,

    /// Delete an uploaded object when its database record can't be written.
    ///
    /// Environment variable: `REMOVE_ORPHANS`
    #[arg(long, env = "REMOVE_ORPHANS", default_value_t = false)]
    pub remove_orphans: bool,

    /// Keep intermediate files in the scratch directory.
    ///
    /// Environment variable: `RETAIN_SCRATCH`
    #[arg(long, env = "RETAIN_SCRATCH", default_value_t = false)]
    pub retain_scratch: bool,

    /// Create the record tables on startup if they are missing.
    ///
    /// Environment variable: `BOOTSTRAP_SCHEMA`
    #[arg(long, env = "BOOTSTRAP_SCHEMA", default_value_t = false)]
    pub bootstrap_schema: bool,

    /// How long in-flight requests may drain after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: SocketAddr,
    pub supabase_url: String,
    pub supabase_key: Secret,
    pub database: DatabaseConfig,
    pub scratch_dir: PathBuf,
    pub symbology: Symbology,
    pub id_scheme: IdScheme,
    pub jpeg_quality: u8,
    pub pipeline: PipelineSettings,
    pub bootstrap_schema: bool,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub name: String,
    pub pool: PoolSettings,
}

impl DatabaseConfig {
    /// Connection options with TLS disabled.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(self.password.expose())
            .database(&self.name)
            .ssl_mode(PgSslMode::Disable)
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let server_addr: SocketAddr = args
            .server_addr
            .trim()
            .parse()
            .with_context(|| {
                format!("SERVER_ADDR `{}` is not a socket address", args.server_addr)
            })?;

        let supabase_url = args.supabase_url.trim().trim_end_matches('/').to_string();
        if supabase_url.is_empty() {
            bail!("SUPABASE_URL must not be empty");
        }
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            bail!("SUPABASE_URL must be an http(s) URL, got `{supabase_url}`");
        }
        if args.supabase_key.trim().is_empty() {
            bail!("SUPABASE_KEY must not be empty");
        }
        if args.barcode_bucket.trim().is_empty() || args.qr_bucket.trim().is_empty() {
            bail!("BARCODE_BUCKET and QR_BUCKET must not be empty");
        }

        if args.db_pool_size == 0 {
            bail!("DB_POOL_SIZE must be greater than 0");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!(
                "JPEG_QUALITY ({}) must be between 1 and 100",
                args.jpeg_quality
            );
        }
        if args.max_quantity == 0 {
            bail!("MAX_QUANTITY must be at least 1");
        }
        if args.retry_attempts == 0 {
            bail!("RETRY_ATTEMPTS must be at least 1");
        }
        if args.stage_timeout_secs == 0 {
            bail!("STAGE_TIMEOUT_SECS must be greater than 0");
        }
        if args.symbology == Symbology::Ean13 && !args.id_scheme.is_numeric() {
            bail!(
                "SYMBOLOGY=ean13 requires ID_SCHEME=numeric, got `{}`",
                args.id_scheme
            );
        }

        Ok(Self {
            server_addr,
            supabase_url,
            supabase_key: args.supabase_key.into(),
            database: DatabaseConfig {
                host: args.db_host,
                port: args.db_port,
                user: args.db_user,
                password: args.db_password.into(),
                name: args.db_name,
                pool: PoolSettings {
                    max_connections: args.db_pool_size,
                    acquire_timeout: Duration::from_millis(args.db_acquire_timeout_ms),
                },
            },
            scratch_dir: args.scratch_dir.unwrap_or_else(std::env::temp_dir),
            symbology: args.symbology,
            id_scheme: args.id_scheme,
            jpeg_quality: args.jpeg_quality,
            pipeline: PipelineSettings {
                barcode_bucket: args.barcode_bucket,
                qr_bucket: args.qr_bucket,
                max_quantity: args.max_quantity,
                retry: RetryPolicy {
                    max_attempts: args.retry_attempts,
                    backoff: Duration::from_millis(args.retry_backoff_ms),
                },
                stage_timeout: Duration::from_secs(args.stage_timeout_secs),
                remove_orphans: args.remove_orphans,
                retain_scratch: args.retain_scratch,
            },
            bootstrap_schema: args.bootstrap_schema,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
