//! # Queue-Relay CLI
//!
//! Command-line daemon that relays SQS messages to an HTTP endpoint.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. Optional configuration file (`--config`, YAML/TOML/JSON)
//! 3. Environment variables prefixed `QUEUE_RELAY__` (`__` separates levels),
//!    e.g. `QUEUE_RELAY__AWS__REGION=eu-west-1`
//! 4. Command-line flags

use clap::Parser;
use queue_relay_core::{RelayConfig, RelayDaemon, RelayError};
use queue_runtime::{
    create_and_subscribe, AwsProvisioningClient, CreateQueueOptions, ProvisioningApi,
    ProvisioningError,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix for configuration environment variables
pub const ENV_PREFIX: &str = "QUEUE_RELAY";

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue-Relay - deliver SQS messages to an HTTP endpoint
#[derive(Parser, Debug)]
#[command(name = "queue-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deliver SQS messages to an HTTP endpoint")]
#[command(
    long_about = "Queue-Relay long-polls an SQS queue and POSTs every message to an HTTP \
                  endpoint, deleting it only when the endpoint answers 200 OK"
)]
pub struct Cli {
    /// URL of the SQS queue to read from
    #[arg(long, env = "SQS_URL")]
    pub sqs_url: Option<String>,

    /// Create the named queue (if missing) and read from it
    #[arg(long, env = "SQS_CREATE_QUEUE")]
    pub sqs_create_queue: Option<String>,

    /// Comma-separated SNS topic ARNs to subscribe a created queue to
    #[arg(long, value_delimiter = ',')]
    pub subscribe_to_sns_arns: Vec<String>,

    /// Where messages are POSTed [default: http://localhost:9900/sqs]
    #[arg(long)]
    pub http_url: Option<String>,

    /// Content-Type of the forwarded messages [default: application/json]
    #[arg(long)]
    pub mime_type: Option<String>,

    /// Timeout of a single delivery in seconds [default: 30]
    #[arg(long)]
    pub http_timeout: Option<u64>,

    /// Visibility timeout of received messages in seconds [default: 60]
    #[arg(long)]
    pub visibility_timeout: Option<u64>,

    /// Maximum number of concurrent deliveries [default: 50]
    #[arg(long)]
    pub connections: Option<usize>,

    /// Log delivery requests and responses
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, env = "QUEUE_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is unset [default: info, or debug with -v]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set
    pub fn default_log_level(&self) -> &str {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level,
            (None, true) => "debug",
            (None, false) => "info",
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI errors; each maps to a distinct process exit code
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Queue provisioning failed: {message}")]
    Provisioning { message: String },

    #[error("Failed to start relay: {0}")]
    Startup(#[source] RelayError),

    #[error("Relay failed: {message}")]
    Runtime { message: String },
}

impl CliError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for CliError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<queue_relay_core::ConfigError> for CliError {
    fn from(err: queue_relay_core::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<ProvisioningError> for CliError {
    fn from(err: ProvisioningError) -> Self {
        Self::Provisioning {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Queue Selection
// ============================================================================

/// Where the relay's queue comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSource {
    /// An existing queue
    Url(String),
    /// A queue to create and subscribe before relaying
    Create {
        queue_name: String,
        topic_arns: Vec<String>,
    },
}

/// Decide the queue source; exactly one of a queue URL or a queue to create
/// must be given.
pub fn queue_source(cli: &Cli, config: &RelayConfig) -> Result<QueueSource, CliError> {
    let create = cli
        .sqs_create_queue
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let url = Some(config.queue_url.trim()).filter(|url| !url.is_empty());

    match (url, create) {
        (Some(_), Some(_)) => Err(CliError::configuration(
            "--sqs-url and --sqs-create-queue are mutually exclusive",
        )),
        (None, None) => Err(CliError::configuration(
            "one of --sqs-url or --sqs-create-queue is required",
        )),
        (Some(url), None) => {
            if !cli.subscribe_to_sns_arns.is_empty() {
                warn!("--subscribe-to-sns-arns only applies with --sqs-create-queue; ignoring");
            }
            Ok(QueueSource::Url(url.to_string()))
        }
        (None, Some(name)) => Ok(QueueSource::Create {
            queue_name: name.to_string(),
            topic_arns: cli
                .subscribe_to_sns_arns
                .iter()
                .map(|arn| arn.trim().to_string())
                .filter(|arn| !arn.is_empty())
                .collect(),
        }),
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

/// Load configuration from the file, the process environment and the flags
pub fn load_config(cli: &Cli) -> Result<RelayConfig, CliError> {
    load_config_with_env(cli, None)
}

/// Load configuration, reading `QUEUE_RELAY__*` variables from `env` instead
/// of the process environment when given
pub fn load_config_with_env(
    cli: &Cli,
    env: Option<config::Map<String, String>>,
) -> Result<RelayConfig, CliError> {
    let mut builder = config::Config::builder();

    if let Some(path) = &cli.config {
        if !path.exists() {
            return Err(CliError::configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()?;

    let mut relay_config: RelayConfig = settings.try_deserialize()?;
    apply_flags(cli, &mut relay_config);

    Ok(relay_config)
}

/// Explicit flags override every other source
fn apply_flags(cli: &Cli, config: &mut RelayConfig) {
    if let Some(url) = &cli.sqs_url {
        config.queue_url = url.clone();
    }
    if let Some(http_url) = &cli.http_url {
        config.http_url = http_url.clone();
    }
    if let Some(mime_type) = &cli.mime_type {
        config.content_type = mime_type.clone();
    }
    if let Some(timeout) = cli.http_timeout {
        config.http_timeout_seconds = timeout;
    }
    if let Some(timeout) = cli.visibility_timeout {
        config.visibility_timeout_seconds = timeout;
    }
    if let Some(connections) = cli.connections {
        config.max_connections = connections;
    }
    if cli.verbose {
        config.verbose = true;
    }
}

/// Resolve the queue, provisioning it through `api` when requested, and
/// return the configuration the relay starts with.
pub async fn resolve_queue(
    cli: &Cli,
    mut config: RelayConfig,
    api: Option<&dyn ProvisioningApi>,
) -> Result<RelayConfig, CliError> {
    match queue_source(cli, &config)? {
        QueueSource::Url(url) => config.queue_url = url,
        QueueSource::Create {
            queue_name,
            topic_arns,
        } => {
            let options = CreateQueueOptions::new(queue_name)
                .with_topic_arns(topic_arns)
                .with_visibility_timeout(Duration::from_secs(config.visibility_timeout_seconds));

            config.queue_url = match api {
                Some(api) => create_and_subscribe(api, &options).await?,
                None => {
                    let client = AwsProvisioningClient::new(&config.aws).await.map_err(|e| {
                        CliError::Provisioning {
                            message: e.to_string(),
                        }
                    })?;
                    create_and_subscribe(&client, &options).await?
                }
            };
        }
    }

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global tracing subscriber
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(cli.default_log_level()).map_err(|e| {
            CliError::configuration(format!("invalid log level '{}': {}", cli.default_log_level(), e))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::configuration(format!("failed to initialise logging: {}", e)))
}

// ============================================================================
// Entry Point
// ============================================================================

/// Parse arguments and run the relay until SIGINT or SIGTERM
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;

    let config = load_config(&cli)?;
    let config = resolve_queue(&cli, config, None).await?;

    let handle = RelayDaemon::start(config).await.map_err(CliError::Startup)?;
    info!(queue_url = %handle.queue_url(), "Relay running");

    shutdown_signal().await;

    info!(
        open_deliveries = handle.open_deliveries(),
        "Stopping relay, waiting for open deliveries"
    );
    handle.shutdown().await.map_err(|e| CliError::Runtime {
        message: e.to_string(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
