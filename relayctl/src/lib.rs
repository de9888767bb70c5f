use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use relay_core::{
    load_relay_config, BroadcastProvider, BroadcastSpec, HttpBroadcastProvider, NewStream,
    NullBroadcastProvider, ProviderError, Quality, RelayConfig, RelayScheduler, Schedule,
    ScheduleError, SchedulerError, StreamRegistry, StreamView,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] relay_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("registry error: {0}")]
    Registry(#[from] relay_core::RegistryError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream relay command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the relay.toml config
    #[arg(long, default_value = "configs/relay.toml")]
    pub config: PathBuf,
    /// Registry file override (replaces paths.registry_file)
    #[arg(long)]
    pub registry: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a new stream
    Add(AddArgs),
    /// List configured streams with their schedule countdowns
    List,
    /// Start a stream immediately, bypassing its schedule
    Start { id: u64 },
    /// Stop a running stream
    Stop { id: u64 },
    /// Stop (if running) and remove a stream
    Delete { id: u64 },
    /// Run a single scheduling pass
    Tick,
    /// Run the scheduler loop until interrupted
    Run,
    /// Show per-status stream counts
    Status,
    /// List playable files in the media directory
    Media,
    /// Remote broadcast operations
    #[command(subcommand)]
    Broadcast(BroadcastCommands),
    /// Print the registry file
    Export,
    /// Replace the registry from an exported file
    Import { file: PathBuf },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Media file to relay
    #[arg(long)]
    pub media: String,
    /// Ingest key for the RTMP endpoint
    #[arg(long)]
    pub key: String,
    /// "NOW" or "HH:MM" in the configured timezone
    #[arg(long, default_value = "NOW")]
    pub start: String,
    #[arg(long, default_value = "720p")]
    pub quality: Quality,
    /// Mark the stream as short-form content
    #[arg(long, default_value_t = false)]
    pub shorts: bool,
    /// Remote broadcast to drive through its lifecycle
    #[arg(long, default_value = "")]
    pub broadcast: String,
    /// Channel whose credentials the provider should use
    #[arg(long, default_value = "default")]
    pub channel: String,
}

#[derive(Subcommand, Debug)]
pub enum BroadcastCommands {
    /// Create a remote broadcast and print its ingest key
    Create(BroadcastCreateArgs),
}

#[derive(Args, Debug)]
pub struct BroadcastCreateArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long, default_value = "")]
    pub description: String,
    /// Defaults to the configured provider privacy
    #[arg(long)]
    pub privacy: Option<String>,
    /// "NOW" or "HH:MM"; scheduled times target the next occurrence
    #[arg(long, default_value = "NOW")]
    pub start: String,
    #[arg(long, default_value = "default")]
    pub channel: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = load_relay_config(&cli.config)?;
    if let Some(registry) = &cli.registry {
        config.paths.registry_file = registry.to_string_lossy().to_string();
    }
    let provider = build_provider(&config)?;

    match &cli.command {
        Commands::Add(args) => {
            let scheduler = scheduler(&config, &provider)?;
            let schedule = Schedule::parse(&args.start)?;
            let id = scheduler
                .add_stream(NewStream {
                    media_path: args.media.clone(),
                    ingest_key: args.key.clone(),
                    schedule,
                    quality: args.quality,
                    is_shorts: args.shorts,
                    broadcast_ref: args.broadcast.clone(),
                    channel: args.channel.clone(),
                })
                .await?;
            render(&ActionReport::new(format!("stream {id} registered")), cli.format)?;
        }
        Commands::List => {
            let scheduler = scheduler(&config, &provider)?;
            let rows = scheduler.list_streams(config.local_now()).await;
            render(&StreamTable { rows }, cli.format)?;
        }
        Commands::Start { id } => {
            let scheduler = scheduler(&config, &provider)?;
            scheduler.start_now(*id).await?;
            render(&ActionReport::new(format!("stream {id} started")), cli.format)?;
        }
        Commands::Stop { id } => {
            let scheduler = scheduler(&config, &provider)?;
            scheduler.stop_stream(*id).await?;
            render(&ActionReport::new(format!("stream {id} stopped")), cli.format)?;
        }
        Commands::Delete { id } => {
            let scheduler = scheduler(&config, &provider)?;
            scheduler.delete_stream(*id).await?;
            render(&ActionReport::new(format!("stream {id} removed")), cli.format)?;
        }
        Commands::Tick => {
            let scheduler = scheduler(&config, &provider)?;
            let report = scheduler.tick(config.local_now()).await;
            render(&TickView::from_report(&report), cli.format)?;
        }
        Commands::Run => {
            let scheduler = scheduler(&config, &provider)?;
            info!(node = %config.system.node_name, "relay service starting");
            tokio::select! {
                _ = scheduler.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    scheduler.shutdown().await;
                }
            }
        }
        Commands::Status => {
            let scheduler = scheduler(&config, &provider)?;
            let summary = scheduler.status_summary().await;
            render(
                &StatusView {
                    node_name: config.system.node_name.clone(),
                    environment: config.system.environment.clone(),
                    total: summary.total,
                    waiting: summary.waiting,
                    running: summary.running,
                    stopped: summary.stopped,
                    finished: summary.finished,
                },
                cli.format,
            )?;
        }
        Commands::Media => {
            let listing = media_listing(&config)?;
            render(&listing, cli.format)?;
        }
        Commands::Broadcast(BroadcastCommands::Create(args)) => {
            let created = broadcast_create(&config, provider.as_ref(), args).await?;
            render(&created, cli.format)?;
        }
        Commands::Export => {
            let path = config.registry_path();
            if !path.exists() {
                return Err(AppError::MissingResource(format!(
                    "registry file not found at {}",
                    path.display()
                )));
            }
            print!("{}", fs::read_to_string(&path)?);
        }
        Commands::Import { file } => {
            let imported = StreamRegistry::load(file)?;
            let count = imported.len();
            imported.persist_to(&config.registry_path())?;
            render(
                &ActionReport::new(format!("imported {count} streams")),
                cli.format,
            )?;
        }
    }

    Ok(())
}

fn build_provider(config: &RelayConfig) -> Result<Arc<dyn BroadcastProvider>> {
    if config.provider.enabled {
        Ok(Arc::new(HttpBroadcastProvider::new(
            config.provider.api_base.clone(),
            config.tokens_path(),
            config.provider.request_timeout(),
        )?))
    } else {
        Ok(Arc::new(NullBroadcastProvider))
    }
}

fn scheduler(
    config: &RelayConfig,
    provider: &Arc<dyn BroadcastProvider>,
) -> Result<RelayScheduler> {
    Ok(RelayScheduler::new(
        config.clone(),
        Arc::clone(provider),
        None,
    )?)
}

/// Files the encoder knows how to relay.
const MEDIA_EXTENSIONS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm"];

fn media_listing(config: &RelayConfig) -> Result<MediaListing> {
    let dir = config.media_path();
    if !dir.is_dir() {
        return Err(AppError::MissingResource(format!(
            "media directory not found at {}",
            dir.display()
        )));
    }
    let mut files: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    files.sort();
    Ok(MediaListing {
        directory: dir.display().to_string(),
        files,
    })
}

async fn broadcast_create(
    config: &RelayConfig,
    provider: &dyn BroadcastProvider,
    args: &BroadcastCreateArgs,
) -> Result<BroadcastCreated> {
    let schedule = Schedule::parse(&args.start)?;
    let scheduled_start = match schedule {
        Schedule::Immediate => None,
        at => Some(relay_core::next_occurrence(at, config.local_now())),
    };
    let resource = provider
        .create_broadcast(&BroadcastSpec {
            title: args.title.clone(),
            description: args.description.clone(),
            privacy: args
                .privacy
                .clone()
                .unwrap_or_else(|| config.provider.default_privacy.clone()),
            scheduled_start,
            channel: args.channel.clone(),
        })
        .await?;
    Ok(BroadcastCreated {
        broadcast_ref: resource.broadcast_ref,
        // Shown in full exactly once so the operator can wire up the stream.
        ingest_key: resource.ingest_key,
        channel: args.channel.clone(),
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct ActionReport {
    message: String,
}

impl ActionReport {
    fn new(message: String) -> Self {
        Self { message }
    }
}

impl DisplayFallback for ActionReport {
    fn display(&self) -> String {
        self.message.clone()
    }
}

#[derive(Debug, Serialize)]
struct StreamTable {
    #[serde(serialize_with = "serialize_views")]
    rows: Vec<StreamView>,
}

fn serialize_views<S: serde::Serializer>(
    rows: &[StreamView],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(rows.len()))?;
    for row in rows {
        seq.serialize_element(&serde_json::json!({
            "id": row.id,
            "media": row.media_path,
            "key": row.masked_key,
            "start_at": row.start_at,
            "status": row.status.as_str(),
            "pid": row.pid,
            "quality": row.quality.as_str(),
            "broadcast_ref": row.broadcast_ref,
            "channel": row.channel,
            "countdown": row.countdown,
        }))?;
    }
    seq.end()
}

impl DisplayFallback for StreamTable {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No streams registered".to_string();
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            lines.push(format!(
                "{} | {} | key={} | start={} | status={} | {} | channel={} | {}",
                row.id,
                row.media_path,
                row.masked_key,
                row.start_at,
                row.status,
                row.quality,
                row.channel,
                row.countdown
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct TickView {
    started: Vec<u64>,
    skipped: usize,
    errors: Vec<TickErrorView>,
}

#[derive(Debug, Serialize)]
struct TickErrorView {
    id: u64,
    error: String,
}

impl TickView {
    fn from_report(report: &relay_core::TickReport) -> Self {
        Self {
            started: report.started.clone(),
            skipped: report.skipped,
            errors: report
                .errors
                .iter()
                .map(|(id, error)| TickErrorView {
                    id: *id,
                    error: error.clone(),
                })
                .collect(),
        }
    }
}

impl DisplayFallback for TickView {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "started={} skipped={} errors={}",
            self.started.len(),
            self.skipped,
            self.errors.len()
        )];
        for entry in &self.errors {
            lines.push(format!("  - stream {}: {}", entry.id, entry.error));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    node_name: String,
    environment: String,
    total: usize,
    waiting: usize,
    running: usize,
    stopped: usize,
    finished: usize,
}

impl DisplayFallback for StatusView {
    fn display(&self) -> String {
        format!(
            "Node: {} (env: {})\nStreams: {} total, {} waiting, {} running, {} stopped, {} finished",
            self.node_name,
            self.environment,
            self.total,
            self.waiting,
            self.running,
            self.stopped,
            self.finished
        )
    }
}

#[derive(Debug, Serialize)]
struct MediaListing {
    directory: String,
    files: Vec<String>,
}

impl DisplayFallback for MediaListing {
    fn display(&self) -> String {
        if self.files.is_empty() {
            return format!("No media files in {}", self.directory);
        }
        self.files.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct BroadcastCreated {
    broadcast_ref: String,
    ingest_key: String,
    channel: String,
}

impl DisplayFallback for BroadcastCreated {
    fn display(&self) -> String {
        format!(
            "broadcast {} created on channel {}\ningest key: {}",
            self.broadcast_ref, self.channel, self.ingest_key
        )
    }
}
