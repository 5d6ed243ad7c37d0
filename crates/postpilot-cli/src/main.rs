use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use postpilot_core::{Platform, PostId, PostStatus, PostpilotConfig};
use postpilot_publishers::{CredentialSource, EnvCredentials, PublisherRegistry, WebhookPublisher};
use postpilot_scheduler::{
    Engine, NewPost, PostFilter, PostStore, ScheduledPost, SlotAllocator, TimeWindow,
};

#[derive(Parser)]
#[command(name = "postpilot", about = "Schedule and deliver posts to multiple platforms")]
struct Cli {
    /// Path to config file (default: $POSTPILOT_CONFIG, then ~/.postpilot/postpilot.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery daemon until Ctrl-C
    Run,
    /// Run a single delivery pass and exit
    Tick,
    /// Submit a prepared media item for publishing
    Submit {
        /// Reference to the rendered artifact (path, bucket key, URL)
        media: String,
        /// Target platforms, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        platforms: Vec<Platform>,
        /// Publish time (RFC 3339); picked automatically when omitted
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Title/caption/hashtags as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List posts, soonest first
    List {
        /// Only these statuses (repeatable)
        #[arg(short, long)]
        status: Vec<PostStatus>,
        #[arg(short, long)]
        platform: Option<Platform>,
        /// Window start (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Window end (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Show one post with its platform results and failures
    Show { id: String },
    /// Show a post's status history
    History { id: String },
    /// Publish a pending post immediately
    PublishNow { id: String },
    /// Cancel a pending or processing post
    Cancel { id: String },
    /// Move a pending post to a new time (RFC 3339)
    Reschedule { id: String, at: DateTime<Utc> },
    /// List failed posts
    Failed,
    /// Retry one failed post now
    Retry { id: String },
    /// Retry every failed post with recorded platform failures
    RetryAll,
    /// Show the next free slot for the given platforms
    NextSlot {
        #[arg(value_delimiter = ',', required = true)]
        platforms: Vec<Platform>,
    },
    /// Post counts per status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "postpilot=info,postpilot_scheduler=info,postpilot_publishers=info".into()
        }))
        .init();

    let cli = Cli::parse();

    // explicit flag > POSTPILOT_CONFIG env > ~/.postpilot/postpilot.toml
    let config_path = cli.config.or_else(|| std::env::var("POSTPILOT_CONFIG").ok());
    let config = PostpilotConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        PostpilotConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    let store = PostStore::open(db_path)
        .with_context(|| format!("opening database at {db_path}"))?;
    let engine = Engine::new(store, build_registry(&config)?, &config.scheduler);

    match cli.command {
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let daemon = engine.daemon().clone();
            let handle = tokio::spawn(async move { daemon.run(shutdown_rx).await });
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received, stopping");
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
        Commands::Tick => {
            let report = engine.daemon().tick().await?;
            println!(
                "recovered {}  due {}  completed {}  requeued {}  failed {}  missed {}  skipped {}",
                report.recovered,
                report.due,
                report.completed,
                report.requeued,
                report.failed,
                report.missed,
                report.skipped
            );
        }
        Commands::Submit {
            media,
            platforms,
            at,
            metadata,
        } => {
            let mut req = NewPost::new(media, platforms);
            if let Some(raw) = metadata {
                req = req.with_metadata(
                    serde_json::from_str(&raw).context("--metadata must be valid JSON")?,
                );
            }
            if let Some(at) = at {
                req = req.at(at);
            }
            let post = engine.submitter().submit(req)?;
            println!("{}  scheduled for {}", post.id, post.scheduled_time);
        }
        Commands::List {
            status,
            platform,
            from,
            to,
        } => {
            let mut filter = PostFilter::new();
            for s in status {
                filter = filter.status(s);
            }
            if let Some(p) = platform {
                filter = filter.platform(p);
            }
            if from.is_some() || to.is_some() {
                filter = filter.window(TimeWindow { start: from, end: to });
            }
            let now = Utc::now();
            let posts = engine.store().list(&filter)?;
            if posts.is_empty() {
                println!("no posts");
            }
            for post in posts {
                print_row(&post, now);
            }
        }
        Commands::Show { id } => {
            let detail = engine.control().detail(&PostId::from(id))?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Commands::History { id } => {
            for event in engine.store().history(&PostId::from(id))? {
                let from = event.from_status.map_or("-", PostStatus::as_str);
                println!(
                    "{}  {:>10} -> {:<10} {}",
                    event.at,
                    from,
                    event.to_status,
                    event.note.unwrap_or_default()
                );
            }
        }
        Commands::PublishNow { id } => {
            let post = engine.control().force_publish_now(&PostId::from(id)).await?;
            print_outcome(&post);
        }
        Commands::Cancel { id } => {
            let post = engine.control().cancel(&PostId::from(id))?;
            println!("{}  {}", post.id, post.status);
        }
        Commands::Reschedule { id, at } => {
            let post = engine.control().reschedule(&PostId::from(id), at)?;
            println!("{}  rescheduled to {}", post.id, post.scheduled_time);
        }
        Commands::Failed => {
            let failed = engine.control().failed_posts()?;
            if failed.is_empty() {
                println!("no failed posts");
            }
            for f in failed {
                println!(
                    "{}  retriable={}  {}",
                    f.post.id,
                    f.retriable,
                    f.post.error_message.as_deref().unwrap_or("")
                );
                for entry in f.failures {
                    println!(
                        "    {:<12} attempts={} last={}  {}",
                        entry.platform, entry.attempts, entry.last_failed_at, entry.error
                    );
                }
            }
        }
        Commands::Retry { id } => {
            let post = engine.control().retry(&PostId::from(id)).await?;
            print_outcome(&post);
        }
        Commands::RetryAll => {
            let results = engine.control().retry_all().await?;
            println!("retried {} post(s)", results.len());
            for (id, outcome) in results {
                println!("{id}  {outcome:?}");
            }
        }
        Commands::NextSlot { platforms } => {
            let slot = engine.slots().next_slot_for(&platforms, Utc::now())?;
            println!(
                "{}  (display {})",
                slot,
                SlotAllocator::present_slot(slot)
            );
        }
        Commands::Status => {
            for (status, count) in engine.store().counts()? {
                println!("{:<10} {count}", status.as_str());
            }
        }
    }

    Ok(())
}

/// One adapter per `[[publishers.webhooks]]` entry, with bearer tokens read
/// from `POSTPILOT_TOKEN_<PLATFORM>` at publish time.
fn build_registry(config: &PostpilotConfig) -> anyhow::Result<PublisherRegistry> {
    let credentials: Arc<dyn CredentialSource> = Arc::new(EnvCredentials);
    let mut registry = PublisherRegistry::new();
    for hook in &config.publishers.webhooks {
        let publisher = WebhookPublisher::from_config(hook, credentials.clone())
            .with_context(|| format!("publisher for '{}'", hook.platform))?;
        registry.register(Arc::new(publisher));
    }
    if registry.is_empty() {
        warn!("no publishers configured; due posts will fail until one is added");
    }
    Ok(registry)
}

fn print_row(post: &ScheduledPost, now: DateTime<Utc>) {
    let platforms: Vec<&str> = post.platforms.iter().map(Platform::as_str).collect();
    let when = if post.status.is_terminal() {
        String::new()
    } else {
        format!("in {}", format_countdown(post.countdown(now)))
    };
    println!(
        "{}  {:<10} {}  (slot {})  [{}]  {}",
        post.id,
        post.status,
        post.scheduled_time,
        SlotAllocator::present_slot(post.scheduled_time).format("%Y-%m-%d %H:00"),
        platforms.join(","),
        when
    );
}

fn print_outcome(post: &ScheduledPost) {
    println!("{}  {}", post.id, post.status);
    for (platform, result) in &post.platform_results {
        println!("    {:<12} {}", platform, result.published_url);
    }
    if let Some(err) = &post.error_message {
        println!("    error: {err}");
    }
}

fn format_countdown(d: Duration) -> String {
    if d < Duration::zero() {
        return format!("-{}", format_countdown(-d));
    }
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    if hours >= 24 {
        format!("{}d{}h", hours / 24, hours % 24)
    } else {
        format!("{hours}h{minutes:02}m")
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
