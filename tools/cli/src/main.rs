//! RepSync CLI - inspect the pending operations queue and run a demo sync.
//!
//! Queue commands operate on a file-backed store in the data directory,
//! with the network treated as offline so nothing is replayed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use repsync_common::{now_millis, UserId};
use repsync_storage::{FileStore, KeyValueStore, MemoryStore};
use repsync_sync::{
    CollectionStore, ExerciseSet, FriendEdge, FriendStatus, ManualProbe, MemoryRemote,
    NetworkMonitor, NetworkState, PendingOperationsQueue, Session, StoreConfig, SyncConfig,
    SyncOrchestrator, Workout,
};

#[derive(Parser)]
#[command(name = "repsync")]
#[command(about = "RepSync - Offline-first sync toolkit")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (default: platform data dir).
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or maintain the pending operations queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run an offline-then-online sync against in-memory remotes.
    Demo,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending mutations.
    List {
        /// Only show mutations for this store.
        #[arg(short, long)]
        store: Option<String>,
    },

    /// Count pending mutations.
    Count {
        /// Only count mutations for this store.
        #[arg(short, long)]
        store: Option<String>,
    },

    /// Remove pending mutations.
    Clear {
        /// Only remove mutations for this store.
        #[arg(short, long)]
        store: Option<String>,
    },

    /// Evict entries older than the staleness window.
    Prune,

    /// Add a mutation by hand.
    Enqueue {
        /// Owning store.
        #[arg(short, long)]
        store: String,

        /// JSON payload.
        #[arg(short, long)]
        payload: String,
    },

    /// Reset retry counters of failed mutations and move them to the front.
    Retry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Queue { action } => {
            let data_dir = resolve_data_dir(cli.data_dir)?;
            cmd_queue(&data_dir, &config, action).await
        }
        Commands::Demo => cmd_demo(config).await,
    }
}

/// Load the sync configuration, falling back to defaults.
fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid config file")
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => dirs::data_dir()
            .map(|dir| dir.join("repsync"))
            .context("No data directory available; pass --data-dir"),
    }
}

/// Open the file-backed queue without loading it.
fn open_queue(
    data_dir: &Path,
    config: &SyncConfig,
) -> Result<(Arc<FileStore>, PendingOperationsQueue)> {
    let storage = Arc::new(FileStore::new(data_dir).context("Failed to open data directory")?);
    let offline = NetworkMonitor::new(Arc::new(ManualProbe::new(NetworkState::offline())));
    let queue = PendingOperationsQueue::new(storage.clone(), offline, config.queue.clone());
    Ok((storage, queue))
}

async fn cmd_queue(data_dir: &Path, config: &SyncConfig, action: QueueAction) -> Result<()> {
    let (storage, queue) = open_queue(data_dir, config)?;

    if let QueueAction::Prune = action {
        let stored = storage
            .get(&config.queue.storage_key)
            .await
            .context("Failed to read queue")?
            .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(&raw).ok())
            .map_or(0, |entries| entries.len());
        queue.initialize().await.context("Failed to load queue")?;
        let kept = queue.count().await?;
        println!("Evicted {} stale mutations, {} remain", stored.saturating_sub(kept), kept);
        return Ok(());
    }

    queue.initialize().await.context("Failed to load queue")?;

    match action {
        QueueAction::List { store } => {
            let entries = match &store {
                Some(name) => queue.for_store(name).await?,
                None => queue.all().await?,
            };
            if entries.is_empty() {
                println!("Queue is empty.");
            }
            for entry in entries {
                let when = chrono::DateTime::from_timestamp_millis(entry.timestamp)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| entry.timestamp.to_string());
                println!(
                    "  {} [{}] retries={} at {} {}",
                    entry.id, entry.store_name, entry.retry_count, when, entry.payload
                );
            }
        }

        QueueAction::Count { store } => {
            let count = match &store {
                Some(name) => queue.store_count(name).await?,
                None => queue.count().await?,
            };
            println!("{}", count);
        }

        QueueAction::Clear { store } => match store {
            Some(name) => {
                let removed = queue.clear_store(&name).await?;
                println!("Removed {} mutations for '{}'", removed, name);
            }
            None => {
                queue.clear().await?;
                println!("Queue cleared.");
            }
        },

        QueueAction::Enqueue { store, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let id = queue
                .enqueue(&store, payload)
                .await
                .context("Failed to enqueue mutation")?;
            println!("Enqueued {}", id);
        }

        QueueAction::Retry => {
            let failed = queue
                .all()
                .await?
                .iter()
                .filter(|m| m.retry_count > 0)
                .count();
            // Offline, so nothing is replayed here.
            queue.retry_failed(|_| async { Ok(()) }).await?;
            println!("Reset {} failed mutations", failed);
        }

        QueueAction::Prune => {}
    }

    Ok(())
}

/// Sync two in-memory collections across an offline period.
async fn cmd_demo(config: SyncConfig) -> Result<()> {
    let probe = Arc::new(ManualProbe::new(NetworkState::offline()));
    let orchestrator =
        SyncOrchestrator::with_storage(Arc::new(MemoryStore::new()), probe.clone(), config);
    orchestrator.initialize().await?;

    let workouts_remote = Arc::new(MemoryRemote::<Workout>::new());
    let friends_remote = Arc::new(MemoryRemote::<FriendEdge>::new());
    let workouts = CollectionStore::<Workout>::new(
        "workouts",
        workouts_remote.clone(),
        orchestrator.queue().clone(),
    );
    let friends = CollectionStore::<FriendEdge>::new(
        "friends",
        friends_remote.clone(),
        orchestrator.queue().clone(),
    );

    orchestrator
        .register_store(StoreConfig::new("workouts", Arc::new(workouts.clone())))
        .await?;
    orchestrator
        .register_store(StoreConfig::new("friends", Arc::new(friends.clone())))
        .await?;
    orchestrator
        .register_realtime("friends", friends.start_realtime()?)
        .await?;

    let user = UserId::new("demo-user")?;
    orchestrator
        .on_sign_in(Session::new(user.clone()).with_access_token("demo-token"))
        .await;

    info!("Offline: recording a workout and blocking a user");
    let now = now_millis();
    workouts
        .save(Workout {
            id: "w-1".to_string(),
            user_id: user.to_string(),
            name: "Leg day".to_string(),
            sets: vec![ExerciseSet {
                exercise_id: "squat".to_string(),
                reps: 5,
                weight_kg: 100.0,
            }],
            started_at_ms: now - 3_600_000,
            completed_at_ms: Some(now),
            updated_at_ms: now,
            deleted: false,
        })
        .await?;
    friends
        .save(FriendEdge::new(user.as_str(), "coach", FriendStatus::Blocked, now))
        .await?;

    // Another device accepts the friendship later.
    friends_remote.seed(FriendEdge::new(
        user.as_str(),
        "coach",
        FriendStatus::Friends,
        now + 1_000,
    ));

    println!("Pending mutations while offline: {}", orchestrator.queue().count().await?);

    info!("Going online");
    probe.set(NetworkState::online("wifi"));

    for _ in 0..100 {
        let stats = orchestrator.stats().await;
        if stats.total_syncs > 0 && stats.pending_mutations == 0 && !orchestrator.is_syncing().await
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = orchestrator.stats().await;
    println!("Sync statistics:");
    println!("  Cycles: {}", stats.total_syncs);
    println!("  Successful store syncs: {}", stats.successful_syncs);
    println!("  Failed store syncs: {}", stats.failed_syncs);
    println!("  Pending mutations: {}", stats.pending_mutations);

    let mut statuses: Vec<_> = orchestrator.sync_statuses().await.into_iter().collect();
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    println!("Store status:");
    for (name, status) in statuses {
        println!("  {}: {:?}", name, status);
    }

    println!("Remote workouts: {}", workouts_remote.len());
    for edge in friends_remote.records() {
        println!(
            "Remote friendship {} -> {}: {:?} (updated {})",
            edge.user_id, edge.friend_id, edge.status, edge.updated_at_ms
        );
    }

    orchestrator.shutdown();
    Ok(())
}
