//! EdgeSync CLI - Command line interface for a facility node.
//!
//! This tool edits records in a facility database, reports its sync state
//! and runs sync sessions against a central server or a central database
//! file on the same machine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use edgesync_common::facts;
use edgesync_peer::{CentralPeer, HttpCentral, HttpCentralConfig};
use edgesync_store::{Database, ModelRegistry, ModelSpec, SnapshotStore, SyncModel};
use edgesync_sync::{CentralConfig, LocalCentral, SyncConfig, SyncManager, SyncReason, SyncScheduler};

/// Interval used by `sync --watch` when the config sets none.
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "edgesync")]
#[command(about = "EdgeSync - Facility to central record replication")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the facility database and config.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Node config file (default: <data-dir>/edgesync.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a record as a local edit.
    Put {
        /// Model table.
        #[arg(short, long)]
        table: String,

        /// Record id.
        #[arg(short, long)]
        id: String,

        /// Record fields as a JSON object.
        #[arg(short = 'j', long)]
        data: String,
    },

    /// Soft-delete a record as a local edit.
    Delete {
        #[arg(short, long)]
        table: String,

        #[arg(short, long)]
        id: String,
    },

    /// Print one record.
    Show {
        #[arg(short, long)]
        table: String,

        #[arg(short, long)]
        id: String,
    },

    /// Show sync cursors and record counts.
    Status,

    /// Run a sync session.
    Sync {
        /// Central server API root.
        #[arg(long, conflicts_with = "central_db", required_unless_present = "central_db")]
        central_url: Option<Url>,

        /// Central database file, synced in-process.
        #[arg(long)]
        central_db: Option<PathBuf>,

        /// Pull over the streaming endpoint.
        #[arg(long)]
        streaming: bool,

        /// Ask central to prioritise this session.
        #[arg(long)]
        urgent: bool,

        /// Keep syncing on the configured interval until interrupted.
        #[arg(short, long)]
        watch: bool,
    },

    /// Pull the given tables from scratch on the next sync.
    Resync {
        /// Model tables.
        #[arg(required = true)]
        tables: Vec<String>,
    },

    /// Drop snapshot tables left behind by interrupted sessions.
    DropSnapshots,
}

/// Contents of the node config file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeConfig {
    models: Vec<ModelSpec>,
    #[serde(default)]
    sync: SyncConfig,
}

/// A facility database with its models loaded.
struct Node {
    db: Database,
    registry: ModelRegistry,
    config: SyncConfig,
}

impl Node {
    fn model(&self, table: &str) -> Result<Arc<dyn SyncModel>> {
        self.registry
            .get(table)
            .cloned()
            .with_context(|| format!("Unknown model '{}'", table))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let config_path = cli.config.unwrap_or_else(|| data_dir.join("edgesync.json"));
    let node = open_node(&data_dir, &config_path).await?;

    match cli.command {
        Commands::Put { table, id, data } => cmd_put(&node, &table, &id, &data).await,

        Commands::Delete { table, id } => cmd_delete(&node, &table, &id).await,

        Commands::Show { table, id } => cmd_show(&node, &table, &id).await,

        Commands::Status => cmd_status(&node).await,

        Commands::Sync {
            central_url,
            central_db,
            streaming,
            urgent,
            watch,
        } => {
            let peer = open_peer(&node, central_url, central_db, streaming).await?;
            cmd_sync(node, peer, urgent, watch).await
        }

        Commands::Resync { tables } => cmd_resync(&node, &tables).await,

        Commands::DropSnapshots => cmd_drop_snapshots(&node).await,
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("edgesync"))
        .context("No data directory on this platform, pass --data-dir")
}

async fn load_config(path: &Path) -> Result<NodeConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

async fn open_registry(db: &Database, models: Vec<ModelSpec>) -> Result<ModelRegistry> {
    let registry = ModelRegistry::from_specs(models).context("Invalid model definitions")?;
    db.ensure_tables(&registry)
        .await
        .context("Failed to create model tables")?;
    Ok(registry)
}

async fn open_node(data_dir: &Path, config_path: &Path) -> Result<Node> {
    let config = load_config(config_path).await?;

    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join("facility.db");
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let registry = open_registry(&db, config.models).await?;

    Ok(Node {
        db,
        registry,
        config: config.sync,
    })
}

async fn open_peer(
    node: &Node,
    central_url: Option<Url>,
    central_db: Option<PathBuf>,
    streaming: bool,
) -> Result<Arc<dyn CentralPeer>> {
    if let Some(path) = central_db {
        info!("Syncing with central database at: {}", path.display());
        let db = Database::open(&path)
            .with_context(|| format!("Failed to open central database {}", path.display()))?;
        let central = LocalCentral::open(
            db,
            node.registry.clone(),
            CentralConfig::default().with_streaming(streaming),
        )
        .await
        .context("Failed to open central")?;
        return Ok(Arc::new(central));
    }

    let url = central_url.context("Pass --central-url or --central-db")?;
    info!("Syncing with central at: {}", url);
    let central = HttpCentral::new(HttpCentralConfig::new(url).with_streaming(streaming))
        .context("Failed to create central client")?;
    Ok(Arc::new(central))
}

/// Write a record.
async fn cmd_put(node: &Node, table: &str, id: &str, data: &str) -> Result<()> {
    let fields: Map<String, Value> = serde_json::from_str(data).context("Record data must be a JSON object")?;
    let record = node
        .db
        .write_local(node.model(table)?, id, fields)
        .await
        .context("Failed to write record")?;

    println!("Saved {}/{} at tick {}", table, record.id, record.updated_at_sync_tick);
    Ok(())
}

/// Delete a record.
async fn cmd_delete(node: &Node, table: &str, id: &str) -> Result<()> {
    node.db
        .delete_local(node.model(table)?, id)
        .await
        .context("Failed to delete record")?;

    println!("Deleted {}/{}", table, id);
    Ok(())
}

async fn cmd_show(node: &Node, table: &str, id: &str) -> Result<()> {
    let record = node
        .db
        .find(node.model(table)?, id)
        .await
        .context("Failed to read record")?
        .with_context(|| format!("No record {}/{}", table, id))?;

    println!("{}", serde_json::to_string_pretty(&record.to_data())?);
    Ok(())
}

/// Show sync cursors and record counts.
async fn cmd_status(node: &Node) -> Result<()> {
    let store = node.db.facts();
    let models: Vec<_> = node.registry.ordered().cloned().collect();

    let (ticks, resync, counts) = node
        .db
        .call(move |conn| {
            let conn: &Connection = conn;
            let ticks = [
                facts::CURRENT_SYNC_TICK,
                facts::LAST_SUCCESSFUL_SYNC_PULL,
                facts::LAST_SUCCESSFUL_SYNC_PUSH,
            ]
            .iter()
            .map(|name| Ok((*name, store.get(conn, name)?)))
            .collect::<edgesync_common::Result<Vec<_>>>()?;
            let resync = store.get_value(conn, facts::TABLES_FOR_FULL_RESYNC)?;
            let counts = models
                .iter()
                .map(|model| Ok((model.table_name().to_string(), model.count(conn)?)))
                .collect::<edgesync_common::Result<Vec<_>>>()?;
            Ok((ticks, resync, counts))
        })
        .await
        .context("Failed to read status")?;

    println!("Sync:");
    println!("  Enabled: {}", node.config.enabled);
    for (name, tick) in ticks {
        let shown = tick.map(|t| t.to_string()).unwrap_or_else(|| "never".to_string());
        println!("  {}: {}", name, shown);
    }
    if let Some(tables) = resync.filter(|t| !t.is_empty()) {
        println!("  Full resync pending: {}", tables);
    }

    println!("\nRecords:");
    for (table, count) in counts {
        println!("  {}: {}", table, count);
    }

    Ok(())
}

/// Run one sync, or keep syncing with `watch`.
async fn cmd_sync(node: Node, peer: Arc<dyn CentralPeer>, urgent: bool, watch: bool) -> Result<()> {
    let interval = node.config.schedule_interval().unwrap_or(DEFAULT_WATCH_INTERVAL);
    let manager = SyncManager::new(node.db, node.registry, peer, node.config);

    let reason = if urgent {
        SyncReason::urgent("cli")
    } else {
        SyncReason::new("cli")
    };

    if !watch {
        let result = manager.trigger_sync(reason).await.context("Sync failed")?;
        if !result.enabled {
            println!("Sync is disabled in the config.");
        } else if result.queued {
            println!("Central is busy, try again later.");
        } else if let Some(last) = manager.last_run().await {
            println!("Sync complete in {} ms", last.duration_ms);
            println!("  Pushed: {}", last.pushed);
            println!("  Pulled: {}", last.pulled);
            println!("  Saved: {}", last.saved);
        }
        return Ok(());
    }

    let (scheduler, handle) = SyncScheduler::new(Some(interval));
    let task = tokio::spawn(handle.run(manager.clone()));
    info!(interval_secs = interval.as_secs(), "Watching, press Ctrl-C to stop");

    if let Err(e) = scheduler.request_sync(reason).await {
        warn!(error = %e, "Initial sync failed");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    if let Some(last) = manager.last_run().await {
        println!("Last sync: {} ({} ms)", last.completed_at, last.duration_ms);
    }
    Ok(())
}

async fn cmd_resync(node: &Node, tables: &[String]) -> Result<()> {
    for table in tables {
        node.model(table)?;
    }

    let store = node.db.facts();
    let value = tables.join(",");
    node.db
        .call(move |conn| store.set_value(conn, facts::TABLES_FOR_FULL_RESYNC, Some(value.as_str())))
        .await
        .context("Failed to schedule resync")?;

    println!("Next sync pulls from scratch: {}", tables.join(", "));
    Ok(())
}

async fn cmd_drop_snapshots(node: &Node) -> Result<()> {
    let dropped = node
        .db
        .call(|conn| SnapshotStore::drop_all(conn))
        .await
        .context("Failed to drop snapshot tables")?;

    println!("Dropped {} snapshot tables", dropped);
    Ok(())
}
