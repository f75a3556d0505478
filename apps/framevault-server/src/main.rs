//! Framevault Server: room-scoped frame ingestion over WebSocket
//!
//! Producers connect to `/api/rooms/{id}/ws` and stream frames; recordings
//! land under the storage path as `{room}/{yyyy-mm-dd}/{sequence}.raw`.
//!
//! ## Usage
//!
//! ```bash
//! # Start server on 0.0.0.0:3000, objects in ./data
//! framevault-server
//!
//! # Rooms and account budgets from a file
//! FRAMEVAULT_ROOMS_FILE=rooms.json FRAMEVAULT_STORAGE_PATH=/var/lib/framevault framevault-server
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use framevault::dedup::{DedupConfig, DedupScope};
use framevault::quota::MemoryQuotaLedger;
use framevault::room::MemoryRoomDirectory;
use framevault::storage::{LocalBlobStore, LocalBlobStoreConfig, WriterConfig};
use framevault::{
    AccountId, Collaborators, GatewayConfig, Room, RoomConfig, RoomId, SessionGateway,
};

const MB: u64 = 1024 * 1024;

/// Server configuration from environment
struct Config {
    bind: SocketAddr,
    storage_path: PathBuf,
    flush_interval_ms: u64,
    flush_bytes: usize,
    max_object_mb: u64,
    buffer_mb: u64,
    dedup_window_secs: u64,
    dedup_scope: DedupScope,
    rooms_file: Option<PathBuf>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        let bind = env_or("FRAMEVAULT_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)));

        let storage_path = std::env::var("FRAMEVAULT_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let dedup_scope = match std::env::var("FRAMEVAULT_DEDUP_SCOPE")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Ok("global") => DedupScope::Global,
            _ => DedupScope::PerRoom,
        };

        let rooms_file = std::env::var("FRAMEVAULT_ROOMS_FILE")
            .map(PathBuf::from)
            .ok();

        Self {
            bind,
            storage_path,
            flush_interval_ms: env_or("FRAMEVAULT_FLUSH_INTERVAL_MS", 1000),
            flush_bytes: env_or("FRAMEVAULT_FLUSH_BYTES", 256 * 1024),
            max_object_mb: env_or("FRAMEVAULT_MAX_OBJECT_MB", 64),
            buffer_mb: env_or("FRAMEVAULT_BUFFER_MB", 16),
            dedup_window_secs: env_or("FRAMEVAULT_DEDUP_WINDOW_SECS", 300),
            dedup_scope,
            rooms_file,
        }
    }

    fn gateway_config(&self) -> GatewayConfig {
        let flush_interval = Duration::from_millis(self.flush_interval_ms.max(1));
        GatewayConfig {
            writer: WriterConfig {
                flush_interval,
                flush_bytes: self.flush_bytes,
                max_object_bytes: self.max_object_mb.max(1) * MB,
                buffer_capacity: self.buffer_mb.max(1) * MB,
                ..Default::default()
            },
            dedup: DedupConfig {
                window: Duration::from_secs(self.dedup_window_secs),
                scope: self.dedup_scope,
                ..Default::default()
            },
            tick_interval: flush_interval,
        }
    }
}

/// Rooms file layout
#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    accounts: Vec<AccountSeed>,
    #[serde(default)]
    rooms: Vec<RoomSeed>,
}

#[derive(Debug, Deserialize)]
struct AccountSeed {
    id: String,
    limit_bytes: u64,
    #[serde(default)]
    used_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct RoomSeed {
    id: String,
    account: String,
    #[serde(default)]
    config: RoomConfig,
}

impl Seed {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rooms file {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid rooms file {:?}", path))
    }

    /// One room "default" on an account with a 10 GB budget.
    fn fallback() -> Self {
        Self {
            accounts: vec![AccountSeed {
                id: "default".into(),
                limit_bytes: 10 * 1024 * MB,
                used_bytes: 0,
            }],
            rooms: vec![RoomSeed {
                id: "default".into(),
                account: "default".into(),
                config: RoomConfig::default(),
            }],
        }
    }

    async fn apply(self, directory: &MemoryRoomDirectory, quota: &MemoryQuotaLedger) {
        for account in self.accounts {
            info!(
                account = %account.id,
                limit_mb = account.limit_bytes / MB,
                "Account registered"
            );
            quota
                .set_account(AccountId::new(account.id), account.limit_bytes, account.used_bytes)
                .await;
        }
        for room in self.rooms {
            info!(room = %room.id, account = %room.account, "Room registered");
            directory
                .insert(Room::new(
                    RoomId::new(room.id),
                    AccountId::new(room.account),
                    room.config,
                ))
                .await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Framevault Server starting");
    info!("  Bind: {}", config.bind);
    info!("  Storage path: {:?}", config.storage_path);
    info!(
        "  Objects: flush every {} ms or {} bytes, cap {} MB, buffer {} MB",
        config.flush_interval_ms, config.flush_bytes, config.max_object_mb, config.buffer_mb
    );
    info!(
        "  Dedup: {:?} scope, {} s window",
        config.dedup_scope, config.dedup_window_secs
    );

    let seed = match config.rooms_file {
        Some(ref path) => Seed::load(path)?,
        None => {
            warn!("FRAMEVAULT_ROOMS_FILE not set, serving a single room \"default\"");
            Seed::fallback()
        }
    };
    let directory = Arc::new(MemoryRoomDirectory::new());
    let quota = Arc::new(MemoryQuotaLedger::new());
    seed.apply(&directory, &quota).await;

    let store = LocalBlobStore::open(LocalBlobStoreConfig {
        root_path: config.storage_path.clone(),
        ..Default::default()
    })?;
    info!(
        "Storage: {} objects, {} MB",
        store.object_count().await,
        store.usage_bytes().await / MB
    );

    let gateway = SessionGateway::new(
        Collaborators::new(directory, quota, Arc::new(store)),
        config.gateway_config(),
    );

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let connections = TaskTracker::new();

    let web_gateway = gateway.clone();
    let web_cancel = cancel.clone();
    let web_connections = connections.clone();
    let bind = config.bind;
    tracker.spawn(async move {
        if let Err(e) = framevault::web::start(web_gateway, bind, web_cancel.clone(), web_connections).await {
            error!("Web server error: {:#}", e);
            web_cancel.cancel();
        }
    });

    tracker.close();

    run_headless(gateway, cancel, tracker, connections).await
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "framevault=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log stats periodically, shut down on SIGINT or a failed web server
async fn run_headless(
    gateway: SessionGateway,
    cancel: CancellationToken,
    tracker: TaskTracker,
    connections: TaskTracker,
) -> Result<()> {
    info!("Waiting for producers...");
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = cancel.cancelled() => break,
            _ = stats_interval.tick() => {
                let stats = gateway.stats();
                info!(
                    "Stats: {} rooms active, {} stored, {} duplicate, {} rejected, {} sessions finalized ({} failed)",
                    stats.rooms_active, stats.frames_stored, stats.frames_duplicate,
                    stats.frames_rejected, stats.sessions_finalized, stats.sessions_failed
                );
            }
        }
    }

    // Producer connections finalize their recordings before exiting
    connections.close();
    let drain = gateway.config().writer.drain_timeout + Duration::from_secs(5);
    let wait_all = async {
        tracker.wait().await;
        connections.wait().await;
    };
    if tokio::time::timeout(drain, wait_all).await.is_err() {
        warn!("Shutdown timed out after {:?}", drain);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gateway_config_scales_megabytes() {
        let config = Config {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            storage_path: PathBuf::from("/tmp"),
            flush_interval_ms: 0,
            flush_bytes: 1024,
            max_object_mb: 2,
            buffer_mb: 0,
            dedup_window_secs: 60,
            dedup_scope: DedupScope::Global,
            rooms_file: None,
        };
        let gateway = config.gateway_config();
        assert_eq!(gateway.writer.max_object_bytes, 2 * MB);
        assert_eq!(gateway.writer.buffer_capacity, MB);
        assert_eq!(gateway.writer.flush_interval, Duration::from_millis(1));
        assert_eq!(gateway.dedup.scope, DedupScope::Global);
        assert_eq!(gateway.dedup.window, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn rooms_file_seeds_directory_and_quota() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "accounts": [{{ "id": "acme", "limit_bytes": 1000, "used_bytes": 10 }}],
                "rooms": [{{ "id": "lobby", "account": "acme", "config": {{ "dedup_threshold": 0.9 }} }}]
            }}"#
        )
        .unwrap();

        let seed = Seed::load(file.path()).unwrap();
        let directory = MemoryRoomDirectory::new();
        let quota = MemoryQuotaLedger::new();
        seed.apply(&directory, &quota).await;

        use framevault::quota::QuotaLedger;
        use framevault::room::RoomDirectory;
        let room = directory.room(&RoomId::new("lobby")).await.unwrap().unwrap();
        assert_eq!(room.account, AccountId::new("acme"));
        assert_eq!(room.config.effective_threshold(), Some(0.9));
        let usage = quota.usage(&AccountId::new("acme")).await.unwrap().unwrap();
        assert_eq!((usage.limit, usage.used), (1000, 10));
    }

    #[test]
    fn malformed_rooms_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(Seed::load(file.path()).is_err());
    }
}
