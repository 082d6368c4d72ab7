//! Blocksync server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: bind 0.0.0.0:8080, 10 s leases, 30 s presence TTL
//! blocksync-server
//!
//! # Tuned deployment
//! blocksync-server --bind 0.0.0.0:9000 --lease-ttl-ms 5000 --max-users 25
//! ```
//!
//! Every knob also reads its environment variable (`LEASE_TTL_MS`,
//! `USER_TTL_MS`, `REAPER_INTERVAL_MS`, `SESSION_OUTBOUND_QUEUE`,
//! `SNAPSHOT_MAX_BYTES`, `COLOR_PALETTE`, `MAX_USERS_DEFAULT`).

use std::time::Duration;

use blocksync_core::CoreConfig;
use blocksync_server::{AppState, reaper};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Blocksync collaboration server
#[derive(Parser, Debug)]
#[command(name = "blocksync-server")]
#[command(about = "Collaboration backend for shared block workspaces")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Lease lifetime in milliseconds
    #[arg(long, env = "LEASE_TTL_MS", default_value_t = 10_000)]
    lease_ttl_ms: u64,

    /// Presence staleness threshold in milliseconds
    #[arg(long, env = "USER_TTL_MS", default_value_t = 30_000)]
    user_ttl_ms: u64,

    /// Reaper sweep interval in milliseconds
    #[arg(long, env = "REAPER_INTERVAL_MS", default_value_t = 3_000)]
    reaper_interval_ms: u64,

    /// Per-session outbound queue bound (frames)
    #[arg(long, env = "SESSION_OUTBOUND_QUEUE", default_value_t = 256)]
    outbound_queue: usize,

    /// Maximum accepted workspace snapshot size in bytes
    #[arg(long, env = "SNAPSHOT_MAX_BYTES", default_value_t = 1_048_576)]
    snapshot_max_bytes: usize,

    /// Comma-separated participant color palette
    #[arg(long, env = "COLOR_PALETTE", value_delimiter = ',')]
    color_palette: Vec<String>,

    /// Participant limit for rooms created without explicit metadata
    #[arg(long, env = "MAX_USERS_DEFAULT", default_value_t = 10)]
    max_users: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn core_config(&self) -> CoreConfig {
        let defaults = CoreConfig::default();
        CoreConfig {
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            user_ttl: Duration::from_millis(self.user_ttl_ms),
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            outbound_queue: self.outbound_queue,
            snapshot_max_bytes: self.snapshot_max_bytes,
            palette: if self.color_palette.is_empty() {
                defaults.palette
            } else {
                self.color_palette.clone()
            },
            max_users_default: self.max_users,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("blocksync server starting");
    tracing::info!("binding to {}", args.bind);

    let state = AppState::new(args.core_config());
    let shutdown = CancellationToken::new();
    let reaper_task = tokio::spawn(reaper::run(state.registry(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, blocksync_server::app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    let _ = reaper_task.await;

    Ok(())
}
