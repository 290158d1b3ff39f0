//! Stock Count Ledger - administrative CLI
//!
//! # Usage
//!
//! ```bash
//! # Apply schema migrations
//! scl-admin migrate
//!
//! # Fill daily balance snapshots up to today (or a given date)
//! scl-admin snapshot --through 2024-03-31
//!
//! # Rebuild every stock position from the movement ledger
//! scl-admin rebuild-positions
//!
//! # List batches awaiting approval
//! scl-admin pending
//!
//! # Reconcile and close an inventory cycle
//! scl-admin close-cycle 12
//! ```

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use stock_count_ledger::services::Services;
use stock_count_ledger::{db, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "scl-admin")]
#[command(author, version, about = "Stock Count Ledger administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Generate missing daily balance snapshots
    Snapshot {
        /// Last day to generate (defaults to today, UTC)
        #[arg(long)]
        through: Option<NaiveDate>,
    },
    /// Zero every stock position and replay the movement ledger
    RebuildPositions,
    /// List batches awaiting manager approval
    Pending,
    /// Reconcile the counts of a cycle and close it
    CloseCycle {
        /// Inventory cycle id
        cycle_id: i64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "scl_admin=info,stock_count_ledger=info,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    init_tracing(config.logging.json);

    let cli = Cli::parse();

    tracing::info!("Environment: {}", config.environment);
    let pool = db::connect(&config.database).await?;

    let services = Services::new(pool.clone(), config.stock.clone());
    match cli.command {
        Commands::Migrate => {
            db::migrate(&pool).await?;
            tracing::info!("Migrations completed");
        }
        Commands::Snapshot { through } => {
            let through = through.unwrap_or_else(|| Utc::now().date_naive());
            let summary = services.snapshots.generate_missing_snapshots(through).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::RebuildPositions => {
            let settings = services.settings.resolve().await?;
            let summary = services.positions.rebuild(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Pending => {
            let pending = services.batches.list_pending().await?;
            if pending.is_empty() {
                println!("No batches awaiting approval");
            }
            for batch in pending {
                println!(
                    "#{:<6} {:<9} {:<24} created {} by user {}",
                    batch.id,
                    batch.batch_type.as_str(),
                    batch.reason,
                    batch.created_at.format("%Y-%m-%d %H:%M"),
                    batch.created_by
                );
            }
        }
        Commands::CloseCycle { cycle_id } => {
            let settings = services.settings.resolve().await?;
            let summary = services
                .reconciliation
                .close_cycle(cycle_id, &settings)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
