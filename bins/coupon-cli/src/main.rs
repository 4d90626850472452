//! coupon-cli: offline administration of the code database.
//!
//! Opens the same RocksDB directory the server uses. RocksDB allows a single
//! writer process, so stop `coupon-server` before running commands that
//! modify the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use coupon_core::pool::CodePool;
use coupon_core::store::CouponStore;
use coupon_core::types::CodeStatus;
use coupon_node_lib::{NodeConfig, RocksStore};

/// Coupon Drop code database administration.
#[derive(Parser)]
#[command(name = "coupon-cli")]
#[command(version, about = "Manage the Coupon Drop code pool.")]
struct Cli {
    /// Path to the RocksDB directory (default: ~/.coupon-drop/db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a single code.
    Add(AddArgs),
    /// Add codes from a file, one per line.
    Import(ImportArgs),
    /// List every code with its status.
    List(ListArgs),
    /// Show pool occupancy.
    Stats,
    /// Release codes claimed more than the given number of seconds ago.
    ReleaseExpired(ReleaseArgs),
    /// Return every claimed code to the pool.
    Reset,
    /// Delete every cooldown entry.
    ClearCooldowns,
}

#[derive(Args)]
struct AddArgs {
    /// The code value.
    code: String,
}

#[derive(Args)]
struct ImportArgs {
    /// File with one code per line. Blank lines and `#` comments are ignored.
    file: PathBuf,
}

#[derive(Args)]
struct ListArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReleaseArgs {
    /// Claims older than this many seconds are released.
    #[arg(long)]
    older_than_secs: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(|| NodeConfig::default().db_path());
    let store = open_store(&db_path)?;
    run(cli.command, store)
}

fn open_store(path: &Path) -> Result<Arc<dyn CouponStore>> {
    let store = RocksStore::open(path)
        .with_context(|| format!("Failed to open code database at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn run(command: Commands, store: Arc<dyn CouponStore>) -> Result<()> {
    let pool = CodePool::new(Arc::clone(&store));

    match command {
        Commands::Add(args) => {
            let code = pool
                .add(&args.code, Utc::now())
                .with_context(|| format!("Failed to add {}", args.code))?;
            println!("Added {}", code.value);
        }
        Commands::Import(args) => {
            let contents = std::fs::read_to_string(&args.file)
                .with_context(|| format!("Failed to read {}", args.file.display()))?;
            let values = parse_code_list(&contents);
            if values.is_empty() {
                bail!("No codes found in {}", args.file.display());
            }
            let report = pool.add_many(&values, Utc::now()).context("Import failed")?;
            println!(
                "Imported {} code(s), skipped {} duplicate(s)",
                report.added.len(),
                report.skipped.len()
            );
            for value in &report.skipped {
                println!("  skipped: {value}");
            }
        }
        Commands::List(args) => {
            let codes = pool.list()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&codes)?);
            } else {
                println!("{:<6} {:<24} {:<10} CLAIMED AT", "SEQ", "CODE", "STATUS");
                for code in codes {
                    let status = match code.status {
                        CodeStatus::Available => "available",
                        CodeStatus::Claimed => "claimed",
                    };
                    let claimed_at = code
                        .claimed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<6} {:<24} {:<10} {}", code.seq, code.value, status, claimed_at);
                }
            }
        }
        Commands::Stats => {
            let stats = pool.stats()?;
            println!("Total:     {}", stats.total);
            println!("Available: {}", stats.available);
            println!("Claimed:   {}", stats.claimed);
        }
        Commands::ReleaseExpired(args) => {
            let secs = i64::try_from(args.older_than_secs).context("--older-than-secs is too large")?;
            let threshold = Utc::now()
                .checked_sub_signed(TimeDelta::seconds(secs))
                .context("--older-than-secs is too large")?;
            let released = pool.release_expired(threshold)?;
            println!("Released {released} code(s)");
        }
        Commands::Reset => {
            let released = pool.reset_all()?;
            println!("Released {released} code(s)");
        }
        Commands::ClearCooldowns => {
            let cleared = store.clear_cooldowns()?;
            println!("Cleared {cleared} cooldown entr{}", if cleared == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

/// One code per line; blank lines and `#` comments skipped.
fn parse_code_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
