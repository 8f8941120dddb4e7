//! Seeds or moves the cursor record of one incremental crawl source
//!
//! ```bash
//! cursor_seed [--force] <site_id> <name> <cursor> [cursor_name]
//! ```
//!
//! An existing record is left alone unless `--force` is given.
//!
//! The repository comes from `cursor.database_url` in the layered
//! configuration. `CRAWL_COORD_CONFIG` points at a config file other than
//! the default one.

use anyhow::{Context, Result, bail};
use tracing::info;

use crawl_coord::application::{SeedOutcome, seed_cursor};
use crawl_coord::domain::CursorRecord;
use crawl_coord::infrastructure::config::ConfigManager;
use crawl_coord::infrastructure::{SqlCursorRepository, init_logging_with_config};

const USAGE: &str = "usage: cursor_seed [--force] <site_id> <name> <cursor> [cursor_name]";

#[tokio::main]
async fn main() -> Result<()> {
    let (flags, args): (Vec<String>, Vec<String>) = std::env::args().skip(1).partition(|arg| arg.starts_with("--"));
    let force = match flags.as_slice() {
        [] => false,
        [flag] if flag == "--force" => true,
        _ => bail!(USAGE),
    };
    if !(3..=4).contains(&args.len()) {
        bail!(USAGE);
    }

    let manager = match std::env::var("CRAWL_COORD_CONFIG") {
        Ok(path) => ConfigManager::with_path(path),
        Err(_) => ConfigManager::new()?,
    };
    let config = manager.load_config()?;
    init_logging_with_config(config.logging.clone())?;

    let site_id: i64 = args[0]
        .parse()
        .with_context(|| format!("site_id must be an integer, got {:?}", args[0]))?;
    let cursor_value: i64 = args[2]
        .parse()
        .with_context(|| format!("cursor must be an integer, got {:?}", args[2]))?;
    let record = CursorRecord {
        site_id,
        name: args[1].clone(),
        cursor_value,
        cursor_name: args.get(3).cloned().unwrap_or_else(|| config.cursor.cursor_name.clone()),
    };

    let repository = SqlCursorRepository::connect(&config.cursor.database_url)
        .await
        .with_context(|| format!("Failed to open cursor store {}", config.cursor.database_url))?;

    let outcome = seed_cursor(&repository, &record, force).await?;
    let previous = match outcome {
        SeedOutcome::Created => None,
        SeedOutcome::Overwritten { previous } => Some(previous),
    };

    info!(
        site_id = record.site_id,
        cursor_name = %record.cursor_name,
        previous = ?previous,
        cursor = record.cursor_value,
        "✅ Cursor seeded"
    );
    Ok(())
}
