//! coursekeep - inspect and edit an offline progress store from the shell.
//!
//! Operates on the same record directory the app writes, so it can be used
//! to debug a learner's progress, replay writes, or watch another process
//! update records live.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coursekeep_core::config::DATA_DIR_ENV;
use coursekeep_core::progress::expired_keys;
use coursekeep_core::{
    Clock, Config, ContentCache, EntityType, FileStore, KeyValueStore, OfflineStorage,
    OfflineStore, ProgressPatch, ProgressStore, SystemClock,
};

#[derive(Parser)]
#[command(name = "coursekeep")]
#[command(about = "Inspect and edit an offline course progress store", long_about = None)]
#[command(version)]
struct Cli {
    /// Record directory (defaults to the configured data directory)
    #[arg(long, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Key namespace, e.g. `tajweed`
    #[arg(short, long)]
    namespace: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record in the namespace
    Dump {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print one record
    Get {
        /// course, unit or lesson
        entity_type: EntityType,
        /// Composite id, e.g. c1_u1_l1
        id: String,
    },
    /// Merge fields into a record and cascade to its parents
    Set {
        entity_type: EntityType,
        id: String,
        #[arg(short, long)]
        progress: Option<i64>,
        #[arg(long)]
        completed: Option<bool>,
        #[arg(long)]
        locked: Option<bool>,
        /// Resume position for unit/course records
        #[arg(long)]
        last_lesson: Option<String>,
    },
    /// Record an answer on a lesson
    Answer {
        lesson_id: String,
        question_id: String,
        /// Answer as JSON; bare words are stored as strings
        answer: String,
        #[arg(long)]
        correct: bool,
    },
    /// Purge expired and corrupt records
    Sweep,
    /// Remove one record, or the whole namespace with --all
    Clear {
        #[arg(required_unless_present = "all", requires = "id")]
        entity_type: Option<EntityType>,
        id: Option<String>,
        #[arg(long, conflicts_with = "entity_type")]
        all: bool,
    },
    /// Print changes made by other processes until interrupted
    Watch,
    /// Empty the content cache
    CacheClear,
    /// List courses stored for offline use, or remove them with --clear
    Offline {
        #[arg(long)]
        clear: bool,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;

    let mut config = Config::load()?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = Some(dir);
    }
    if cli.namespace.is_some() {
        config.namespace = cli.namespace.clone();
    }

    let data_dir = config.data_dir()?;
    info!(dir = %data_dir.display(), "Opening progress store");
    let backend: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::new(data_dir.clone())
            .with_context(|| format!("Failed to open data directory: {}", data_dir.display()))?
            .with_watch_interval(config.watch_interval()),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if let Commands::CacheClear = cli.command {
        let cache = ContentCache::new(backend, clock, config.cache_config());
        let removed = cache.len();
        cache.clear_cache();
        println!("Cleared {} cache entries", removed);
        return Ok(());
    }

    if let Commands::Offline { clear } = cli.command {
        let offline = OfflineStorage::new(backend);
        if clear {
            let removed = offline.clear_storage()?;
            println!("Removed {} offline records", removed);
            return Ok(());
        }
        let courses = offline.ids(OfflineStore::Meta)?;
        for course_id in &courses {
            let Some(meta) = offline.get_meta(course_id) else {
                continue;
            };
            println!(
                "{:<20} units={:<3} lessons={:<4} assets={:<4} {:>10} bytes  priority={}",
                meta.course_id,
                meta.unit_ids.len(),
                meta.lesson_ids.len(),
                meta.assets.len(),
                meta.asset_bytes(),
                meta.priority
            );
        }
        println!("{} courses", courses.len());
        return Ok(());
    }

    let store = ProgressStore::new(backend, clock.clone(), config.store_config());

    match cli.command {
        Commands::Dump { json } => {
            let records = store.debug_dump();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                let expired = expired_keys(&records, clock.now());
                for (key, record) in &records {
                    let marker = if expired.contains(key) { " (expired)" } else { "" };
                    println!(
                        "{:<40} {:>3}%  completed={:<5}  locked={:<5}  {}{}",
                        key,
                        record.progress,
                        record.is_completed,
                        record.is_locked,
                        serde_json::to_string(&record.sync_status)?.trim_matches('"'),
                        marker
                    );
                }
                println!("{} records", records.len());
            }
        }
        Commands::Get { entity_type, id } => match store.get_progress(entity_type, &id) {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("No {} record for '{}'", entity_type, id),
        },
        Commands::Set {
            entity_type,
            id,
            progress,
            completed,
            locked,
            last_lesson,
        } => {
            let patch = ProgressPatch {
                progress,
                is_completed: completed,
                is_locked: locked,
                last_accessed_lesson: last_lesson,
                ..ProgressPatch::default()
            };
            store.save_progress(entity_type, &id, patch);
            store.settle().await;
            let record = store
                .get_progress(entity_type, &id)
                .context("Write was not persisted, see log for details")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Answer {
            lesson_id,
            question_id,
            answer,
            correct,
        } => {
            let value = serde_json::from_str(&answer)
                .unwrap_or_else(|_| serde_json::Value::String(answer.clone()));
            store.save_answer(&lesson_id, &question_id, value, correct);
            store.settle().await;
        }
        Commands::Sweep => {
            let removed = store.clear_expired_data();
            println!("Removed {} records", removed);
        }
        Commands::Clear {
            entity_type,
            id,
            all,
        } => {
            if all {
                let removed = store.clear_all();
                println!("Removed {} records", removed);
            } else if let (Some(entity_type), Some(id)) = (entity_type, id) {
                store.clear_progress(entity_type, &id);
            }
        }
        Commands::Watch => {
            let mut changes = store.progress_changes();
            eprintln!("Watching {} (Ctrl-C to stop)", data_dir.display());
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Some(change) = change else { break };
                        println!("{}", serde_json::to_string(&change)?);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::CacheClear | Commands::Offline { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_set() {
        let cli = Cli::try_parse_from([
            "coursekeep",
            "--namespace",
            "tajweed",
            "set",
            "lesson",
            "c1_u1_l1",
            "--progress",
            "100",
            "--completed",
            "true",
        ])
        .unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("tajweed"));
        match cli.command {
            Commands::Set {
                entity_type,
                progress,
                completed,
                ..
            } => {
                assert_eq!(entity_type, EntityType::Lesson);
                assert_eq!(progress, Some(100));
                assert_eq!(completed, Some(true));
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_clear_needs_target_or_all() {
        assert!(Cli::try_parse_from(["coursekeep", "clear"]).is_err());
        assert!(Cli::try_parse_from(["coursekeep", "clear", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["coursekeep", "clear", "unit", "c1_u1"]).is_ok());
        assert!(Cli::try_parse_from(["coursekeep", "get", "chapter", "x"]).is_err());
    }

    #[test]
    fn test_parses_offline() {
        let cli = Cli::try_parse_from(["coursekeep", "offline", "--clear"]).unwrap();
        assert!(matches!(cli.command, Commands::Offline { clear: true }));
        let cli = Cli::try_parse_from(["coursekeep", "offline"]).unwrap();
        assert!(matches!(cli.command, Commands::Offline { clear: false }));
    }
}
