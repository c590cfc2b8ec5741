//! # Collectio CLI (`collectio`)
//!
//! The `collectio` binary drives the shard store engine against a
//! file-backed key-value store. It provides commands for ingestion,
//! listing, undoable deletion, retrying failed classification, and
//! compiling shards into a document.
//!
//! ## Usage
//!
//! ```bash
//! collectio --config ./collectio.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `collectio init` | Create the data directory and an empty snapshot |
//! | `collectio ingest <file>` | Ingest a text fragment (`-` for stdin) |
//! | `collectio list` | List active shards grouped by domain |
//! | `collectio show <id>` | Print one shard in full |
//! | `collectio retry <id>` | Re-run classification for a failed shard |
//! | `collectio delete <id>` | Soft-delete a shard (undoable) |
//! | `collectio clear` | Soft-delete every active shard (undoable) |
//! | `collectio undo` | Reverse the most recent delete within its window |
//! | `collectio compile` | Compile ready shards into a document |
//! | `collectio status` | Counts, undo window, storage and usage state |

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use collectio::config::{load_config, Config};
use collectio::engine::{Collectio, IngestOutcome};
use collectio::models::ShardStatus;
use collectio::persist::FileKvStore;

/// Collectio, a knowledge shard store with undoable deletes and
/// document compilation.
#[derive(Parser)]
#[command(
    name = "collectio",
    about = "Collectio: a client-side knowledge shard store",
    version,
    long_about = "Collectio ingests text fragments, deduplicates them by content hash, \
    classifies them through a pluggable indexer, supports time-boxed undo of deletions, \
    and compiles selected shards into an ordered document with a descriptive manifest."
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used when the file
    /// does not exist.
    #[arg(long, global = true, default_value = "./collectio.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and write an empty snapshot.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest a text fragment from a file, or stdin with `-`.
    ///
    /// The fragment is deduplicated by content hash and classified by the
    /// configured indexer. Duplicate content is rejected with a notice.
    Ingest {
        /// Path to a UTF-8 text file, or `-` to read stdin.
        input: String,
    },

    /// List active shards grouped by domain.
    List,

    /// Print one shard in full.
    Show {
        /// Shard id.
        id: String,
    },

    /// Re-run classification for a shard, typically after a failure.
    Retry {
        /// Shard id.
        id: String,
    },

    /// Soft-delete a shard. Undoable with `collectio undo` within the
    /// configured window.
    Delete {
        /// Shard id.
        id: String,
    },

    /// Soft-delete every active shard. Undoable as one batch.
    Clear,

    /// Reverse the most recent delete, if its undo window is still open.
    Undo,

    /// Compile ready shards into a document plus manifest.
    Compile {
        /// Restrict compilation to these shard ids (repeatable).
        #[arg(long = "select")]
        select: Vec<String>,

        /// Write the document here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show store counts, the undo window, and persistence state.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::default()
    };

    let kv = Arc::new(FileKvStore::new(
        config.storage.data_dir.clone(),
        config.storage.quota_bytes,
    ));
    let engine = Collectio::from_config(&config, kv)?;

    let now = Utc::now();
    engine.hydrate(now).await?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
                format!(
                    "Failed to create data directory: {}",
                    config.storage.data_dir.display()
                )
            })?;
            engine.persist_now().await;
            println!("initialized {}", config.storage.data_dir.display());
        }

        Commands::Ingest { input } => {
            let content = read_input(&input)?;
            match engine.ingest(&content).await? {
                IngestOutcome::Ingested(id) => {
                    let shard = engine.shard(&id).expect("shard just ingested");
                    match shard.status {
                        ShardStatus::Ready => {
                            let meta = shard.metadata.as_ref().expect("ready shard has metadata");
                            println!("ingested {}", id);
                            println!("  title:  {}", meta.title);
                            println!("  domain: {}", meta.domain);
                            println!("  tokens: ~{}", shard.token_count);
                        }
                        ShardStatus::Error => {
                            println!("ingested {} (classification failed)", id);
                            println!("  error: {}", shard.error.as_deref().unwrap_or("unknown"));
                            println!("  retry with: collectio retry {}", id);
                        }
                        _ => println!("ingested {} (still indexing)", id),
                    }
                }
                IngestOutcome::Duplicate => {
                    println!("duplicate content, nothing ingested");
                }
                IngestOutcome::Empty => {
                    println!("empty input, nothing ingested");
                }
            }
            engine.persist_now().await;
            report_storage(&engine);
        }

        Commands::List => {
            let groups = engine.display_groups();
            if groups.is_empty() {
                println!("no shards");
            }
            for group in groups {
                println!("{}", group.domain);
                for shard in group.shards {
                    let title = shard
                        .metadata
                        .as_ref()
                        .map(|m| m.title.as_str())
                        .unwrap_or("(unclassified)");
                    println!(
                        "  {}  [{}]  {}  ~{} tokens",
                        shard.id,
                        status_label(shard.status),
                        title,
                        shard.token_count
                    );
                }
            }
        }

        Commands::Show { id } => match engine.shard(&id) {
            Some(shard) => {
                println!("id:        {}", shard.id);
                println!("status:    {}", status_label(shard.status));
                println!("ingested:  {} (seq {})", shard.timestamp, shard.ingest_seq);
                println!("hash:      {}", shard.content_hash);
                println!("tokens:    ~{}", shard.token_count);
                if let Some(meta) = &shard.metadata {
                    println!("title:     {}", meta.title);
                    println!("domain:    {}", meta.domain);
                    println!("tags:      {}", meta.tags.join(", "));
                    println!("abstract:  {}", meta.synopsis);
                }
                if let Some(error) = &shard.error {
                    println!("error:     {}", error);
                }
                println!("---\n{}", shard.content);
            }
            None => println!("no shard with id {}", id),
        },

        Commands::Retry { id } => {
            if engine.retry(&id).await? {
                let shard = engine.shard(&id).expect("shard exists after retry");
                match shard.status {
                    ShardStatus::Ready => println!("reclassified {}", id),
                    _ => println!(
                        "retry failed: {}",
                        shard.error.as_deref().unwrap_or("unknown")
                    ),
                }
                engine.persist_now().await;
                report_storage(&engine);
            } else {
                println!("no active shard with id {}", id);
            }
        }

        Commands::Delete { id } => {
            if engine.delete_shard(&id, now) {
                let state = engine.undo_state(now);
                println!(
                    "deleted {} (undo within {}s: collectio undo)",
                    id,
                    state.ms_remaining / 1000
                );
                engine.persist_now().await;
                report_storage(&engine);
            } else {
                println!("no active shard with id {}", id);
            }
        }

        Commands::Clear => {
            let count = engine.clear_all(now);
            if count == 0 {
                println!("nothing to clear");
            } else {
                let state = engine.undo_state(now);
                println!(
                    "cleared {} shard{} (undo within {}s: collectio undo)",
                    count,
                    if count == 1 { "" } else { "s" },
                    state.ms_remaining / 1000
                );
                engine.persist_now().await;
                report_storage(&engine);
            }
        }

        Commands::Undo => {
            let restored = engine.undo_delete(now);
            if restored == 0 {
                println!("nothing to undo");
            } else {
                println!(
                    "restored {} shard{}",
                    restored,
                    if restored == 1 { "" } else { "s" }
                );
                engine.persist_now().await;
                report_storage(&engine);
            }
        }

        Commands::Compile { select, output } => {
            for id in &select {
                if !engine.toggle_selection(id) {
                    println!("warning: {} is not an active shard, skipping", id);
                }
            }
            let compilation = engine.compile().await;
            println!("compiled {} shards", compilation.shard_count);
            println!("  title: {}", compilation.manifest.title);
            println!("  type:  {}", compilation.manifest.collection_type.as_str());
            println!("  file:  {}", compilation.manifest.suggested_filename);
            match output {
                Some(path) => {
                    std::fs::write(&path, compilation.document).with_context(|| {
                        format!("Failed to write document to {}", path.display())
                    })?;
                    println!("  wrote: {}", path.display());
                }
                None => {
                    if compilation.shard_count > 0 {
                        println!("---");
                        print!("{}", compilation.document);
                    }
                }
            }
        }

        Commands::Status => {
            let shards = engine.active_shards();
            let ready = shards.iter().filter(|s| s.status == ShardStatus::Ready).count();
            let failed = shards.iter().filter(|s| s.status == ShardStatus::Error).count();
            println!("shards: {} active ({} ready, {} failed)", shards.len(), ready, failed);

            let state = engine.undo_state(now);
            if state.can_undo {
                println!(
                    "undo:   {} shard{} restorable for another {}s",
                    state.affected_count,
                    if state.affected_count == 1 { "" } else { "s" },
                    state.ms_remaining / 1000
                );
            } else {
                println!("undo:   nothing pending");
            }

            let usage = engine.usage();
            println!(
                "usage:  {} calls, {} input tokens, {} output tokens",
                usage.calls, usage.input_tokens, usage.output_tokens
            );
            report_storage(&engine);
        }
    }

    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
    }
}

fn status_label(status: ShardStatus) -> &'static str {
    match status {
        ShardStatus::Pending => "pending",
        ShardStatus::Indexing => "indexing",
        ShardStatus::Ready => "ready",
        ShardStatus::Error => "error",
    }
}

fn report_storage(engine: &Collectio) {
    use collectio::persist::StorageError;
    match engine.storage_error() {
        Some(StorageError::QuotaExceeded) => {
            println!("warning: storage quota exceeded, recent changes may not survive a reload");
        }
        Some(StorageError::WriteFailed) => {
            println!("warning: persistence failed, recent changes may not survive a reload");
        }
        None => {}
    }
}
