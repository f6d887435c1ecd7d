//! # repocore
//!
//! CLI front end over the storage core: a client-side deduplicating,
//! encrypted backup engine built on content-addressed blocks, a local
//! relational catalog, and a pluggable remote object store.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   CLI (clap) │
//!                    └──────┬──────┘
//!                           │
//!      ┌──────────┬─────────┼─────────┬──────────┬──────────┐
//!      ▼          ▼         ▼         ▼          ▼          ▼
//!  ┌────────┐ ┌────────┐ ┌───────┐ ┌───────┐ ┌─────────┐ ┌────────┐
//!  │ Backup │ │ Restore│ │ Purge │ │Compact│ │ Verify  │ │ Repair │
//!  └───┬────┘ └───┬────┘ └───┬───┘ └───┬───┘ └────┬────┘ └───┬────┘
//!      └──────────┴─────────┴─────────┴──────────┴──────────┘
//!                           │
//!                    ┌──────┴──────┐
//!                    │   Catalog   │ (rusqlite)
//!                    └──────┬──────┘
//!                           │
//!                    ┌──────┴──────┐
//!                    │ VolumeQueue │──▶ ObjectStore (local fs, ...)
//!                    └─────────────┘
//! ```

use clap::{Parser, Subcommand};
use repocore::backup;
use repocore::catalog::{self, Catalog, SharedCatalog};
use repocore::compact::{self, CompactOptions};
use repocore::config::{self, Config};
use repocore::error::Result;
use repocore::object_store::{LocalFsStore, ObjectStore, VolumeQueue};
use repocore::progress::{self, ProgressEvent};
use repocore::purge::{self, CompiledSelector, PurgeFilter, PurgeOptions, VersionSelection};
use repocore::restore::{self, RestoreOptions};
use repocore::verify;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// repocore — a deduplicating, encrypted backup engine.
#[derive(Parser, Debug)]
#[command(
    name = "repocore",
    version,
    about = "A client-side deduplicating, encrypted backup engine",
    long_about = "repocore stores backups as content-addressed blocks in a local \
                  catalog, packs them into remote volumes, and keeps the two in \
                  sync through a purge/compact maintenance cycle."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new configuration file
    Init {
        #[arg(short, long, default_value = "repocore.toml")]
        output: PathBuf,
    },

    /// Back up every configured target (or one, with --target)
    Backup {
        #[arg(short, long)]
        target: Option<String>,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Restore a fileset's files
    Restore {
        /// Fileset id to restore (see `list`)
        fileset: i64,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        force: bool,

        #[arg(long, default_value_t = true)]
        verify: bool,

        #[arg(short = 'F', long)]
        filter: Option<Vec<String>>,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// List every fileset in the catalog
    List,

    /// Show what changed between two filesets
    Diff {
        older: i64,
        newer: i64,

        #[arg(short, long)]
        detail: bool,
    },

    /// Drop all but the most recent N filesets
    Prune {
        #[arg(short, long, default_value_t = 5)]
        keep: usize,
    },

    /// Check catalog consistency, optionally against the backend
    Verify {
        /// Also list the backend and reconcile it against the catalog
        #[arg(long)]
        remote: bool,

        /// Delete backend blobs left behind by a crashed session
        #[arg(long)]
        reap: bool,
    },

    /// Remove matching files from one or more fileset versions
    Purge {
        /// Destination/prefix this purge applies to (used to name rewritten volumes)
        destination: String,

        /// Path globs; an entry is purged if it matches any of these
        #[arg(required = true, num_args = 1..)]
        filter: Vec<String>,

        /// Only purge filesets at these version indices (0 = newest)
        #[arg(long, conflicts_with = "time")]
        version: Vec<usize>,

        /// Only purge filesets with exactly this RFC3339 timestamp
        #[arg(long, conflicts_with = "version")]
        time: Vec<String>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        no_auto_compact: bool,

        #[arg(long)]
        no_backend_verification: bool,

        #[arg(long)]
        full_result: bool,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Repack under-referenced dblock volumes to reclaim backend space
    Compact {
        #[arg(long)]
        no_backend_verification: bool,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Reconcile remote-volume rows left mid-transition by a crashed session
    Repair,

    /// Watch configured targets and back them up on an interval
    Watch {
        #[arg(short, long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", colored::Colorize::red("error:"), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Init { output } => cmd_init(output),
        Command::Backup { target, password } => cmd_backup(&cli, target.as_deref(), password.as_deref()).await,
        Command::Restore { fileset, output, force, verify, filter, password } => {
            cmd_restore(&cli, *fileset, output, *force, *verify, filter.clone(), password.as_deref()).await
        }
        Command::List => cmd_list(&cli),
        Command::Diff { older, newer, detail } => cmd_diff(&cli, *older, *newer, *detail),
        Command::Prune { keep } => cmd_prune(&cli, *keep).await,
        Command::Verify { remote, reap } => cmd_verify(&cli, *remote, *reap).await,
        Command::Purge {
            destination,
            filter,
            version,
            time,
            dry_run,
            no_auto_compact,
            no_backend_verification,
            full_result,
            password,
        } => {
            cmd_purge(
                &cli,
                destination,
                filter,
                version,
                time,
                *dry_run,
                *no_auto_compact,
                *no_backend_verification,
                *full_result,
                password.as_deref(),
            )
            .await
        }
        Command::Compact { no_backend_verification, password } => {
            cmd_compact(&cli, *no_backend_verification, password.as_deref()).await
        }
        Command::Repair => cmd_repair(&cli).await,
        Command::Watch { password } => cmd_watch(&cli, password.as_deref()).await,
    }
}

// ─── Command implementations ────────────────────────────────────────────────

fn cmd_init(output: &Path) -> Result<()> {
    config::init_config(output)?;
    eprintln!(
        "{} Created configuration file: {}",
        colored::Colorize::green("✓"),
        output.display(),
    );
    eprintln!("  Edit the file to configure your backup targets, then run:");
    eprintln!("  {} repocore backup", colored::Colorize::bold("$"));
    Ok(())
}

async fn cmd_backup(cli: &Cli, target: Option<&str>, password: Option<&str>) -> Result<()> {
    let cfg = load_config(cli)?;
    let password = resolve_password(password);
    let (catalog, queue) = open_repo(&cfg).await?;

    print_header("Backup");

    let targets: Vec<(&String, &config::BackupTarget)> = match target {
        Some(name) => {
            let t = cfg
                .backup
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("target '{name}' not found in configuration"))?;
            vec![(cfg.backup.get_key_value(name).unwrap().0, t)]
        }
        None => cfg.backup.iter().collect(),
    };

    for (name, target_config) in targets {
        eprintln!(
            "\n{} Backing up: {}",
            colored::Colorize::bold(colored::Colorize::cyan("▶")),
            colored::Colorize::bold(name.as_str()),
        );
        let (sink, rx) = progress::channel();
        let handle = tokio::spawn(print_progress(rx, cli.verbose));
        let outcome = backup::backup_target(&catalog, &queue, &cfg.settings, target_config, password.as_deref(), &sink).await?;
        drop(sink);
        let _ = handle.await;

        eprintln!(
            "  {} fileset #{}: {} file(s), {} new, {} deduplicated, {} stored",
            colored::Colorize::green("✓"),
            outcome.fileset_id,
            outcome.files_total,
            outcome.files_new,
            outcome.files_deduplicated,
            backup::format_size(outcome.bytes_stored),
        );
    }

    Ok(())
}

async fn cmd_restore(
    cli: &Cli,
    fileset_id: i64,
    output: &Path,
    force: bool,
    verify: bool,
    filter: Option<Vec<String>>,
    password: Option<&str>,
) -> Result<()> {
    let cfg = load_config(cli)?;
    let password = resolve_password(password);
    let (catalog, queue) = open_repo(&cfg).await?;

    print_header("Restore");

    eprintln!("  Fileset:   #{fileset_id}");
    eprintln!("  Target:    {}", output.display());
    eprintln!();

    let opts = RestoreOptions {
        target_dir: output.to_path_buf(),
        password: password.as_deref(),
        force,
        verify,
        filter,
        verbose: cli.verbose,
    };
    let (sink, rx) = progress::channel();
    let handle = tokio::spawn(print_progress(rx, cli.verbose));
    let stats = restore::restore_fileset(&catalog, queue.store(), &cfg.settings, fileset_id, &opts, &sink).await?;
    drop(sink);
    let _ = handle.await;

    eprintln!();
    eprintln!(
        "  {} Restored {} files ({})",
        colored::Colorize::green("✓"),
        stats.files_restored,
        backup::format_size(stats.bytes_restored),
    );

    Ok(())
}

fn cmd_list(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let catalog = open_catalog_only(&cfg)?;

    let ids = catalog.get_fileset_ids()?;
    if ids.is_empty() {
        eprintln!("No filesets found.");
        return Ok(());
    }

    eprintln!("{:>4}  {:>6}  {:25}  {:6}  {:>8}", "#", "id", "timestamp", "full?", "files");
    eprintln!("{}", "─".repeat(60));

    for (i, id) in ids.iter().rev().enumerate() {
        let Some(fs) = catalog.get_fileset(*id)? else { continue };
        let entries = catalog.fileset_entries(*id)?;
        eprintln!(
            "{:>4}  {:>6}  {:25}  {:6}  {:>8}",
            i,
            fs.id,
            fs.timestamp.format("%Y-%m-%d %H:%M:%S"),
            if fs.is_full_backup { "yes" } else { "no" },
            entries.len(),
        );
    }

    eprintln!();
    eprintln!("  {} fileset(s)", ids.len());
    Ok(())
}

fn cmd_diff(cli: &Cli, older_id: i64, newer_id: i64, detail: bool) -> Result<()> {
    let cfg = load_config(cli)?;
    let catalog = open_catalog_only(&cfg)?;

    let older_entries = catalog.fileset_entries(older_id)?;
    let newer_entries = catalog.fileset_entries(newer_id)?;

    let older_paths: std::collections::HashMap<&str, i64> = older_entries
        .iter()
        .map(|(f, _)| (f.path.as_str(), f.content_blockset_id.unwrap_or(-1)))
        .collect();
    let newer_paths: std::collections::HashMap<&str, i64> = newer_entries
        .iter()
        .map(|(f, _)| (f.path.as_str(), f.content_blockset_id.unwrap_or(-1)))
        .collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut removed = Vec::new();

    for (path, blockset) in &newer_paths {
        match older_paths.get(path) {
            None => added.push(*path),
            Some(old_blockset) if old_blockset != blockset => modified.push(*path),
            _ => {}
        }
    }
    for path in older_paths.keys() {
        if !newer_paths.contains_key(path) {
            removed.push(*path);
        }
    }
    added.sort_unstable();
    modified.sort_unstable();
    removed.sort_unstable();

    eprintln!("  Comparing fileset #{older_id} -> #{newer_id}");
    eprintln!(
        "  {} added, {} modified, {} removed",
        added.len(),
        modified.len(),
        removed.len(),
    );

    if detail {
        for p in &added {
            eprintln!("  {} {p}", colored::Colorize::green("+"));
        }
        for p in &modified {
            eprintln!("  {} {p}", colored::Colorize::yellow("~"));
        }
        for p in &removed {
            eprintln!("  {} {p}", colored::Colorize::red("-"));
        }
    }

    Ok(())
}

async fn cmd_prune(cli: &Cli, keep: usize) -> Result<()> {
    let cfg = load_config(cli)?;
    let mut catalog = open_catalog_only(&cfg)?;

    print_header("Prune");

    let ids = catalog.get_fileset_ids()?; // oldest first
    if ids.len() <= keep {
        eprintln!("  Nothing to prune (≤{keep} fileset(s) exist).");
        return Ok(());
    }

    let drop_count = ids.len() - keep;
    let to_drop = &ids[..drop_count];

    // Each dropped fileset may own a dfileset volume (its manifest blob). Retire
    // those the same way purge does, rather than leaving them permanently
    // `Uploaded`/`Verified` with no candidate path ever considering them again
    // (compact only ever looks at dblock volumes).
    let mut orphaned_volumes = Vec::new();
    for &id in to_drop {
        if let Some(fileset) = catalog.get_fileset(id)? {
            if let Some(volume_id) = fileset.remote_volume_id {
                orphaned_volumes.push(volume_id);
            }
        }
    }

    catalog.drop_filesets_from_table(to_drop)?;
    let freed_blocks = catalog.sweep_orphans()?;

    if !orphaned_volumes.is_empty() {
        let queue = VolumeQueue::spawn(open_store(&cfg)?, None);
        for volume_id in &orphaned_volumes {
            if let Some(volume) = catalog.get_remote_volume(*volume_id)? {
                catalog.update_remote_volume(*volume_id, repocore::model::VolumeState::Deleting, None)?;
                queue.delete(volume.name).await?;
            }
        }
        queue.wait_for_empty().await?;
    }

    eprintln!(
        "  {} Pruned {} fileset(s), freed {} orphaned block(s), retired {} dfileset volume(s)",
        colored::Colorize::green("✓"),
        to_drop.len(),
        freed_blocks.len(),
        orphaned_volumes.len(),
    );
    eprintln!(
        "  Note: freed blocks' backend bytes are reclaimed by a subsequent `compact` run."
    );

    Ok(())
}

async fn cmd_verify(cli: &Cli, remote: bool, reap: bool) -> Result<()> {
    let cfg = load_config(cli)?;
    let catalog = open_catalog_only(&cfg)?;

    print_header("Verify");

    verify::verify_local(&catalog)?;
    eprintln!("  {} Catalog self-consistency ok", colored::Colorize::green("✓"));

    if remote || reap {
        let store = open_store(&cfg)?;
        let report = verify::verify_remote(&catalog, store.as_ref()).await?;
        eprintln!(
            "  {} Backend reconciled: {} scheduled for deletion",
            colored::Colorize::green("✓"),
            report.scheduled_for_deletion.len(),
        );
        if reap {
            verify::reap_scheduled(&store, &report).await?;
            eprintln!("  {} Reaped {} abandoned blob(s)", colored::Colorize::green("✓"), report.scheduled_for_deletion.len());
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_purge(
    cli: &Cli,
    destination: &str,
    filters: &[String],
    versions: &[usize],
    times: &[String],
    dry_run: bool,
    no_auto_compact: bool,
    no_backend_verification: bool,
    full_result: bool,
    password: Option<&str>,
) -> Result<()> {
    let cfg = load_config(cli)?;
    let password = resolve_password(password);
    let mut catalog = Catalog::open(&catalog_path(&cfg))?;

    print_header("Purge");

    let filter = PurgeFilter::AnyOf(
        filters
            .iter()
            .map(|f| match glob::Pattern::new(f) {
                Ok(pattern) => PurgeFilter::PathGlob(pattern),
                Err(_) => PurgeFilter::CatalogSelector(CompiledSelector(f.clone())),
            })
            .collect(),
    );

    let selection = if !versions.is_empty() {
        VersionSelection::Versions(versions.to_vec())
    } else if !times.is_empty() {
        let parsed: std::result::Result<Vec<_>, _> = times
            .iter()
            .map(|t| chrono::DateTime::parse_from_rfc3339(t).map(|dt| dt.with_timezone(&chrono::Utc)))
            .collect();
        VersionSelection::Times(parsed.map_err(|e| anyhow::anyhow!("invalid --time value: {e}"))?)
    } else {
        VersionSelection::All
    };

    let options = PurgeOptions {
        dry_run,
        no_auto_compact,
        no_backend_verification,
        full_result,
        prefix: destination.to_string(),
        compression: cfg.settings.compression,
        compression_level: cfg.settings.zstd_level,
        password: password.clone(),
    };

    let queue = VolumeQueue::spawn(open_store(&cfg)?, None);

    let (sink, rx) = progress::channel();
    let handle = tokio::spawn(print_progress(rx, cli.verbose));
    let report = purge::run_purge(&mut catalog, Some(&queue), &filter, &selection, &options, &sink).await?;
    drop(sink);
    let _ = handle.await;

    eprintln!(
        "  {} {} fileset(s) rewritten, {} unchanged, {} entries removed",
        colored::Colorize::green("✓"),
        report.filesets_rewritten,
        report.filesets_unchanged,
        report.entries_removed,
    );
    if let Some(compact_report) = &report.compact {
        eprintln!(
            "  auto-compact: {} volume(s) rewritten, {} deleted outright, {} reclaimed",
            compact_report.volumes_rewritten,
            compact_report.volumes_deleted_outright,
            backup::format_size(compact_report.bytes_reclaimed),
        );
    }
    if full_result {
        eprintln!("{report:#?}");
    }

    Ok(())
}

async fn cmd_compact(cli: &Cli, no_backend_verification: bool, password: Option<&str>) -> Result<()> {
    let cfg = load_config(cli)?;
    let password = resolve_password(password);
    let mut catalog = Catalog::open(&catalog_path(&cfg))?;

    print_header("Compact");

    let queue = VolumeQueue::spawn(open_store(&cfg)?, None);

    let options = CompactOptions {
        wasted_threshold: cfg.settings.purge.wasted_threshold,
        wasted_bytes_threshold: cfg.settings.purge.wasted_bytes_threshold,
        prefix: "repocore".into(),
        compression: cfg.settings.compression,
        compression_level: cfg.settings.zstd_level,
        password,
        no_backend_verification,
    };

    let (sink, rx) = progress::channel();
    let handle = tokio::spawn(print_progress(rx, cli.verbose));
    let report = compact::run_compact(&mut catalog, Some(&queue), &options, &sink).await?;
    drop(sink);
    let _ = handle.await;

    eprintln!(
        "  {} {} volume(s) rewritten, {} deleted outright, {} reclaimed",
        colored::Colorize::green("✓"),
        report.volumes_rewritten,
        report.volumes_deleted_outright,
        backup::format_size(report.bytes_reclaimed),
    );

    Ok(())
}

async fn cmd_repair(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let catalog = open_catalog_only(&cfg)?;
    let store = open_store(&cfg)?;

    print_header("Repair");

    let report = verify::repair(&catalog, store.as_ref()).await?;
    eprintln!(
        "  {} {} volume(s) promoted to uploaded, {} promoted to deleted, {} abandoned upload(s)",
        colored::Colorize::green("✓"),
        report.promoted_to_uploaded,
        report.promoted_to_deleted,
        report.abandoned_uploads,
    );

    Ok(())
}

async fn cmd_watch(cli: &Cli, password: Option<&str>) -> Result<()> {
    let cfg = load_config(cli)?;
    let password = resolve_password(password);
    let (catalog, queue) = open_repo(&cfg).await?;

    let interval = cfg.settings.interval;
    eprintln!(
        "  {} Watching {} target(s) every {}s (Ctrl+C to stop)",
        colored::Colorize::cyan("👁"),
        cfg.backup.len(),
        interval,
    );

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        eprintln!(
            "\n  {} {}",
            colored::Colorize::dimmed("───"),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        for (name, target_config) in &cfg.backup {
            let (sink, _rx) = progress::channel();
            match backup::backup_target(&catalog, &queue, &cfg.settings, target_config, password.as_deref(), &sink).await {
                Ok(outcome) => eprintln!("  {} {name}: fileset #{}", colored::Colorize::green("✓"), outcome.fileset_id),
                Err(e) => eprintln!("  {} {name}: {e}", colored::Colorize::red("✗")),
            }
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(path) = &cli.config {
        config::load_config_from(path)
    } else {
        config::load_config()
    }
}

fn resolve_password(password: Option<&str>) -> Option<String> {
    password
        .map(String::from)
        .or_else(|| std::env::var("REPOCORE_PASSWORD").ok())
}

fn catalog_path(cfg: &Config) -> PathBuf {
    cfg.settings.repo_path.join("catalog.db")
}

fn open_catalog_only(cfg: &Config) -> Result<Catalog> {
    Catalog::open(&catalog_path(cfg))
}

/// Opens the backend object store named by `settings.backend`. Only the
/// `local` kind (a directory on disk) is implemented; any other kind is
/// represented solely by the `ObjectStore` trait contract.
fn open_store(cfg: &Config) -> Result<Arc<dyn ObjectStore>> {
    match cfg.settings.backend.kind.as_str() {
        "local" => {
            let root = cfg
                .settings
                .backend
                .params
                .get("path")
                .map(PathBuf::from)
                .unwrap_or_else(|| cfg.settings.repo_path.join("remote"));
            Ok(Arc::new(LocalFsStore::new(root)?))
        }
        other => Err(anyhow::anyhow!("backend kind '{other}' is not implemented").into()),
    }
}

/// Opens the catalog and backend together, wiring the catalog's flush hook
/// into a fresh upload queue (spec.md §4.1).
async fn open_repo(cfg: &Config) -> Result<(SharedCatalog, VolumeQueue)> {
    let catalog: SharedCatalog = Arc::new(Mutex::new(Catalog::open(&catalog_path(cfg))?));
    let store = open_store(cfg)?;
    let hook = catalog::flush_hook(catalog.clone());
    let queue = VolumeQueue::spawn(store, Some(hook));
    Ok((catalog, queue))
}

/// Renders progress events to stderr as they arrive, until the sink is dropped.
async fn print_progress(mut rx: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>, verbose: bool) {
    if !verbose {
        while rx.recv().await.is_some() {}
        return;
    }
    while let Some(ev) = rx.recv().await {
        eprint!("\r  {} {:>5.1}%", ev.phase, ev.fraction * 100.0);
    }
    eprintln!();
}

fn print_header(action: &str) {
    eprintln!();
    eprintln!(
        "  {} repocore v{} — {action}",
        colored::Colorize::bold("⚡"),
        env!("CARGO_PKG_VERSION"),
    );
    eprintln!();
}
