use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cinefiles_adapters::letterboxd::LETTERBOXD_BASE_URL;
use cinefiles_core::Source;
use cinefiles_storage::read_error_log;
use cinefiles_sync::{
    load_user_log, spawn_run, sync_watched, CheckpointError, CheckpointManager, CheckpointPaths, CineConfig,
    Enricher, RunEvent, RunState, SkipMode,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cinefiles")]
#[command(about = "Fill the gaps in a movie catalogue from TMDB, Letterboxd, IMDb, Rotten Tomatoes and the Academy Awards")]
struct Cli {
    /// Workspace holding input/, state/ and output/ (overrides CINEFILES_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct TableArgs {
    /// Table file name inside input/ (overrides CINEFILES_TABLE).
    table: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enrich the catalogue, starting over or from the last save file.
    Enrich {
        #[command(flatten)]
        table: TableArgs,
        /// Continue from the save file instead of re-reading input/.
        #[arg(long)]
        resume: bool,
        /// Inspect every record, even ones already enriched.
        #[arg(long)]
        check_all: bool,
        /// Serve source data from a fixture file instead of the network.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Letterboxd account whose ratings fill the personal rating column.
        #[arg(long)]
        username: Option<String>,
    },
    /// Append films from a Letterboxd watch log that the catalogue lacks.
    SyncWatched {
        #[command(flatten)]
        table: TableArgs,
        #[arg(long)]
        username: Option<String>,
    },
    /// Print the current error log for a table.
    Errors {
        #[command(flatten)]
        table: TableArgs,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = CineConfig::from_env();
    if let Some(root) = cli.root {
        config.workspace_root = root;
    }

    match cli.command {
        Commands::Enrich {
            table,
            resume,
            check_all,
            fixtures,
            username,
        } => {
            apply_table(&mut config, table);
            if username.is_some() {
                config.letterboxd_username = username;
            }
            let skip_mode = if check_all {
                SkipMode::CheckAll
            } else {
                SkipMode::SkipEnriched
            };
            enrich(&config, resume, skip_mode, fixtures).await?;
        }
        Commands::SyncWatched { table, username } => {
            apply_table(&mut config, table);
            if username.is_some() {
                config.letterboxd_username = username;
            }
            watched(&config).await?;
        }
        Commands::Errors { table } => {
            apply_table(&mut config, table);
            print_errors(&config).await?;
        }
    }

    Ok(())
}

fn apply_table(config: &mut CineConfig, args: TableArgs) {
    if args.table.is_some() {
        config.table_file = args.table;
    }
}

fn manager_for(config: &CineConfig) -> Result<CheckpointManager> {
    let table = config.table_file()?;
    Ok(CheckpointManager::new(CheckpointPaths::new(&config.workspace_root, table)))
}

async fn enrich(config: &CineConfig, resume: bool, skip_mode: SkipMode, fixtures: Option<PathBuf>) -> Result<()> {
    let manager = manager_for(config)?;
    let registry = config.load_source_registry()?;

    let (enricher, user_log) = match fixtures {
        Some(path) => (Enricher::from_fixtures(config, &registry, &path)?, None),
        None => {
            let http = config.http_fetcher()?;
            let user_log = if registry.is_enabled(Source::Letterboxd) {
                load_user_log(&http, LETTERBOXD_BASE_URL, config.letterboxd_username.as_deref()).await
            } else {
                None
            };
            (Enricher::live(config, &registry, http), user_log)
        }
    };

    let state = load_state(&manager, resume).await?;
    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stopping after the current record...");
            ctrl_c_stop.store(true, Ordering::SeqCst);
        }
    });

    let (handle, mut events) = spawn_run(
        Arc::new(enricher),
        manager,
        state,
        user_log.map(Arc::new),
        skip_mode,
        stop,
    );
    while let Some(event) = events.recv().await {
        render(&event);
    }
    let (_, summary) = handle.await.context("enrichment task panicked")??;
    if summary.stopped {
        println!("stopped early; rerun with --resume to continue");
    }
    Ok(())
}

async fn load_state(manager: &CheckpointManager, resume: bool) -> Result<RunState> {
    let state = if resume {
        manager.resume().await
    } else {
        manager.start().await
    };
    state.context("loading run state")
}

fn render(event: &RunEvent) {
    match event {
        RunEvent::Started { run_id, total } => println!("run {run_id}: {total} records"),
        RunEvent::Progress { index, total, title } => {
            println!("[{index}/{total}] {}", title.as_deref().unwrap_or("<untitled>"));
        }
        RunEvent::Checkpoint { enriched } => println!("saved progress ({enriched} records enriched)"),
        RunEvent::Finished(summary) => {
            println!(
                "done: enriched={} already_enriched={} skipped={} new_errors={}",
                summary.enriched, summary.already_enriched, summary.skipped, summary.errors_added
            );
            if let Some(output) = &summary.output_table {
                println!("output written to {}", output.display());
            }
        }
    }
}

async fn watched(config: &CineConfig) -> Result<()> {
    if config.letterboxd_username.is_none() {
        bail!("sync-watched needs a Letterboxd username (--username or LETTERBOXD_USERNAME)");
    }
    let manager = manager_for(config)?;
    let http = config.http_fetcher()?;
    let Some(log) = load_user_log(&http, LETTERBOXD_BASE_URL, config.letterboxd_username.as_deref()).await else {
        bail!("could not load the Letterboxd watch log; see the warning above");
    };

    let mut state = match manager.resume().await {
        Ok(state) => state,
        Err(CheckpointError::NoSaveFound { .. }) => manager.start().await?,
        Err(err) => return Err(err.into()),
    };
    let added = sync_watched(&mut state.records, &log);
    manager.persist(&mut state).await?;
    info!(added = added.len(), "watch log synced");
    for record in &added {
        println!(
            "added {} ({})",
            record.title().unwrap_or_default(),
            record.year().map(|y| y.to_string()).unwrap_or_default()
        );
    }
    println!("{} films added; run `enrich --resume` to fill them in", added.len());
    Ok(())
}

async fn print_errors(config: &CineConfig) -> Result<()> {
    let manager = manager_for(config)?;
    let paths = manager.paths();
    for path in [paths.state_errors(), paths.output_errors()] {
        if let Some(text) = read_error_log(&path).await? {
            println!("{}", text);
            return Ok(());
        }
    }
    println!("no error log for {}", paths.table_file());
    Ok(())
}
