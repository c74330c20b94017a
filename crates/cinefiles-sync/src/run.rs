//! The record loop, with checkpoints, progress events and a cooperative stop flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinefiles_core::UserLog;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointManager, RunState};
use crate::{EnrichStatus, Enricher, SkipMode};

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started { run_id: Uuid, total: usize },
    /// Emitted before record `index` (1-based) is processed.
    Progress { index: usize, total: usize, title: Option<String> },
    Checkpoint { enriched: usize },
    Finished(RunSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub visited: usize,
    pub enriched: usize,
    pub skipped: usize,
    pub already_enriched: usize,
    pub errors_added: usize,
    pub checkpoints: usize,
    pub stopped: bool,
    /// Set when the run reached the end and wrote its outputs.
    pub output_table: Option<PathBuf>,
}

/// Enrich every record in `state`, flushing every few enriched records and
/// once more at the end. A raised `stop` flag is honoured between records;
/// the state is then persisted without writing the output table.
pub async fn run<F>(
    enricher: &Enricher,
    manager: &CheckpointManager,
    state: &mut RunState,
    user_log: Option<&UserLog>,
    skip_mode: SkipMode,
    stop: &AtomicBool,
    mut progress: F,
) -> Result<RunSummary, CheckpointError>
where
    F: FnMut(RunEvent),
{
    let total = state.records.len();
    let mut summary = RunSummary {
        run_id: state.run_id,
        total,
        ..RunSummary::default()
    };
    info!(run_id = %state.run_id, total, ?skip_mode, "enrichment run started");
    progress(RunEvent::Started {
        run_id: state.run_id,
        total,
    });

    for index in 0..total {
        if stop.load(Ordering::SeqCst) {
            info!(index, "stop requested");
            summary.stopped = true;
            break;
        }
        progress(RunEvent::Progress {
            index: index + 1,
            total,
            title: state.records[index].title(),
        });

        let outcome = {
            let RunState { records, ledger, .. } = &mut *state;
            enricher
                .enrich_one_record(&mut records[index], user_log, ledger, skip_mode)
                .await
        };
        summary.visited += 1;
        summary.errors_added += outcome.errors_added.len();
        match outcome.status {
            EnrichStatus::Skipped => summary.skipped += 1,
            EnrichStatus::AlreadyEnriched => summary.already_enriched += 1,
            EnrichStatus::Processed => {}
        }

        if outcome.enriched() {
            summary.enriched += 1;
            if state.note_enriched() {
                manager.persist(state).await?;
                summary.checkpoints += 1;
                progress(RunEvent::Checkpoint {
                    enriched: summary.enriched,
                });
            }
        }
    }

    if summary.stopped {
        manager.persist(state).await?;
    } else {
        summary.output_table = Some(manager.finish(state).await?);
    }
    info!(
        enriched = summary.enriched,
        errors = state.ledger.len(),
        stopped = summary.stopped,
        "enrichment run finished"
    );
    progress(RunEvent::Finished(summary.clone()));
    Ok(summary)
}

/// Move the run onto a tokio task. Events stream through the returned
/// receiver; the handle yields the final state alongside the summary.
pub fn spawn_run(
    enricher: Arc<Enricher>,
    manager: CheckpointManager,
    mut state: RunState,
    user_log: Option<Arc<UserLog>>,
    skip_mode: SkipMode,
    stop: Arc<AtomicBool>,
) -> (
    JoinHandle<Result<(RunState, RunSummary), CheckpointError>>,
    mpsc::UnboundedReceiver<RunEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let summary = run(
            &enricher,
            &manager,
            &mut state,
            user_log.as_deref(),
            skip_mode,
            &stop,
            |event| {
                if let Err(err) = tx.send(event) {
                    debug!(event = ?err.0, "run event dropped; receiver closed");
                }
            },
        )
        .await?;
        Ok((state, summary))
    });
    (handle, rx)
}
