//! Durable run state: load a fresh table or a save file, flush snapshots, write final outputs.

use std::path::{Path, PathBuf};

use cinefiles_core::{ErrorLedger, Record};
use cinefiles_storage::{
    load_table, read_error_log, read_snapshot, store_table, write_error_log, write_snapshot, Snapshot, StoreError,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Enriched records between two snapshots.
pub const CHECKPOINT_EVERY: usize = 6;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no save file for {table} (expected {}); start from the beginning to create one", path.display())]
    NoSaveFound { table: String, path: PathBuf },
    #[error("no source table {table} (expected {})", path.display())]
    NoSourceFound { table: String, path: PathBuf },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// File layout of one catalogue table under the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    root: PathBuf,
    table_file: String,
}

impl CheckpointPaths {
    pub fn new(root: impl Into<PathBuf>, table_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            table_file: table_file.into(),
        }
    }

    pub fn table_file(&self) -> &str {
        &self.table_file
    }

    pub fn stem(&self) -> String {
        Path::new(&self.table_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.table_file.clone())
    }

    pub fn source_table(&self) -> PathBuf {
        self.root.join("input").join(&self.table_file)
    }

    pub fn save_file(&self) -> PathBuf {
        self.root.join("state").join(format!("{}_save_file.json", self.stem()))
    }

    pub fn state_errors(&self) -> PathBuf {
        self.root.join("state").join(format!("{}_errors.txt", self.stem()))
    }

    pub fn output_table(&self) -> PathBuf {
        self.root.join("output").join(format!("output-{}", self.table_file))
    }

    pub fn output_errors(&self) -> PathBuf {
        self.root.join("output").join(format!("output-{}_errors.txt", self.stem()))
    }
}

/// Records, the error ledger and the count of records enriched since the last flush.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: Uuid,
    pub records: Vec<Record>,
    pub ledger: ErrorLedger,
    pub since_checkpoint: usize,
}

impl RunState {
    pub fn new(records: Vec<Record>, ledger: ErrorLedger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            records,
            ledger,
            since_checkpoint: 0,
        }
    }

    /// Count one enriched record; true when a checkpoint is due.
    pub fn note_enriched(&mut self) -> bool {
        self.since_checkpoint += 1;
        self.since_checkpoint >= CHECKPOINT_EVERY
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    paths: CheckpointPaths,
}

impl CheckpointManager {
    pub fn new(paths: CheckpointPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    /// Fresh run from `input/<table>`. Clears any error log left by an earlier run.
    pub async fn start(&self) -> Result<RunState, CheckpointError> {
        let path = self.paths.source_table();
        let records = load_table(&path).map_err(|err| match err {
            StoreError::NotFound(path) => CheckpointError::NoSourceFound {
                table: self.paths.table_file.clone(),
                path,
            },
            other => CheckpointError::Store(other),
        })?;
        write_error_log(&self.paths.state_errors(), &ErrorLedger::new()).await?;
        info!(table = %self.paths.table_file, records = records.len(), "loaded source table");
        Ok(RunState::new(records, ErrorLedger::new()))
    }

    /// Continue from the last snapshot.
    pub async fn resume(&self) -> Result<RunState, CheckpointError> {
        let path = self.paths.save_file();
        let snapshot = read_snapshot(&path).await.map_err(|err| match err {
            StoreError::NotFound(path) => CheckpointError::NoSaveFound {
                table: self.paths.table_file.clone(),
                path,
            },
            other => CheckpointError::Store(other),
        })?;

        let mut ledger = ErrorLedger::new();
        ledger.extend(snapshot.errors);
        if let Some(text) = read_error_log(&self.paths.state_errors()).await? {
            ledger.absorb_log_text(&text);
        }
        info!(
            table = %self.paths.table_file,
            records = snapshot.records.len(),
            previous_run = %snapshot.run_id,
            saved_at = %snapshot.saved_at,
            "resumed from save file"
        );
        Ok(RunState::new(snapshot.records, ledger))
    }

    /// Snapshot plus state error log. Errors already in the state log are
    /// folded into the ledger first so nothing logged earlier is lost.
    pub async fn persist(&self, state: &mut RunState) -> Result<(), CheckpointError> {
        let errors_path = self.paths.state_errors();
        if let Some(text) = read_error_log(&errors_path).await? {
            state.ledger.absorb_log_text(&text);
        }
        let snapshot = Snapshot::new(state.run_id, state.records.clone(), &state.ledger);
        write_snapshot(&self.paths.save_file(), &snapshot).await?;
        write_error_log(&errors_path, &state.ledger).await?;
        state.since_checkpoint = 0;
        debug!(records = state.records.len(), errors = state.ledger.len(), "checkpoint written");
        Ok(())
    }

    /// Final flush: persist, then the output table and output error log.
    pub async fn finish(&self, state: &mut RunState) -> Result<PathBuf, CheckpointError> {
        self.persist(state).await?;
        let output = self.paths.output_table();
        store_table(&output, &state.records).await?;
        write_error_log(&self.paths.output_errors(), &state.ledger).await?;
        info!(output = %output.display(), errors = state.ledger.len(), "run outputs written");
        Ok(output)
    }
}
