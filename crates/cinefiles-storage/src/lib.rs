//! Durable file formats (tables, snapshots, error logs) + HTTP fetch utilities for CineFiles.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Float64Type, Int32Type, Int64Type};
use arrow_array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use calamine::{Data, Reader, Xlsx};
use chrono::{DateTime, Utc};
use cinefiles_core::{field, ErrorLedger, FieldMap, FieldValue, Record};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use reqwest::StatusCode;
use rust_xlsxwriter::Workbook;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinefiles-storage";

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no file at {0}")]
    NotFound(PathBuf),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("arrow error in {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: ArrowError,
    },
    #[error("parquet error in {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
    #[error("xlsx read error in {path}: {source}")]
    XlsxRead {
        path: PathBuf,
        #[source]
        source: calamine::XlsxError,
    },
    #[error("xlsx write error in {path}: {source}")]
    XlsxWrite {
        path: PathBuf,
        #[source]
        source: rust_xlsxwriter::XlsxError,
    },
    #[error("{0} has no worksheet")]
    NoWorksheet(PathBuf),
    #[error("unsupported table format for {0} (expected .csv, .parquet or .xlsx)")]
    UnsupportedFormat(PathBuf),
    #[error("column `{column}` in {path} has unsupported type {data_type}")]
    UnsupportedColumn {
        path: PathBuf,
        column: String,
        data_type: DataType,
    },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| {
        if source.kind() == std::io::ErrorKind::NotFound && action == "reading" {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::Io {
                action,
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// only ever see the old or the new contents.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(io_error("creating directory", parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cinefiles".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_error("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_error("flushing temp file", &temp_path))?;
    file.sync_all()
        .await
        .map_err(io_error("syncing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "atomically renaming temp file onto",
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Parquet,
    Xlsx,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            "xlsx" => Ok(Self::Xlsx),
            _ => Err(StoreError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Load a catalogue table. Empty cells become `Null`; integer, float and
/// boolean columns keep their type and every other column is read as text.
pub fn load_table(path: &Path) -> Result<Vec<Record>, StoreError> {
    let format = TableFormat::from_path(path)?;
    let mut file = File::open(path).map_err(io_error("reading", path))?;
    let arrow_err = |source| StoreError::Arrow {
        path: path.to_path_buf(),
        source,
    };

    let mut records = Vec::new();
    match format {
        TableFormat::Csv => {
            let csv_format = arrow_csv::reader::Format::default().with_header(true);
            let (inferred, _) = csv_format.infer_schema(&mut file, None).map_err(arrow_err)?;
            file.rewind().map_err(io_error("rewinding", path))?;
            let reader = arrow_csv::ReaderBuilder::new(Arc::new(catalogue_schema(&inferred)))
                .with_header(true)
                .build(file)
                .map_err(arrow_err)?;
            for batch in reader {
                push_batch_records(path, &batch.map_err(arrow_err)?, &mut records)?;
            }
        }
        TableFormat::Parquet => {
            let parquet_err = |source| StoreError::Parquet {
                path: path.to_path_buf(),
                source,
            };
            let reader = ParquetRecordBatchReaderBuilder::try_new(file)
                .map_err(parquet_err)?
                .build()
                .map_err(parquet_err)?;
            for batch in reader {
                push_batch_records(path, &batch.map_err(arrow_err)?, &mut records)?;
            }
        }
        TableFormat::Xlsx => records = read_xlsx(path, BufReader::new(file))?,
    }
    debug!(path = %path.display(), records = records.len(), "loaded table");
    Ok(records)
}

fn catalogue_schema(inferred: &Schema) -> Schema {
    let fields = inferred
        .fields()
        .iter()
        .map(|f| {
            let data_type = match f.data_type() {
                DataType::Int64 | DataType::Float64 | DataType::Boolean => f.data_type().clone(),
                _ => DataType::Utf8,
            };
            ArrowField::new(f.name(), data_type, true)
        })
        .collect::<Vec<_>>();
    Schema::new(fields)
}

fn push_batch_records(path: &Path, batch: &RecordBatch, out: &mut Vec<Record>) -> Result<(), StoreError> {
    let schema = batch.schema();
    let mut rows = (0..batch.num_rows())
        .map(|_| FieldMap::with_capacity(batch.num_columns()))
        .collect::<Vec<_>>();

    for (idx, column) in batch.columns().iter().enumerate() {
        let name = schema.field(idx).name();
        for (row_idx, row) in rows.iter_mut().enumerate() {
            row.insert(name.clone(), cell_value(path, name, column, row_idx)?);
        }
    }
    out.extend(rows.into_iter().map(Record::from_fields));
    Ok(())
}

fn cell_value(path: &Path, name: &str, array: &ArrayRef, row: usize) -> Result<FieldValue, StoreError> {
    if array.is_null(row) {
        return Ok(FieldValue::Null);
    }
    let text = |s: &str| {
        if s.trim().is_empty() {
            FieldValue::Null
        } else {
            FieldValue::text(s)
        }
    };
    let value = match array.data_type() {
        DataType::Utf8 => text(array.as_string::<i32>().value(row)),
        DataType::LargeUtf8 => text(array.as_string::<i64>().value(row)),
        DataType::Int64 => FieldValue::Integer(array.as_primitive::<Int64Type>().value(row)),
        DataType::Int32 => FieldValue::Integer(i64::from(array.as_primitive::<Int32Type>().value(row))),
        DataType::Float64 => FieldValue::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Float32 => FieldValue::Float(f64::from(array.as_primitive::<Float32Type>().value(row))),
        DataType::Boolean => FieldValue::Bool(array.as_boolean().value(row)),
        DataType::Null => FieldValue::Null,
        other => {
            return Err(StoreError::UnsupportedColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
                data_type: other.clone(),
            })
        }
    };
    Ok(value)
}

/// First worksheet, header row first. Numeric columns whose every value is
/// whole become integers, matching what the CSV reader infers.
fn read_xlsx<R: Read + Seek>(path: &Path, reader: R) -> Result<Vec<Record>, StoreError> {
    let xlsx_err = |source| StoreError::XlsxRead {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook: Xlsx<R> = Xlsx::new(reader).map_err(xlsx_err)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| StoreError::NoWorksheet(path.to_path_buf()))?
        .map_err(xlsx_err)?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let columns = header
        .iter()
        .enumerate()
        .map(|(idx, cell)| match cell {
            Data::Empty => format!("Unnamed: {idx}"),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    let body = rows.collect::<Vec<_>>();

    let whole_columns = (0..columns.len())
        .map(|col| {
            let mut numbers = body.iter().filter_map(|row| row.get(col)).filter(|c| !matches!(c, Data::Empty));
            numbers.all(|cell| match cell {
                Data::Int(_) => true,
                Data::Float(f) => f.is_finite() && f.fract() == 0.0,
                _ => false,
            })
        })
        .collect::<Vec<_>>();

    let records = body
        .into_iter()
        .map(|row| {
            let mut fields = FieldMap::with_capacity(columns.len());
            for (col, name) in columns.iter().enumerate() {
                let value = row
                    .get(col)
                    .map(|cell| xlsx_cell_value(cell, whole_columns[col]))
                    .unwrap_or(FieldValue::Null);
                fields.insert(name.clone(), value);
            }
            Record::from_fields(fields)
        })
        .collect();
    Ok(records)
}

fn xlsx_cell_value(cell: &Data, whole_column: bool) -> FieldValue {
    match cell {
        Data::Empty | Data::Error(_) => FieldValue::Null,
        Data::Int(i) => FieldValue::Integer(*i),
        Data::Float(f) if whole_column => FieldValue::Integer(*f as i64),
        Data::Float(f) => FieldValue::Float(*f),
        Data::Bool(b) => FieldValue::Bool(*b),
        Data::String(s) if s.trim().is_empty() => FieldValue::Null,
        Data::String(s) => FieldValue::text(s.as_str()),
        other => FieldValue::text(other.to_string()),
    }
}

fn encode_xlsx(path: &Path, records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let xlsx_err = |source| StoreError::XlsxWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, name) in table_columns(records).iter().enumerate() {
        let col = u16::try_from(col).map_err(|_| xlsx_err(rust_xlsxwriter::XlsxError::RowColumnLimitError))?;
        sheet.write_string(0, col, name.as_str()).map_err(xlsx_err)?;
        for (idx, record) in records.iter().enumerate() {
            let row = u32::try_from(idx + 1).map_err(|_| xlsx_err(rust_xlsxwriter::XlsxError::RowColumnLimitError))?;
            match record.get(name) {
                None | Some(FieldValue::Null) => {}
                Some(FieldValue::Integer(i)) => {
                    sheet.write_number(row, col, *i as f64).map_err(xlsx_err)?;
                }
                Some(FieldValue::Float(f)) => {
                    sheet.write_number(row, col, *f).map_err(xlsx_err)?;
                }
                Some(FieldValue::Bool(b)) => {
                    sheet.write_boolean(row, col, *b).map_err(xlsx_err)?;
                }
                Some(value @ FieldValue::Text(_)) => {
                    sheet.write_string(row, col, value.to_string()).map_err(xlsx_err)?;
                }
            }
        }
    }
    workbook.save_to_buffer().map_err(xlsx_err)
}

/// Union of record keys in first-seen order; identity columns lead an empty table.
pub fn table_columns(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.to_string()) {
                columns.push(key.to_string());
            }
        }
    }
    if columns.is_empty() {
        columns = vec![field::TITLE.to_string(), field::YEAR.to_string()];
    }
    columns
}

fn records_to_batch(records: &[Record]) -> Result<RecordBatch, ArrowError> {
    let columns = table_columns(records);
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|name| ArrowField::new(name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrays = columns
        .iter()
        .map(|name| {
            let values = records
                .iter()
                .map(|r| r.get(name).filter(|v| !v.is_null()).map(ToString::to_string))
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema, arrays)
}

/// Encode records in the table format implied by `path`'s extension.
pub fn encode_table(path: &Path, records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let arrow_err = |source| StoreError::Arrow {
        path: path.to_path_buf(),
        source,
    };
    let mut buf = Vec::new();
    match TableFormat::from_path(path)? {
        TableFormat::Csv => {
            let batch = records_to_batch(records).map_err(arrow_err)?;
            let mut writer = arrow_csv::WriterBuilder::new().with_header(true).build(&mut buf);
            writer.write(&batch).map_err(arrow_err)?;
        }
        TableFormat::Parquet => {
            let parquet_err = |source| StoreError::Parquet {
                path: path.to_path_buf(),
                source,
            };
            let batch = records_to_batch(records).map_err(arrow_err)?;
            let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).map_err(parquet_err)?;
            writer.write(&batch).map_err(parquet_err)?;
            writer.close().map_err(parquet_err)?;
        }
        TableFormat::Xlsx => buf = encode_xlsx(path, records)?,
    }
    Ok(buf)
}

pub async fn store_table(path: &Path, records: &[Record]) -> Result<(), StoreError> {
    let bytes = encode_table(path, records)?;
    write_atomic(path, &bytes).await
}

/// Durable copy of a run: every record plus the error ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<Record>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Snapshot {
    pub fn new(run_id: Uuid, records: Vec<Record>, ledger: &ErrorLedger) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            run_id,
            saved_at: Utc::now(),
            records,
            errors: ledger.entries().map(ToString::to_string).collect(),
        }
    }
}

/// Save files written before the versioned envelope were a bare record array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Versioned(Snapshot),
    Bare(Vec<Record>),
}

pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

pub async fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let bytes = fs::read(path).await.map_err(io_error("reading", path))?;
    let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match file {
        SnapshotFile::Versioned(snapshot) => snapshot,
        SnapshotFile::Bare(records) => Snapshot {
            schema_version: 0,
            run_id: Uuid::nil(),
            saved_at: DateTime::<Utc>::default(),
            records,
            errors: Vec::new(),
        },
    })
}

/// Previous error log contents, or `None` when no log exists yet.
pub async fn read_error_log(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            action: "reading",
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub async fn write_error_log(path: &Path, ledger: &ErrorLedger) -> Result<(), StoreError> {
    write_atomic(path, ledger.to_log_text().as_bytes()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Concurrent requests allowed against one source.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Build `base` with url-encoded query parameters.
    pub fn url_with_params(base: &str, params: &[(&str, &str)]) -> Result<reqwest::Url, FetchError> {
        reqwest::Url::parse_with_params(base, params).map_err(|e| FetchError::InvalidUrl {
            url: base.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let per_source = self.per_source_semaphore(source_id).await;
        let _permit = per_source.acquire_owned().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn get_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url).await?.text())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, source_id: &str, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

/// Read a CSV table from memory; used by fixtures and tests.
pub fn load_csv_bytes(bytes: &[u8]) -> Result<Vec<Record>, StoreError> {
    let path = PathBuf::from("<memory>.csv");
    let arrow_err = |source| StoreError::Arrow {
        path: path.clone(),
        source,
    };
    let csv_format = arrow_csv::reader::Format::default().with_header(true);
    let (inferred, _) = csv_format
        .infer_schema(Cursor::new(bytes), None)
        .map_err(arrow_err)?;
    let reader = arrow_csv::ReaderBuilder::new(Arc::new(catalogue_schema(&inferred)))
        .with_header(true)
        .build(Cursor::new(bytes))
        .map_err(arrow_err)?;
    let mut records = Vec::new();
    for batch in reader {
        push_batch_records(&path, &batch.map_err(arrow_err)?, &mut records)?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_CSV: &str = "Movie Title,Year,Medium,Director,Rating\n\
Dune,2021,Movie,,4.5\n\
1917,2019,Movie,Sam Mendes,\n\
Chernobyl,2019,Mini Series,,3\n";

    #[test]
    fn csv_columns_keep_types_and_empty_cells_are_null() {
        let records = load_csv_bytes(SAMPLE_CSV.as_bytes()).unwrap();
        assert_eq!(records.len(), 3);
        let dune = &records[0];
        assert_eq!(dune.get("Year"), Some(&FieldValue::Integer(2021)));
        assert_eq!(dune.get("Director"), Some(&FieldValue::Null));
        assert_eq!(dune.get("Rating"), Some(&FieldValue::Float(4.5)));
        assert_eq!(records[1].get("Movie Title"), Some(&FieldValue::text("1917")));
        assert_eq!(records[1].get("Rating"), Some(&FieldValue::Null));
        assert_eq!(
            dune.keys().collect::<Vec<_>>(),
            vec!["Movie Title", "Year", "Medium", "Director", "Rating"]
        );
    }

    #[tokio::test]
    async fn csv_and_parquet_tables_reload_identity_fields() {
        let dir = tempdir().expect("tempdir");
        let mut records = load_csv_bytes(SAMPLE_CSV.as_bytes()).unwrap();
        records[0].set("Extra", "only on first");

        for name in ["out.csv", "out.parquet", "out.xlsx"] {
            let path = dir.path().join(name);
            store_table(&path, &records).await.expect("store");
            let loaded = load_table(&path).expect("load");
            assert_eq!(loaded.len(), 3);
            assert_eq!(loaded[0].identity(), Some(("Dune".to_string(), 2021)));
            assert_eq!(loaded[2].text("Medium").as_deref(), Some("Mini Series"));
            assert_eq!(loaded[1].get("Extra"), Some(&FieldValue::Null));
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load_table(Path::new("movies.ods")).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedFormat(_)));
        assert_eq!(TableFormat::from_path(Path::new("Movies.XLSX")).unwrap(), TableFormat::Xlsx);
    }

    #[tokio::test]
    async fn xlsx_tables_keep_value_kinds_and_blank_cells_are_null() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("movies.xlsx");
        let mut records = load_csv_bytes(SAMPLE_CSV.as_bytes()).unwrap();
        records[1].set("Seen", FieldValue::Bool(true));
        records[2].set("Director", "   ");
        store_table(&path, &records).await.expect("store");

        let loaded = load_table(&path).expect("load");
        assert_eq!(loaded.len(), 3);
        assert_eq!(
            loaded[0].keys().collect::<Vec<_>>(),
            vec!["Movie Title", "Year", "Medium", "Director", "Rating", "Seen"]
        );
        assert_eq!(loaded[0].get("Year"), Some(&FieldValue::Integer(2021)));
        assert_eq!(loaded[0].get("Rating"), Some(&FieldValue::Float(4.5)));
        assert_eq!(loaded[2].get("Rating"), Some(&FieldValue::Float(3.0)));
        assert_eq!(loaded[1].get("Movie Title"), Some(&FieldValue::text("1917")));
        assert_eq!(loaded[1].get("Seen"), Some(&FieldValue::Bool(true)));
        assert_eq!(loaded[0].get("Seen"), Some(&FieldValue::Null));
        assert_eq!(loaded[0].get("Director"), Some(&FieldValue::Null));
        assert_eq!(loaded[2].get("Director"), Some(&FieldValue::Null));
    }

    #[tokio::test]
    async fn missing_table_reports_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = load_table(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = read_snapshot(&dir.path().join("absent.json")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn atomic_write_replaces_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("save.json");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn snapshot_reads_versioned_and_bare_files() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = ErrorLedger::new();
        ledger.record("Error: IMDb - No info found for Dune (2021)!");
        let records = load_csv_bytes(SAMPLE_CSV.as_bytes()).unwrap();
        let snapshot = Snapshot::new(Uuid::new_v4(), records.clone(), &ledger);

        let path = dir.path().join("save.json");
        write_snapshot(&path, &snapshot).await.expect("write");
        let loaded = read_snapshot(&path).await.expect("read");
        assert_eq!(loaded, snapshot);

        let bare = dir.path().join("legacy.json");
        std::fs::write(&bare, serde_json::to_vec(&records).unwrap()).unwrap();
        let loaded = read_snapshot(&bare).await.expect("read bare");
        assert_eq!(loaded.schema_version, 0);
        assert_eq!(loaded.records, records);
        assert!(loaded.errors.is_empty());
    }

    #[tokio::test]
    async fn error_log_round_trip_and_absence() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("errors.txt");
        assert!(read_error_log(&path).await.unwrap().is_none());

        let mut ledger = ErrorLedger::new();
        ledger.record("b");
        ledger.record("a");
        write_error_log(&path, &ledger).await.unwrap();
        assert_eq!(read_error_log(&path).await.unwrap().as_deref(), Some("a\nb"));
    }

    #[test]
    fn default_backoff_doubles_from_quarter_second() {
        let policy = HttpClientConfig::default().backoff;
        assert_eq!(policy.max_retries, 2);
        let delays = (0..=policy.max_retries)
            .map(|attempt| policy.delay_for_attempt(attempt))
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ]
        );
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn url_params_are_encoded() {
        let url = HttpFetcher::url_with_params(
            "https://api.example.org/search",
            &[("query", "Dune: Part Two"), ("year", "2024")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.org/search?query=Dune%3A+Part+Two&year=2024"
        );
    }
}
