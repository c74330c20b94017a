//! Enrichment orchestration: configuration, per-record enrichment, checkpointed runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use cinefiles_adapters::{
    adapter_for_source, fetch_user_log, AdapterSettings, CertificationPreference, FixtureAdapter, Hints, Query, SourceAdapter,
};
use cinefiles_core::{
    decade_label, field, halve_rating, is_missing, merge, ErrorLedger, FieldGroup, FieldMap, FieldValue,
    PriorityFields, Record, Source, UserLog,
};
use cinefiles_storage::{HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod checkpoint;
pub mod run;

pub use checkpoint::{CheckpointError, CheckpointManager, CheckpointPaths, RunState, CHECKPOINT_EVERY};
pub use run::{run, spawn_run, RunEvent, RunSummary};

pub const CRATE_NAME: &str = "cinefiles-sync";

pub const DEFAULT_SKIP_MARKER: &str = field::LB_RUNTIME;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no table file configured (set CINEFILES_TABLE or pass one on the command line)")]
    MissingTable,
}

/// `sources.yaml`: which external sources a run may call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    /// Sources the registry does not mention stay enabled.
    pub fn is_enabled(&self, source: Source) -> bool {
        self.sources
            .iter()
            .find(|s| s.source == source)
            .map_or(true, |s| s.enabled)
    }

    pub fn enabled_sources(&self) -> Vec<Source> {
        Source::ALL.into_iter().filter(|s| self.is_enabled(*s)).collect()
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Registry {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Missing file means every source is enabled.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text, path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CineConfig {
    pub workspace_root: PathBuf,
    pub table_file: Option<String>,
    pub tmdb_api_key: Option<String>,
    pub letterboxd_username: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub classification_primary: String,
    pub classification_fallback: String,
    pub skip_marker: String,
}

impl Default for CineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            table_file: None,
            tmdb_api_key: None,
            letterboxd_username: None,
            user_agent: "cinefiles/0.1".to_string(),
            http_timeout_secs: 5,
            classification_primary: "AU".to_string(),
            classification_fallback: "US".to_string(),
            skip_marker: DEFAULT_SKIP_MARKER.to_string(),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl CineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = env_non_empty("CINEFILES_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        let tmdb_api_key = env_non_empty("TMDB_API_KEY").or_else(|| read_api_key_file(&workspace_root));
        Self {
            table_file: env_non_empty("CINEFILES_TABLE"),
            tmdb_api_key,
            letterboxd_username: env_non_empty("LETTERBOXD_USERNAME"),
            user_agent: env_non_empty("CINEFILES_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_non_empty("CINEFILES_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            classification_primary: env_non_empty("CINEFILES_CLASSIFICATION_PRIMARY")
                .unwrap_or(defaults.classification_primary),
            classification_fallback: env_non_empty("CINEFILES_CLASSIFICATION_FALLBACK")
                .unwrap_or(defaults.classification_fallback),
            skip_marker: env_non_empty("CINEFILES_SKIP_MARKER").unwrap_or(defaults.skip_marker),
            workspace_root,
        }
    }

    pub fn table_file(&self) -> Result<&str, ConfigError> {
        self.table_file.as_deref().ok_or(ConfigError::MissingTable)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn load_source_registry(&self) -> Result<SourceRegistry, ConfigError> {
        SourceRegistry::load(&self.registry_path())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn http_fetcher(&self) -> Result<Arc<HttpFetcher>> {
        let http = HttpFetcher::new(self.http_client_config()).context("building http client")?;
        Ok(Arc::new(http))
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            tmdb_api_key: self.tmdb_api_key.clone(),
            certification: CertificationPreference {
                primary: self.classification_primary.clone(),
                fallback: self.classification_fallback.clone(),
            },
            ..AdapterSettings::default()
        }
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig {
            skip_marker: self.skip_marker.clone(),
            ..EnrichConfig::default()
        }
    }
}

fn read_api_key_file(root: &Path) -> Option<String> {
    let text = std::fs::read_to_string(root.join("api_key.txt")).ok()?;
    let key = text.trim();
    (!key.is_empty()).then(|| key.to_string())
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Field whose presence marks a record as already enriched.
    pub skip_marker: String,
    /// Reference year for the un-awarded old film rule.
    pub current_year: i64,
    pub priority: PriorityFields,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            skip_marker: DEFAULT_SKIP_MARKER.to_string(),
            current_year: i64::from(Utc::now().year()),
            priority: PriorityFields::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipMode {
    /// Records carrying the skip marker are left alone.
    #[default]
    SkipEnriched,
    /// Every record is inspected for gaps.
    CheckAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichStatus {
    Skipped,
    AlreadyEnriched,
    Processed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichOutcome {
    pub new_fields: FieldMap,
    pub status: EnrichStatus,
    pub errors_added: Vec<String>,
}

impl EnrichOutcome {
    fn empty(status: EnrichStatus) -> Self {
        Self {
            new_fields: FieldMap::new(),
            status,
            errors_added: Vec::new(),
        }
    }

    /// Whether the record counts toward the checkpoint cadence.
    pub fn enriched(&self) -> bool {
        !self.new_fields.is_empty()
    }
}

/// The enabled adapters plus the rules for folding their output into records.
pub struct Enricher {
    adapters: HashMap<Source, Box<dyn SourceAdapter>>,
    config: EnrichConfig,
}

impl Enricher {
    pub fn new(config: EnrichConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            config,
        }
    }

    pub fn with_adapter(mut self, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }

    pub fn from_adapters<I>(config: EnrichConfig, adapters: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn SourceAdapter>>,
    {
        adapters.into_iter().fold(Self::new(config), Self::with_adapter)
    }

    /// Network-backed adapters for every source the registry enables.
    pub fn live(cine: &CineConfig, registry: &SourceRegistry, http: Arc<HttpFetcher>) -> Self {
        let settings = cine.adapter_settings();
        if registry.is_enabled(Source::Tmdb) && settings.tmdb_api_key.is_none() {
            warn!("no TMDB API key configured; TMDB lookups will find nothing");
        }
        let adapters = registry
            .enabled_sources()
            .into_iter()
            .map(|source| adapter_for_source(source, http.clone(), &settings));
        Self::from_adapters(cine.enrich_config(), adapters)
    }

    /// Canned adapters from a fixture file, for offline runs.
    pub fn from_fixtures(cine: &CineConfig, registry: &SourceRegistry, path: &Path) -> Result<Self> {
        let adapters = FixtureAdapter::load_all(path)?
            .into_iter()
            .filter(|a| registry.is_enabled(a.source()))
            .map(|a| Box::new(a) as Box<dyn SourceAdapter>);
        Ok(Self::from_adapters(cine.enrich_config(), adapters))
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub fn has_source(&self, source: Source) -> bool {
        self.adapters.contains_key(&source)
    }

    /// Fill the record's missing field groups, one source at a time.
    ///
    /// Each group's fields are merged as soon as they arrive so identifiers
    /// found by an earlier source feed the later lookups. Failures land in
    /// `ledger`; nothing here aborts the run. Without a `user_log` the
    /// personal rating column is left as it is.
    pub async fn enrich_one_record(
        &self,
        record: &mut Record,
        user_log: Option<&UserLog>,
        ledger: &mut ErrorLedger,
        skip_mode: SkipMode,
    ) -> EnrichOutcome {
        let Some((title, year)) = record.identity() else {
            let entry = ErrorLedger::identity_missing(record);
            let mut outcome = EnrichOutcome::empty(EnrichStatus::Skipped);
            if ledger.record(entry.clone()) {
                outcome.errors_added.push(entry);
            }
            return outcome;
        };

        if skip_mode == SkipMode::SkipEnriched && record.is_populated(&self.config.skip_marker) {
            debug!(%title, year, "already enriched");
            return EnrichOutcome::empty(EnrichStatus::AlreadyEnriched);
        }

        let span = info_span!("enrich_record", %title, year);
        self.process(record, &title, year, user_log, ledger)
            .instrument(span)
            .await
    }

    async fn process(
        &self,
        record: &mut Record,
        title: &str,
        year: i64,
        user_log: Option<&UserLog>,
        ledger: &mut ErrorLedger,
    ) -> EnrichOutcome {
        let mut outcome = EnrichOutcome::empty(EnrichStatus::Processed);
        let log_error = |ledger: &mut ErrorLedger, source: Source, errors: &mut Vec<String>| {
            let entry = ErrorLedger::not_found(source, title, year);
            if ledger.record(entry.clone()) {
                errors.push(entry);
            }
        };

        for group in FieldGroup::ALL {
            if !is_missing(record, group) {
                continue;
            }
            let source = group.source();
            let Some(adapter) = self.adapters.get(&source) else {
                debug!(source = source.label(), "source disabled");
                continue;
            };

            let hints = hints_for(record, group);
            let needs_imdb = matches!(group, FieldGroup::ExternalRating | FieldGroup::Awards);
            if needs_imdb && hints.imdb_id.is_none() {
                debug!(source = source.label(), "no IMDb id to look up");
                log_error(ledger, source, &mut outcome.errors_added);
                continue;
            }

            info!(source = source.label(), "fetching");
            let query = Query::new(title, year).with_hints(hints);
            let fetched = adapter.fetch(&query).await.into_fields();

            let fields = match (group, fetched) {
                (FieldGroup::ReleaseCrew, Some(mut fields)) => {
                    if record.is_populated(field::FRANCHISE) {
                        fields.shift_remove(field::FRANCHISE);
                    }
                    fields
                }
                (FieldGroup::SocialCatalog, Some(mut fields)) => {
                    if let Some(log) = user_log {
                        let rating = fields
                            .get(field::LB_SLUG)
                            .and_then(FieldValue::as_str)
                            .map(|slug| log.personal_rating(slug))
                            .unwrap_or_default();
                        fields.insert(field::LB_MY_RATING.to_string(), rating);
                    }
                    fields
                }
                (_, Some(fields)) => fields,
                (FieldGroup::Awards, None) => {
                    log_error(ledger, source, &mut outcome.errors_added);
                    self.unawarded_fields(year)
                }
                (_, None) => {
                    log_error(ledger, source, &mut outcome.errors_added);
                    continue;
                }
            };

            for key in merge(record, fields.clone(), &self.config.priority) {
                if let Some(value) = fields.get(&key) {
                    outcome.new_fields.insert(key, value.clone());
                }
            }
        }
        outcome
    }

    /// Zero counts; films older than two years also get empty details so
    /// later runs stop asking.
    fn unawarded_fields(&self, year: i64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(field::AA_NOMINATIONS.to_string(), FieldValue::Integer(0));
        fields.insert(field::AA_WINS.to_string(), FieldValue::Integer(0));
        if year < self.config.current_year - 2 {
            fields.insert(field::AA_DETAILS.to_string(), FieldValue::text(""));
        }
        fields
    }
}

/// Disambiguators the record already holds for `group`'s source.
pub fn hints_for(record: &Record, group: FieldGroup) -> Hints {
    let either = |primary: &str, fallback: &str| record.text(primary).or_else(|| record.text(fallback));
    let imdb_id = match group {
        FieldGroup::Awards => record.text(field::IMDB_ID),
        _ => either(field::IMDB_ID, field::LB_IMDB_ID),
    };
    Hints {
        medium: record.medium(),
        tmdb_id: either(field::TMDB_ID, field::LB_TMDB_ID),
        imdb_id,
        cast: record
            .text(field::LB_CAST)
            .map(|cast| cast.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

/// The user's Letterboxd films, or `None` when no username is set or the log
/// cannot be fetched. A run carries on without it.
pub async fn load_user_log(http: &HttpFetcher, base_url: &str, username: Option<&str>) -> Option<UserLog> {
    let Some(username) = username else {
        warn!("no Letterboxd username configured; personal ratings are left as they are");
        return None;
    };
    match fetch_user_log(http, base_url, username).await {
        Ok(log) => Some(log),
        Err(err) => {
            warn!(username, error = %err, "could not load Letterboxd films; personal ratings are left as they are");
            None
        }
    }
}

/// Append a stub record for every logged film the catalogue does not have yet.
/// Returns the records added, in log order.
pub fn sync_watched(records: &mut Vec<Record>, log: &UserLog) -> Vec<Record> {
    let known: HashSet<String> = records.iter().filter_map(|r| r.text(field::LB_SLUG)).collect();

    let added: Vec<Record> = log
        .iter()
        .filter(|(slug, _)| !known.contains(*slug))
        .map(|(slug, film)| {
            let mut record = Record::new();
            record.set(field::TITLE, film.title.as_str());
            record.set(field::YEAR, film.year.map(FieldValue::Integer).unwrap_or_default());
            record.set(
                field::LB_MY_RATING,
                film.rating.map(|r| FieldValue::Float(halve_rating(r))).unwrap_or_default(),
            );
            record.set(field::LB_SLUG, slug);
            record.set(
                field::DECADE,
                FieldValue::opt_text(film.year.map(decade_label)),
            );
            record.set(field::MEDIUM, FieldValue::Null);
            record.set(field::FRANCHISE, FieldValue::Null);
            record
        })
        .collect();

    if !added.is_empty() {
        info!(added = added.len(), "appended watched films missing from the catalogue");
    }
    records.extend(added.iter().cloned());
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinefiles_core::LoggedFilm;
    use cinefiles_storage::BackoffPolicy;

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.set(*k, v.clone());
        }
        r
    }

    #[test]
    fn registry_defaults_to_enabled_and_honours_switches() {
        let yaml = "sources:\n  - source: rotten-tomatoes\n    enabled: false\n    notes: blocked from this network\n  - source: imdb\n";
        let registry = SourceRegistry::from_yaml(yaml, Path::new("sources.yaml")).unwrap();
        assert!(!registry.is_enabled(Source::RottenTomatoes));
        assert!(registry.is_enabled(Source::Imdb));
        assert!(registry.is_enabled(Source::Tmdb));
        assert_eq!(registry.enabled_sources().len(), 4);
    }

    #[test]
    fn missing_registry_file_enables_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("sources.yaml")).unwrap();
        assert_eq!(registry.enabled_sources(), Source::ALL.to_vec());
    }

    #[test]
    fn api_key_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api_key.txt"), "abc123\n").unwrap();
        assert_eq!(read_api_key_file(dir.path()).as_deref(), Some("abc123"));
        assert_eq!(read_api_key_file(&dir.path().join("nowhere")), None);
    }

    #[test]
    fn hints_prefer_catalogue_ids_over_letterboxd_cross_references() {
        let r = record(&[
            (field::TITLE, FieldValue::text("Dune")),
            (field::YEAR, FieldValue::Integer(2021)),
            (field::MEDIUM, FieldValue::text("Film")),
            (field::LB_TMDB_ID, FieldValue::text("438631")),
            (field::LB_IMDB_ID, FieldValue::text("tt1160419")),
            (field::LB_CAST, FieldValue::text("Timothée Chalamet, Zendaya")),
        ]);
        let hints = hints_for(&r, FieldGroup::ExternalRating);
        assert_eq!(hints.tmdb_id.as_deref(), Some("438631"));
        assert_eq!(hints.imdb_id.as_deref(), Some("tt1160419"));
        assert_eq!(hints.cast, vec!["Timothée Chalamet", "Zendaya"]);
        assert_eq!(hints_for(&r, FieldGroup::Awards).imdb_id, None);
    }

    #[test]
    fn sync_watched_appends_only_unknown_slugs() {
        let mut records = vec![record(&[
            (field::TITLE, FieldValue::text("Alien")),
            (field::YEAR, FieldValue::Integer(1979)),
            (field::LB_SLUG, FieldValue::text("alien")),
        ])];
        let mut log = UserLog::new();
        log.insert(
            "alien",
            LoggedFilm {
                title: "Alien".to_string(),
                year: Some(1979),
                rating: Some(10.0),
            },
        );
        log.insert(
            "dune-2021",
            LoggedFilm {
                title: "Dune".to_string(),
                year: Some(2021),
                rating: Some(7.0),
            },
        );

        let added = sync_watched(&mut records, &log);
        assert_eq!(added.len(), 1);
        assert_eq!(records.len(), 2);
        let dune = &records[1];
        assert_eq!(dune.text(field::DECADE).as_deref(), Some("2020s"));
        assert_eq!(dune.get(field::LB_MY_RATING), Some(&FieldValue::Float(3.5)));
        assert_eq!(dune.get(field::MEDIUM), Some(&FieldValue::Null));
        assert!(sync_watched(&mut records, &log).is_empty());
    }

    #[tokio::test]
    async fn unreachable_watch_log_falls_back_to_none() {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        assert!(load_user_log(&http, "http://127.0.0.1:9", Some("someone")).await.is_none());
        assert!(load_user_log(&http, "http://127.0.0.1:9", None).await.is_none());
    }
}
