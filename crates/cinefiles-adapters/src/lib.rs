//! Source adapter contract + concrete adapters for the external catalogue sources.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cinefiles_core::{FieldMap, Source};
use cinefiles_storage::{FetchError, HttpFetcher};
use indexmap::IndexMap;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod awards;
pub mod imdb;
pub mod letterboxd;
pub mod rotten_tomatoes;
pub mod tmdb;

pub use awards::AcademyAwardsAdapter;
pub use imdb::ImdbAdapter;
pub use letterboxd::{fetch_user_log, LetterboxdAdapter};
pub use rotten_tomatoes::RottenTomatoesAdapter;
pub use tmdb::TmdbAdapter;

pub const CRATE_NAME: &str = "cinefiles-adapters";

/// Disambiguators already known about a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hints {
    pub medium: Option<String>,
    pub tmdb_id: Option<String>,
    pub imdb_id: Option<String>,
    pub cast: Vec<String>,
}

impl Hints {
    pub fn is_series(&self) -> bool {
        self.medium
            .as_deref()
            .is_some_and(cinefiles_core::is_series_medium)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub title: String,
    pub year: i64,
    pub hints: Hints,
}

impl Query {
    pub fn new(title: impl Into<String>, year: i64) -> Self {
        Self {
            title: title.into(),
            year,
            hints: Hints::default(),
        }
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    /// Within one year either side, to absorb festival vs. release year drift.
    pub fn year_matches(&self, candidate: i64) -> bool {
        (candidate - self.year).abs() <= 1
    }
}

/// What an adapter hands back. Failures never cross this boundary as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(FieldMap),
    NotFound,
}

impl FetchOutcome {
    pub fn into_fields(self) -> Option<FieldMap> {
        match self {
            Self::Found(fields) if !fields.is_empty() => Some(fields),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(&self, query: &Query) -> FetchOutcome;
}

/// Collapse an adapter's internal result into the uniform outcome.
pub(crate) fn settle(source: Source, query: &Query, result: Result<Option<FieldMap>, AdapterError>) -> FetchOutcome {
    match result {
        Ok(Some(fields)) if !fields.is_empty() => FetchOutcome::Found(fields),
        Ok(_) => {
            debug!(source = source.label(), title = %query.title, year = query.year, "no match");
            FetchOutcome::NotFound
        }
        Err(err) => {
            warn!(source = source.label(), title = %query.title, year = query.year, error = %err, "lookup failed");
            FetchOutcome::NotFound
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationPreference {
    pub primary: String,
    pub fallback: String,
}

impl Default for CertificationPreference {
    fn default() -> Self {
        Self {
            primary: "AU".to_string(),
            fallback: "US".to_string(),
        }
    }
}

/// Everything the adapter factories need, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub tmdb_api_key: Option<String>,
    pub certification: CertificationPreference,
    pub tmdb_base_url: String,
    pub letterboxd_base_url: String,
    pub imdb_base_url: String,
    pub rotten_tomatoes_base_url: String,
    pub awards_base_url: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            tmdb_api_key: None,
            certification: CertificationPreference::default(),
            tmdb_base_url: tmdb::TMDB_BASE_URL.to_string(),
            letterboxd_base_url: letterboxd::LETTERBOXD_BASE_URL.to_string(),
            imdb_base_url: imdb::IMDB_API_BASE_URL.to_string(),
            rotten_tomatoes_base_url: rotten_tomatoes::ROTTEN_TOMATOES_BASE_URL.to_string(),
            awards_base_url: awards::AWARDS_API_BASE_URL.to_string(),
        }
    }
}

pub fn tmdb_adapter(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> TmdbAdapter {
    TmdbAdapter::new(
        http,
        settings.tmdb_base_url.clone(),
        settings.tmdb_api_key.clone(),
        settings.certification.clone(),
    )
}

pub fn letterboxd_adapter(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> LetterboxdAdapter {
    LetterboxdAdapter::new(http, settings.letterboxd_base_url.clone())
}

pub fn imdb_adapter(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> ImdbAdapter {
    ImdbAdapter::new(http, settings.imdb_base_url.clone())
}

pub fn rotten_tomatoes_adapter(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> RottenTomatoesAdapter {
    RottenTomatoesAdapter::new(http, settings.rotten_tomatoes_base_url.clone())
}

pub fn academy_awards_adapter(http: Arc<HttpFetcher>, settings: &AdapterSettings) -> AcademyAwardsAdapter {
    AcademyAwardsAdapter::new(http, settings.awards_base_url.clone())
}

pub fn adapter_for_source(
    source: Source,
    http: Arc<HttpFetcher>,
    settings: &AdapterSettings,
) -> Box<dyn SourceAdapter> {
    match source {
        Source::Tmdb => Box::new(tmdb_adapter(http, settings)),
        Source::Letterboxd => Box::new(letterboxd_adapter(http, settings)),
        Source::Imdb => Box::new(imdb_adapter(http, settings)),
        Source::RottenTomatoes => Box::new(rotten_tomatoes_adapter(http, settings)),
        Source::AcademyAwards => Box::new(academy_awards_adapter(http, settings)),
    }
}

/// Canned responses keyed by `Title (Year)`, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source: Source,
    entries: HashMap<String, Option<FieldMap>>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct FixtureFile(HashMap<Source, IndexMap<String, Option<FieldMap>>>);

pub fn fixture_key(title: &str, year: i64) -> String {
    format!("{title} ({year})")
}

impl FixtureAdapter {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, title: &str, year: i64, fields: FieldMap) -> Self {
        self.entries.insert(fixture_key(title, year), Some(fields));
        self
    }

    pub fn with_not_found(mut self, title: &str, year: i64) -> Self {
        self.entries.insert(fixture_key(title, year), None);
        self
    }

    /// One adapter per source named in the fixture file; sources it omits get
    /// an empty adapter that never finds anything.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<FixtureAdapter>> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let FixtureFile(mut by_source) =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Source::ALL
            .into_iter()
            .map(|source| FixtureAdapter {
                source,
                entries: by_source
                    .remove(&source)
                    .map(|entries| entries.into_iter().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        let entry = self
            .entries
            .get(&fixture_key(&query.title, query.year))
            .cloned()
            .flatten();
        settle(self.source, query, Ok(entry))
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

pub(crate) fn element_text(element: &ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(|n| element_text(&n)))
}

pub(crate) fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).filter_map(|n| element_text(&n)).collect())
}

pub(crate) fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// First plausible release year (four digits, 1870 onwards) in `text`.
pub(crate) fn extract_year(text: &str) -> Option<i64> {
    extract_numbers(text)
        .into_iter()
        .filter(|n| n.fract() == 0.0)
        .map(|n| n as i64)
        .find(|n| (1870..=2100).contains(n))
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

pub(crate) fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_at(value, path)?;
    v.as_i64()
        .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// `names` joined the way the catalogue stores people lists.
pub(crate) fn join_names<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
