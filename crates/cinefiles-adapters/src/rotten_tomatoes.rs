//! Rotten Tomatoes search page + scorecard JSON: critic/audience group.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cinefiles_core::{field, FieldMap, FieldValue, Source, NOT_LISTED};
use cinefiles_storage::HttpFetcher;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    element_text, json_at, select_first_text, selector, settle, AdapterError, FetchOutcome, Query, SourceAdapter,
};

pub const ROTTEN_TOMATOES_BASE_URL: &str = "https://www.rottentomatoes.com";

pub struct RottenTomatoesAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRow {
    pub title: String,
    pub year: i64,
    pub cast: Vec<String>,
    pub url: String,
}

impl RottenTomatoesAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, query: &Query) -> Result<Option<FieldMap>, AdapterError> {
        let term = search_term(&query.title);
        let url = HttpFetcher::url_with_params(&format!("{}/search", self.base_url), &[("search", &term)])?;
        let html = self.http.get_text(Source::RottenTomatoes.source_id(), url.as_str()).await?;
        let rows = parse_search_page(&html, query.hints.is_series())?;

        let Some(row) = pick_match(&rows, query) else {
            return Ok(None);
        };
        debug!(title = %query.title, url = %row.url, "rotten tomatoes match");

        let page_url = if row.url.starts_with("http") {
            row.url.clone()
        } else {
            format!("{}{}", self.base_url, row.url)
        };
        let page = self.http.get_text(Source::RottenTomatoes.source_id(), &page_url).await?;
        parse_scorecard(&page)
    }
}

#[async_trait]
impl SourceAdapter for RottenTomatoesAdapter {
    fn source(&self) -> Source {
        Source::RottenTomatoes
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        settle(Source::RottenTomatoes, query, self.lookup(query).await)
    }
}

/// The search box treats punctuation as noise; send letters, digits and spaces.
pub fn search_term(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect()
}

pub fn parse_search_page(html: &str, series: bool) -> Result<Vec<SearchRow>, AdapterError> {
    let document = Html::parse_document(html);
    let (kind, year_attr) = if series {
        ("tvSeries", "startyear")
    } else {
        ("movie", "release-year")
    };
    let rows = selector(&format!("search-page-result[type=\"{kind}\"] search-page-media-row"))?;
    let title_link = selector("a[slot=\"title\"]")?;

    let mut out = Vec::new();
    for row in document.select(&rows) {
        let Some(year) = row.value().attr(year_attr).and_then(|y| y.trim().parse().ok()) else {
            continue;
        };
        let Some(link) = row.select(&title_link).next() else { continue };
        let (Some(title), Some(url)) = (element_text(&link), link.value().attr("href")) else {
            continue;
        };
        let cast = row
            .value()
            .attr("cast")
            .map(|c| {
                c.split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        out.push(SearchRow {
            title,
            year,
            cast,
            url: url.trim().to_string(),
        });
    }
    Ok(out)
}

/// First row within a year of the query whose title matches exactly, or whose
/// listed cast is entirely contained in the cast already known for the record.
pub fn pick_match<'a>(rows: &'a [SearchRow], query: &Query) -> Option<&'a SearchRow> {
    let known: HashSet<&str> = query.hints.cast.iter().map(String::as_str).collect();
    rows.iter().find(|row| {
        query.year_matches(row.year)
            && (row.title == query.title
                || (!row.cast.is_empty() && row.cast.iter().all(|name| known.contains(name.as_str()))))
    })
}

fn score_value(scorecard: &JsonValue, key: &str) -> FieldValue {
    match json_at(scorecard, &[key, "score"]) {
        Some(JsonValue::Number(n)) => n.as_i64().map(FieldValue::Integer).unwrap_or_else(|| {
            n.as_f64().map(FieldValue::Float).unwrap_or_else(|| FieldValue::text(NOT_LISTED))
        }),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s
            .trim()
            .parse::<i64>()
            .map(FieldValue::Integer)
            .unwrap_or_else(|_| FieldValue::text(s.trim())),
        _ => FieldValue::text(NOT_LISTED),
    }
}

/// `None` when the page carries no scorecard at all.
pub fn parse_scorecard(html: &str) -> Result<Option<FieldMap>, AdapterError> {
    let document = Html::parse_document(html);
    let Some(raw) = select_first_text(&document, "script#media-scorecard-json")? else {
        return Ok(None);
    };
    let scorecard: JsonValue =
        serde_json::from_str(&raw).map_err(|e| AdapterError::Message(format!("scorecard json: {e}")))?;

    let mut fields = FieldMap::new();
    fields.insert(field::TOMATOMETER.to_string(), score_value(&scorecard, "criticsScore"));
    fields.insert(field::POPCORNMETER.to_string(), score_value(&scorecard, "audienceScore"));
    Ok(Some(fields))
}
