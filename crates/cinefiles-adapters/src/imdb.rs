//! imdbapi.dev title lookups: external-rating group.

use std::sync::Arc;

use async_trait::async_trait;
use cinefiles_core::{field, FieldMap, FieldValue, Source, NOT_LISTED};
use cinefiles_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;

use crate::{json_at, json_f64, json_str, settle, AdapterError, FetchOutcome, Query, SourceAdapter};

pub const IMDB_API_BASE_URL: &str = "https://api.imdbapi.dev";

pub struct ImdbAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ImdbAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, query: &Query) -> Result<Option<FieldMap>, AdapterError> {
        let Some(imdb_id) = query.hints.imdb_id.as_deref() else {
            return Ok(None);
        };
        let url = format!("{}/titles/{imdb_id}", self.base_url);
        match self.http.get_json::<JsonValue>(Source::Imdb.source_id(), &url).await {
            Ok(title) => Ok(Some(parse_title(&title))),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SourceAdapter for ImdbAdapter {
    fn source(&self) -> Source {
        Source::Imdb
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        settle(Source::Imdb, query, self.lookup(query).await)
    }
}

/// A title absent from Metacritic has no `metacritic` block at all.
pub fn parse_title(title: &JsonValue) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(
        field::IMDB_RATING.to_string(),
        json_f64(title, &["rating", "aggregateRating"])
            .map(FieldValue::Float)
            .unwrap_or_default(),
    );
    let metascore = json_at(title, &["metacritic", "score"])
        .and_then(JsonValue::as_i64)
        .map(FieldValue::Integer)
        .unwrap_or_else(|| FieldValue::text(NOT_LISTED));
    fields.insert(field::METASCORE.to_string(), metascore);
    fields.insert(
        field::POSTER_URL.to_string(),
        FieldValue::opt_text(json_str(title, &["primaryImage", "url"])),
    );
    fields
}
