//! TMDB v3 JSON API: release/crew group.

use std::sync::Arc;

use async_trait::async_trait;
use cinefiles_core::{field, FieldMap, FieldValue, Source};
use cinefiles_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    join_names, json_at, json_i64, json_str, settle, AdapterError, CertificationPreference, FetchOutcome, Query,
    SourceAdapter,
};

pub const TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

pub struct TmdbAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: Option<String>,
    certification: CertificationPreference,
}

impl TmdbAdapter {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: String,
        api_key: Option<String>,
        certification: CertificationPreference,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            certification,
        }
    }

    async fn lookup(&self, query: &Query) -> Result<Option<FieldMap>, AdapterError> {
        let api_key = self.api_key.as_deref().ok_or(AdapterError::MissingConfig("TMDB API key"))?;
        let series = query.hints.is_series();

        let tmdb_id = match query.hints.tmdb_id.clone() {
            Some(id) => id,
            None => match self.search(api_key, query, series).await? {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let kind = if series { "tv" } else { "movie" };
        let append = if series { "credits" } else { "credits,releases" };
        let url = HttpFetcher::url_with_params(
            &format!("{}/{kind}/{tmdb_id}", self.base_url),
            &[("api_key", api_key), ("append_to_response", append)],
        )?;
        let details: JsonValue = self.http.get_json(Source::Tmdb.source_id(), url.as_str()).await?;

        let mut fields = if series {
            parse_tv_details(&details)
        } else {
            parse_movie_details(&details, &self.certification)
        };
        fields.insert(field::TMDB_ID.to_string(), FieldValue::text(tmdb_id));
        Ok(Some(fields))
    }

    async fn search(&self, api_key: &str, query: &Query, series: bool) -> Result<Option<String>, AdapterError> {
        let year = query.year.to_string();
        let (path, year_param) = if series {
            ("search/tv", "first_air_date_year")
        } else {
            ("search/movie", "year")
        };
        let url = HttpFetcher::url_with_params(
            &format!("{}/{path}", self.base_url),
            &[("api_key", api_key), ("query", &query.title), (year_param, &year)],
        )?;
        let results: JsonValue = self.http.get_json(Source::Tmdb.source_id(), url.as_str()).await?;
        let id = first_result_id(&results);
        debug!(title = %query.title, year = query.year, ?id, "tmdb search");
        Ok(id)
    }
}

#[async_trait]
impl SourceAdapter for TmdbAdapter {
    fn source(&self) -> Source {
        Source::Tmdb
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        settle(Source::Tmdb, query, self.lookup(query).await)
    }
}

pub fn first_result_id(search: &JsonValue) -> Option<String> {
    let first = search.get("results")?.as_array()?.first()?;
    json_i64(first, &["id"]).map(|id| id.to_string())
}

fn directors(details: &JsonValue) -> String {
    let crew = json_at(details, &["credits", "crew"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    join_names(
        crew.iter()
            .filter(|c| json_str(c, &["job"]) == Some("Director"))
            .filter_map(|c| json_str(c, &["name"])),
    )
}

fn origin_countries(details: &JsonValue) -> String {
    let countries = json_at(details, &["origin_country"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    join_names(countries.iter().filter_map(JsonValue::as_str))
}

fn spoken_languages(details: &JsonValue) -> String {
    let languages = json_at(details, &["spoken_languages"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    join_names(languages.iter().filter_map(|l| json_str(l, &["english_name"])))
}

/// Primary country's certification, else the fallback's tagged with its
/// country code, else nothing.
pub fn classification(details: &JsonValue, preference: &CertificationPreference) -> Option<String> {
    let countries = json_at(details, &["releases", "countries"])?.as_array()?;
    let certification_for = |code: &str| {
        countries
            .iter()
            .filter(|c| json_str(c, &["iso_3166_1"]) == Some(code))
            .filter_map(|c| json_str(c, &["certification"]))
            .map(str::trim)
            .find(|c| !c.is_empty())
    };
    if let Some(primary) = certification_for(&preference.primary) {
        return Some(primary.to_string());
    }
    certification_for(&preference.fallback).map(|c| format!("{c} ({})", preference.fallback))
}

pub fn parse_movie_details(details: &JsonValue, preference: &CertificationPreference) -> FieldMap {
    let mut fields = FieldMap::new();
    let int_field = |key: &str| json_i64(details, &[key]).map(FieldValue::Integer).unwrap_or_default();

    fields.insert(field::DIRECTOR.to_string(), FieldValue::text(directors(details)));
    fields.insert(field::RUNTIME.to_string(), int_field("runtime"));
    fields.insert(field::BUDGET.to_string(), int_field("budget"));
    fields.insert(field::BOX_OFFICE.to_string(), int_field("revenue"));
    if let Some(collection) = json_str(details, &["belongs_to_collection", "name"]) {
        fields.insert(
            field::FRANCHISE.to_string(),
            FieldValue::text(collection.replace(" Collection", "")),
        );
    }
    fields.insert(field::COUNTRY_OF_ORIGIN.to_string(), FieldValue::text(origin_countries(details)));
    fields.insert(field::SPOKEN_LANGUAGES.to_string(), FieldValue::text(spoken_languages(details)));
    fields.insert(
        field::CLASSIFICATION.to_string(),
        FieldValue::opt_text(classification(details, preference)),
    );
    fields.insert(
        field::IMDB_ID.to_string(),
        FieldValue::opt_text(json_str(details, &["imdb_id"]).and_then(crate::text_or_none)),
    );
    fields
}

/// Series carry no runtime, money or certification data on TMDB.
pub fn parse_tv_details(details: &JsonValue) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(field::DIRECTOR.to_string(), FieldValue::text(directors(details)));
    fields.insert(field::COUNTRY_OF_ORIGIN.to_string(), FieldValue::text(origin_countries(details)));
    fields.insert(field::SPOKEN_LANGUAGES.to_string(), FieldValue::text(spoken_languages(details)));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dune_details() -> JsonValue {
        json!({
            "id": 438631,
            "imdb_id": "tt1160419",
            "runtime": 155,
            "budget": 165000000,
            "revenue": 402027830,
            "origin_country": ["US"],
            "belongs_to_collection": { "id": 726871, "name": "Dune Collection" },
            "spoken_languages": [
                { "english_name": "English", "iso_639_1": "en" },
                { "english_name": "Mandarin", "iso_639_1": "zh" }
            ],
            "credits": {
                "crew": [
                    { "job": "Producer", "name": "Mary Parent" },
                    { "job": "Director", "name": "Denis Villeneuve" }
                ]
            },
            "releases": {
                "countries": [
                    { "iso_3166_1": "US", "certification": "PG-13" },
                    { "iso_3166_1": "AU", "certification": "M" }
                ]
            }
        })
    }

    #[test]
    fn movie_details_cover_the_release_crew_group() {
        let fields = parse_movie_details(&dune_details(), &CertificationPreference::default());
        assert_eq!(fields.get(field::DIRECTOR), Some(&FieldValue::text("Denis Villeneuve")));
        assert_eq!(fields.get(field::RUNTIME), Some(&FieldValue::Integer(155)));
        assert_eq!(fields.get(field::BOX_OFFICE), Some(&FieldValue::Integer(402027830)));
        assert_eq!(fields.get(field::FRANCHISE), Some(&FieldValue::text("Dune")));
        assert_eq!(fields.get(field::SPOKEN_LANGUAGES), Some(&FieldValue::text("English, Mandarin")));
        assert_eq!(fields.get(field::CLASSIFICATION), Some(&FieldValue::text("M")));
        assert_eq!(fields.get(field::IMDB_ID), Some(&FieldValue::text("tt1160419")));
    }

    #[test]
    fn classification_falls_back_to_tagged_us_rating() {
        let details = json!({
            "releases": { "countries": [
                { "iso_3166_1": "AU", "certification": "" },
                { "iso_3166_1": "US", "certification": "R" }
            ]}
        });
        let pref = CertificationPreference::default();
        assert_eq!(classification(&details, &pref).as_deref(), Some("R (US)"));
        assert_eq!(classification(&json!({ "releases": { "countries": [] } }), &pref), None);
    }

    #[test]
    fn search_takes_first_result() {
        let results = json!({ "results": [{ "id": 438631 }, { "id": 841 }] });
        assert_eq!(first_result_id(&results).as_deref(), Some("438631"));
        assert_eq!(first_result_id(&json!({ "results": [] })), None);
    }

    #[test]
    fn series_details_skip_movie_only_fields() {
        let details = json!({
            "origin_country": ["GB", "US"],
            "spoken_languages": [{ "english_name": "English" }],
            "credits": { "crew": [] }
        });
        let fields = parse_tv_details(&details);
        assert_eq!(fields.get(field::COUNTRY_OF_ORIGIN), Some(&FieldValue::text("GB, US")));
        assert!(!fields.contains_key(field::RUNTIME));
        assert!(!fields.contains_key(field::CLASSIFICATION));
    }
}
