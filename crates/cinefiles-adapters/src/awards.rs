//! Academy Awards by IMDb id.

use std::sync::Arc;

use async_trait::async_trait;
use cinefiles_core::{field, FieldMap, FieldValue, Source};
use cinefiles_storage::{FetchError, HttpFetcher};
use serde::Deserialize;

use crate::{settle, AdapterError, FetchOutcome, Query, SourceAdapter};

pub const AWARDS_API_BASE_URL: &str = "https://web-production-b8145.up.railway.app";

pub struct AcademyAwardsAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nomination {
    pub category: String,
    #[serde(default)]
    pub names: Vec<Nominee>,
    #[serde(rename = "isWinner", default)]
    pub is_winner: WinnerFlag,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nominee {
    pub name: String,
}

/// The API reports wins as `"1"`, but older rows use a bare number or bool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum WinnerFlag {
    Text(String),
    Number(i64),
    Bool(bool),
    #[default]
    Unknown,
}

impl WinnerFlag {
    pub fn is_win(&self) -> bool {
        match self {
            Self::Text(s) => s.trim() == "1",
            Self::Number(n) => *n == 1,
            Self::Bool(b) => *b,
            Self::Unknown => false,
        }
    }
}

impl AcademyAwardsAdapter {
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
        let url = format!("{}/awards/imdb/{imdb_id}", self.base_url);
        match self
            .http
            .get_json::<Vec<Nomination>>(Source::AcademyAwards.source_id(), &url)
            .await
        {
            Ok(nominations) => Ok(summarize(&nominations)),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SourceAdapter for AcademyAwardsAdapter {
    fn source(&self) -> Source {
        Source::AcademyAwards
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        settle(Source::AcademyAwards, query, self.lookup(query).await)
    }
}

/// Separators of the details encoding never appear inside a name.
fn clean_name(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, ',' | ';' | ':')).collect::<String>().trim().to_string()
}

/// Nominations, wins and `category; nominees; Winner|Nominee` lines joined
/// by `:`. An empty list means no data.
pub fn summarize(nominations: &[Nomination]) -> Option<FieldMap> {
    if nominations.is_empty() {
        return None;
    }
    let mut wins = 0i64;
    let details = nominations
        .iter()
        .map(|nom| {
            let nominees = nom.names.iter().map(|n| clean_name(&n.name)).collect::<Vec<_>>().join(", ");
            let outcome = if nom.is_winner.is_win() {
                wins += 1;
                "Winner"
            } else {
                "Nominee"
            };
            format!("{}; {nominees}; {outcome}", nom.category)
        })
        .collect::<Vec<_>>()
        .join(":");

    let mut fields = FieldMap::new();
    fields.insert(field::AA_NOMINATIONS.to_string(), FieldValue::Integer(nominations.len() as i64));
    fields.insert(field::AA_WINS.to_string(), FieldValue::Integer(wins));
    fields.insert(field::AA_DETAILS.to_string(), FieldValue::text(details));
    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominations_summarize_into_counts_and_details() {
        let raw = r#"[
            {"category": "Best Picture", "names": [{"name": "Mary Parent"}, {"name": "Denis Villeneuve, Jr."}], "isWinner": "0"},
            {"category": "Sound", "names": [{"name": "Mac Ruth; Mark Mangini"}], "isWinner": "1"},
            {"category": "Visual Effects", "names": [], "isWinner": 1}
        ]"#;
        let nominations: Vec<Nomination> = serde_json::from_str(raw).unwrap();
        let fields = summarize(&nominations).unwrap();
        assert_eq!(fields.get(field::AA_NOMINATIONS), Some(&FieldValue::Integer(3)));
        assert_eq!(fields.get(field::AA_WINS), Some(&FieldValue::Integer(2)));
        assert_eq!(
            fields.get(field::AA_DETAILS),
            Some(&FieldValue::text(
                "Best Picture; Mary Parent, Denis Villeneuve Jr.; Nominee:Sound; Mac Ruth Mark Mangini; Winner:Visual Effects; ; Winner"
            ))
        );
    }

    #[test]
    fn empty_award_list_is_no_data() {
        assert_eq!(summarize(&[]), None);
    }
}
