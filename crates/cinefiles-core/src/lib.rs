//! Core record model, field groups, gap detection, merge precedence and the error ledger.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cinefiles-core";

/// Column names shared by the engine, the adapters and the table files.
pub mod field {
    pub const TITLE: &str = "Movie Title";
    pub const YEAR: &str = "Year";
    pub const MEDIUM: &str = "Medium";
    pub const FRANCHISE: &str = "Franchise";
    pub const DECADE: &str = "Decade";

    pub const DIRECTOR: &str = "Director";
    pub const RUNTIME: &str = "Runtime (minutes)";
    pub const BUDGET: &str = "Budget";
    pub const BOX_OFFICE: &str = "Box Office";
    pub const COUNTRY_OF_ORIGIN: &str = "Country of Origin";
    pub const SPOKEN_LANGUAGES: &str = "Spoken Languages";
    pub const CLASSIFICATION: &str = "Classification";
    pub const IMDB_ID: &str = "IMDb ID";
    pub const TMDB_ID: &str = "TMDB ID";

    pub const LB_AVERAGE_RATING: &str = "Letterboxd Average Rating";
    pub const LB_MY_RATING: &str = "Letterboxd My Rating";
    pub const LB_REVIEW_COUNT: &str = "Letterboxd Review Count";
    pub const LB_RATING_COUNT: &str = "Letterboxd Rating Count";
    pub const LB_CAST: &str = "Cast (from Letterboxd)";
    pub const LB_RUNTIME: &str = "Runtime (from Letterboxd)";
    pub const LB_TMDB_ID: &str = "TMDB ID (from Letterboxd)";
    pub const LB_IMDB_ID: &str = "IMDb ID (from Letterboxd)";
    pub const LB_SLUG: &str = "Letterboxd Slug";

    pub const IMDB_RATING: &str = "IMDb Rating";
    pub const METASCORE: &str = "Metascore";
    pub const POSTER_URL: &str = "Poster URL";

    pub const TOMATOMETER: &str = "Tomatometer (Critic Score)";
    pub const POPCORNMETER: &str = "Popcornmeter (Audience Score)";

    pub const AA_NOMINATIONS: &str = "Academy Award Nominations";
    pub const AA_WINS: &str = "Academy Award Wins";
    pub const AA_DETAILS: &str = "Academy Award Details";
}

/// Score section exists but carries no number.
pub const NOT_LISTED: &str = "Not Listed";
/// Title is in the user's log but was never rated.
pub const NOT_RATED: &str = "Not Rated";

pub const SERIES_MEDIUMS: &[&str] = &["Mini Series", "Documentary Mini Series"];

pub fn is_series_medium(medium: &str) -> bool {
    SERIES_MEDIUMS.iter().any(|m| m.eq_ignore_ascii_case(medium.trim()))
}

/// One cell of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// `None` maps to `Null`, so optional scraped values drop straight in.
    pub fn opt_text(value: Option<impl Into<String>>) -> Self {
        value.map(|v| Self::Text(v.into())).unwrap_or(Self::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

pub type FieldMap = IndexMap<String, FieldValue>;

/// Schema-less catalogue row. Column order is kept as first seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: FieldMap,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: FieldMap) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Present and not null.
    pub fn is_populated(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    /// Non-null value rendered as text, with blank strings treated as absent.
    pub fn text(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|v| !v.is_null())
            .map(ToString::to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn title(&self) -> Option<String> {
        self.text(field::TITLE)
    }

    pub fn year(&self) -> Option<i64> {
        self.fields.get(field::YEAR).and_then(FieldValue::as_i64)
    }

    /// Title and year, or `None` when the record cannot be looked up.
    pub fn identity(&self) -> Option<(String, i64)> {
        Some((self.title()?, self.year()?))
    }

    pub fn medium(&self) -> Option<String> {
        self.text(field::MEDIUM)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| format!("{:?}", self.fields))
    }
}

impl From<FieldMap> for Record {
    fn from(fields: FieldMap) -> Self {
        Self { fields }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Tmdb,
    Letterboxd,
    Imdb,
    RottenTomatoes,
    AcademyAwards,
}

impl Source {
    pub const ALL: [Source; 5] = [
        Source::Tmdb,
        Source::Letterboxd,
        Source::Imdb,
        Source::RottenTomatoes,
        Source::AcademyAwards,
    ];

    /// Human label used in error entries.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tmdb => "TMDB",
            Self::Letterboxd => "Letterboxd",
            Self::Imdb => "IMDb",
            Self::RottenTomatoes => "Rotten Tomatoes",
            Self::AcademyAwards => "Academy Awards",
        }
    }

    pub fn source_id(self) -> &'static str {
        match self {
            Self::Tmdb => "tmdb",
            Self::Letterboxd => "letterboxd",
            Self::Imdb => "imdb",
            Self::RottenTomatoes => "rotten-tomatoes",
            Self::AcademyAwards => "academy-awards",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fields fetched together from one source. Enrichment walks them in `ALL` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    ReleaseCrew,
    SocialCatalog,
    ExternalRating,
    CriticScore,
    Awards,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 5] = [
        FieldGroup::ReleaseCrew,
        FieldGroup::SocialCatalog,
        FieldGroup::ExternalRating,
        FieldGroup::CriticScore,
        FieldGroup::Awards,
    ];

    pub fn source(self) -> Source {
        match self {
            Self::ReleaseCrew => Source::Tmdb,
            Self::SocialCatalog => Source::Letterboxd,
            Self::ExternalRating => Source::Imdb,
            Self::CriticScore => Source::RottenTomatoes,
            Self::Awards => Source::AcademyAwards,
        }
    }

    /// Gap members. Any absent or null member marks the whole group incomplete.
    pub fn members(self) -> &'static [&'static str] {
        match self {
            Self::ReleaseCrew => &[
                field::DIRECTOR,
                field::RUNTIME,
                field::BUDGET,
                field::BOX_OFFICE,
                field::COUNTRY_OF_ORIGIN,
                field::SPOKEN_LANGUAGES,
                field::CLASSIFICATION,
                field::IMDB_ID,
            ],
            Self::SocialCatalog => &[
                field::LB_AVERAGE_RATING,
                field::LB_REVIEW_COUNT,
                field::LB_RATING_COUNT,
                field::LB_CAST,
                field::LB_RUNTIME,
                field::LB_TMDB_ID,
                field::LB_IMDB_ID,
            ],
            Self::ExternalRating => &[field::IMDB_RATING, field::METASCORE, field::POSTER_URL],
            Self::CriticScore => &[field::TOMATOMETER, field::POPCORNMETER],
            Self::Awards => &[field::AA_NOMINATIONS, field::AA_WINS, field::AA_DETAILS],
        }
    }
}

/// True when any member of `group` is absent from `record` or null.
pub fn is_missing(record: &Record, group: FieldGroup) -> bool {
    group.members().iter().any(|name| !record.is_populated(name))
}

pub fn missing_groups(record: &Record) -> Vec<FieldGroup> {
    FieldGroup::ALL
        .into_iter()
        .filter(|group| is_missing(record, *group))
        .collect()
}

pub const PRIORITY_FIELDS: &[&str] = &[
    field::DIRECTOR,
    field::RUNTIME,
    field::BUDGET,
    field::BOX_OFFICE,
    field::COUNTRY_OF_ORIGIN,
    field::CLASSIFICATION,
    field::IMDB_ID,
    field::IMDB_RATING,
    field::METASCORE,
    field::TOMATOMETER,
    field::POPCORNMETER,
    field::LB_AVERAGE_RATING,
    field::LB_MY_RATING,
    field::AA_NOMINATIONS,
    field::AA_WINS,
    field::AA_DETAILS,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityFields {
    names: HashSet<String>,
}

impl PriorityFields {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

impl Default for PriorityFields {
    fn default() -> Self {
        Self::new(PRIORITY_FIELDS.iter().copied())
    }
}

fn is_identity_key(key: &str) -> bool {
    key == field::TITLE || key == field::YEAR
}

/// Fold freshly fetched fields into `record` and return the keys written.
///
/// Priority keys are pulled out and applied first, then the remainder is
/// bulk-updated. Identity keys are never written.
pub fn merge(record: &mut Record, mut new_fields: FieldMap, priority: &PriorityFields) -> Vec<String> {
    new_fields.retain(|key, _| !is_identity_key(key));

    let priority_keys: Vec<String> = new_fields
        .keys()
        .filter(|key| priority.contains(key))
        .cloned()
        .collect();

    let mut written = Vec::with_capacity(new_fields.len());
    for key in priority_keys {
        if let Some(value) = new_fields.shift_remove(&key) {
            record.fields.insert(key.clone(), value);
            written.push(key);
        }
    }
    for (key, value) in new_fields {
        record.fields.insert(key.clone(), value);
        written.push(key);
    }
    written
}

/// Sorted, deduplicated failure messages accumulated across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLedger {
    entries: BTreeSet<String>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_found(source: Source, title: &str, year: i64) -> String {
        format!("Error: {} - No info found for {title} ({year})!", source.label())
    }

    pub fn identity_missing(record: &Record) -> String {
        format!(
            "Error: Entry needs both title and year to attempt data retrieval - {}!",
            record.to_json_string()
        )
    }

    /// Returns `false` when the entry was already recorded. Fraction slashes
    /// are dropped on the way in so stored entries match the log text.
    pub fn record(&mut self, entry: impl Into<String>) -> bool {
        let entry = entry.into().replace('\u{2044}', "");
        if entry.trim().is_empty() {
            return false;
        }
        self.entries.insert(entry)
    }

    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            self.record(entry);
        }
    }

    /// Merge a newline-separated error log written by an earlier run.
    pub fn absorb_log_text(&mut self, text: &str) {
        self.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()));
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_log_text(&self) -> String {
        self.entries.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Letterboxd stores ratings on a ten-step half-star scale; the catalogue keeps five.
pub fn halve_rating(rating: f64) -> f64 {
    rating / 2.0
}

pub fn decade_label(year: i64) -> String {
    format!("{}s", year.div_euclid(10) * 10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedFilm {
    pub title: String,
    pub year: Option<i64>,
    /// Raw ten-point rating, absent when the film was logged without one.
    pub rating: Option<f64>,
}

/// A user's watch log keyed by slug, in the order the source listed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserLog {
    films: IndexMap<String, LoggedFilm>,
}

impl UserLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slug: impl Into<String>, film: LoggedFilm) {
        self.films.insert(slug.into(), film);
    }

    pub fn get(&self, slug: &str) -> Option<&LoggedFilm> {
        self.films.get(slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LoggedFilm)> {
        self.films.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.films.len()
    }

    pub fn is_empty(&self) -> bool {
        self.films.is_empty()
    }

    /// Halved rating, `Not Rated` for an unrated log entry, `Null` when not logged.
    pub fn personal_rating(&self, slug: &str) -> FieldValue {
        match self.films.get(slug) {
            Some(LoggedFilm {
                rating: Some(rating),
                ..
            }) => FieldValue::Float(halve_rating(*rating)),
            Some(_) => FieldValue::text(NOT_RATED),
            None => FieldValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.set(*k, v.clone());
        }
        r
    }

    #[test]
    fn gap_detection_flags_single_null_member() {
        let r = record(&[
            (field::IMDB_RATING, 7.9.into()),
            (field::METASCORE, FieldValue::Null),
            (field::POSTER_URL, "https://img".into()),
        ]);
        assert!(is_missing(&r, FieldGroup::ExternalRating));

        let mut five = record(&[
            (field::LB_AVERAGE_RATING, 4.1.into()),
            (field::LB_REVIEW_COUNT, 10.into()),
            (field::LB_RATING_COUNT, 20.into()),
            (field::LB_CAST, "A, B".into()),
            (field::LB_RUNTIME, 155.into()),
            (field::LB_TMDB_ID, "438631".into()),
        ]);
        five.set(field::LB_IMDB_ID, FieldValue::Null);
        assert!(is_missing(&five, FieldGroup::SocialCatalog));
        five.set(field::LB_IMDB_ID, "tt1160419");
        assert!(!is_missing(&five, FieldGroup::SocialCatalog));
    }

    #[test]
    fn sentinels_count_as_complete() {
        let r = record(&[
            (field::TOMATOMETER, NOT_LISTED.into()),
            (field::POPCORNMETER, 88.into()),
            (field::AA_NOMINATIONS, 0.into()),
            (field::AA_WINS, 0.into()),
            (field::AA_DETAILS, "".into()),
        ]);
        assert!(!is_missing(&r, FieldGroup::CriticScore));
        assert!(!is_missing(&r, FieldGroup::Awards));
        assert_eq!(missing_groups(&r).len(), 3);
    }

    #[test]
    fn priority_field_overwrites_existing_value() {
        let mut r = record(&[
            (field::TITLE, "Dune".into()),
            (field::YEAR, 2021.into()),
            (field::DIRECTOR, "A".into()),
        ]);
        let mut fetched = FieldMap::new();
        fetched.insert(field::DIRECTOR.to_string(), "B".into());
        let written = merge(&mut r, fetched, &PriorityFields::default());
        assert_eq!(written, vec![field::DIRECTOR.to_string()]);
        assert_eq!(r.get(field::DIRECTOR), Some(&FieldValue::text("B")));
    }

    #[test]
    fn merge_keeps_identity_and_column_order() {
        let mut r = record(&[
            (field::TITLE, "Dune".into()),
            (field::YEAR, 2021.into()),
            ("Notes", "keep me".into()),
            (field::LB_CAST, FieldValue::Null),
        ]);
        let mut fetched = FieldMap::new();
        fetched.insert(field::TITLE.to_string(), "Dune: Part One".into());
        fetched.insert(field::LB_CAST.to_string(), "Timothée Chalamet".into());
        fetched.insert(field::LB_SLUG.to_string(), "dune-2021".into());
        let written = merge(&mut r, fetched, &PriorityFields::default());

        assert_eq!(r.title().as_deref(), Some("Dune"));
        assert_eq!(written, vec![field::LB_CAST.to_string(), field::LB_SLUG.to_string()]);
        let keys: Vec<_> = r.keys().collect();
        assert_eq!(
            keys,
            vec![field::TITLE, field::YEAR, "Notes", field::LB_CAST, field::LB_SLUG]
        );
        assert_eq!(r.get("Notes"), Some(&FieldValue::text("keep me")));
    }

    #[test]
    fn identity_requires_title_and_integral_year() {
        assert!(record(&[(field::TITLE, "Dune".into())]).identity().is_none());
        assert!(record(&[(field::TITLE, "Dune".into()), (field::YEAR, FieldValue::Null)])
            .identity()
            .is_none());
        assert_eq!(
            record(&[(field::TITLE, "1917".into()), (field::YEAR, 2019.0.into())]).identity(),
            Some(("1917".to_string(), 2019))
        );
        assert_eq!(
            record(&[(field::TITLE, FieldValue::Integer(1917)), (field::YEAR, "2019".into())])
                .identity(),
            Some(("1917".to_string(), 2019))
        );
    }

    #[test]
    fn ledger_dedups_and_sorts_across_runs() {
        let mut first = ErrorLedger::new();
        first.record(ErrorLedger::not_found(Source::Imdb, "Dune", 2021));
        first.record(ErrorLedger::not_found(Source::AcademyAwards, "Alien", 1979));
        let log = first.to_log_text();

        let mut second = ErrorLedger::new();
        second.absorb_log_text(&log);
        assert!(!second.record(ErrorLedger::not_found(Source::Imdb, "Dune", 2021)));
        assert_eq!(second.len(), 2);
        assert_eq!(
            second.entries().collect::<Vec<_>>(),
            vec![
                "Error: Academy Awards - No info found for Alien (1979)!",
                "Error: IMDb - No info found for Dune (2021)!",
            ]
        );
    }

    #[test]
    fn fraction_slash_entries_do_not_duplicate_after_reload() {
        let mut ledger = ErrorLedger::new();
        assert!(ledger.record(ErrorLedger::not_found(Source::Tmdb, "Face\u{2044}Off", 1997)));
        let log = ledger.to_log_text();
        assert_eq!(log, "Error: TMDB - No info found for FaceOff (1997)!");

        ledger.absorb_log_text(&log);
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.record(ErrorLedger::not_found(Source::Tmdb, "Face\u{2044}Off", 1997)));
        assert_eq!(ledger.to_log_text(), log);
    }

    #[test]
    fn record_json_round_trips_value_kinds() {
        let text = r#"{"Movie Title":"Dune","Year":2021,"Rating":3.5,"Seen":true,"Director":null}"#;
        let r: Record = serde_json::from_str(text).unwrap();
        assert_eq!(r.get("Year"), Some(&FieldValue::Integer(2021)));
        assert_eq!(r.get("Rating"), Some(&FieldValue::Float(3.5)));
        assert_eq!(r.get("Seen"), Some(&FieldValue::Bool(true)));
        assert_eq!(r.get("Director"), Some(&FieldValue::Null));
        assert_eq!(r.to_json_string(), text);
    }

    #[test]
    fn personal_rating_and_decade() {
        let mut log = UserLog::new();
        log.insert(
            "dune-2021",
            LoggedFilm { title: "Dune".into(), year: Some(2021), rating: Some(9.0) },
        );
        log.insert(
            "alien",
            LoggedFilm { title: "Alien".into(), year: Some(1979), rating: None },
        );
        assert_eq!(log.personal_rating("dune-2021"), FieldValue::Float(4.5));
        assert_eq!(log.personal_rating("alien"), FieldValue::text(NOT_RATED));
        assert_eq!(log.personal_rating("heat"), FieldValue::Null);
        assert_eq!(decade_label(2021), "2020s");
        assert_eq!(decade_label(1999), "1990s");
        assert!(is_series_medium("mini series"));
        assert!(!is_series_medium("Movie"));
    }
}
