//! Letterboxd HTML: social-catalog group and the user's watch log.

use std::sync::Arc;

use async_trait::async_trait;
use cinefiles_core::{field, FieldMap, FieldValue, LoggedFilm, Source, UserLog};
use cinefiles_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    element_text, extract_numbers, extract_year, join_names, json_f64, json_i64, select_all_texts,
    select_first_attr, select_first_text, selector, settle, text_or_none, AdapterError, FetchOutcome, Query,
    SourceAdapter,
};

pub const LETTERBOXD_BASE_URL: &str = "https://letterboxd.com";

/// Upper bound on watch-log pages, in case pagination never ends.
const MAX_LOG_PAGES: usize = 500;

pub struct LetterboxdAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub slug: String,
    pub title: Option<String>,
    pub year: Option<i64>,
}

impl LetterboxdAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, query: &Query) -> Result<Option<FieldMap>, AdapterError> {
        let term = query.title.replace('/', " ");
        let mut search_url = HttpFetcher::url_with_params(&format!("{}/s/search/films/", self.base_url), &[])?;
        search_url.set_query(None);
        search_url
            .path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("cannot extend {}", self.base_url)))?
            .pop_if_empty()
            .push(&term)
            .push("");
        let search_html = self.http.get_text(Source::Letterboxd.source_id(), search_url.as_str()).await?;
        let hits = parse_search_results(&search_html)?;

        let Some(hit) = hits.into_iter().find(|h| h.year.is_some_and(|y| query.year_matches(y))) else {
            return Ok(None);
        };
        debug!(title = %query.title, slug = %hit.slug, "letterboxd match");

        let film_url = format!("{}/film/{}/", self.base_url, hit.slug);
        let film_html = self.http.get_text(Source::Letterboxd.source_id(), &film_url).await?;
        let mut fields = parse_film_page(&film_html)?;
        fields.insert(field::LB_SLUG.to_string(), FieldValue::text(hit.slug));
        Ok(Some(fields))
    }
}

#[async_trait]
impl SourceAdapter for LetterboxdAdapter {
    fn source(&self) -> Source {
        Source::Letterboxd
    }

    async fn fetch(&self, query: &Query) -> FetchOutcome {
        settle(Source::Letterboxd, query, self.lookup(query).await)
    }
}

/// Second-to-last path segment, which is where both cross-reference sites put
/// their id (`/movie/438631/`, `/title/tt1160419/maindetails`).
pub fn id_from_link(href: &str) -> Option<String> {
    href.rsplit('/').nth(1).and_then(text_or_none)
}

fn slug_from_href(href: &str) -> Option<String> {
    let mut segments = href.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "film")?;
    segments.next().map(str::to_string)
}

pub fn parse_search_results(html: &str) -> Result<Vec<SearchHit>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("ul.results > li")?;
    let film_link = selector("a[href*=\"/film/\"]")?;
    let title_sel = selector(".film-title-wrapper > a")?;
    let meta_sel = selector(".film-title-wrapper small.metadata")?;

    let mut hits = Vec::new();
    for row in document.select(&rows) {
        let slug = row
            .value()
            .attr("data-film-slug")
            .map(str::to_string)
            .or_else(|| {
                row.select(&film_link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .and_then(slug_from_href)
            });
        let Some(slug) = slug else { continue };
        let year = row
            .select(&meta_sel)
            .next()
            .and_then(|n| element_text(&n))
            .and_then(|t| extract_year(&t));
        let title = row.select(&title_sel).next().and_then(|n| element_text(&n));
        hits.push(SearchHit { slug, title, year });
    }
    Ok(hits)
}

/// JSON-LD blocks on Letterboxd are wrapped in CDATA comments.
fn ld_json(document: &Html) -> Result<Option<JsonValue>, AdapterError> {
    let Some(raw) = select_first_text(document, "script[type=\"application/ld+json\"]")? else {
        return Ok(None);
    };
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Ok(None);
    };
    Ok(serde_json::from_str(&raw[start..=end]).ok())
}

pub fn parse_film_page(html: &str) -> Result<FieldMap, AdapterError> {
    let document = Html::parse_document(html);
    let mut fields = FieldMap::new();

    let ld = ld_json(&document)?;
    let rating = |key: &str| ld.as_ref().and_then(|v| json_f64(v, &["aggregateRating", key]));
    let count = |key: &str| ld.as_ref().and_then(|v| json_i64(v, &["aggregateRating", key]));

    fields.insert(
        field::LB_AVERAGE_RATING.to_string(),
        rating("ratingValue")
            .map(|r| FieldValue::Float((r * 100.0).round() / 100.0))
            .unwrap_or_default(),
    );
    fields.insert(
        field::LB_REVIEW_COUNT.to_string(),
        count("reviewCount").map(FieldValue::Integer).unwrap_or_default(),
    );
    fields.insert(
        field::LB_RATING_COUNT.to_string(),
        count("ratingCount").map(FieldValue::Integer).unwrap_or_default(),
    );

    let cast = select_all_texts(&document, "#tab-cast a.text-slug")?;
    fields.insert(
        field::LB_CAST.to_string(),
        FieldValue::text(join_names(cast.iter().map(|name| name.replace(',', "")))),
    );

    let runtime = select_first_text(&document, "p.text-link.text-footer")?
        .and_then(|t| extract_numbers(&t).first().copied())
        .map(|n| FieldValue::Integer(n as i64))
        .unwrap_or_default();
    fields.insert(field::LB_RUNTIME.to_string(), runtime);

    let tmdb = select_first_attr(&document, "a[data-track-action=\"TMDB\"]", "href")?;
    fields.insert(
        field::LB_TMDB_ID.to_string(),
        FieldValue::opt_text(tmdb.as_deref().and_then(id_from_link)),
    );
    let imdb = select_first_attr(&document, "a[data-track-action=\"IMDb\"]", "href")?;
    fields.insert(
        field::LB_IMDB_ID.to_string(),
        FieldValue::opt_text(imdb.as_deref().and_then(id_from_link)),
    );
    Ok(fields)
}

/// One page of a user's films grid. Ratings are the half-star `rated-N`
/// class, on a ten-point scale.
pub fn parse_log_page(html: &str) -> Result<Vec<(String, LoggedFilm)>, AdapterError> {
    let document = Html::parse_document(html);
    let items = selector("li.poster-container, li.griditem")?;
    let poster = selector("[data-film-slug], [data-item-slug]")?;
    let img = selector("img")?;
    let rating_sel = selector("span.rating")?;

    let mut films = Vec::new();
    for item in document.select(&items) {
        let Some(node) = item.select(&poster).next() else { continue };
        let attrs = node.value();
        let Some(slug) = attrs.attr("data-film-slug").or_else(|| attrs.attr("data-item-slug")) else {
            continue;
        };
        let title = attrs
            .attr("data-film-name")
            .or_else(|| attrs.attr("data-item-name"))
            .map(str::to_string)
            .or_else(|| {
                item.select(&img)
                    .next()
                    .and_then(|i| i.value().attr("alt"))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| slug.to_string());
        let (title, named_year) = split_year_suffix(&title);
        let year = attrs
            .attr("data-film-release-year")
            .and_then(|y| y.trim().parse().ok())
            .or(named_year)
            .or_else(|| disambiguation_year(slug, &title));
        let rating = item.select(&rating_sel).next().and_then(|span| {
            span.value()
                .classes()
                .find_map(|c| c.strip_prefix("rated-"))
                .and_then(|n| n.parse::<f64>().ok())
        });
        films.push((
            slug.to_string(),
            LoggedFilm {
                title,
                year,
                rating,
            },
        ));
    }
    Ok(films)
}

/// `"Title (YYYY)"` split into the bare title and its year.
fn split_year_suffix(title: &str) -> (String, Option<i64>) {
    let trimmed = title.trim();
    if let Some((head, tail)) = trimmed.rsplit_once(" (") {
        if let Some(year) = tail.strip_suffix(')').filter(|y| y.len() == 4).and_then(|y| y.parse().ok()) {
            return (head.trim_end().to_string(), Some(year));
        }
    }
    (trimmed.to_string(), None)
}

/// Letterboxd appends `-YYYY` to the slug of a title it has seen before.
/// A trailing number that belongs to the title itself is not a year.
fn disambiguation_year(slug: &str, title: &str) -> Option<i64> {
    let (_, tail) = slug.rsplit_once('-')?;
    if tail.len() != 4 {
        return None;
    }
    let last_word = title
        .rsplit(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())
        .unwrap_or_default();
    if last_word == tail || title.trim().eq_ignore_ascii_case(slug) {
        return None;
    }
    tail.parse().ok().filter(|y| (1870..=2100).contains(y))
}

/// Walk the user's films pages until one comes back empty.
pub async fn fetch_user_log(http: &HttpFetcher, base_url: &str, username: &str) -> Result<UserLog, FetchError> {
    let base = base_url.trim_end_matches('/');
    let mut log = UserLog::new();
    for page in 1..=MAX_LOG_PAGES {
        let url = format!("{base}/{username}/films/page/{page}/");
        let html = match http.get_text(Source::Letterboxd.source_id(), &url).await {
            Ok(html) => html,
            Err(FetchError::HttpStatus { status: 404, .. }) if page > 1 => break,
            Err(err) => return Err(err),
        };
        let films = parse_log_page(&html).unwrap_or_default();
        if films.is_empty() {
            break;
        }
        for (slug, film) in films {
            log.insert(slug, film);
        }
    }
    info!(username, films = log.len(), "loaded letterboxd watch log");
    Ok(log)
}
