use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{classify_status, AppResult, FetchError};
use crate::grid::Cell;

const PAGE_SIZE: u8 = 20;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_ERROR_BODY_CHARS: usize = 300;

const NEARBY_SEARCH_FIELDS: &str = "places.id,places.displayName,places.formattedAddress,places.location,places.types,places.rating,places.userRatingCount,places.priceLevel,places.websiteUri,places.nationalPhoneNumber,places.businessStatus,places.reviewSummary";
const PLACE_DETAILS_FIELDS: &str = "id,displayName,reviews,generativeSummary,reviewSummary";

/// A place as returned by one cell query. `raw` is the API object and becomes
/// the base of the merged output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub website_uri: Option<String>,
    pub raw: Value,
}

impl SearchHit {
    /// `None` when the object has no usable `id`.
    pub fn from_place(raw: Value) -> Option<Self> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        let name = raw
            .pointer("/displayName/text")
            .or_else(|| raw.get("displayName"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let lat = raw
            .pointer("/location/latitude")
            .and_then(Value::as_f64)
            .unwrap_or(f64::NAN);
        let lng = raw
            .pointer("/location/longitude")
            .and_then(Value::as_f64)
            .unwrap_or(f64::NAN);
        let website_uri = raw
            .get("websiteUri")
            .and_then(Value::as_str)
            .filter(|uri| !uri.trim().is_empty())
            .map(str::to_string);
        Some(Self {
            id,
            name,
            lat,
            lng,
            website_uri,
            raw,
        })
    }

    pub fn has_location(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

/// Hits for one cell plus the number of places the API actually returned.
/// `raw_count` is taken before any local filtering so a truncated cell is
/// still recognisable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub raw_count: usize,
}

impl SearchPage {
    pub fn from_places(places: Vec<Value>) -> Self {
        let raw_count = places.len();
        Self {
            hits: places.into_iter().filter_map(SearchHit::from_place).collect(),
            raw_count,
        }
    }
}

/// The two calls the collector needs from a place search backend.
#[async_trait]
pub trait PlacesApi: Send + Sync {
    async fn search(&self, cell: &Cell) -> Result<SearchPage, FetchError>;
    async fn detail(&self, place_id: &str) -> Result<Value, FetchError>;
}

/// Google Places API (New) adapter: `places:searchNearby` per cell and
/// `places/{id}` for details.
pub struct HttpPlacesClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    included_types: Vec<String>,
    max_pages: u32,
    page_delay: Duration,
    max_reviews: usize,
    require_website: bool,
}

impl HttpPlacesClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.require_api_key()?;
        let http = Client::builder()
            .user_agent(concat!("places-grid/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            api_key,
            base_url: config.places_api_base.trim_end_matches('/').to_string(),
            included_types: config.included_types.clone(),
            max_pages: config.search_max_pages.max(1),
            page_delay: Duration::from_millis(config.search_page_delay_ms),
            max_reviews: config.max_reviews,
            require_website: config.require_website,
        })
    }

    async fn search_page(&self, cell: &Cell, page_token: Option<&str>) -> Result<Value, FetchError> {
        let mut body = json!({
            "includedTypes": self.included_types,
            "maxResultCount": PAGE_SIZE,
            "locationRestriction": {
                "circle": {
                    "center": {
                        "latitude": cell.center_lat,
                        "longitude": cell.center_lon,
                    },
                    "radius": cell.radius_m.round(),
                }
            }
        });
        if let Some(token) = page_token {
            body["pageToken"] = Value::String(token.to_string());
        }

        let response = self
            .http
            .post(format!("{}/places:searchNearby", self.base_url))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", NEARBY_SEARCH_FIELDS)
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response, "places search").await?;
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl PlacesApi for HttpPlacesClient {
    async fn search(&self, cell: &Cell) -> Result<SearchPage, FetchError> {
        let mut result = SearchPage::default();
        let mut page_token: Option<String> = None;

        for page in 1..=self.max_pages {
            let parsed = self.search_page(cell, page_token.as_deref()).await?;
            let places = parsed
                .get("places")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = places.len();
            result.raw_count += page_len;
            result.hits.extend(
                places
                    .into_iter()
                    .filter_map(SearchHit::from_place)
                    .filter(|hit| !self.require_website || hit.website_uri.is_some()),
            );

            page_token = parsed
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string);
            trace!(cell = %cell.index, page, page_len, "search page received");

            match page_token {
                Some(_) if page < self.max_pages => sleep(self.page_delay).await,
                _ => break,
            }
        }

        debug!(
            cell = %cell.index,
            hits = result.hits.len(),
            returned = result.raw_count,
            "cell search complete"
        );
        Ok(result)
    }

    async fn detail(&self, place_id: &str) -> Result<Value, FetchError> {
        let response = self
            .http
            .get(format!("{}/places/{}", self.base_url, place_id))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", PLACE_DETAILS_FIELDS)
            .send()
            .await?;
        let response = ensure_success(response, "place details").await?;
        let mut payload: Value = response.json().await?;
        if !payload.is_object() {
            return Err(FetchError::permanent(format!(
                "place details for {place_id} is not an object"
            )));
        }
        trim_reviews(&mut payload, self.max_reviews);
        Ok(payload)
    }
}

async fn ensure_success(response: Response, operation: &str) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = classify_status(status.as_u16(), &body);
    let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    Err(FetchError::new(
        kind,
        format!("{operation} returned {status}: {snippet}"),
    ))
}

/// Keeps the `max_reviews` most recent reviews, newest first. Reviews without
/// a parseable `publishTime` sort last.
pub fn trim_reviews(payload: &mut Value, max_reviews: usize) {
    let Some(reviews) = payload.get_mut("reviews").and_then(Value::as_array_mut) else {
        return;
    };
    reviews.sort_by_key(|review| {
        std::cmp::Reverse(
            review
                .get("publishTime")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.timestamp())
                .unwrap_or(i64::MIN),
        )
    });
    reviews.truncate(max_reviews);
}

/// Search object overlaid with the detail object. `id`, `displayName` and
/// `websiteUri` are always present so downstream consumers can rely on them.
pub fn merge_payloads(hit: &SearchHit, detail: &Value) -> Value {
    let mut merged = match &hit.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(detail) = detail {
        for (key, value) in detail {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.insert("id".into(), Value::String(hit.id.clone()));
    if !merged.contains_key("displayName") {
        merged.insert("displayName".into(), json!({ "text": hit.name }));
    }
    merged
        .entry("websiteUri")
        .or_insert_with(|| hit.website_uri.clone().map(Value::String).unwrap_or(Value::Null));
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, key, matches, not, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};

    use super::*;
    use crate::errors::FailureKind;
    use crate::grid::{Region, RegionGrid};

    fn test_config(server: &Server) -> AppConfig {
        AppConfig {
            places_api_base: server.url("/v1").to_string(),
            google_places_api_key: Some(SecretString::from("test-key".to_string())),
            search_page_delay_ms: 0,
            max_reviews: 2,
            ..AppConfig::default()
        }
    }

    fn one_cell() -> Cell {
        let region = Region::new(40.70, 40.71, -74.00, -73.99, 1, 1).unwrap();
        RegionGrid::build(&region, 100.0).remove(0)
    }

    fn place(id: &str, website: Option<&str>) -> Value {
        json!({
            "id": id,
            "displayName": { "text": format!("Place {id}"), "languageCode": "en" },
            "location": { "latitude": 40.705, "longitude": -73.995 },
            "websiteUri": website,
        })
    }

    #[tokio::test]
    async fn follows_page_tokens() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/places:searchNearby"),
                request::headers(contains(("x-goog-api-key", "test-key"))),
                request::body(not(matches("pageToken")))
            ])
            .respond_with(json_encoded(json!({
                "places": [place("a", Some("https://a.example")), place("b", None)],
                "nextPageToken": "page-2"
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/places:searchNearby"),
                request::body(matches("page-2"))
            ])
            .respond_with(json_encoded(json!({ "places": [place("c", None)] }))),
        );

        let client = HttpPlacesClient::new(&test_config(&server)).unwrap();
        let page = client.search(&one_cell()).await.unwrap();
        assert_eq!(page.raw_count, 3);
        let hits = page.hits;
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(hits[0].name, "Place a");
        assert_eq!(hits[0].website_uri.as_deref(), Some("https://a.example"));
    }

    #[tokio::test]
    async fn drops_hits_without_website_when_required() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
                .respond_with(json_encoded(json!({
                    "places": [place("a", Some("https://a.example")), place("b", None)]
                }))),
        );
        let mut config = test_config(&server);
        config.require_website = true;

        let client = HttpPlacesClient::new(&config).unwrap();
        let page = client.search(&one_cell()).await.unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].id, "a");
        assert_eq!(page.raw_count, 2);
    }

    #[tokio::test]
    async fn classifies_error_statuses() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
                .respond_with(status_code(429).body("RESOURCE_EXHAUSTED")),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/missing"))
                .respond_with(status_code(404).body("NOT_FOUND")),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/flaky"))
                .respond_with(status_code(503)),
        );

        let client = HttpPlacesClient::new(&test_config(&server)).unwrap();
        let err = client.search(&one_cell()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::QuotaExceeded);
        let err = client.detail("missing").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        let err = client.detail("flaky").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn detail_keeps_newest_reviews() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/v1/places/p1"),
                request::headers(contains(key("x-goog-fieldmask")))
            ])
            .respond_with(json_encoded(json!({
                "id": "p1",
                "reviews": [
                    { "rating": 3, "publishTime": "2023-01-01T00:00:00Z" },
                    { "rating": 5, "publishTime": "2024-06-01T00:00:00Z" },
                    { "rating": 4, "publishTime": "2024-01-01T00:00:00Z" }
                ],
                "generativeSummary": { "overview": { "text": "Cozy." } }
            }))),
        );

        let client = HttpPlacesClient::new(&test_config(&server)).unwrap();
        let detail = client.detail("p1").await.unwrap();
        let ratings: Vec<_> = detail["reviews"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["rating"].as_i64().unwrap())
            .collect();
        assert_eq!(ratings, vec![5, 4]);
        assert_eq!(detail["generativeSummary"]["overview"]["text"], "Cozy.");
    }

    #[test]
    fn requires_api_key() {
        let config = AppConfig::default();
        assert!(HttpPlacesClient::new(&config).is_err());
    }

    #[test]
    fn merge_overlays_detail_on_search_payload() {
        let hit = SearchHit::from_place(place("x", None)).unwrap();
        let merged = merge_payloads(&hit, &json!({ "reviews": [], "displayName": { "text": "X!" } }));
        assert_eq!(merged["id"], "x");
        assert_eq!(merged["displayName"]["text"], "X!");
        assert!(merged["websiteUri"].is_null());
        assert!(merged["reviews"].as_array().unwrap().is_empty());
        assert_eq!(merged["location"]["latitude"], 40.705);
    }

    #[test]
    fn hits_without_id_are_rejected() {
        assert!(SearchHit::from_place(json!({ "displayName": { "text": "?" } })).is_none());
        let hit = SearchHit::from_place(json!({ "id": "y" })).unwrap();
        assert!(!hit.has_location());
    }
}
