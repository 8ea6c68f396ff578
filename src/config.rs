use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::grid::Region;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub lat_low: f64,
    pub lat_high: f64,
    pub lon_low: f64,
    pub lon_high: f64,
    pub grid_rows: u32,
    pub grid_columns: u32,
    pub overlap_margin_m: f64,
    pub boundary_geojson_path: Option<PathBuf>,
    pub included_types: Vec<String>,
    pub require_website: bool,
    pub max_reviews: usize,
    pub result_cap: usize,
    pub search_max_pages: u32,
    pub search_page_delay_ms: u64,
    pub search_delay_ms: u64,
    pub details_delay_ms: u64,
    pub search_concurrency: usize,
    pub details_concurrency: usize,
    pub places_rate_limit_qps: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub quota_backoff_factor: u32,
    pub detail_validity_days: Option<i64>,
    pub search_validity_days: Option<i64>,
    pub reset_failed_details: bool,
    pub dedup_distance_m: f64,
    pub dedup_name_similarity: f64,
    pub cache_dir: PathBuf,
    pub output_file: PathBuf,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub places_api_base: String,
    pub google_places_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub bounds: [f64; 4],
    pub grid_rows: u32,
    pub grid_columns: u32,
    pub overlap_margin_m: f64,
    pub has_boundary: bool,
    pub included_types: Vec<String>,
    pub search_concurrency: usize,
    pub details_concurrency: usize,
    pub places_rate_limit_qps: u32,
    pub max_attempts: u32,
    pub detail_validity_days: Option<i64>,
    pub cache_dir: String,
    pub output_file: String,
    pub has_google_places_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lat_low: 40.7000,
            lat_high: 40.8800,
            lon_low: -74.0500,
            lon_high: -73.9000,
            grid_rows: 20,
            grid_columns: 20,
            overlap_margin_m: 100.0,
            boundary_geojson_path: None,
            included_types: vec!["restaurant".to_string()],
            require_website: false,
            max_reviews: 10,
            result_cap: 60,
            search_max_pages: 3,
            search_page_delay_ms: 2_000,
            search_delay_ms: 0,
            details_delay_ms: 100,
            search_concurrency: 10,
            details_concurrency: 20,
            places_rate_limit_qps: 10,
            max_attempts: 5,
            backoff_base_ms: 250,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            quota_backoff_factor: 4,
            detail_validity_days: Some(30),
            search_validity_days: None,
            reset_failed_details: false,
            dedup_distance_m: 15.0,
            dedup_name_similarity: 0.9,
            cache_dir: PathBuf::from("cache"),
            output_file: PathBuf::from("restaurants.json"),
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            google_places_api_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            lat_low: parse_f64("REGION_LAT_LOW", defaults.lat_low),
            lat_high: parse_f64("REGION_LAT_HIGH", defaults.lat_high),
            lon_low: parse_f64("REGION_LON_LOW", defaults.lon_low),
            lon_high: parse_f64("REGION_LON_HIGH", defaults.lon_high),
            grid_rows: parse_u32("GRID_ROWS", defaults.grid_rows),
            grid_columns: parse_u32("GRID_COLUMNS", defaults.grid_columns),
            overlap_margin_m: parse_f64("GRID_OVERLAP_MARGIN_M", defaults.overlap_margin_m)
                .max(0.0),
            boundary_geojson_path: non_empty("BOUNDARY_GEOJSON_PATH").map(PathBuf::from),
            included_types: non_empty("PLACES_INCLUDED_TYPES")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.included_types),
            require_website: parse_bool("REQUIRE_WEBSITE", defaults.require_website),
            max_reviews: parse_usize("MAX_REVIEWS", defaults.max_reviews),
            result_cap: parse_usize("SEARCH_RESULT_CAP", defaults.result_cap).max(1),
            search_max_pages: parse_u32("SEARCH_MAX_PAGES", defaults.search_max_pages).max(1),
            search_page_delay_ms: parse_u64("SEARCH_PAGE_DELAY_MS", defaults.search_page_delay_ms),
            search_delay_ms: parse_u64("SEARCH_DELAY_MS", defaults.search_delay_ms),
            details_delay_ms: parse_u64("DETAILS_DELAY_MS", defaults.details_delay_ms),
            search_concurrency: parse_usize("SEARCH_CONCURRENCY", defaults.search_concurrency)
                .max(1),
            details_concurrency: parse_usize("DETAILS_CONCURRENCY", defaults.details_concurrency)
                .max(1),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", defaults.places_rate_limit_qps),
            max_attempts: parse_u32("MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff_base_ms: parse_u64("BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_multiplier: parse_f64("BACKOFF_MULTIPLIER", defaults.backoff_multiplier)
                .max(1.0),
            backoff_max_ms: parse_u64("BACKOFF_MAX_MS", defaults.backoff_max_ms),
            quota_backoff_factor: parse_u32("QUOTA_BACKOFF_FACTOR", defaults.quota_backoff_factor)
                .max(1),
            detail_validity_days: parse_days("CACHE_VALIDITY_DAYS", defaults.detail_validity_days),
            search_validity_days: parse_days(
                "SEARCH_CACHE_VALIDITY_DAYS",
                defaults.search_validity_days,
            ),
            reset_failed_details: parse_bool("RESET_FAILED_DETAILS", false),
            dedup_distance_m: parse_f64("DEDUP_DISTANCE_M", defaults.dedup_distance_m).max(0.0),
            dedup_name_similarity: parse_f64(
                "DEDUP_NAME_SIMILARITY",
                defaults.dedup_name_similarity,
            )
            .clamp(0.0, 1.0),
            cache_dir: non_empty("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            output_file: non_empty("OUTPUT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_file),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", defaults.journal_max_bytes),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", defaults.journal_max_files).max(1),
            places_api_base: non_empty("PLACES_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.places_api_base),
            google_places_api_key: non_empty("GOOGLE_PLACES_API_KEY").map(SecretString::from),
        }
    }

    /// Validated region descriptor. Invalid bounds or a zero resolution abort
    /// the run before any network call is made.
    pub fn region(&self) -> AppResult<Region> {
        Region::new(
            self.lat_low,
            self.lat_high,
            self.lon_low,
            self.lon_high,
            self.grid_rows,
            self.grid_columns,
        )
    }

    pub fn require_api_key(&self) -> AppResult<SecretString> {
        self.google_places_api_key.clone().ok_or_else(|| {
            AppError::Config(
                "GOOGLE_PLACES_API_KEY not set; export it or add it to .env".into(),
            )
        })
    }

    pub fn detail_validity(&self) -> Option<chrono::Duration> {
        self.detail_validity_days.map(chrono::Duration::days)
    }

    pub fn search_validity(&self) -> Option<chrono::Duration> {
        self.search_validity_days.map(chrono::Duration::days)
    }

    pub fn search_delay(&self) -> Duration {
        Duration::from_millis(self.search_delay_ms)
    }

    pub fn details_delay(&self) -> Duration {
        Duration::from_millis(self.details_delay_ms)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.cache_dir.join("run-journal.jsonl")
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            bounds: [self.lat_low, self.lat_high, self.lon_low, self.lon_high],
            grid_rows: self.grid_rows,
            grid_columns: self.grid_columns,
            overlap_margin_m: self.overlap_margin_m,
            has_boundary: self.boundary_geojson_path.is_some(),
            included_types: self.included_types.clone(),
            search_concurrency: self.search_concurrency,
            details_concurrency: self.details_concurrency,
            places_rate_limit_qps: self.places_rate_limit_qps,
            max_attempts: self.max_attempts,
            detail_validity_days: self.detail_validity_days,
            cache_dir: self.cache_dir.to_string_lossy().to_string(),
            output_file: self.output_file.to_string_lossy().to_string(),
            has_google_places_key: self.google_places_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// `0` or a negative value disables expiry for the namespace.
fn parse_days(key: &str, default: Option<i64>) -> Option<i64> {
    match env::var(key).ok().and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(days) if days > 0 => Some(days),
        Some(_) => None,
        None => default,
    }
}
