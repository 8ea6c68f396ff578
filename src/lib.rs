pub mod boundary;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod grid;
pub mod journal;
pub mod orchestrator;
pub mod places;
pub mod retry;
pub mod run_state;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use boundary::Boundary;
pub use cache::{CacheEntry, CacheStore, Namespace};
pub use config::{AppConfig, PublicAppConfig};
pub use dedup::{Admission, DedupPolicy, Deduplicator, EntityRecord, SuspectedDuplicate};
pub use errors::{AppError, AppResult, FailureKind, FetchError};
pub use grid::{haversine_m, Cell, CellIndex, Region, RegionGrid};
pub use journal::RunJournal;
pub use orchestrator::{
    write_output, CollectionOrchestrator, CollectionProgress, OrchestratorSettings, Phase,
    ProgressObserver, RunReport,
};
pub use places::{merge_payloads, HttpPlacesClient, PlacesApi, SearchHit, SearchPage};
pub use retry::{RetryPolicy, RetryingClient};
pub use run_state::{reset_failed_details, DetailOutcome, DetailState, RunState};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,places_grid=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

/// Grid cells for the configured region, narrowed to the boundary polygon
/// when one is configured.
pub fn plan_cells(config: &AppConfig) -> AppResult<Vec<Cell>> {
    let region = config.region()?;
    let cells = RegionGrid::build(&region, config.overlap_margin_m);
    match &config.boundary_geojson_path {
        Some(path) => Ok(Boundary::load(path)?.filter_cells(cells)),
        None => Ok(cells),
    }
}

/// Runs a full collection against the Google Places API using `config`.
pub async fn collect(
    config: &AppConfig,
    observer: Option<ProgressObserver>,
    cancel: CancellationToken,
) -> AppResult<RunReport> {
    info!(config = ?config.public_profile(), "starting collection");
    let cells = plan_cells(config)?;
    let api: Arc<dyn PlacesApi> = Arc::new(HttpPlacesClient::new(config)?);

    let cache = CacheStore::open(&config.cache_dir)?;
    if config.reset_failed_details {
        reset_failed_details(&cache)?;
    }
    let journal = RunJournal::from_config(config)?;
    let orchestrator = CollectionOrchestrator::new(
        RetryingClient::new(api, config),
        cache,
        OrchestratorSettings::from_config(config),
    )
    .with_journal(journal);

    let report = orchestrator.run(&cells, observer, cancel).await?;
    info!(
        search_attempts = orchestrator.client().search_attempts(),
        detail_attempts = orchestrator.client().detail_attempts(),
        "collection finished"
    );
    Ok(report)
}
