use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Namespace};
use crate::config::AppConfig;
use crate::dedup::{Admission, DedupPolicy};
use crate::errors::{AppError, AppResult, FailureKind};
use crate::grid::Cell;
use crate::journal::RunJournal;
use crate::places::SearchPage;
use crate::retry::RetryingClient;
use crate::run_state::{DetailOutcome, DetailState, RunState};

pub type ProgressObserver = Arc<dyn Fn(CollectionProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Search,
    Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionProgress {
    pub phase: Phase,
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub cells_total: usize,
    pub cells_from_cache: usize,
    pub cells_searched: usize,
    pub cells_failed: usize,
    pub cells_saturated: usize,
    pub entities_total: usize,
    pub details_from_cache: usize,
    pub details_fetched: usize,
    pub details_failed: usize,
    pub failed_permanent: usize,
    pub suspected_duplicates: usize,
    pub output_count: usize,
    /// Every cell searched and every entity detailed or failed-permanent.
    pub complete: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub search_concurrency: usize,
    pub details_concurrency: usize,
    pub result_cap: usize,
    pub search_validity: Option<Duration>,
    pub detail_validity: Option<Duration>,
    pub dedup: DedupPolicy,
    pub output_file: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            search_concurrency: config.search_concurrency.max(1),
            details_concurrency: config.details_concurrency.max(1),
            result_cap: config.result_cap,
            search_validity: config.search_validity(),
            detail_validity: config.detail_validity(),
            dedup: DedupPolicy::from_config(config),
            output_file: config.output_file.clone(),
        }
    }
}

/// Drives one collection run: resume from cache, search the remaining cells,
/// fetch details for new entities, then write the merged output.
///
/// Workers only perform network calls. Their results reach a single consumer
/// in submission order, which persists each unit before touching [`RunState`].
pub struct CollectionOrchestrator {
    client: RetryingClient,
    cache: CacheStore,
    journal: Option<RunJournal>,
    settings: OrchestratorSettings,
}

impl CollectionOrchestrator {
    pub fn new(client: RetryingClient, cache: CacheStore, settings: OrchestratorSettings) -> Self {
        Self {
            client,
            cache,
            journal: None,
            settings,
        }
    }

    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn run(
        &self,
        cells: &[Cell],
        observer: Option<ProgressObserver>,
        cancel: CancellationToken,
    ) -> AppResult<RunReport> {
        let (mut state, restored) = RunState::restore(
            &self.cache,
            cells,
            self.settings.dedup,
            self.settings.search_validity,
            self.settings.detail_validity,
        );
        let mut report = RunReport {
            cells_total: cells.len(),
            cells_from_cache: restored.cells_from_cache,
            details_from_cache: restored.details_from_cache,
            ..RunReport::default()
        };
        self.journal_event(
            "run_started",
            json!({
                "cells_total": cells.len(),
                "cells_from_cache": restored.cells_from_cache,
                "entities_from_cache": state.dedup().len(),
            }),
        );

        self.search_phase(cells, &mut state, &mut report, observer.as_ref(), &cancel)
            .await;
        report.cancelled |= cancel.is_cancelled();
        if !report.cancelled {
            self.detail_phase(&mut state, &mut report, observer.as_ref(), &cancel)
                .await;
        }

        report.cancelled |= cancel.is_cancelled();
        report.entities_total = state.dedup().len();
        report.failed_permanent = state.count(DetailState::FailedPermanent);
        report.suspected_duplicates = state.dedup().ambiguities().len();
        report.complete = !report.cancelled && state.is_complete(cells);

        if report.cancelled {
            info!("run cancelled; completed units are cached, output left untouched");
        } else {
            let records = state.merged_records();
            write_output(&self.settings.output_file, &records)?;
            report.output_count = records.len();
            info!(
                path = %self.settings.output_file.display(),
                records = records.len(),
                "wrote collection output"
            );
        }

        self.journal_event("run_finished", json!(report));
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(error = %err, "failed to flush run journal");
            }
        }
        Ok(report)
    }

    async fn search_phase(
        &self,
        cells: &[Cell],
        state: &mut RunState,
        report: &mut RunReport,
        observer: Option<&ProgressObserver>,
        cancel: &CancellationToken,
    ) {
        let pending: Vec<&Cell> = cells
            .iter()
            .filter(|cell| !state.is_searched(cell.index))
            .collect();
        let total = pending.len();
        info!(pending = total, cached = report.cells_from_cache, "starting search phase");

        let client = &self.client;
        let mut results = stream::iter(pending)
            .map(|cell| async move { (cell, client.search(cell, cancel).await) })
            .buffered(self.settings.search_concurrency.max(1));

        let mut processed = 0;
        while let Some((cell, outcome)) = results.next().await {
            processed += 1;
            match outcome {
                Ok(page) => self.store_search(state, report, cell, page),
                Err(err) if err.is_cancelled() => report.cancelled = true,
                Err(err) => {
                    report.cells_failed += 1;
                    warn!(
                        cell = %cell.index,
                        kind = %err.kind,
                        attempts = err.attempts,
                        error = %err.message,
                        "cell search failed; cell left unsearched"
                    );
                    self.journal_event(
                        "cell_failed",
                        json!({
                            "cell": cell.key(),
                            "kind": err.kind.as_str(),
                            "attempts": err.attempts,
                            "error": err.message,
                        }),
                    );
                }
            }
            notify(observer, Phase::Search, processed, total);
        }
    }

    fn store_search(&self, state: &mut RunState, report: &mut RunReport, cell: &Cell, page: SearchPage) {
        let key = cell.key();
        let payload: Vec<&Value> = page.hits.iter().map(|hit| &hit.raw).collect();
        if let Err(err) = self.cache.put(Namespace::CellSearch, &key, &payload) {
            report.cells_failed += 1;
            warn!(cell = %key, error = %err, "could not persist cell search; cell left unsearched");
            self.journal_event(
                "cell_failed",
                json!({ "cell": key, "kind": "cache_write", "error": err.to_string() }),
            );
            return;
        }

        // Judged on what the API returned, before any local filtering.
        let returned = page.raw_count;
        if self.settings.result_cap > 0 && returned >= self.settings.result_cap {
            report.cells_saturated += 1;
            warn!(
                cell = %key,
                returned,
                cap = self.settings.result_cap,
                "cell hit the result cap; results may be truncated, consider a finer grid"
            );
            self.journal_event(
                "cell_saturated",
                json!({ "cell": key, "returned": returned, "kept": page.hits.len() }),
            );
        }

        let hit_count = page.hits.len();
        let mut new_entities = 0;
        for admission in state.record_search(cell.index, page.hits) {
            match admission {
                Admission::New(_) => new_entities += 1,
                Admission::Known(_) => {}
                Admission::SuspectedDuplicate(suspect) => {
                    self.journal_event("duplicate_suspected", json!(suspect));
                }
            }
        }
        report.cells_searched += 1;
        debug!(cell = %key, hits = hit_count, returned, new_entities, "cell searched");
    }

    async fn detail_phase(
        &self,
        state: &mut RunState,
        report: &mut RunReport,
        observer: Option<&ProgressObserver>,
        cancel: &CancellationToken,
    ) {
        let pending = state.pending_details();
        let total = pending.len();
        info!(pending = total, cached = report.details_from_cache, "starting detail phase");

        let client = &self.client;
        let mut results = stream::iter(pending)
            .map(|id| async move {
                let outcome = client.detail(&id, cancel).await;
                (id, outcome)
            })
            .buffered(self.settings.details_concurrency.max(1));

        let mut processed = 0;
        while let Some((id, outcome)) = results.next().await {
            processed += 1;
            match outcome {
                Ok(detail) => {
                    let entry = DetailOutcome::Fetched {
                        detail: detail.clone(),
                    };
                    match self.cache.put(Namespace::EntityDetail, &id, &entry) {
                        Ok(_) => {
                            state.record_detail(&id, detail);
                            report.details_fetched += 1;
                            debug!(place_id = %id, "detail fetched");
                        }
                        Err(err) => {
                            report.details_failed += 1;
                            warn!(place_id = %id, error = %err, "could not persist detail; entity left pending");
                        }
                    }
                }
                Err(err) if err.is_cancelled() => report.cancelled = true,
                Err(err) => {
                    report.details_failed += 1;
                    let permanent = err.kind == FailureKind::Permanent;
                    let mut stale_fallback = false;
                    if permanent {
                        let marker = DetailOutcome::Failed {
                            reason: err.message.clone(),
                            attempts: err.attempts,
                        };
                        if let Err(write_err) = self.cache.put(Namespace::EntityDetail, &id, &marker) {
                            warn!(place_id = %id, error = %write_err, "could not persist failure marker");
                        }
                        state.record_failure(&id);
                    } else {
                        // Terminal for this run only; nothing is persisted, so a
                        // later run tries again.
                        stale_fallback = state.record_exhausted(&id);
                    }
                    warn!(
                        place_id = %id,
                        kind = %err.kind,
                        attempts = err.attempts,
                        permanent,
                        stale_fallback,
                        error = %err.message,
                        "detail fetch failed"
                    );
                    self.journal_event(
                        "detail_failed",
                        json!({
                            "place_id": id,
                            "kind": err.kind.as_str(),
                            "attempts": err.attempts,
                            "exhausted": err.exhausted,
                            "permanent": permanent,
                            "stale_fallback": stale_fallback,
                            "error": err.message,
                        }),
                    );
                }
            }
            notify(observer, Phase::Details, processed, total);
        }
    }

    fn journal_event(&self, event: &str, payload: Value) {
        if let Some(journal) = &self.journal {
            journal.record(event, payload);
        }
    }
}

fn notify(observer: Option<&ProgressObserver>, phase: Phase, processed: usize, total: usize) {
    if let Some(observer) = observer {
        observer(CollectionProgress {
            phase,
            processed,
            total,
        });
    }
}

/// Writes `{ total_count, scraped_at, restaurants }` next to `path` and
/// renames it into place.
pub fn write_output(path: &Path, records: &[Value]) -> AppResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let document = json!({
        "total_count": records.len(),
        "scraped_at": Utc::now().to_rfc3339(),
        "restaurants": records,
    });
    let mut tmp = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut tmp, &document)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| AppError::Cache(format!("{}: {}", path.display(), err.error)))?;
    Ok(())
}
