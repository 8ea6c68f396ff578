use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheStore, Namespace};
use crate::dedup::{Admission, DedupPolicy, Deduplicator};
use crate::errors::AppResult;
use crate::grid::{Cell, CellIndex};
use crate::places::{merge_payloads, SearchHit};

/// Payload stored under the entity-detail namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetailOutcome {
    Fetched { detail: Value },
    /// Completion marker for an entity that can never be detailed. Kept until
    /// reset so resumed runs skip it.
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailState {
    Pending,
    Detailed,
    FailedPermanent,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub cells_from_cache: usize,
    pub details_from_cache: usize,
    pub failed_from_cache: usize,
    /// Expired details kept as a fallback while the entity is refetched.
    pub stale_details: usize,
}

/// In-memory progress of one collection run. Only the orchestrator's consumer
/// mutates it.
#[derive(Debug)]
pub struct RunState {
    dedup: Deduplicator,
    searched: BTreeSet<CellIndex>,
    details: BTreeMap<String, DetailState>,
}

impl RunState {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            dedup: Deduplicator::new(policy),
            searched: BTreeSet::new(),
            details: BTreeMap::new(),
        }
    }

    /// Replays fresh cache entries in grid order so the first-seen choices
    /// match those of the run that wrote them.
    pub fn restore(
        cache: &CacheStore,
        cells: &[Cell],
        policy: DedupPolicy,
        search_validity: Option<Duration>,
        detail_validity: Option<Duration>,
    ) -> (Self, RestoreSummary) {
        let mut state = Self::new(policy);
        let mut summary = RestoreSummary::default();

        for cell in cells {
            let Some(entry) = cache.get::<Vec<Value>>(Namespace::CellSearch, &cell.key()) else {
                continue;
            };
            if !entry.is_fresh(search_validity) {
                debug!(cell = %cell.index, "cell search entry is stale");
                continue;
            }
            let hits = entry
                .payload
                .into_iter()
                .filter_map(SearchHit::from_place)
                .collect();
            state.record_search(cell.index, hits);
            summary.cells_from_cache += 1;
        }

        let ids: Vec<String> = state.details.keys().cloned().collect();
        for id in ids {
            let Some(entry) = cache.get::<DetailOutcome>(Namespace::EntityDetail, &id) else {
                continue;
            };
            if !entry.is_fresh(detail_validity) {
                debug!(place_id = %id, "detail entry is stale; refetching");
                if let DetailOutcome::Fetched { detail } = entry.payload {
                    state.dedup.set_detail(&id, detail);
                    summary.stale_details += 1;
                }
                continue;
            }
            match entry.payload {
                DetailOutcome::Fetched { detail } => {
                    state.record_detail(&id, detail);
                    summary.details_from_cache += 1;
                }
                DetailOutcome::Failed { .. } => {
                    state.record_failure(&id);
                    summary.failed_from_cache += 1;
                }
            }
        }

        info!(
            cells = summary.cells_from_cache,
            entities = state.dedup.len(),
            details = summary.details_from_cache,
            failed = summary.failed_from_cache,
            stale = summary.stale_details,
            "restored run state from cache"
        );
        (state, summary)
    }

    /// Marks the cell searched and admits its hits in order.
    pub fn record_search(&mut self, index: CellIndex, hits: Vec<SearchHit>) -> Vec<Admission> {
        self.searched.insert(index);
        hits.into_iter()
            .map(|hit| {
                let admission = self.dedup.admit(hit, index);
                if let Admission::New(id) = &admission {
                    self.details.entry(id.clone()).or_insert(DetailState::Pending);
                }
                admission
            })
            .collect()
    }

    pub fn is_searched(&self, index: CellIndex) -> bool {
        self.searched.contains(&index)
    }

    pub fn searched_count(&self) -> usize {
        self.searched.len()
    }

    pub fn record_detail(&mut self, id: &str, detail: Value) {
        if self.dedup.set_detail(id, detail) {
            self.details.insert(id.to_string(), DetailState::Detailed);
        }
    }

    /// Non-retryable failure: the entity is terminal and leaves the output,
    /// including any stale detail it carried.
    pub fn record_failure(&mut self, id: &str) {
        if let Some(state) = self.details.get_mut(id) {
            *state = DetailState::FailedPermanent;
            self.dedup.clear_detail(id);
        }
    }

    /// Retry budget spent: terminal for this run, but a stale detail from an
    /// earlier run stays in the output. Returns whether such a fallback exists.
    pub fn record_exhausted(&mut self, id: &str) -> bool {
        match self.details.get_mut(id) {
            Some(state) => {
                *state = DetailState::FailedPermanent;
                self.dedup
                    .get(id)
                    .is_some_and(|record| record.detail.is_some())
            }
            None => false,
        }
    }

    pub fn detail_state(&self, id: &str) -> Option<DetailState> {
        self.details.get(id).copied()
    }

    /// Ids still waiting for a detail fetch, sorted.
    pub fn pending_details(&self) -> Vec<String> {
        self.details
            .iter()
            .filter(|(_, state)| **state == DetailState::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self, wanted: DetailState) -> usize {
        self.details.values().filter(|state| **state == wanted).count()
    }

    /// All cells searched and no entity left pending.
    pub fn is_complete(&self, cells: &[Cell]) -> bool {
        cells.iter().all(|cell| self.is_searched(cell.index))
            && self.count(DetailState::Pending) == 0
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Records carrying a detail payload merged into output objects, in id
    /// order. Besides detailed entities this includes stale fallbacks.
    pub fn merged_records(&self) -> Vec<Value> {
        self.dedup
            .records()
            .filter_map(|record| {
                record
                    .detail
                    .as_ref()
                    .map(|detail| merge_payloads(&record.search_payload, detail))
            })
            .collect()
    }
}

/// Deletes every failed-permanent marker so the next run retries those ids.
pub fn reset_failed_details(cache: &CacheStore) -> AppResult<usize> {
    let mut removed = 0;
    for entry in cache.entries::<DetailOutcome>(Namespace::EntityDetail)? {
        if matches!(entry.payload, DetailOutcome::Failed { .. })
            && cache.remove(Namespace::EntityDetail, &entry.key)?
        {
            removed += 1;
        }
    }
    info!(removed, "reset failed detail markers");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::grid::{Region, RegionGrid};

    fn place(id: &str) -> Value {
        json!({
            "id": id,
            "displayName": { "text": format!("Place {id}") },
            "location": { "latitude": 0.1, "longitude": 0.1 }
        })
    }

    fn cells() -> Vec<Cell> {
        let region = Region::new(0.0, 1.0, 0.0, 1.0, 2, 2).unwrap();
        RegionGrid::build(&region, 0.0)
    }

    #[test]
    fn restores_searched_cells_and_detail_markers() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let cells = cells();
        cache
            .put(Namespace::CellSearch, &cells[0].key(), &vec![place("a"), place("b")])
            .unwrap();
        cache
            .put(Namespace::CellSearch, &cells[1].key(), &vec![place("b"), place("c")])
            .unwrap();
        cache
            .put(
                Namespace::EntityDetail,
                "a",
                &DetailOutcome::Fetched { detail: json!({ "reviews": [] }) },
            )
            .unwrap();
        cache
            .put(
                Namespace::EntityDetail,
                "b",
                &DetailOutcome::Failed { reason: "NOT_FOUND".into(), attempts: 1 },
            )
            .unwrap();

        let policy = DedupPolicy { distance_m: 0.0, name_similarity: 0.9 };
        let (state, summary) = RunState::restore(&cache, &cells, policy, None, Some(Duration::days(30)));

        assert_eq!(summary.cells_from_cache, 2);
        assert_eq!(summary.details_from_cache, 1);
        assert_eq!(summary.failed_from_cache, 1);
        assert!(state.is_searched(cells[1].index));
        assert!(!state.is_searched(cells[2].index));
        assert_eq!(state.detail_state("a"), Some(DetailState::Detailed));
        assert_eq!(state.detail_state("b"), Some(DetailState::FailedPermanent));
        assert_eq!(state.pending_details(), vec!["c".to_string()]);
        assert_eq!(state.dedup().get("b").unwrap().origins.len(), 2);

        let merged = state.merged_records();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["id"], "a");
    }

    #[test]
    fn stale_details_are_pending_again() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        let cells = cells();
        cache
            .put(Namespace::CellSearch, &cells[0].key(), &vec![place("a")])
            .unwrap();
        cache
            .put_at(
                Namespace::EntityDetail,
                "a",
                &DetailOutcome::Fetched { detail: json!({ "rating": 4.1 }) },
                chrono::Utc::now() - Duration::days(31),
            )
            .unwrap();

        let (mut state, summary) =
            RunState::restore(&cache, &cells, DedupPolicy::default(), None, Some(Duration::days(30)));
        assert_eq!(summary.details_from_cache, 0);
        assert_eq!(summary.stale_details, 1);
        assert_eq!(state.pending_details(), vec!["a".to_string()]);
        assert!(!state.is_complete(&cells));

        // A refresh that runs out of retries keeps the old detail in the output.
        assert!(state.record_exhausted("a"));
        assert_eq!(state.detail_state("a"), Some(DetailState::FailedPermanent));
        assert_eq!(state.merged_records().len(), 1);

        // A place that no longer exists drops out.
        state.record_failure("a");
        assert!(state.merged_records().is_empty());
    }

    #[test]
    fn reset_removes_only_failed_markers() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        cache
            .put(Namespace::EntityDetail, "ok", &DetailOutcome::Fetched { detail: json!({}) })
            .unwrap();
        cache
            .put(
                Namespace::EntityDetail,
                "gone",
                &DetailOutcome::Failed { reason: "NOT_FOUND".into(), attempts: 1 },
            )
            .unwrap();

        assert_eq!(reset_failed_details(&cache).unwrap(), 1);
        assert!(cache.exists(Namespace::EntityDetail, "ok"));
        assert!(!cache.exists(Namespace::EntityDetail, "gone"));
    }

    #[test]
    fn detail_outcome_is_tagged() {
        let value = serde_json::to_value(DetailOutcome::Failed {
            reason: "x".into(),
            attempts: 2,
        })
        .unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["attempts"], 2);
    }
}
