use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::config::AppConfig;
use crate::grid::{haversine_m, CellIndex};
use crate::places::SearchHit;

/// Roughly 20 m of latitude; cheaper than haversine for rejecting far records.
const LAT_PREFILTER_PER_METER: f64 = 1.0 / 111_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    /// `0` disables the proximity check.
    pub distance_m: f64,
    pub name_similarity: f64,
}

impl DedupPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            distance_m: config.dedup_distance_m.max(0.0),
            name_similarity: config.dedup_name_similarity.clamp(0.0, 1.0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.distance_m > 0.0
    }
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            distance_m: 15.0,
            name_similarity: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub website_uri: Option<String>,
    pub search_payload: SearchHit,
    pub detail: Option<Value>,
    /// Cells whose search returned this id. Diagnostic only.
    pub origins: BTreeSet<CellIndex>,
}

impl EntityRecord {
    fn from_hit(hit: SearchHit, origin: CellIndex) -> Self {
        Self {
            id: hit.id.clone(),
            name: hit.name.clone(),
            lat: hit.lat,
            lng: hit.lng,
            website_uri: hit.website_uri.clone(),
            search_payload: hit,
            detail: None,
            origins: BTreeSet::from([origin]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspectedDuplicate {
    pub kept: String,
    pub kept_name: String,
    pub incoming: String,
    pub incoming_name: String,
    pub origin: CellIndex,
    pub distance_m: f64,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    New(String),
    Known(String),
    SuspectedDuplicate(SuspectedDuplicate),
}

/// Owns every entity seen in a run, keyed by the place id.
///
/// A hit whose id is new but which sits within `distance_m` of an existing
/// record with a near-identical name is not admitted: the first-seen record
/// stays and the pair is kept in [`Deduplicator::ambiguities`]. When the same
/// suppressed id turns up again from another cell it resolves to the kept
/// record as `Known`, so it is reported once.
#[derive(Debug, Default)]
pub struct Deduplicator {
    policy: DedupPolicy,
    records: BTreeMap<String, EntityRecord>,
    suppressed: HashMap<String, String>,
    ambiguities: Vec<SuspectedDuplicate>,
}

impl Deduplicator {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn admit(&mut self, hit: SearchHit, origin: CellIndex) -> Admission {
        if let Some(record) = self.records.get_mut(&hit.id) {
            record.origins.insert(origin);
            return Admission::Known(hit.id);
        }
        if let Some(kept) = self.suppressed.get(&hit.id) {
            let kept = kept.clone();
            if let Some(record) = self.records.get_mut(&kept) {
                record.origins.insert(origin);
            }
            return Admission::Known(kept);
        }

        if let Some(suspect) = self.find_near_duplicate(&hit, origin) {
            warn!(
                kept = %suspect.kept,
                incoming = %suspect.incoming,
                name = %suspect.incoming_name,
                distance_m = suspect.distance_m,
                similarity = suspect.similarity,
                "suspected duplicate with a different place id; keeping first seen"
            );
            self.suppressed
                .insert(suspect.incoming.clone(), suspect.kept.clone());
            self.ambiguities.push(suspect.clone());
            return Admission::SuspectedDuplicate(suspect);
        }

        trace!(place_id = %hit.id, cell = %origin, "new entity");
        let id = hit.id.clone();
        self.records
            .insert(id.clone(), EntityRecord::from_hit(hit, origin));
        Admission::New(id)
    }

    fn find_near_duplicate(&self, hit: &SearchHit, origin: CellIndex) -> Option<SuspectedDuplicate> {
        if !self.policy.enabled() || !hit.has_location() {
            return None;
        }
        let lat_window = self.policy.distance_m * LAT_PREFILTER_PER_METER * 2.0;
        let incoming_name = normalize_name(&hit.name);

        self.records
            .values()
            .filter(|record| record.lat.is_finite() && record.lng.is_finite())
            .filter(|record| (record.lat - hit.lat).abs() <= lat_window)
            .find_map(|record| {
                let distance_m = haversine_m(record.lat, record.lng, hit.lat, hit.lng);
                if distance_m > self.policy.distance_m {
                    return None;
                }
                let similarity = dice_coefficient(&normalize_name(&record.name), &incoming_name);
                (similarity >= self.policy.name_similarity).then(|| SuspectedDuplicate {
                    kept: record.id.clone(),
                    kept_name: record.name.clone(),
                    incoming: hit.id.clone(),
                    incoming_name: hit.name.clone(),
                    origin,
                    distance_m,
                    similarity,
                })
            })
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    pub fn set_detail(&mut self, id: &str, detail: Value) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.detail = Some(detail);
                true
            }
            None => false,
        }
    }

    pub fn clear_detail(&mut self, id: &str) -> Option<Value> {
        self.records.get_mut(id).and_then(|record| record.detail.take())
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ambiguities(&self) -> &[SuspectedDuplicate] {
        &self.ambiguities
    }
}

/// Lowercase alphanumerics with single spaces between words.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sørensen–Dice coefficient over character bigrams, in `[0, 1]`.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
    for pair in a.windows(2) {
        *bigrams.entry((pair[0], pair[1])).or_default() += 1;
    }
    let mut shared = 0;
    for pair in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }
    (2 * shared) as f64 / (a.len() - 1 + b.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hit(id: &str, name: &str, lat: f64, lng: f64) -> SearchHit {
        SearchHit::from_place(json!({
            "id": id,
            "displayName": { "text": name },
            "location": { "latitude": lat, "longitude": lng }
        }))
        .unwrap()
    }

    #[test]
    fn known_ids_only_gain_origins() {
        let mut dedup = Deduplicator::new(DedupPolicy::default());
        let first = hit("X1", "Joe's Pizza", 40.7306, -73.9890);
        assert_eq!(
            dedup.admit(first.clone(), CellIndex::new(0, 0)),
            Admission::New("X1".into())
        );
        dedup.set_detail("X1", json!({ "reviews": [] }));

        let mut moved = first;
        moved.name = "Renamed".into();
        assert_eq!(
            dedup.admit(moved, CellIndex::new(0, 1)),
            Admission::Known("X1".into())
        );

        let record = dedup.get("X1").unwrap();
        assert_eq!(record.name, "Joe's Pizza");
        assert!(record.detail.is_some());
        assert_eq!(record.origins.len(), 2);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn flags_nearby_records_with_same_name() {
        let mut dedup = Deduplicator::new(DedupPolicy::default());
        dedup.admit(hit("A", "Katz's Delicatessen", 40.72223, -73.98743), CellIndex::new(0, 0));

        let admission = dedup.admit(
            hit("B", "Katz's Delicatessen", 40.72226, -73.98745),
            CellIndex::new(1, 0),
        );
        let suspect = match admission {
            Admission::SuspectedDuplicate(suspect) => suspect,
            other => panic!("expected suspected duplicate, got {other:?}"),
        };
        assert_eq!(suspect.kept, "A");
        assert_eq!(suspect.incoming, "B");
        assert!(suspect.distance_m < 15.0);
        assert!(dedup.get("B").is_none());
        assert_eq!(dedup.ambiguities().len(), 1);

        assert_eq!(
            dedup.admit(hit("B", "Katz's Delicatessen", 40.72226, -73.98745), CellIndex::new(1, 1)),
            Admission::Known("A".into())
        );
        assert_eq!(dedup.ambiguities().len(), 1);
        assert_eq!(dedup.get("A").unwrap().origins.len(), 2);
    }

    #[test]
    fn admits_neighbours_with_different_names_or_distance() {
        let mut dedup = Deduplicator::new(DedupPolicy::default());
        dedup.admit(hit("A", "Joe's Pizza", 40.7306, -73.9890), CellIndex::new(0, 0));
        let other_name = dedup.admit(hit("B", "Ramen Shop", 40.7306, -73.9890), CellIndex::new(0, 0));
        let far_away = dedup.admit(hit("C", "Joe's Pizza", 40.7406, -73.9890), CellIndex::new(0, 0));
        assert_eq!(other_name, Admission::New("B".into()));
        assert_eq!(far_away, Admission::New("C".into()));
        assert!(dedup.ambiguities().is_empty());
    }

    #[test]
    fn zero_distance_disables_proximity_check() {
        let mut dedup = Deduplicator::new(DedupPolicy {
            distance_m: 0.0,
            name_similarity: 0.9,
        });
        dedup.admit(hit("A", "Same", 40.0, -73.0), CellIndex::new(0, 0));
        assert_eq!(
            dedup.admit(hit("B", "Same", 40.0, -73.0), CellIndex::new(0, 0)),
            Admission::New("B".into())
        );
        let ids: Vec<_> = dedup.ids().cloned().collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn dice_similarity() {
        assert_eq!(dice_coefficient("night", "night"), 1.0);
        assert!((dice_coefficient("night", "nacht") - 0.25).abs() < 1e-9);
        assert_eq!(dice_coefficient("a", "b"), 0.0);
        assert_eq!(normalize_name("  Joe's   PIZZA! "), "joe s pizza");
    }
}
