//! Declination-zone index of running-catalog entries.
//!
//! Entries are binned by `(dataset, band, zone)` and, inside a zone, ordered by ra.
//! A search box of radius `θ` around `(ra, decl)` touches the zones
//! `[floor(decl - θ), floor(decl + θ)]` and the ra interval `ra ± alpha(θ, decl)`,
//! split in two when it wraps around ra = 0.
//! The box is only a prefilter, exact matching is done by the caller.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::geometry::{alpha, ra_intervals, wrap_ra, zone, zone_range};
use crate::source::{Band, DatasetId, SourceId};

/// Key of one zone bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneKey {
    /// Dataset of the entries.
    pub dataset: DatasetId,
    /// Band of the entries.
    pub band: Band,
    /// Declination zone.
    pub zone: i32,
}

impl ZoneKey {
    /// Zone bin containing `decl`.
    pub fn of(dataset: DatasetId, band: Band, decl: f64) -> Self {
        Self {
            dataset,
            band,
            zone: zone(decl),
        }
    }

    /// All zone bins a search of `radius` around `decl` touches.
    pub fn around(
        dataset: DatasetId,
        band: Band,
        decl: f64,
        radius: f64,
    ) -> impl Iterator<Item = ZoneKey> {
        zone_range(decl, radius).map(move |zone| ZoneKey {
            dataset,
            band,
            zone,
        })
    }
}

/// Totally ordered ra, so it can key a `BTreeMap`.
#[derive(Debug, Clone, Copy)]
struct RaKey(f64);

impl PartialEq for RaKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RaKey {}

impl PartialOrd for RaKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RaKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Zone index over entry positions; stores the declination next to each id
/// so the decl cut needs no entry lookup.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    zones: BTreeMap<ZoneKey, BTreeMap<(RaKey, SourceId), f64>>,
}

impl ZoneIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.zones.values().map(BTreeMap::len).sum()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.zones.values().all(BTreeMap::is_empty)
    }

    /// Index an entry at `(ra, decl)`; `ra` must lie in `[0, 360)`.
    pub fn insert(&mut self, dataset: DatasetId, band: Band, id: SourceId, ra: f64, decl: f64) {
        self.zones
            .entry(ZoneKey::of(dataset, band, decl))
            .or_default()
            .insert((RaKey(ra), id), decl);
    }

    /// Remove an entry previously inserted at `(ra, decl)`. Returns whether it was present.
    pub fn remove(
        &mut self,
        dataset: DatasetId,
        band: Band,
        id: SourceId,
        ra: f64,
        decl: f64,
    ) -> bool {
        let key = ZoneKey::of(dataset, band, decl);
        let Some(bin) = self.zones.get_mut(&key) else {
            return false;
        };
        let removed = bin.remove(&(RaKey(ra), id)).is_some();
        if bin.is_empty() {
            self.zones.remove(&key);
        }
        removed
    }

    /// Ids of entries inside the search box of `radius` around `(ra, decl)`.
    ///
    /// Lazy; ids come out ordered by zone, then ra.
    pub fn candidates(
        &self,
        dataset: DatasetId,
        band: Band,
        ra: f64,
        decl: f64,
        radius: f64,
    ) -> impl Iterator<Item = SourceId> + '_ {
        let intervals = ra_intervals(wrap_ra(ra), alpha(radius, decl));
        let (decl_min, decl_max) = (decl - radius, decl + radius);

        ZoneKey::around(dataset, band, decl, radius)
            .filter_map(move |key| self.zones.get(&key))
            .flat_map(move |bin| {
                intervals.clone().into_iter().flat_map(move |(lo, hi)| {
                    bin.range((RaKey(lo), SourceId(u64::MIN))..=(RaKey(hi), SourceId(u64::MAX)))
                })
            })
            .filter(move |(_, decl)| (decl_min..=decl_max).contains(*decl))
            .map(|((_, id), _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    const DS: DatasetId = DatasetId(1);
    const BAND: Band = Band(0);

    #[test]
    fn box_search() {
        let mut index = ZoneIndex::new();
        index.insert(DS, BAND, SourceId(1), 10., 45.);
        index.insert(DS, BAND, SourceId(2), 10.03, 45.);
        index.insert(DS, BAND, SourceId(3), 10.1, 45.);
        index.insert(DS, BAND, SourceId(4), 10., 44.99);
        index.insert(DS, BAND, SourceId(5), 10., 45.1);
        index.insert(DatasetId(2), BAND, SourceId(6), 10., 45.);
        index.insert(DS, Band(1), SourceId(7), 10., 45.);
        assert_eq!(index.len(), 7);

        // alpha(0.025, 45) is about 0.0354, so 10.03 is inside and 10.1 is not
        let found = index
            .candidates(DS, BAND, 10., 45., 0.025)
            .sorted()
            .collect_vec();
        assert_eq!(found, vec![SourceId(1), SourceId(2), SourceId(4)]);
    }

    #[test]
    fn wraps_around_ra_zero() {
        let mut index = ZoneIndex::new();
        index.insert(DS, BAND, SourceId(1), 359.99, 0.);
        index.insert(DS, BAND, SourceId(2), 0.01, 0.);
        index.insert(DS, BAND, SourceId(3), 180., 0.);

        let found = index
            .candidates(DS, BAND, 0., 0., 0.025)
            .sorted()
            .collect_vec();
        assert_eq!(found, vec![SourceId(1), SourceId(2)]);
    }

    #[test]
    fn pole_searches_whole_ring() {
        let mut index = ZoneIndex::new();
        index.insert(DS, BAND, SourceId(1), 0., 89.99);
        index.insert(DS, BAND, SourceId(2), 180., 89.99);

        let found = index
            .candidates(DS, BAND, 90., 90., 0.025)
            .sorted()
            .collect_vec();
        assert_eq!(found, vec![SourceId(1), SourceId(2)]);
    }

    #[test]
    fn remove() {
        let mut index = ZoneIndex::new();
        index.insert(DS, BAND, SourceId(1), 10., 45.);
        assert!(!index.remove(DS, BAND, SourceId(1), 10., 44.));
        assert!(index.remove(DS, BAND, SourceId(1), 10., 45.));
        assert!(index.is_empty());
        assert_eq!(index.candidates(DS, BAND, 10., 45., 0.025).count(), 0);
    }
}
