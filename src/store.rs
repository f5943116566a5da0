//! The catalog store.
//!
//! [`CatalogStore`] owns every table: datasets, images, extracted sources, the live
//! and retired running-catalog entries, the zone index and the association graph.
//! All state sits behind one [`parking_lot::RwLock`]; readers get a [`StoreView`]
//! for the duration of a closure, writers go through a [`Transaction`].
//!
//! Transactions are optimistic. Every zone bin carries a version that is bumped on
//! each committed change to an entry inside it. A transaction records the versions
//! of the bins it read in [`Transaction::snapshot`] and [`Transaction::commit`]
//! fails with [`Error::StoreConflict`] if any of them moved in the meantime.
//! Dropping a transaction without committing discards it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use log::debug;
use parking_lot::RwLock;

use crate::association::{Association, AssociationGraph, AssociationId, PendingAssociation};
use crate::catalog::RunningCatalogEntry;
use crate::error::{Error, Result};
use crate::source::{
    Band, Dataset, DatasetId, ExtractedSource, Image, ImageId, Measurement, SourceId,
};
use crate::zones::{ZoneIndex, ZoneKey};

#[derive(Debug, Default)]
struct StoreState {
    next_dataset: u32,
    next_image: u64,
    next_source: u64,
    datasets: HashMap<DatasetId, Dataset>,
    images: HashMap<ImageId, Image>,
    sources: HashMap<SourceId, ExtractedSource>,
    image_sources: HashMap<ImageId, Vec<SourceId>>,
    entries: HashMap<SourceId, RunningCatalogEntry>,
    retired: HashMap<SourceId, RunningCatalogEntry>,
    zones: ZoneIndex,
    zone_versions: HashMap<ZoneKey, u64>,
    associations: AssociationGraph,
}

impl StoreState {
    fn zone_version(&self, key: &ZoneKey) -> u64 {
        self.zone_versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: ZoneKey) {
        *self.zone_versions.entry(key).or_insert(0) += 1;
    }

    fn unindex(&mut self, entry: &RunningCatalogEntry) {
        self.zones
            .remove(entry.dataset, entry.band, entry.id, entry.wm_ra, entry.wm_decl);
        self.bump(ZoneKey::of(entry.dataset, entry.band, entry.wm_decl));
    }

    fn index(&mut self, entry: &RunningCatalogEntry) {
        self.zones
            .insert(entry.dataset, entry.band, entry.id, entry.wm_ra, entry.wm_decl);
        self.bump(ZoneKey::of(entry.dataset, entry.band, entry.wm_decl));
    }
}

/// In-memory catalog store. Pass it by reference to every operation.
#[derive(Debug, Default)]
pub struct CatalogStore {
    state: RwLock<StoreState>,
}

impl CatalogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a consistent read-only view of the store.
    ///
    /// The read lock is held while `f` runs, so `f` must not write to the store.
    pub fn read<R>(&self, f: impl FnOnce(StoreView<'_>) -> R) -> R {
        let state = self.state.read();
        f(StoreView { state: &state })
    }

    /// Start a transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            read_versions: BTreeMap::new(),
            upserts: BTreeMap::new(),
            retirements: BTreeSet::new(),
            edges: Vec::new(),
        }
    }

    /// Register a dataset.
    pub fn insert_dataset(&self, description: impl Into<String>) -> DatasetId {
        let mut state = self.state.write();
        state.next_dataset += 1;
        let id = DatasetId(state.next_dataset);
        state.datasets.insert(
            id,
            Dataset {
                id,
                description: description.into(),
            },
        );
        id
    }

    /// Register an image. Its `id` field is replaced by the assigned one.
    pub fn insert_image(&self, mut image: Image) -> Result<ImageId> {
        let mut state = self.state.write();
        if !state.datasets.contains_key(&image.dataset) {
            return Err(Error::UnknownDataset(image.dataset));
        }
        state.next_image += 1;
        image.id = ImageId(state.next_image);
        let id = image.id;
        state.images.insert(id, image);
        state.image_sources.insert(id, Vec::new());
        Ok(id)
    }

    /// Store the measurements of one image and return their ids in input order.
    ///
    /// Zone and unit vector are derived here. Values are stored as given,
    /// validation happens when the sources are associated.
    pub fn insert_extracted_sources(
        &self,
        image: ImageId,
        measurements: &[Measurement],
    ) -> Result<Vec<SourceId>> {
        let mut state = self.state.write();
        if !state.images.contains_key(&image) {
            return Err(Error::UnknownImage(image));
        }

        let first = state.next_source + 1;
        state.next_source += measurements.len() as u64;
        let ids = (first..=state.next_source).map(SourceId).collect_vec();
        for (id, m) in ids.iter().zip(measurements) {
            state
                .sources
                .insert(*id, ExtractedSource::from_measurement(*id, image, m));
        }
        state
            .image_sources
            .entry(image)
            .or_default()
            .extend(ids.iter().copied());
        debug!("Stored {} sources for image {image}.", ids.len());
        Ok(ids)
    }

    /// Dataset by id.
    pub fn dataset(&self, id: DatasetId) -> Option<Dataset> {
        self.read(|view| view.dataset(id).cloned())
    }

    /// Image by id.
    pub fn image(&self, id: ImageId) -> Option<Image> {
        self.read(|view| view.image(id).cloned())
    }

    /// Extracted source by id.
    pub fn extracted_source(&self, id: SourceId) -> Option<ExtractedSource> {
        self.read(|view| view.extracted_source(id).cloned())
    }

    /// Live running-catalog entry by id.
    pub fn entry(&self, id: SourceId) -> Option<RunningCatalogEntry> {
        self.read(|view| view.entry(id).cloned())
    }

    /// Running-catalog entry by id, including entries retired by a split.
    pub fn entry_any(&self, id: SourceId) -> Option<RunningCatalogEntry> {
        self.read(|view| view.entry_any(id).cloned())
    }

    /// Whether `id` was retired by a split.
    pub fn is_retired(&self, id: SourceId) -> bool {
        self.read(|view| view.retired_entry(id).is_some())
    }

    /// Live entries of a dataset, ordered by id.
    pub fn entries(&self, dataset: DatasetId) -> Vec<RunningCatalogEntry> {
        self.read(|view| view.entries(dataset).cloned().collect())
    }

    /// Association by id.
    pub fn association(&self, id: AssociationId) -> Option<Association> {
        self.read(|view| view.association(id).cloned())
    }

    /// Associations owned by running-catalog id `id`, in commit order.
    pub fn associations_of(&self, id: SourceId) -> Vec<Association> {
        self.read(|view| view.associations_of(id).cloned().collect())
    }

    /// Associations whose target is `id`, in commit order.
    pub fn associations_to(&self, id: SourceId) -> Vec<Association> {
        self.read(|view| view.associations_to(id).cloned().collect())
    }

    /// Number of associations.
    pub fn n_associations(&self) -> usize {
        self.read(|view| view.state.associations.len())
    }

    /// Ids of live entries within the search box of `radius` around `(ra, decl)`,
    /// ordered by id.
    pub fn candidates(
        &self,
        dataset: DatasetId,
        band: Band,
        ra: f64,
        decl: f64,
        radius: f64,
    ) -> Vec<SourceId> {
        self.read(|view| {
            view.candidates(dataset, band, ra, decl, radius)
                .map(|e| e.id)
                .sorted()
                .collect()
        })
    }
}

/// Read-only view of the store, valid while the read lock is held.
#[derive(Debug, Clone, Copy)]
pub struct StoreView<'a> {
    state: &'a StoreState,
}

impl<'a> StoreView<'a> {
    /// Dataset by id.
    pub fn dataset(self, id: DatasetId) -> Option<&'a Dataset> {
        self.state.datasets.get(&id)
    }

    /// Image by id.
    pub fn image(self, id: ImageId) -> Option<&'a Image> {
        self.state.images.get(&id)
    }

    /// Extracted source by id.
    pub fn extracted_source(self, id: SourceId) -> Option<&'a ExtractedSource> {
        self.state.sources.get(&id)
    }

    /// Extracted sources of an image in insertion order.
    pub fn sources_of_image(
        self,
        image: ImageId,
    ) -> impl Iterator<Item = &'a ExtractedSource> + 'a {
        let sources = &self.state.sources;
        self.state
            .image_sources
            .get(&image)
            .into_iter()
            .flatten()
            .filter_map(move |id| sources.get(id))
    }

    /// Live entry by id.
    pub fn entry(self, id: SourceId) -> Option<&'a RunningCatalogEntry> {
        self.state.entries.get(&id)
    }

    /// Entry retired by a split.
    pub fn retired_entry(self, id: SourceId) -> Option<&'a RunningCatalogEntry> {
        self.state.retired.get(&id)
    }

    /// Live or retired entry by id.
    pub fn entry_any(self, id: SourceId) -> Option<&'a RunningCatalogEntry> {
        self.entry(id).or_else(|| self.retired_entry(id))
    }

    /// Live entries of a dataset, ordered by id.
    pub fn entries(self, dataset: DatasetId) -> impl Iterator<Item = &'a RunningCatalogEntry> + 'a {
        self.state
            .entries
            .values()
            .filter(move |e| e.dataset == dataset)
            .sorted_by_key(|e| e.id)
    }

    /// Live entries inside the search box of `radius` around `(ra, decl)`, in index order.
    pub fn candidates(
        self,
        dataset: DatasetId,
        band: Band,
        ra: f64,
        decl: f64,
        radius: f64,
    ) -> impl Iterator<Item = &'a RunningCatalogEntry> + 'a {
        let entries = &self.state.entries;
        self.state
            .zones
            .candidates(dataset, band, ra, decl, radius)
            .filter_map(move |id| entries.get(&id))
    }

    /// Association by id.
    pub fn association(self, id: AssociationId) -> Option<&'a Association> {
        self.state.associations.get(id)
    }

    /// Associations owned by running-catalog id `id`.
    pub fn associations_of(self, id: SourceId) -> impl Iterator<Item = &'a Association> + 'a {
        self.state.associations.from_source(id)
    }

    /// Associations whose target is `id`.
    pub fn associations_to(self, id: SourceId) -> impl Iterator<Item = &'a Association> + 'a {
        self.state.associations.to_target(id)
    }

    /// Whether `detection` contributes to an entry, live or retired.
    pub fn has_contributed(self, detection: SourceId) -> bool {
        self.associations_to(detection)
            .chain(self.associations_of(detection))
            .any(|edge| edge.contributed_detection() == Some(detection))
    }

    /// Current version of a zone bin.
    pub fn zone_version(self, key: &ZoneKey) -> u64 {
        self.state.zone_version(key)
    }
}

/// A set of writes applied atomically by [`commit`](Self::commit).
///
/// Nothing is visible to other readers before the commit.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s CatalogStore,
    read_versions: BTreeMap<ZoneKey, u64>,
    upserts: BTreeMap<SourceId, RunningCatalogEntry>,
    retirements: BTreeSet<SourceId>,
    edges: Vec<PendingAssociation>,
}

impl<'s> Transaction<'s> {
    /// Read the store under one lock, registering `zones` as read.
    ///
    /// A zone keeps the version it had the first time it was registered.
    pub fn snapshot<R>(
        &mut self,
        zones: impl IntoIterator<Item = ZoneKey>,
        f: impl FnOnce(StoreView<'_>) -> R,
    ) -> R {
        let state = self.store.state.read();
        for key in zones {
            self.read_versions
                .entry(key)
                .or_insert_with(|| state.zone_version(&key));
        }
        f(StoreView { state: &state })
    }

    /// Insert a new entry or replace a live one.
    pub fn put_entry(&mut self, entry: RunningCatalogEntry) {
        self.upserts.insert(entry.id, entry);
    }

    /// Move a live entry to the retired table, removing it from the zone index.
    pub fn retire(&mut self, id: SourceId) {
        self.retirements.insert(id);
    }

    /// Queue an association.
    pub fn associate(&mut self, edge: PendingAssociation) {
        self.edges.push(edge);
    }

    /// Whether the transaction holds no writes.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.retirements.is_empty() && self.edges.is_empty()
    }

    /// Apply every queued write, or none of them.
    ///
    /// Returns the ids of the new associations in the order they were queued.
    ///
    /// # Errors
    /// - [`Error::StoreConflict`] if a zone read through [`snapshot`](Self::snapshot)
    ///   was changed by another commit.
    /// - [`Error::UnknownSource`] if a retired entry is not live.
    pub fn commit(self) -> Result<Vec<AssociationId>> {
        let store = self.store;
        let mut state = store.state.write();

        for (key, version) in &self.read_versions {
            if state.zone_version(key) != *version {
                return Err(Error::StoreConflict {
                    dataset: key.dataset,
                    zone: key.zone,
                });
            }
        }
        if let Some(id) = self
            .retirements
            .iter()
            .find(|id| !state.entries.contains_key(*id))
        {
            return Err(Error::UnknownSource(*id));
        }

        for id in &self.retirements {
            if let Some(entry) = state.entries.remove(id) {
                state.unindex(&entry);
                state.retired.insert(*id, entry);
            }
        }
        for (id, entry) in self.upserts {
            if let Some(old) = state.entries.remove(&id) {
                state.unindex(&old);
            }
            state.index(&entry);
            state.entries.insert(id, entry);
        }
        Ok(self
            .edges
            .into_iter()
            .map(|edge| state.associations.push(edge))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::association::AssociationMethod;
    use crate::source::tests::measurement;

    /// Store with one dataset and `n_images` hourly images in band 0.
    pub(crate) fn store_with_images(n_images: usize) -> (CatalogStore, DatasetId, Vec<ImageId>) {
        let store = CatalogStore::new();
        let dataset = store.insert_dataset("test");
        let images = (0..n_images)
            .map(|i| {
                let taustart = Utc.with_ymd_and_hms(2024, 1, 1, i as u32, 0, 0).unwrap();
                store
                    .insert_image(
                        Image::new(dataset, Band(0), taustart)
                            .with_frequency(150e6, 1e6)
                            .with_tau_time(60.),
                    )
                    .unwrap()
            })
            .collect();
        (store, dataset, images)
    }

    fn new_entry(store: &CatalogStore, image: ImageId, ra: f64, decl: f64) -> SourceId {
        let ids = store
            .insert_extracted_sources(image, &[measurement(ra, decl, 0.001, 5., 0.1)])
            .unwrap();
        let source = store.extracted_source(ids[0]).unwrap();
        let mut tx = store.transaction();
        tx.put_entry(RunningCatalogEntry::from_detection(&source, DatasetId(1), Band(0)));
        tx.associate(PendingAssociation::identity(source.id, AssociationMethod::New));
        tx.commit().unwrap();
        source.id
    }

    #[test]
    fn metadata() {
        let (store, dataset, images) = store_with_images(2);
        assert_eq!(store.dataset(dataset).unwrap().description, "test");
        assert_eq!(store.image(images[1]).unwrap().id, images[1]);
        assert!(matches!(
            store.insert_image(Image::new(DatasetId(9), Band(0), Utc::now())),
            Err(Error::UnknownDataset(DatasetId(9)))
        ));
        assert!(matches!(
            store.insert_extracted_sources(ImageId(99), &[]),
            Err(Error::UnknownImage(ImageId(99)))
        ));

        let ids = store
            .insert_extracted_sources(
                images[0],
                &[measurement(10., 45.5, 0.001, 1., 0.1), measurement(11., -3.2, 0.001, 1., 0.1)],
            )
            .unwrap();
        assert_eq!(ids, vec![SourceId(1), SourceId(2)]);
        let source = store.extracted_source(SourceId(2)).unwrap();
        assert_eq!((source.image, source.zone), (images[0], -4));

        let more = store
            .insert_extracted_sources(images[1], &[measurement(10., 45.5, 0.001, 1., 0.1)])
            .unwrap();
        assert_eq!(more, vec![SourceId(3)]);
        assert_eq!(
            store.read(|v| v.sources_of_image(images[0]).map(|s| s.id).collect_vec()),
            ids
        );
    }

    #[test]
    fn commit_and_index() {
        let (store, dataset, images) = store_with_images(1);
        let id = new_entry(&store, images[0], 10., 45.);

        assert_eq!(store.entries(dataset).len(), 1);
        assert_eq!(store.candidates(dataset, Band(0), 10., 45., 0.025), vec![id]);
        assert_eq!(store.associations_of(id).len(), 1);
        assert_eq!(store.n_associations(), 1);
    }

    #[test]
    fn retire_removes_from_index() {
        let (store, dataset, images) = store_with_images(1);
        let id = new_entry(&store, images[0], 10., 45.);

        let mut tx = store.transaction();
        tx.retire(id);
        tx.associate(PendingAssociation::identity(id, AssociationMethod::SplitIdentity));
        tx.commit().unwrap();

        assert!(store.entry(id).is_none());
        assert!(store.is_retired(id));
        assert_eq!(store.entry_any(id).unwrap().id, id);
        assert!(store.candidates(dataset, Band(0), 10., 45., 0.025).is_empty());

        let mut tx = store.transaction();
        tx.retire(id);
        assert!(matches!(tx.commit(), Err(Error::UnknownSource(_))));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (store, dataset, images) = store_with_images(1);
        let id = new_entry(&store, images[0], 10., 45.);
        let before = store.entry(id).unwrap();

        {
            let mut tx = store.transaction();
            let mut changed = before.clone();
            changed.datapoints = 7;
            tx.put_entry(changed);
            tx.retire(id);
            tx.associate(PendingAssociation::identity(id, AssociationMethod::SplitIdentity));
        }

        assert_eq!(store.entry(id).unwrap(), before);
        assert_eq!(store.entries(dataset).len(), 1);
        assert_eq!(store.n_associations(), 1);
    }

    #[test]
    fn concurrent_commit_conflicts() {
        let (store, dataset, images) = store_with_images(2);
        let id = new_entry(&store, images[0], 10., 45.);
        let key = ZoneKey::of(dataset, Band(0), 45.);

        let mut slow = store.transaction();
        let seen = slow.snapshot([key], |view| {
            view.candidates(dataset, Band(0), 10., 45., 0.025).count()
        });
        assert_eq!(seen, 1);

        // another batch updates the same zone first
        let mut fast = store.transaction();
        let mut entry = store.entry(id).unwrap();
        entry.datapoints += 1;
        fast.put_entry(entry);
        fast.commit().unwrap();

        let mut entry = store.entry(id).unwrap();
        entry.datapoints += 1;
        slow.put_entry(entry);
        assert!(matches!(
            slow.commit(),
            Err(Error::StoreConflict { dataset: DatasetId(1), zone: 45 })
        ));
        assert_eq!(store.entry(id).unwrap().datapoints, 2);
    }

    #[test]
    fn disjoint_zones_do_not_conflict() {
        let (store, dataset, images) = store_with_images(1);
        let mut tx = store.transaction();
        tx.snapshot([ZoneKey::of(dataset, Band(0), -20.)], |_| ());

        new_entry(&store, images[0], 10., 45.);
        assert!(tx.commit().is_ok());
    }
}
