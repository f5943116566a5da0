//! Monitoring list and transient bookkeeping.

use std::fmt;

use log::{debug, info};

use crate::association::{AssociationId, AssociationMethod, PendingAssociation};
use crate::catalog::RunningCatalogEntry;
use crate::error::{Error, Result};
use crate::geometry::angular_distance_arcsec;
use crate::matching::de_ruiter_radius;
use crate::source::{DatasetId, ImageId, SourceId};
use crate::store::CatalogStore;
use crate::variability::{VariabilityIndices, lineage};

/// Id of a monitoring target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonitorId(pub u64);

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a monitoring target points at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSubject {
    /// A user-supplied position with no catalog entry yet.
    Placeholder {
        /// Right ascension in degrees.
        ra: f64,
        /// Declination in degrees.
        decl: f64,
    },
    /// A running-catalog entry.
    Catalogued(SourceId),
}

/// A position measured in every image of its dataset, detected or not.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringTarget {
    /// Target id.
    pub id: MonitorId,
    /// Dataset the target belongs to.
    pub dataset: DatasetId,
    /// What the target points at.
    pub subject: TargetSubject,
}

/// An entry flagged as transient.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientRecord {
    /// The entry, following splits to the latest one.
    pub entry: SourceId,
    /// Oldest ancestor of the entry. Every entry split off it shares this record.
    pub root: SourceId,
    /// Variability indices at the last update.
    pub indices: VariabilityIndices,
    /// The association that first triggered the flag.
    pub trigger: AssociationId,
}

/// A target that still needs a forced measurement in an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForcedTarget {
    /// The target.
    pub target: MonitorId,
    /// Right ascension to measure at.
    pub ra: f64,
    /// Declination to measure at.
    pub decl: f64,
}

/// Keeps the monitoring list and the transient records of a store.
///
/// Targets and records refer to store ids without owning anything in the store.
#[derive(Debug)]
pub struct MonitoringManager<'s> {
    store: &'s CatalogStore,
    targets: Vec<MonitoringTarget>,
    transients: Vec<TransientRecord>,
}

impl<'s> MonitoringManager<'s> {
    /// Manager with empty lists.
    pub fn new(store: &'s CatalogStore) -> Self {
        Self {
            store,
            targets: Vec::new(),
            transients: Vec::new(),
        }
    }

    /// All targets.
    pub fn targets(&self) -> &[MonitoringTarget] {
        &self.targets
    }

    /// Target by id.
    pub fn target(&self, id: MonitorId) -> Option<&MonitoringTarget> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// All transient records.
    pub fn transients(&self) -> &[TransientRecord] {
        &self.transients
    }

    fn push_target(&mut self, dataset: DatasetId, subject: TargetSubject) -> MonitorId {
        let id = MonitorId(self.targets.len() as u64 + 1);
        self.targets.push(MonitoringTarget {
            id,
            dataset,
            subject,
        });
        id
    }

    /// Monitor a position that has no catalog entry yet.
    pub fn add_monitoring_target(
        &mut self,
        dataset: DatasetId,
        ra: f64,
        decl: f64,
    ) -> Result<MonitorId> {
        if self.store.dataset(dataset).is_none() {
            return Err(Error::UnknownDataset(dataset));
        }
        Ok(self.push_target(dataset, TargetSubject::Placeholder { ra, decl }))
    }

    /// Monitor a running-catalog entry. Returns the existing target if there is one.
    pub fn monitor_entry(&mut self, entry: SourceId) -> Result<MonitorId> {
        let dataset = self
            .store
            .entry_any(entry)
            .ok_or(Error::UnknownSource(entry))?
            .dataset;
        if let Some(target) = self
            .targets
            .iter()
            .find(|t| t.subject == TargetSubject::Catalogued(entry))
        {
            return Ok(target.id);
        }
        Ok(self.push_target(dataset, TargetSubject::Catalogued(entry)))
    }

    /// Whether `entry` is on the monitoring list.
    pub fn is_monitored(&self, entry: SourceId) -> bool {
        self.targets
            .iter()
            .any(|t| t.subject == TargetSubject::Catalogued(entry))
    }

    /// Targets of the image's dataset without a detection in the image, with the
    /// position to force-measure at.
    pub fn monitoring_not_observed(&self, image: ImageId) -> Result<Vec<ForcedTarget>> {
        self.store.read(|view| {
            let dataset = view.image(image).ok_or(Error::UnknownImage(image))?.dataset;
            let mut pending = Vec::new();
            for target in self.targets.iter().filter(|t| t.dataset == dataset) {
                let (ra, decl) = match target.subject {
                    TargetSubject::Placeholder { ra, decl } => (ra, decl),
                    TargetSubject::Catalogued(id) => {
                        let observed = view
                            .associations_of(id)
                            .filter_map(|e| e.contributed_detection())
                            .filter_map(|d| view.extracted_source(d))
                            .any(|d| d.image == image);
                        if observed {
                            continue;
                        }
                        let entry = view.entry_any(id).ok_or(Error::UnknownSource(id))?;
                        (entry.wm_ra, entry.wm_decl)
                    }
                };
                pending.push(ForcedTarget {
                    target: target.id,
                    ra,
                    decl,
                });
            }
            Ok(pending)
        })
    }

    /// Flag `entry` as transient because of `trigger_detection`.
    ///
    /// A record sharing its oldest ancestor with `entry` is updated in place and moved
    /// to `entry`, so split siblings keep one record; otherwise a new record is created.
    /// Either way `entry` ends up monitored, re-pointing a target that followed one of
    /// its ancestors.
    ///
    /// # Errors
    /// - [`Error::UnknownSource`] if `trigger_detection` did not contribute to `entry`.
    /// - [`Error::CycleDetected`] if the ancestry of `entry` is cyclic.
    pub fn flag_transient(
        &mut self,
        entry: SourceId,
        indices: VariabilityIndices,
        trigger_detection: SourceId,
    ) -> Result<TransientRecord> {
        let ancestry = lineage(self.store, entry)?;
        let root = ancestry.last().copied().unwrap_or(entry);

        let record = match self.transients.iter_mut().find(|r| r.root == root) {
            Some(record) => {
                debug!("Updating transient {} as {entry}.", record.entry);
                record.entry = entry;
                record.indices = indices;
                record.clone()
            }
            None => {
                let trigger = self
                    .store
                    .associations_of(entry)
                    .into_iter()
                    .find(|e| e.contributed_detection() == Some(trigger_detection))
                    .ok_or(Error::UnknownSource(trigger_detection))?
                    .id;
                info!(
                    "Flagging {entry} as transient (V = {:.3}, eta = {:.3}).",
                    indices.v, indices.eta
                );
                let record = TransientRecord {
                    entry,
                    root,
                    indices,
                    trigger,
                };
                self.transients.push(record.clone());
                record
            }
        };

        match self.targets.iter_mut().find(|t| {
            matches!(t.subject, TargetSubject::Catalogued(id) if ancestry.contains(&id))
        }) {
            Some(target) => target.subject = TargetSubject::Catalogued(entry),
            None => {
                self.monitor_entry(entry)?;
            }
        }
        Ok(record)
    }

    /// Record a forced measurement `detection` for `target`.
    ///
    /// A placeholder target founds a new entry, exactly like an unmatched detection,
    /// and is resolved to it. A catalogued target gets a
    /// [`Single`](AssociationMethod::Single) association while the entry's statistics
    /// stay untouched. Returns the entry id.
    pub fn record_forced_measurement(
        &mut self,
        target: MonitorId,
        detection: SourceId,
    ) -> Result<SourceId> {
        let subject = self.target(target).ok_or(Error::UnknownTarget(target))?.subject;
        let source = self
            .store
            .extracted_source(detection)
            .ok_or(Error::UnknownSource(detection))?;
        let image = self
            .store
            .image(source.image)
            .ok_or(Error::UnknownImage(source.image))?;
        source.validate()?;

        let mut tx = self.store.transaction();
        let entry = match subject {
            TargetSubject::Placeholder { .. } => {
                tx.put_entry(RunningCatalogEntry::from_detection(
                    &source,
                    image.dataset,
                    image.band,
                ));
                tx.associate(PendingAssociation::identity(source.id, AssociationMethod::New));
                source.id
            }
            TargetSubject::Catalogued(id) => {
                let entry = self.store.entry_any(id).ok_or(Error::UnknownSource(id))?;
                tx.associate(PendingAssociation {
                    source_id: id,
                    target_id: source.id,
                    distance_arcsec: angular_distance_arcsec(&entry.xyz, &source.xyz),
                    r: de_ruiter_radius(&entry, &source)?,
                    method: AssociationMethod::Single,
                });
                id
            }
        };
        tx.commit()?;

        if let Some(t) = self.targets.iter_mut().find(|t| t.id == target) {
            t.subject = TargetSubject::Catalogued(entry);
        }
        debug!("Forced measurement {detection} recorded for target {target} as {entry}.");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::Associator;
    use crate::source::tests::measurement;
    use crate::store::tests::store_with_images;
    use crate::variability::{lightcurve, variability};

    fn indices(v: f64) -> VariabilityIndices {
        VariabilityIndices { v, eta: 10. }
    }

    #[test]
    fn placeholder_target() {
        let (store, dataset, images) = store_with_images(2);
        let mut manager = MonitoringManager::new(&store);
        let target = manager.add_monitoring_target(dataset, 150., -30.).unwrap();
        assert!(manager.add_monitoring_target(DatasetId(5), 0., 0.).is_err());

        assert_eq!(
            manager.monitoring_not_observed(images[0]).unwrap(),
            vec![ForcedTarget { target, ra: 150., decl: -30. }]
        );

        let ids = store
            .insert_extracted_sources(images[0], &[measurement(150., -30., 0.001, 0.01, 0.005)])
            .unwrap();
        let entry = manager.record_forced_measurement(target, ids[0]).unwrap();
        assert_eq!(entry, ids[0]);
        assert_eq!(store.entry(entry).unwrap().datapoints, 1);
        assert_eq!(store.associations_of(entry)[0].method, AssociationMethod::New);
        assert!(manager.is_monitored(entry));
        assert_eq!(manager.target(target).unwrap().subject, TargetSubject::Catalogued(entry));

        assert!(manager.monitoring_not_observed(images[0]).unwrap().is_empty());
        assert_eq!(manager.monitoring_not_observed(images[1]).unwrap().len(), 1);
    }

    #[test]
    fn forced_measurement_leaves_entry_alone() {
        let (store, _, images) = store_with_images(2);
        let ids = store
            .insert_extracted_sources(images[0], &[measurement(10., 45., 0.001, 5., 0.1)])
            .unwrap();
        Associator::new(&store).associate_extracted_sources(images[0]).unwrap();
        let before = store.entry(ids[0]).unwrap();

        let mut manager = MonitoringManager::new(&store);
        let target = manager.monitor_entry(before.id).unwrap();
        assert_eq!(manager.monitor_entry(before.id).unwrap(), target);

        let forced = store
            .insert_extracted_sources(images[1], &[measurement(10.0002, 45., 0.001, 0.2, 0.1)])
            .unwrap();
        manager.record_forced_measurement(target, forced[0]).unwrap();

        let after = store.entry(before.id).unwrap();
        assert_eq!(after, before);
        let edges = store.associations_of(before.id);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[1].method, AssociationMethod::Single);
        assert!(edges[1].r > 0. && edges[1].distance_arcsec > 0.);
        assert_eq!(lightcurve(&store, before.id).unwrap().len(), 2);

        assert!(matches!(
            manager.record_forced_measurement(MonitorId(42), forced[0]),
            Err(Error::UnknownTarget(MonitorId(42)))
        ));
    }

    #[test]
    fn transient_follows_split() {
        let (store, _, images) = store_with_images(4);
        let associator = Associator::new(&store);
        let mut manager = MonitoringManager::new(&store);

        let batches: [&[f64]; 3] = [&[10.], &[10.], &[10.0005, 9.9995]];
        let mut fluxes = [1., 9.].into_iter();
        for (image, batch) in images.iter().zip(batches) {
            let ms = batch
                .iter()
                .map(|&ra| measurement(ra, 45., 0.001, fluxes.next().unwrap_or(9.), 0.1))
                .collect::<Vec<_>>();
            store.insert_extracted_sources(*image, &ms).unwrap();
            associator.associate_extracted_sources(*image).unwrap();

            if *image == images[1] {
                let entry = store.entry(SourceId(1)).unwrap();
                let record = manager
                    .flag_transient(entry.id, variability(&entry).unwrap(), SourceId(2))
                    .unwrap();
                assert_eq!(record.entry, SourceId(1));
                assert_eq!(store.association(record.trigger).unwrap().target_id, SourceId(2));
                assert!(manager.is_monitored(SourceId(1)));
            }
        }

        // the split survivors descend from the flagged entry
        let record = manager.flag_transient(SourceId(3), indices(0.5), SourceId(3)).unwrap();
        assert_eq!(manager.transients().len(), 1);
        assert_eq!(record.entry, SourceId(3));
        assert_eq!(record.indices, indices(0.5));
        assert_eq!(store.association(record.trigger).unwrap().target_id, SourceId(2));
        assert_eq!(manager.targets().len(), 1);
        assert!(manager.is_monitored(SourceId(3)));
        assert!(!manager.is_monitored(SourceId(1)));

        // the sibling survivor shares the record
        let record = manager.flag_transient(SourceId(4), indices(0.7), SourceId(4)).unwrap();
        assert_eq!(manager.transients().len(), 1);
        assert_eq!((record.entry, record.root), (SourceId(4), SourceId(1)));
        assert_eq!(record.indices, indices(0.7));
        assert_eq!(store.association(record.trigger).unwrap().target_id, SourceId(2));
        assert!(manager.is_monitored(SourceId(4)));

        // an unrelated entry gets its own record
        let ids = store
            .insert_extracted_sources(images[3], &[measurement(20., 45., 0.001, 1., 0.1)])
            .unwrap();
        associator.associate_extracted_sources(images[3]).unwrap();
        assert!(matches!(
            manager.flag_transient(ids[0], indices(0.9), SourceId(99)),
            Err(Error::UnknownSource(SourceId(99)))
        ));
        let record = manager.flag_transient(ids[0], indices(0.9), ids[0]).unwrap();
        assert_eq!((record.entry, record.root), (ids[0], ids[0]));
        assert_eq!(manager.transients().len(), 2);
    }
}
