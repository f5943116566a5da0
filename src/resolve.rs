//! Association of one image's detections with the running catalog.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, error, info, warn};

use crate::association::{AssociationMethod, PendingAssociation};
use crate::catalog::RunningCatalogEntry;
use crate::error::{DomainError, Error, Result};
use crate::matching::{Candidate, CounterpartPolicy, score_candidates};
use crate::source::{ExtractedSource, Image, ImageId, SourceId};
use crate::store::{CatalogStore, StoreView, Transaction};
use crate::zones::ZoneKey;

/// Default De Ruiter radius below which a pair is a match.
pub const DEFAULT_DERUITER_RADIUS: f64 = 3.717;
/// Default radius of the candidate search box in degrees.
pub const DEFAULT_SEARCH_RADIUS: f64 = 0.025;

/// Parameters of the association pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssociationConfig {
    pub(crate) deruiter_radius: f64,
    pub(crate) search_radius: f64,
    pub(crate) policy: CounterpartPolicy,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            deruiter_radius: DEFAULT_DERUITER_RADIUS,
            search_radius: DEFAULT_SEARCH_RADIUS,
            policy: CounterpartPolicy::default(),
        }
    }
}

impl AssociationConfig {
    /// Set the dimensionless De Ruiter radius below which a detection matches an entry.
    pub fn with_deruiter_radius(mut self, radius: f64) -> Self {
        self.deruiter_radius = radius;
        self
    }

    /// Set the radius of the candidate search box in degrees.
    pub fn with_search_radius(mut self, radius: f64) -> Self {
        self.search_radius = radius;
        self
    }

    /// Set how one counterpart is picked among several matching entries.
    pub fn with_policy(mut self, policy: CounterpartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// De Ruiter radius threshold.
    pub fn deruiter_radius(&self) -> f64 {
        self.deruiter_radius
    }

    /// Search box radius in degrees.
    pub fn search_radius(&self) -> f64 {
        self.search_radius
    }

    /// Counterpart policy.
    pub fn policy(&self) -> CounterpartPolicy {
        self.policy
    }
}

/// What happened to one detection of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Merged into an existing entry.
    Single {
        /// The entry it was merged into.
        entry: SourceId,
    },
    /// Founded a new entry split off `ancestor`, which was matched by several
    /// detections of the same image.
    SplitSurvivor {
        /// The retired entry.
        ancestor: SourceId,
    },
    /// Matched nothing and founded a new entry.
    New,
    /// Excluded from matching.
    Rejected(DomainError),
}

/// Outcome of associating one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchReport {
    /// The image.
    pub image: ImageId,
    /// One outcome per detection, in the order the detections were stored.
    pub outcomes: Vec<(SourceId, DetectionOutcome)>,
    /// Detections merged into an existing entry.
    pub n_single: usize,
    /// Entries retired because several detections matched them.
    pub n_split_entries: usize,
    /// New entries created, including split survivors.
    pub n_new: usize,
    /// Detections rejected with a domain error.
    pub n_rejected: usize,
    /// Candidates within the threshold that lost against another candidate.
    pub n_discarded_candidates: usize,
}

impl BatchReport {
    /// Outcome of one detection.
    pub fn outcome(&self, detection: SourceId) -> Option<&DetectionOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == detection)
            .map(|(_, outcome)| outcome)
    }
}

type Scored = std::result::Result<Vec<Candidate>, DomainError>;

/// Associates the extracted sources of an image with the running catalog of its dataset.
///
/// Each image is one atomic batch:
/// 1. Every valid detection is scored against the live entries of its dataset and band
///    in the search box around it. Pairs with a De Ruiter radius below the threshold are kept.
/// 2. A detection with several candidates keeps one, chosen by the [`CounterpartPolicy`].
/// 3. An entry chosen by several detections is split: it is retired behind a
///    [`SplitIdentity`](AssociationMethod::SplitIdentity) edge and every detection founds a
///    new entry linked to it by a [`SplitSurvivor`](AssociationMethod::SplitSurvivor) edge.
/// 4. An entry chosen by exactly one detection absorbs it and gets a
///    [`Single`](AssociationMethod::Single) edge.
/// 5. A detection without candidates founds a new entry with a
///    [`New`](AssociationMethod::New) edge.
///
/// Nothing is written unless all phases succeed.
///
/// Example:
/// ```rust
/// # use runcat::{Associator, AssociationConfig, CatalogStore, CounterpartPolicy};
/// let store = CatalogStore::new();
/// let associator = Associator::new(&store).with_config(
///     AssociationConfig::default()
///         .with_deruiter_radius(3.717)
///         .with_policy(CounterpartPolicy::Brightest),
/// );
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Associator<'s> {
    store: &'s CatalogStore,
    config: AssociationConfig,
}

impl<'s> Associator<'s> {
    /// Associator with the default configuration.
    pub fn new(store: &'s CatalogStore) -> Self {
        Self {
            store,
            config: AssociationConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: AssociationConfig) -> Self {
        self.config = config;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// Associate all extracted sources of `image`.
    ///
    /// # Errors
    /// - [`Error::UnknownImage`] if the image is not stored.
    /// - [`Error::AlreadyAssociated`] if detections of the image already contribute to
    ///   the catalog. Nothing was written.
    /// - [`Error::StoreConflict`] if a concurrent batch changed a zone this batch read.
    ///   Nothing was written and the call can be retried.
    /// - [`Error::TransactionAborted`] for any other failure. Nothing was written.
    pub fn associate_extracted_sources(&self, image: ImageId) -> Result<BatchReport> {
        self.stage(image, |view, meta, detections| self.score_all(view, meta, detections))?
            .commit()
    }

    fn score_all(
        &self,
        view: StoreView<'_>,
        image: &Image,
        detections: &[ExtractedSource],
    ) -> Vec<Scored> {
        detections
            .iter()
            .map(|d| self.candidates(view, image, d))
            .collect()
    }

    /// Valid candidates of one detection, ordered by entry id.
    fn candidates(
        &self,
        view: StoreView<'_>,
        image: &Image,
        detection: &ExtractedSource,
    ) -> Scored {
        detection.validate()?;
        let entries = view
            .candidates(
                image.dataset,
                image.band,
                detection.ra,
                detection.decl,
                self.config.search_radius,
            )
            .sorted_by_key(|e| e.id);
        score_candidates(detection, entries, self.config.deruiter_radius)
    }

    /// Run the pipeline for `image` without writing anything yet.
    fn stage<F>(&self, image: ImageId, score: F) -> Result<StagedBatch<'s>>
    where
        F: FnOnce(StoreView<'_>, &Image, &[ExtractedSource]) -> Vec<Scored>,
    {
        let (meta, detections) = self.store.read(|view| {
            let meta = view.image(image).cloned().ok_or(Error::UnknownImage(image))?;
            let detections = view.sources_of_image(image).cloned().collect_vec();
            Ok::<_, Error>((meta, detections))
        })?;
        info!(
            "Associating {} detections of image {image} in dataset {}.",
            detections.len(),
            meta.dataset
        );

        self.run_batch(&meta, &detections, score)
            .map_err(|reason| abort(image, reason))
    }

    fn run_batch<F>(
        &self,
        image: &Image,
        detections: &[ExtractedSource],
        score: F,
    ) -> Result<StagedBatch<'s>>
    where
        F: FnOnce(StoreView<'_>, &Image, &[ExtractedSource]) -> Vec<Scored>,
    {
        let mut report = BatchReport {
            image: image.id,
            ..Default::default()
        };
        let mut tx = self.store.transaction();

        // Phase 1: candidates, and the entries they point to, from one snapshot.
        let zones = detections
            .iter()
            .filter(|d| d.validate().is_ok())
            .flat_map(|d| {
                ZoneKey::around(image.dataset, image.band, d.decl, self.config.search_radius)
            })
            .unique()
            .collect_vec();
        let snapshot = tx.snapshot(zones, |view| {
            if detections.iter().any(|d| view.has_contributed(d.id)) {
                return None;
            }
            let scored = score(view, image, detections);
            let matched: HashMap<SourceId, RunningCatalogEntry> = scored
                .iter()
                .flatten()
                .flatten()
                .filter_map(|c| view.entry(c.entry))
                .map(|e| (e.id, e.clone()))
                .collect();
            Some((scored, matched))
        });
        let (scored, mut matched) = snapshot.ok_or(Error::AlreadyAssociated(image.id))?;

        // Phase 2: one counterpart per detection.
        let mut outcomes: Vec<Option<DetectionOutcome>> = vec![None; detections.len()];
        let mut chosen = Vec::new();
        let mut unmatched = Vec::new();
        for (i, (detection, scored)) in detections.iter().zip(scored).enumerate() {
            match scored {
                Err(e) => {
                    warn!("Rejecting detection {}: {e}", detection.id);
                    report.n_rejected += 1;
                    outcomes[i] = Some(DetectionOutcome::Rejected(e));
                }
                Ok(candidates) => match self.config.policy.select(&candidates) {
                    Some(candidate) => {
                        report.n_discarded_candidates += candidates.len() - 1;
                        chosen.push((i, candidate));
                    }
                    None => unmatched.push(i),
                },
            }
        }

        // Phase 3: entries chosen by several detections are split.
        let (splits, singles): (Vec<_>, Vec<_>) = chosen
            .into_iter()
            .into_group_map_by(|(_, c)| c.entry)
            .into_iter()
            .sorted_by_key(|(entry, _)| *entry)
            .partition(|(_, group)| group.len() > 1);

        for (ancestor, group) in splits {
            let old = matched.remove(&ancestor).ok_or(Error::UnknownSource(ancestor))?;
            debug!(
                "Splitting entry {ancestor} (n = {}) across {} detections.",
                old.datapoints,
                group.len()
            );
            tx.retire(ancestor);
            tx.associate(PendingAssociation::identity(ancestor, AssociationMethod::SplitIdentity));
            for (i, candidate) in group {
                let detection = &detections[i];
                tx.put_entry(RunningCatalogEntry::from_detection(
                    detection,
                    image.dataset,
                    image.band,
                ));
                tx.associate(PendingAssociation {
                    source_id: detection.id,
                    target_id: ancestor,
                    distance_arcsec: candidate.distance_arcsec,
                    r: candidate.r,
                    method: AssociationMethod::SplitSurvivor,
                });
                outcomes[i] = Some(DetectionOutcome::SplitSurvivor { ancestor });
                report.n_new += 1;
            }
            report.n_split_entries += 1;
        }

        // Phase 4: one-to-one matches update their entry.
        for (entry_id, group) in singles {
            for (i, candidate) in group {
                let detection = &detections[i];
                let mut entry = matched.remove(&entry_id).ok_or(Error::UnknownSource(entry_id))?;
                entry.absorb(detection);
                tx.put_entry(entry);
                tx.associate(PendingAssociation {
                    source_id: entry_id,
                    target_id: detection.id,
                    distance_arcsec: candidate.distance_arcsec,
                    r: candidate.r,
                    method: AssociationMethod::Single,
                });
                outcomes[i] = Some(DetectionOutcome::Single { entry: entry_id });
                report.n_single += 1;
            }
        }

        // Phase 5: everything else founds a new entry.
        for i in unmatched {
            let detection = &detections[i];
            tx.put_entry(RunningCatalogEntry::from_detection(detection, image.dataset, image.band));
            tx.associate(PendingAssociation::identity(detection.id, AssociationMethod::New));
            outcomes[i] = Some(DetectionOutcome::New);
            report.n_new += 1;
        }

        report.outcomes = detections
            .iter()
            .zip(outcomes)
            .map(|(d, outcome)| outcome.map(|o| (d.id, o)).ok_or(Error::UnknownSource(d.id)))
            .collect::<Result<_>>()?;

        Ok(StagedBatch { tx, report })
    }
}

/// The writes and report of one batch, not yet visible to readers.
#[derive(Debug)]
struct StagedBatch<'s> {
    tx: Transaction<'s>,
    report: BatchReport,
}

impl StagedBatch<'_> {
    fn commit(self) -> Result<BatchReport> {
        let report = self.report;
        self.tx.commit().map_err(|reason| abort(report.image, reason))?;
        info!(
            "Image {}: {} single, {} split entries, {} new, {} rejected, {} candidates discarded.",
            report.image,
            report.n_single,
            report.n_split_entries,
            report.n_new,
            report.n_rejected,
            report.n_discarded_candidates
        );
        Ok(report)
    }
}

/// Errors the caller can act on pass through, anything else aborts the batch.
fn abort(image: ImageId, reason: Error) -> Error {
    match reason {
        Error::StoreConflict { .. } | Error::AlreadyAssociated(_) => {
            warn!("Batch for image {image} not applied: {reason}");
            reason
        }
        reason => {
            error!("Batch for image {image} aborted: {reason}");
            Error::TransactionAborted {
                image,
                reason: Box::new(reason),
            }
        }
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    impl Associator<'_> {
        /// Associate all extracted sources of `image`, generating candidates in parallel.
        ///
        /// The result is identical to
        /// [`associate_extracted_sources`](Associator::associate_extracted_sources).
        pub fn associate_extracted_sources_par(&self, image: ImageId) -> Result<BatchReport> {
            self.stage(image, |view, meta, detections| {
                detections
                    .par_iter()
                    .map(|d| self.candidates(view, meta, d))
                    .collect()
            })?
            .commit()
        }
    }
}
