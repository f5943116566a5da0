//! Variability indices and light curves.
//!
//! Both indices come from the flux accumulators of an entry alone, without
//! revisiting its measurements. With `n` measurements `fᵢ ± σᵢ` and weights `wᵢ = 1/σᵢ²`,
//! - the flux coefficient of variation is
//!   \[ V = \frac{1}{\bar f}\sqrt{\frac{n}{n-1}\left(\overline{f^2} - \bar f^2\right)}, \]
//! - the reduced weighted χ² against a constant flux is
//!   \[ \eta = \frac{n}{n-1}\,\frac{\bar w\,\overline{wf^2} - \overline{wf}^2}{\bar w}. \]
//!
//! Light curves are rebuilt from the association graph: every edge owned by an entry
//! names the detection it contributed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::catalog::RunningCatalogEntry;
use crate::error::{Error, Result};
use crate::source::{Band, DatasetId, SourceId};
use crate::store::{CatalogStore, StoreView};

/// Variability indices of an entry with at least two datapoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariabilityIndices {
    /// Flux coefficient of variation.
    pub v: f64,
    /// Reduced weighted χ² against a constant flux.
    pub eta: f64,
}

/// Variability indices from the stored accumulators.
///
/// # Errors
/// [`Error::InsufficientData`] for an entry with a single datapoint.
pub fn variability(entry: &RunningCatalogEntry) -> Result<VariabilityIndices> {
    let n = entry.datapoints;
    if n < 2 {
        return Err(Error::InsufficientData { id: entry.id, n });
    }
    let f = &entry.flux;
    let scale = f64::from(n) / f64::from(n - 1);

    // rounding can push a zero variance slightly negative
    let variance = (f.avg_flux_sq - f.avg_flux * f.avg_flux).max(0.);
    let v = (scale * variance).sqrt() / f.avg_flux;
    let eta = scale
        * (f.avg_weight * f.avg_weighted_flux_sq - f.avg_weighted_flux * f.avg_weighted_flux)
        / f.avg_weight;
    Ok(VariabilityIndices { v, eta })
}

/// A row of [`select_variable`].
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSource {
    /// Entry id.
    pub id: SourceId,
    /// Band of the entry.
    pub band: Band,
    /// Number of datapoints.
    pub datapoints: u32,
    /// Variability indices.
    pub indices: VariabilityIndices,
    /// Weighted mean ra.
    pub ra: f64,
    /// Weighted mean decl.
    pub decl: f64,
}

/// Live entries of `dataset` with `V > v_min` and `eta > eta_min`, ordered by id.
///
/// Entries with a single datapoint have no indices and are skipped.
pub fn select_variable(
    store: &CatalogStore,
    dataset: DatasetId,
    v_min: f64,
    eta_min: f64,
) -> Vec<VariableSource> {
    store.read(|view| {
        view.entries(dataset)
            .filter_map(|entry| {
                let indices = variability(entry).ok()?;
                (indices.v > v_min && indices.eta > eta_min).then(|| VariableSource {
                    id: entry.id,
                    band: entry.band,
                    datapoints: entry.datapoints,
                    indices,
                    ra: entry.wm_ra,
                    decl: entry.wm_decl,
                })
            })
            .collect()
    })
}

/// A row of [`select_single_epoch`]. The indices are undefined for a single datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleEpochSource {
    /// Entry id.
    pub id: SourceId,
    /// Number of datapoints, always 1.
    pub datapoints: u32,
    /// Flux coefficient of variation, never set.
    pub v: Option<f64>,
    /// Reduced weighted χ², never set.
    pub eta: Option<f64>,
}

/// Live entries of `dataset` seen exactly once, ordered by id.
pub fn select_single_epoch(store: &CatalogStore, dataset: DatasetId) -> Vec<SingleEpochSource> {
    store.read(|view| {
        view.entries(dataset)
            .filter(|entry| entry.datapoints == 1)
            .map(|entry| SingleEpochSource {
                id: entry.id,
                datapoints: entry.datapoints,
                v: None,
                eta: None,
            })
            .collect()
    })
}

/// One point of a light curve.
#[derive(Debug, Clone, PartialEq)]
pub struct LightcurvePoint {
    /// Start of the observation.
    pub taustart: DateTime<Utc>,
    /// Integration time in seconds.
    pub tau_time: f64,
    /// Peak flux density.
    pub flux: f64,
    /// Error on the peak flux density.
    pub flux_err: f64,
    /// The detection.
    pub detection: SourceId,
}

/// Ancestry of an entry through split edges, starting with `entry` itself.
///
/// # Errors
/// [`Error::CycleDetected`] if an id comes up twice.
pub fn lineage(store: &CatalogStore, entry: SourceId) -> Result<Vec<SourceId>> {
    store.read(|view| lineage_in(view, entry))
}

fn lineage_in(view: StoreView<'_>, entry: SourceId) -> Result<Vec<SourceId>> {
    let mut chain = vec![entry];
    let mut seen = HashSet::from([entry]);
    let mut current = entry;
    while let Some(parent) = view.associations_of(current).find_map(|e| e.ancestor()) {
        if !seen.insert(parent) {
            return Err(Error::CycleDetected { id: parent });
        }
        chain.push(parent);
        current = parent;
    }
    Ok(chain)
}

fn own_points(view: StoreView<'_>, entry: SourceId) -> Result<Vec<LightcurvePoint>> {
    view.associations_of(entry)
        .filter_map(|edge| edge.contributed_detection())
        .map(|id| {
            let source = view.extracted_source(id).ok_or(Error::UnknownSource(id))?;
            let image = view.image(source.image).ok_or(Error::UnknownImage(source.image))?;
            Ok(LightcurvePoint {
                taustart: image.taustart,
                tau_time: image.tau_time,
                flux: source.i_peak,
                flux_err: source.i_peak_err,
                detection: id,
            })
        })
        .collect()
}

fn sorted(points: Vec<LightcurvePoint>) -> Vec<LightcurvePoint> {
    points
        .into_iter()
        .sorted_by(|a, b| a.taustart.cmp(&b.taustart).then(a.detection.cmp(&b.detection)))
        .collect()
}

/// The detections merged into `entry`, ordered by observation time.
///
/// Forced measurements recorded for the entry are included.
/// An entry split off an ancestor starts with its founding detection,
/// see [`lightcurve_with_ancestry`] for the history before the split.
///
/// # Errors
/// - [`Error::UnknownSource`] if `entry` is neither live nor retired.
/// - [`Error::CycleDetected`] if the ancestry of `entry` is cyclic.
pub fn lightcurve(store: &CatalogStore, entry: SourceId) -> Result<Vec<LightcurvePoint>> {
    store.read(|view| {
        view.entry_any(entry).ok_or(Error::UnknownSource(entry))?;
        lineage_in(view, entry)?;
        Ok(sorted(own_points(view, entry)?))
    })
}

/// Like [`lightcurve`], prefixed with the points of every ancestor the entry was split off.
pub fn lightcurve_with_ancestry(
    store: &CatalogStore,
    entry: SourceId,
) -> Result<Vec<LightcurvePoint>> {
    store.read(|view| {
        view.entry_any(entry).ok_or(Error::UnknownSource(entry))?;
        let mut points = Vec::new();
        for id in lineage_in(view, entry)? {
            points.extend(own_points(view, id)?);
        }
        Ok(sorted(points))
    })
}

/// Light curve of the entry, live or retired, that `detection` contributed to.
pub fn lightcurve_for_detection(
    store: &CatalogStore,
    detection: SourceId,
) -> Result<Vec<LightcurvePoint>> {
    let owner = store.read(|view| {
        view.associations_to(detection)
            .chain(view.associations_of(detection))
            .find(|edge| edge.contributed_detection() == Some(detection))
            .map(|edge| edge.source_id)
    });
    lightcurve(store, owner.ok_or(Error::UnknownSource(detection))?)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::seq::SliceRandom;

    use super::*;
    use crate::association::{AssociationMethod, PendingAssociation};
    use crate::resolve::Associator;
    use crate::source::tests::measurement;
    use crate::source::{ExtractedSource, ImageId};
    use crate::store::tests::store_with_images;

    fn entry_of(fluxes: &[(f64, f64)]) -> RunningCatalogEntry {
        let detection = |i: usize, (flux, err): (f64, f64)| {
            ExtractedSource::from_measurement(
                SourceId(i as u64),
                ImageId(i as u64),
                &measurement(10., 10., 0.001, flux, err),
            )
        };
        let mut entry =
            RunningCatalogEntry::from_detection(&detection(0, fluxes[0]), DatasetId(1), Band(0));
        for (i, f) in fluxes.iter().enumerate().skip(1) {
            entry.absorb(&detection(i, *f));
        }
        entry
    }

    #[test]
    fn indices_match_direct_formulas() {
        let fluxes = [(1., 0.1), (2., 0.2), (1.5, 0.1), (3., 0.3)];
        let indices = variability(&entry_of(&fluxes)).unwrap();

        let n = fluxes.len() as f64;
        let mean = fluxes.iter().map(|f| f.0).sum::<f64>() / n;
        let std = (fluxes.iter().map(|f| (f.0 - mean).powi(2)).sum::<f64>() / (n - 1.)).sqrt();
        assert_relative_eq!(indices.v, std / mean, max_relative = 1e-9);

        let sum_w: f64 = fluxes.iter().map(|f| f.1.powi(-2)).sum();
        let wmean = fluxes.iter().map(|f| f.0 * f.1.powi(-2)).sum::<f64>() / sum_w;
        let chi2 = fluxes.iter().map(|f| ((f.0 - wmean) / f.1).powi(2)).sum::<f64>();
        assert_relative_eq!(indices.eta, chi2 / (n - 1.), max_relative = 1e-9);
    }

    #[test]
    fn indices_ignore_order() {
        let mut rng = rand::rng();
        let mut fluxes = vec![(1., 0.1), (2., 0.2), (1.5, 0.1), (3., 0.3), (0.5, 0.05), (4., 0.1)];
        let reference = variability(&entry_of(&fluxes)).unwrap();
        for _ in 0..10 {
            fluxes.shuffle(&mut rng);
            let indices = variability(&entry_of(&fluxes)).unwrap();
            assert_relative_eq!(indices.v, reference.v, max_relative = 1e-9);
            assert_relative_eq!(indices.eta, reference.eta, max_relative = 1e-9);
        }
    }

    #[test]
    fn constant_flux() {
        let indices = variability(&entry_of(&[(2., 0.1); 5])).unwrap();
        assert_relative_eq!(indices.v, 0., epsilon = 1e-6);
        assert_relative_eq!(indices.eta, 0., epsilon = 1e-6);
    }

    #[test]
    fn single_datapoint() {
        assert!(matches!(
            variability(&entry_of(&[(1., 0.1)])),
            Err(Error::InsufficientData { n: 1, .. })
        ));
    }

    #[test]
    fn selections() {
        let (store, dataset, images) = store_with_images(3);
        let associator = Associator::new(&store);
        for (image, fluxes) in images.iter().zip([[1., 5.], [1., 5.], [1., 15.]]) {
            store
                .insert_extracted_sources(
                    *image,
                    &[
                        measurement(10., 10., 0.001, fluxes[0], 0.1),
                        measurement(20., 10., 0.001, fluxes[1], 0.1),
                    ],
                )
                .unwrap();
            associator.associate_extracted_sources(*image).unwrap();
        }
        let extra = store
            .insert_image(crate::source::Image::new(dataset, Band(0), chrono::Utc::now()))
            .unwrap();
        store
            .insert_extracted_sources(extra, &[measurement(30., 10., 0.001, 1., 0.1)])
            .unwrap();
        associator.associate_extracted_sources(extra).unwrap();

        let variable = select_variable(&store, dataset, 0.1, 1.);
        assert_eq!(variable.len(), 1);
        assert_eq!((variable[0].id, variable[0].datapoints), (SourceId(2), 3));

        // the constant source has V = 0 and fails the strict cut
        assert_eq!(select_variable(&store, dataset, 0., -1.).len(), 1);
        assert_eq!(select_variable(&store, dataset, -1., -1.).len(), 2);

        let single = select_single_epoch(&store, dataset);
        assert_eq!(single.len(), 1);
        assert_eq!((single[0].v, single[0].eta), (None, None));
    }

    #[test]
    fn lightcurve_of_split_entry() {
        let (store, _, images) = store_with_images(4);
        let associator = Associator::new(&store);
        let batches: [&[(f64, f64)]; 4] = [
            &[(10., 1.)],
            &[(10., 2.)],
            &[(10.0005, 3.), (9.9995, 4.)],
            &[(10.0005, 5.)],
        ];
        for (image, batch) in images.iter().zip(batches) {
            let ms = batch
                .iter()
                .map(|&(ra, flux)| measurement(ra, 45., 0.001, flux, 0.1))
                .collect_vec();
            store.insert_extracted_sources(*image, &ms).unwrap();
            associator.associate_extracted_sources(*image).unwrap();
        }

        let ancestor = store.entry_any(SourceId(1)).unwrap();
        let points = lightcurve(&store, ancestor.id).unwrap();
        assert_eq!(points.len(), ancestor.datapoints as usize);
        assert_eq!(
            points.iter().map(|p| p.detection).collect_vec(),
            vec![SourceId(1), SourceId(2)]
        );

        let survivor = store.entry(SourceId(3)).unwrap();
        let points = lightcurve(&store, survivor.id).unwrap();
        assert_eq!(points.len(), survivor.datapoints as usize);
        assert_eq!(points.iter().map(|p| p.flux).collect_vec(), vec![3., 5.]);
        assert!(points.windows(2).all(|w| w[0].taustart < w[1].taustart));

        let full = lightcurve_with_ancestry(&store, survivor.id).unwrap();
        assert_eq!(full.iter().map(|p| p.flux).collect_vec(), vec![1., 2., 3., 5.]);
        assert_eq!(lineage(&store, survivor.id).unwrap(), vec![SourceId(3), SourceId(1)]);

        assert_eq!(lightcurve_for_detection(&store, SourceId(5)).unwrap(), points);
        assert_eq!(lightcurve_for_detection(&store, SourceId(3)).unwrap(), points);
        assert_eq!(lightcurve_for_detection(&store, SourceId(2)).unwrap().len(), 2);
        assert!(matches!(
            lightcurve_for_detection(&store, SourceId(99)),
            Err(Error::UnknownSource(SourceId(99)))
        ));
    }

    #[test]
    fn cyclic_lineage() {
        let (store, _, _) = store_with_images(0);
        let mut tx = store.transaction();
        for (source, target) in [(1, 2), (2, 1)] {
            tx.associate(PendingAssociation {
                source_id: SourceId(source),
                target_id: SourceId(target),
                distance_arcsec: 0.,
                r: 0.,
                method: AssociationMethod::SplitSurvivor,
            });
        }
        tx.commit().unwrap();
        assert!(matches!(
            lineage(&store, SourceId(1)),
            Err(Error::CycleDetected { id: SourceId(1) })
        ));
    }
}
