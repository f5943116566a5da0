//! Running-catalog entries.

use nalgebra::Vector3;

use crate::aggregate::{FluxAccumulator, PositionAccumulator};
use crate::geometry::{radec_to_xyz, wrap_ra, zone};
use crate::matching::{HasFlux, SkyPosition};
use crate::source::{Band, DatasetId, ExtractedSource, SourceId};

/// A merged sky source with running statistics over its `datapoints` measurements.
///
/// Only the accumulators are authoritative; the weighted-mean position, its errors,
/// the zone and the unit vector are derived from them after every update.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningCatalogEntry {
    /// Entry id, equal to the id of the detection that founded it.
    pub id: SourceId,
    /// Dataset of the entry.
    pub dataset: DatasetId,
    /// Frequency band of the entry.
    pub band: Band,
    /// Number of detections merged into the entry.
    pub datapoints: u32,
    /// Declination zone of the weighted mean.
    pub zone: i32,
    /// Weighted mean ra.
    pub wm_ra: f64,
    /// Weighted mean decl.
    pub wm_decl: f64,
    /// Error on `wm_ra`.
    pub wm_ra_err: f64,
    /// Error on `wm_decl`.
    pub wm_decl_err: f64,
    /// Position accumulators.
    pub position: PositionAccumulator,
    /// Unit vector of the weighted mean.
    pub xyz: Vector3<f64>,
    /// Flux accumulators.
    pub flux: FluxAccumulator,
}

impl RunningCatalogEntry {
    /// A new entry holding only `detection`.
    pub fn from_detection(detection: &ExtractedSource, dataset: DatasetId, band: Band) -> Self {
        let ra = wrap_ra(detection.ra);
        let mut entry = Self {
            id: detection.id,
            dataset,
            band,
            datapoints: 1,
            zone: detection.zone,
            wm_ra: ra,
            wm_decl: detection.decl,
            wm_ra_err: detection.ra_err,
            wm_decl_err: detection.decl_err,
            position: PositionAccumulator::seed(
                ra,
                detection.decl,
                detection.ra_err,
                detection.decl_err,
            ),
            xyz: detection.xyz,
            flux: FluxAccumulator::seed(detection.i_peak, detection.i_peak_err),
        };
        entry.refresh();
        entry
    }

    /// Merge one more detection into the running statistics.
    pub fn absorb(&mut self, detection: &ExtractedSource) {
        let n = self.datapoints;
        self.position = self.position.update(
            n,
            detection.ra,
            detection.decl,
            detection.ra_err,
            detection.decl_err,
        );
        self.flux = self.flux.update(n, detection.i_peak, detection.i_peak_err);
        self.datapoints = n + 1;
        self.refresh();
    }

    /// Recompute the derived fields from the accumulators.
    fn refresh(&mut self) {
        let (ra, decl) = self.position.weighted_mean();
        let (ra_err, decl_err) = self.position.weighted_errors(self.datapoints);
        self.wm_ra = ra;
        self.wm_decl = decl;
        self.wm_ra_err = ra_err;
        self.wm_decl_err = decl_err;
        self.zone = zone(decl);
        self.xyz = radec_to_xyz(ra, decl);
    }
}

impl SkyPosition for RunningCatalogEntry {
    fn id(&self) -> SourceId {
        self.id
    }

    fn ra(&self) -> f64 {
        self.wm_ra
    }

    fn decl(&self) -> f64 {
        self.wm_decl
    }

    fn ra_err(&self) -> f64 {
        self.wm_ra_err
    }

    fn decl_err(&self) -> f64 {
        self.wm_decl_err
    }

    fn xyz(&self) -> Vector3<f64> {
        self.xyz
    }
}

impl HasFlux for RunningCatalogEntry {
    fn avg_flux(&self) -> f64 {
        self.flux.avg_flux
    }
}
