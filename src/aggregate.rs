//! Closed-form running accumulators.
//!
//! An entry with `n` datapoints stores averages over its `n` measurements instead
//! of the measurements themselves. Adding measurement `n + 1` only needs the
//! stored averages:
//! \[ \bar{q}_{n+1} = \frac{n \bar{q}_n + q}{n + 1}. \]
//! The weighted mean position and its error follow from the averages alone,
//! \[ \alpha_w = \frac{\overline{w\alpha}}{\bar{w}}, \qquad
//!    \sigma_{\alpha_w} = \sqrt{\frac{1}{n \bar{w}}}, \]
//! which equals the weighted mean over all `n` measurements.

use crate::geometry::{delta_ra, wrap_ra};

/// `(n * avg + value) / (n + 1)`.
pub(crate) fn running_average(avg: f64, n: u32, value: f64) -> f64 {
    let n = f64::from(n);
    (n * avg + value) / (n + 1.)
}

/// Averages of inverse-variance weights and weighted positions.
///
/// Ra is accumulated on a continuous branch so sources straddling ra = 0 average
/// correctly; [`weighted_mean`](Self::weighted_mean) wraps the result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionAccumulator {
    /// Average of `ra / σ_ra²`.
    pub avg_wra: f64,
    /// Average of `decl / σ_decl²`.
    pub avg_wdecl: f64,
    /// Average of `1 / σ_ra²`.
    pub avg_weight_ra: f64,
    /// Average of `1 / σ_decl²`.
    pub avg_weight_decl: f64,
}

impl PositionAccumulator {
    /// Accumulator of a single measurement.
    pub fn seed(ra: f64, decl: f64, ra_err: f64, decl_err: f64) -> Self {
        let weight_ra = 1. / (ra_err * ra_err);
        let weight_decl = 1. / (decl_err * decl_err);
        Self {
            avg_wra: ra * weight_ra,
            avg_wdecl: decl * weight_decl,
            avg_weight_ra: weight_ra,
            avg_weight_decl: weight_decl,
        }
    }

    /// Accumulator after adding one measurement to `n` existing ones.
    pub fn update(&self, n: u32, ra: f64, decl: f64, ra_err: f64, decl_err: f64) -> Self {
        let mean_ra = self.avg_wra / self.avg_weight_ra;
        let ra = mean_ra + delta_ra(ra, mean_ra);
        let weight_ra = 1. / (ra_err * ra_err);
        let weight_decl = 1. / (decl_err * decl_err);
        Self {
            avg_wra: running_average(self.avg_wra, n, ra * weight_ra),
            avg_wdecl: running_average(self.avg_wdecl, n, decl * weight_decl),
            avg_weight_ra: running_average(self.avg_weight_ra, n, weight_ra),
            avg_weight_decl: running_average(self.avg_weight_decl, n, weight_decl),
        }
    }

    /// Weighted mean `(ra, decl)`, ra wrapped into `[0, 360)`.
    pub fn weighted_mean(&self) -> (f64, f64) {
        (
            wrap_ra(self.avg_wra / self.avg_weight_ra),
            self.avg_wdecl / self.avg_weight_decl,
        )
    }

    /// Errors on the weighted mean over `n` measurements.
    pub fn weighted_errors(&self, n: u32) -> (f64, f64) {
        let n = f64::from(n);
        (
            (1. / (n * self.avg_weight_ra)).sqrt(),
            (1. / (n * self.avg_weight_decl)).sqrt(),
        )
    }
}

/// Averages of peak flux, its square and their inverse-variance weighted forms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluxAccumulator {
    /// Average flux.
    pub avg_flux: f64,
    /// Average squared flux.
    pub avg_flux_sq: f64,
    /// Average of `1 / σ²`.
    pub avg_weight: f64,
    /// Average of `flux / σ²`.
    pub avg_weighted_flux: f64,
    /// Average of `flux² / σ²`.
    pub avg_weighted_flux_sq: f64,
}

impl FluxAccumulator {
    /// Accumulator of a single measurement.
    pub fn seed(flux: f64, flux_err: f64) -> Self {
        let weight = 1. / (flux_err * flux_err);
        Self {
            avg_flux: flux,
            avg_flux_sq: flux * flux,
            avg_weight: weight,
            avg_weighted_flux: flux * weight,
            avg_weighted_flux_sq: flux * flux * weight,
        }
    }

    /// Accumulator after adding one measurement to `n` existing ones.
    pub fn update(&self, n: u32, flux: f64, flux_err: f64) -> Self {
        let weight = 1. / (flux_err * flux_err);
        Self {
            avg_flux: running_average(self.avg_flux, n, flux),
            avg_flux_sq: running_average(self.avg_flux_sq, n, flux * flux),
            avg_weight: running_average(self.avg_weight, n, weight),
            avg_weighted_flux: running_average(self.avg_weighted_flux, n, flux * weight),
            avg_weighted_flux_sq: running_average(
                self.avg_weighted_flux_sq,
                n,
                flux * flux * weight,
            ),
        }
    }
}
