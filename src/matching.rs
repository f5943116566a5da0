//! Positional matching with the De Ruiter radius.
//!
//! The De Ruiter radius is the positional offset of two sources normalised by their
//! combined position errors,
//! \[ r^2 = \frac{(\Delta\alpha \cos\delta)^2}{\sigma_{\alpha,1}^2 + \sigma_{\alpha,2}^2}
//!        + \frac{(\Delta\delta)^2}{\sigma_{\delta,1}^2 + \sigma_{\delta,2}^2}, \]
//! so it is dimensionless. A pair counts as a match when `r` is below a threshold
//! (3.717 by default, the radius at which a missed true association becomes as
//! likely as a spurious one for typical source densities).

use nalgebra::Vector3;

use crate::error::DomainError;
use crate::geometry::{angular_distance_arcsec, delta_ra, radec_to_xyz};
use crate::source::SourceId;

/// Anything with a position and 1σ position errors, in degrees.
pub trait SkyPosition {
    /// Id used when reporting a domain error.
    fn id(&self) -> SourceId;
    /// Right ascension.
    fn ra(&self) -> f64;
    /// Declination.
    fn decl(&self) -> f64;
    /// Error on ra.
    fn ra_err(&self) -> f64;
    /// Error on decl.
    fn decl_err(&self) -> f64;

    /// Unit vector of the position.
    fn xyz(&self) -> Vector3<f64> {
        radec_to_xyz(self.ra(), self.decl())
    }
}

fn check_error(id: SourceId, quantity: &'static str, value: f64) -> Result<(), DomainError> {
    if !value.is_finite() {
        Err(DomainError::NonFinite { id, quantity })
    } else if value <= 0. {
        Err(DomainError::NonPositiveError {
            id,
            quantity,
            value,
        })
    } else {
        Ok(())
    }
}

/// Dimensionless De Ruiter radius between `a` and `b`.
///
/// The ra offset is taken on the shortest way around the circle and projected
/// with the declination of `a`.
/// A zero or negative position error leaves the weight undefined and is returned
/// as a [`DomainError`] instead of an infinite radius.
///
/// # Example
/// ```
/// # use runcat::{Measurement, ExtractedSource, SourceId, ImageId, de_ruiter_radius};
/// let m = Measurement { ra: 10., decl: 0., ra_err: 1e-3, decl_err: 1e-3, ..Default::default() };
/// let a = ExtractedSource::from_measurement(SourceId(1), ImageId(1), &m);
/// let m = Measurement { decl: 2e-3, ..m };
/// let b = ExtractedSource::from_measurement(SourceId(2), ImageId(1), &m);
/// assert!((de_ruiter_radius(&a, &b).unwrap() - 2f64.sqrt()).abs() < 1e-9);
/// ```
pub fn de_ruiter_radius<A, B>(a: &A, b: &B) -> Result<f64, DomainError>
where
    A: SkyPosition + ?Sized,
    B: SkyPosition + ?Sized,
{
    check_error(a.id(), "ra", a.ra_err())?;
    check_error(a.id(), "decl", a.decl_err())?;
    check_error(b.id(), "ra", b.ra_err())?;
    check_error(b.id(), "decl", b.decl_err())?;

    let dra = delta_ra(a.ra(), b.ra()) * a.decl().to_radians().cos();
    let ddecl = a.decl() - b.decl();
    let r_sq = dra * dra / (a.ra_err().powi(2) + b.ra_err().powi(2))
        + ddecl * ddecl / (a.decl_err().powi(2) + b.decl_err().powi(2));
    Ok(r_sq.sqrt())
}

/// Whether a De Ruiter radius counts as a match.
pub fn is_match(r: f64, threshold: f64) -> bool {
    r < threshold
}

/// A scored catalog counterpart of one detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Running-catalog entry.
    pub entry: SourceId,
    /// De Ruiter radius to the detection.
    pub r: f64,
    /// Angular distance to the detection in arcsec.
    pub distance_arcsec: f64,
    /// Average peak flux of the entry, used by [`CounterpartPolicy::Brightest`].
    pub avg_flux: f64,
}

/// Score `detection` against `entries` and keep those within `threshold`, in input order.
pub fn score_candidates<'a, D, E>(
    detection: &D,
    entries: impl IntoIterator<Item = &'a E>,
    threshold: f64,
) -> Result<Vec<Candidate>, DomainError>
where
    D: SkyPosition + ?Sized,
    E: SkyPosition + HasFlux + 'a,
{
    let xyz = detection.xyz();
    let mut matched = Vec::new();
    for entry in entries {
        let r = de_ruiter_radius(detection, entry)?;
        if is_match(r, threshold) {
            matched.push(Candidate {
                entry: entry.id(),
                r,
                distance_arcsec: angular_distance_arcsec(&xyz, &entry.xyz()),
                avg_flux: entry.avg_flux(),
            });
        }
    }
    Ok(matched)
}

/// Average flux of a candidate, for brightness-based counterpart selection.
pub trait HasFlux {
    /// Running average of the peak flux.
    fn avg_flux(&self) -> f64;
}

/// How one counterpart is picked when a detection matches several catalog entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterpartPolicy {
    /// Smallest De Ruiter radius.
    #[default]
    MinimumDistance,
    /// Largest average flux, then smallest radius.
    Brightest,
}

impl CounterpartPolicy {
    /// Pick one of `candidates`. On an exact tie the first one wins.
    pub fn select(self, candidates: &[Candidate]) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for candidate in candidates {
            let better = match best {
                None => true,
                Some(current) => match self {
                    Self::MinimumDistance => candidate.r < current.r,
                    Self::Brightest => {
                        candidate.avg_flux > current.avg_flux
                            || (candidate.avg_flux == current.avg_flux && candidate.r < current.r)
                    }
                },
            };
            if better {
                best = Some(*candidate);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;

    #[derive(Debug, Clone)]
    struct Point {
        id: u64,
        ra: f64,
        decl: f64,
        err: f64,
        flux: f64,
    }

    impl SkyPosition for Point {
        fn id(&self) -> SourceId {
            SourceId(self.id)
        }
        fn ra(&self) -> f64 {
            self.ra
        }
        fn decl(&self) -> f64 {
            self.decl
        }
        fn ra_err(&self) -> f64 {
            self.err
        }
        fn decl_err(&self) -> f64 {
            self.err
        }
    }

    impl HasFlux for Point {
        fn avg_flux(&self) -> f64 {
            self.flux
        }
    }

    fn point(id: u64, ra: f64, decl: f64) -> Point {
        Point {
            id,
            ra,
            decl,
            err: 0.001,
            flux: 1.,
        }
    }

    fn candidate(entry: u64, r: f64, avg_flux: f64) -> Candidate {
        Candidate {
            entry: SourceId(entry),
            r,
            distance_arcsec: 0.,
            avg_flux,
        }
    }

    #[test]
    fn de_ruiter() {
        let a = point(1, 10., 45.);
        let b = point(2, 10.0005, 45.);
        let expected = (0.0005 * 45f64.to_radians().cos()) / (2. * 0.001f64.powi(2)).sqrt();
        // the offset seen by the function is 10.0005 - 10, not exactly 0.0005
        assert_relative_eq!(de_ruiter_radius(&a, &b).unwrap(), expected, max_relative = 1e-9);
        assert_abs_diff_eq!(expected, 0.25, epsilon = 1e-3);

        assert_eq!(de_ruiter_radius(&a, &a).unwrap(), 0.);
    }

    #[test]
    fn de_ruiter_across_ra_zero() {
        let a = point(1, 359.9995, 0.);
        let b = point(2, 0.0005, 0.);
        let r = de_ruiter_radius(&a, &b).unwrap();
        assert_abs_diff_eq!(r, 0.001 / (2. * 0.001f64.powi(2)).sqrt(), epsilon = 1e-6);
    }

    #[test]
    fn zero_error_is_domain_error() {
        let a = point(1, 10., 45.);
        let b = Point { err: 0., ..point(2, 10., 45.) };
        assert_eq!(
            de_ruiter_radius(&a, &b),
            Err(DomainError::NonPositiveError {
                id: SourceId(2),
                quantity: "ra",
                value: 0.
            })
        );
    }

    #[test]
    fn scoring_keeps_input_order() {
        let detection = point(10, 10., 45.);
        let entries = vec![
            point(3, 10.0005, 45.),
            point(1, 10.1, 45.),
            point(2, 10., 45.0001),
        ];
        let scored = score_candidates(&detection, &entries, 3.717).unwrap();
        assert_eq!(
            scored.iter().map(|c| c.entry).collect::<Vec<_>>(),
            vec![SourceId(3), SourceId(2)]
        );
        assert_abs_diff_eq!(scored[1].distance_arcsec, 0.36, epsilon = 1e-6);
    }

    #[test]
    fn minimum_distance_ties_keep_first() {
        let policy = CounterpartPolicy::MinimumDistance;
        let cands = [candidate(5, 1.0, 1.), candidate(3, 0.5, 1.), candidate(4, 0.5, 9.)];
        assert_eq!(policy.select(&cands).unwrap().entry, SourceId(3));
        assert_eq!(policy.select(&[]), None);
    }

    #[test]
    fn brightest() {
        let policy = CounterpartPolicy::Brightest;
        let cands = [candidate(1, 0.1, 1.), candidate(2, 2.0, 5.), candidate(3, 1.0, 5.)];
        assert_eq!(policy.select(&cands).unwrap().entry, SourceId(3));
    }
}
