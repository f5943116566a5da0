//! Identifiers, image metadata and extracted-source measurements.

use std::fmt;

use chrono::{DateTime, Utc};
use nalgebra::Vector3;

use crate::error::DomainError;
use crate::geometry::{radec_to_xyz, zone};
use crate::matching::SkyPosition;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Id of an extracted source.
    ///
    /// Running-catalog entries take the id of the detection that founded them,
    /// so the same id space addresses both.
    SourceId(u64)
);
id_type!(
    /// Id of a dataset (one survey or observing campaign).
    DatasetId(u32)
);
id_type!(
    /// Id of an image.
    ImageId(u64)
);
id_type!(
    /// Frequency band of an image.
    Band(u16)
);

/// A dataset groups the images whose sources are associated with each other.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Dataset id.
    pub id: DatasetId,
    /// Free-form description.
    pub description: String,
}

/// Metadata of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Image id.
    pub id: ImageId,
    /// Dataset the image belongs to.
    pub dataset: DatasetId,
    /// Frequency band.
    pub band: Band,
    /// Effective frequency in Hz.
    pub freq_eff: f64,
    /// Bandwidth in Hz.
    pub freq_bw: f64,
    /// Start of the observation.
    pub taustart: DateTime<Utc>,
    /// Integration time in seconds.
    pub tau_time: f64,
    /// Where the image came from.
    pub url: String,
}

impl Image {
    /// Image of `dataset` in `band` starting at `taustart`.
    ///
    /// The id is assigned by [`CatalogStore::insert_image`](crate::CatalogStore::insert_image),
    /// remaining metadata is set via the `with_*` functions.
    pub fn new(dataset: DatasetId, band: Band, taustart: DateTime<Utc>) -> Self {
        Self {
            id: ImageId(0),
            dataset,
            band,
            freq_eff: 0.,
            freq_bw: 0.,
            taustart,
            tau_time: 0.,
            url: String::new(),
        }
    }

    /// Set effective frequency and bandwidth in Hz.
    pub fn with_frequency(mut self, freq_eff: f64, freq_bw: f64) -> Self {
        self.freq_eff = freq_eff;
        self.freq_bw = freq_bw;
        self
    }

    /// Set the integration time in seconds.
    pub fn with_tau_time(mut self, tau_time: f64) -> Self {
        self.tau_time = tau_time;
        self
    }

    /// Set the origin of the image.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// A source measurement as delivered by source extraction, before it is stored.
///
/// Positions and their errors are in degrees, fluxes in Jy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// Right ascension.
    pub ra: f64,
    /// Declination.
    pub decl: f64,
    /// 1σ error on ra.
    pub ra_err: f64,
    /// 1σ error on decl.
    pub decl_err: f64,
    /// Peak flux density.
    pub peak: f64,
    /// Error on the peak flux density.
    pub peak_err: f64,
    /// Integrated flux.
    pub flux: f64,
    /// Error on the integrated flux.
    pub flux_err: f64,
    /// Detection significance.
    pub sigma: f64,
    /// Semi-major axis.
    pub semimajor: f64,
    /// Semi-minor axis.
    pub semiminor: f64,
    /// Position angle.
    pub pa: f64,
}

/// One stored measurement of one image. Never mutated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSource {
    /// Source id.
    pub id: SourceId,
    /// Image the source was measured in.
    pub image: ImageId,
    /// Declination zone, `floor(decl)`.
    pub zone: i32,
    /// Right ascension.
    pub ra: f64,
    /// Declination.
    pub decl: f64,
    /// 1σ error on ra.
    pub ra_err: f64,
    /// 1σ error on decl.
    pub decl_err: f64,
    /// Unit vector of `(ra, decl)`.
    pub xyz: Vector3<f64>,
    /// Peak flux density.
    pub i_peak: f64,
    /// Error on the peak flux density.
    pub i_peak_err: f64,
    /// Integrated flux.
    pub i_int: f64,
    /// Error on the integrated flux.
    pub i_int_err: f64,
    /// Detection significance.
    pub det_sigma: f64,
    /// Semi-major axis.
    pub semimajor: f64,
    /// Semi-minor axis.
    pub semiminor: f64,
    /// Position angle.
    pub pa: f64,
}

impl ExtractedSource {
    /// Derive the stored record from a raw measurement.
    pub fn from_measurement(id: SourceId, image: ImageId, m: &Measurement) -> Self {
        Self {
            id,
            image,
            zone: zone(m.decl),
            ra: m.ra,
            decl: m.decl,
            ra_err: m.ra_err,
            decl_err: m.decl_err,
            xyz: radec_to_xyz(m.ra, m.decl),
            i_peak: m.peak,
            i_peak_err: m.peak_err,
            i_int: m.flux,
            i_int_err: m.flux_err,
            det_sigma: m.sigma,
            semimajor: m.semimajor,
            semiminor: m.semiminor,
            pa: m.pa,
        }
    }

    /// Check that the source can be weighted: finite values, positive errors,
    /// and a declination on the sphere.
    pub fn validate(&self) -> Result<(), DomainError> {
        let id = self.id;
        for (quantity, value) in [
            ("ra", self.ra),
            ("decl", self.decl),
            ("peak flux", self.i_peak),
        ] {
            if !value.is_finite() {
                return Err(DomainError::NonFinite { id, quantity });
            }
        }
        if !(-90. ..=90.).contains(&self.decl) {
            return Err(DomainError::DeclinationOutOfRange {
                id,
                decl: self.decl,
            });
        }
        for (quantity, value) in [
            ("ra", self.ra_err),
            ("decl", self.decl_err),
            ("peak flux", self.i_peak_err),
        ] {
            if !value.is_finite() {
                return Err(DomainError::NonFinite { id, quantity });
            }
            if value <= 0. {
                return Err(DomainError::NonPositiveError {
                    id,
                    quantity,
                    value,
                });
            }
        }
        Ok(())
    }
}

impl SkyPosition for ExtractedSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn ra(&self) -> f64 {
        self.ra
    }

    fn decl(&self) -> f64 {
        self.decl
    }

    fn ra_err(&self) -> f64 {
        self.ra_err
    }

    fn decl_err(&self) -> f64 {
        self.decl_err
    }

    fn xyz(&self) -> Vector3<f64> {
        self.xyz
    }
}
