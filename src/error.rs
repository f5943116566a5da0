//! Error types.

use thiserror::Error;

use crate::monitoring::MonitorId;
use crate::source::{DatasetId, ImageId, SourceId};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A measurement that cannot take part in association.
///
/// Detections failing with a `DomainError` are excluded from matching for the
/// current batch and reported in the [`BatchReport`](crate::BatchReport).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// An error bar is zero or negative, so its weight is undefined.
    #[error("non-positive {quantity} error {value} on source {id}")]
    NonPositiveError {
        /// Offending source.
        id: SourceId,
        /// Name of the measured quantity.
        quantity: &'static str,
        /// The error value.
        value: f64,
    },
    /// A value is NaN or infinite.
    #[error("non-finite {quantity} on source {id}")]
    NonFinite {
        /// Offending source.
        id: SourceId,
        /// Name of the measured quantity.
        quantity: &'static str,
    },
    /// The declination lies outside `[-90, 90]`.
    #[error("declination {decl} of source {id} outside [-90, 90]")]
    DeclinationOutOfRange {
        /// Offending source.
        id: SourceId,
        /// The declination in degrees.
        decl: f64,
    },
}

/// Errors returned by store operations, association batches and queries.
#[derive(Error, Debug)]
pub enum Error {
    /// A measurement with undefined weights or degenerate geometry.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Variability statistics were requested for an entry with a single datapoint.
    #[error("entry {id} has {n} datapoint(s), at least two are required")]
    InsufficientData {
        /// The running-catalog entry.
        id: SourceId,
        /// Its datapoint count.
        n: u32,
    },

    /// Following the association lineage revisited an id.
    #[error("lineage cycle detected at {id}")]
    CycleDetected {
        /// The first id seen twice.
        id: SourceId,
    },

    /// A concurrent batch committed to a zone this batch read from.
    #[error("zone {zone} of dataset {dataset} was modified by a concurrent batch")]
    StoreConflict {
        /// Dataset of the zone.
        dataset: DatasetId,
        /// The conflicting zone.
        zone: i32,
    },

    /// A batch failed mid-pipeline and nothing was committed.
    #[error("association batch for image {image} aborted: {reason}")]
    TransactionAborted {
        /// Image whose batch was rolled back.
        image: ImageId,
        /// What went wrong.
        #[source]
        reason: Box<Error>,
    },

    /// Detections of the image already contribute to the running catalog.
    #[error("image {0} has already been associated")]
    AlreadyAssociated(ImageId),

    /// No extracted source or catalog entry with this id.
    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    /// No image with this id.
    #[error("unknown image {0}")]
    UnknownImage(ImageId),

    /// No dataset with this id.
    #[error("unknown dataset {0}")]
    UnknownDataset(DatasetId),

    /// No monitoring target with this id.
    #[error("unknown monitoring target {0}")]
    UnknownTarget(MonitorId),
}
