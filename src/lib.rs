#![warn(missing_docs)]

//! Incremental source association for transient surveys. \
//! Every image of a dataset delivers a batch of extracted sources. Each batch is matched
//! against a running catalog of merged sky sources, which keeps closed-form weighted
//! statistics per source, and the decisions are recorded in an append-only association
//! graph from which light curves are rebuilt.
//!
//! ## Interface
//! All state lives in a [`CatalogStore`], which is passed by reference to every operation.
//! Images and their measurements are registered with [`CatalogStore::insert_image`] and
//! [`CatalogStore::insert_extracted_sources`], then an [`Associator`] merges one image at a time.
//! Parameters are set via the `with_*()` functions of [`AssociationConfig`].
//!
//! Example:
//! ```rust
//! # use chrono::Utc;
//! # use runcat::{Associator, AssociationConfig, Band, CatalogStore, Image, Measurement};
//! let store = CatalogStore::new();
//! let dataset = store.insert_dataset("survey");
//! let image = store.insert_image(Image::new(dataset, Band(0), Utc::now()))?;
//! let m = Measurement {
//!     ra: 10., decl: 45., ra_err: 1e-3, decl_err: 1e-3, peak: 5., peak_err: 0.1,
//!     ..Default::default()
//! };
//! store.insert_extracted_sources(image, &[m])?;
//!
//! let report = Associator::new(&store)
//!     .with_config(AssociationConfig::default().with_deruiter_radius(3.717))
//!     .associate_extracted_sources(image)?;
//! assert_eq!(report.n_new, 1);
//! # Ok::<(), runcat::Error>(())
//! ```
//!
//! Association can also run its candidate search in parallel
//! ([`Associator::associate_extracted_sources_par`], feature `parallel`).
//!
//! On top of the association graph:
//! - [`variability()`] computes the V and eta indices, [`lightcurve()`] rebuilds light curves.
//! - [`MonitoringManager`] keeps positions to force-measure and the transients found so far.
//! - [`ReferenceCatalog`] cross-matches sources against static catalogs.
//!
//! ## Parameters
//! - `deruiter_radius`: Maximum dimensionless De Ruiter radius between a detection and an entry.
//!     Position offsets are normalised by the combined 1σ errors, so the default of 3.717
//!     does not depend on the image resolution.
//! - `search_radius`: Radius in degrees of the box searched for candidates before
//!     the De Ruiter radius is computed. Defaults to 0.025.
//! - `policy`: Which candidate a detection keeps when several entries match it,
//!     see [`CounterpartPolicy`].

pub mod aggregate;
pub mod association;
pub mod catalog;
pub mod crossmatch;
pub mod error;
pub mod geometry;
pub mod matching;
pub mod monitoring;
pub mod resolve;
pub mod source;
pub mod store;
pub mod variability;
pub mod zones;

pub use association::{Association, AssociationId, AssociationMethod};
pub use catalog::RunningCatalogEntry;
pub use crossmatch::{
    CatalogCrossMatch, CatalogId, CatalogSource, CrossMatchConfig, ReferenceCatalog,
};
pub use error::{DomainError, Error, Result};
pub use matching::{CounterpartPolicy, SkyPosition, de_ruiter_radius};
pub use monitoring::{
    MonitorId, MonitoringManager, MonitoringTarget, TargetSubject, TransientRecord,
};
pub use resolve::{AssociationConfig, Associator, BatchReport, DetectionOutcome};
pub use source::{Band, Dataset, DatasetId, ExtractedSource, Image, ImageId, Measurement, SourceId};
pub use store::{CatalogStore, StoreView, Transaction};
pub use variability::{
    LightcurvePoint, VariabilityIndices, lightcurve, lightcurve_for_detection,
    lightcurve_with_ancestry, lineage, select_single_epoch, select_variable, variability,
};
