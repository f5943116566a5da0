//! Cross-matching against static reference catalogs.
//!
//! Reference sources are indexed in a k-d tree over their unit vectors, so a cone of
//! radius `θ` becomes a ball of squared chord length `(2 sin(θ/2))²`. Every source in
//! the cone is scored with the De Ruiter radius and, for ranking, with the likelihood
//! ratio of a true counterpart against a chance alignment with background density `ρ`:
//! \[ \log_{10} LR = -\frac{r^2}{2 \ln 10} - \log_{10}\left(2\pi\,\sigma_\alpha\sigma_\delta\,\rho\right), \]
//! where `σα` and `σδ` are the combined position errors in degrees.

use std::f64::consts::{LN_10, PI};
use std::fmt;

use itertools::Itertools;
use kiddo::float::{distance::SquaredEuclidean, kdtree::KdTree};
use log::info;

use crate::error::{DomainError, Error, Result};
use crate::geometry::{angular_distance_arcsec, chord_sq};
use crate::matching::{SkyPosition, de_ruiter_radius, is_match};
use crate::resolve::{DEFAULT_DERUITER_RADIUS, DEFAULT_SEARCH_RADIUS};
use crate::source::{ImageId, SourceId};
use crate::store::CatalogStore;

/// Default density of reference sources per square degree.
pub const DEFAULT_BACKGROUND_DENSITY: f64 = 1.;

/// Id of a reference catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CatalogId(pub u32);

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A source of a reference catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSource {
    /// Row id within the reference catalogs, separate from extracted source ids.
    pub id: SourceId,
    /// Catalog the source belongs to.
    pub catalog: CatalogId,
    /// Catalog designation.
    pub name: String,
    /// Right ascension in degrees.
    pub ra: f64,
    /// Declination in degrees.
    pub decl: f64,
    /// 1σ error on ra in degrees.
    pub ra_err: f64,
    /// 1σ error on decl in degrees.
    pub decl_err: f64,
}

impl SkyPosition for CatalogSource {
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
}

/// A scored link between a source and a reference catalog source.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogCrossMatch {
    /// Extracted source or running-catalog entry that was matched.
    pub source: SourceId,
    /// Matched reference source.
    pub catalog_source: SourceId,
    /// Catalog of the reference source.
    pub catalog: CatalogId,
    /// Angular distance in arcsec.
    pub distance_arcsec: f64,
    /// De Ruiter radius.
    pub r: f64,
    /// log10 of the likelihood ratio.
    pub loglr: f64,
}

/// Parameters of the cross-matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossMatchConfig {
    search_radius: f64,
    deruiter_radius: f64,
    background_density: f64,
}

impl Default for CrossMatchConfig {
    fn default() -> Self {
        Self {
            search_radius: DEFAULT_SEARCH_RADIUS,
            deruiter_radius: DEFAULT_DERUITER_RADIUS,
            background_density: DEFAULT_BACKGROUND_DENSITY,
        }
    }
}

impl CrossMatchConfig {
    /// Set the cone radius in degrees.
    pub fn with_search_radius(mut self, radius: f64) -> Self {
        self.search_radius = radius;
        self
    }

    /// Set the De Ruiter radius below which a reference source counts as a counterpart.
    pub fn with_deruiter_radius(mut self, radius: f64) -> Self {
        self.deruiter_radius = radius;
        self
    }

    /// Set the density of reference sources per square degree.
    pub fn with_background_density(mut self, density: f64) -> Self {
        self.background_density = density;
        self
    }
}

/// log10 likelihood ratio of a counterpart at De Ruiter radius `r`.
pub fn log_likelihood_ratio(
    r: f64,
    sigma_ra: f64,
    sigma_decl: f64,
    background_density: f64,
) -> f64 {
    -r * r / (2. * LN_10) - (2. * PI * sigma_ra * sigma_decl * background_density).log10()
}

/// Reference sources of one or more static catalogs.
pub struct ReferenceCatalog {
    sources: Vec<CatalogSource>,
    tree: KdTree<f64, usize, 3, 32, u32>,
    config: CrossMatchConfig,
}

impl ReferenceCatalog {
    /// Index `sources` with the default configuration.
    ///
    /// # Errors
    /// [`Error::Domain`](crate::Error::Domain) if a source has a non-positive position error.
    pub fn new(sources: Vec<CatalogSource>) -> Result<Self> {
        for source in &sources {
            for (quantity, value) in [("ra", source.ra_err), ("decl", source.decl_err)] {
                if value.is_nan() || value <= 0. {
                    return Err(DomainError::NonPositiveError {
                        id: source.id,
                        quantity,
                        value,
                    }
                    .into());
                }
            }
        }
        let tree = sources
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let xyz = s.xyz();
                ([xyz.x, xyz.y, xyz.z], i)
            })
            .collect();
        Ok(Self {
            sources,
            tree,
            config: CrossMatchConfig::default(),
        })
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: CrossMatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of reference sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether there are no reference sources.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Reference sources in the cone around `position` with a De Ruiter radius below
    /// `max_r`, ordered by catalog and then by `r`. An empty `catalogs` filter keeps all.
    pub fn match_nearests<P>(
        &self,
        position: &P,
        catalogs: &[CatalogId],
        max_r: f64,
    ) -> Result<Vec<CatalogCrossMatch>>
    where
        P: SkyPosition + ?Sized,
    {
        let xyz = position.xyz();
        let mut matches = Vec::new();
        for found in self
            .tree
            .within_unsorted::<SquaredEuclidean>(
                &[xyz.x, xyz.y, xyz.z],
                chord_sq(self.config.search_radius),
            )
        {
            let reference = &self.sources[found.item];
            if !catalogs.is_empty() && !catalogs.contains(&reference.catalog) {
                continue;
            }
            let r = de_ruiter_radius(position, reference)?;
            if !is_match(r, max_r) {
                continue;
            }
            let sigma_ra = (position.ra_err().powi(2) + reference.ra_err.powi(2)).sqrt();
            let sigma_decl = (position.decl_err().powi(2) + reference.decl_err.powi(2)).sqrt();
            matches.push(CatalogCrossMatch {
                source: position.id(),
                catalog_source: reference.id,
                catalog: reference.catalog,
                distance_arcsec: angular_distance_arcsec(&xyz, &reference.xyz()),
                r,
                loglr: log_likelihood_ratio(
                    r,
                    sigma_ra,
                    sigma_decl,
                    self.config.background_density,
                ),
            });
        }
        Ok(matches
            .into_iter()
            .sorted_by(|a, b| a.catalog.cmp(&b.catalog).then(a.r.total_cmp(&b.r)))
            .collect())
    }

    /// Cross-match every extracted source of `image` against all catalogs.
    ///
    /// Sources that fail validation are skipped.
    pub fn associate_with_catalogs(
        &self,
        store: &CatalogStore,
        image: ImageId,
    ) -> Result<Vec<CatalogCrossMatch>> {
        let sources = store.read(|view| {
            view.image(image)
                .map(|_| view.sources_of_image(image).cloned().collect_vec())
                .ok_or(Error::UnknownImage(image))
        })?;
        let mut matches = Vec::new();
        for source in sources.iter().filter(|s| s.validate().is_ok()) {
            matches.extend(self.match_nearests(source, &[], self.config.deruiter_radius)?);
        }
        info!(
            "Cross-matched {} sources of image {image} to {} catalog sources.",
            sources.len(),
            matches.len()
        );
        Ok(matches)
    }
}
