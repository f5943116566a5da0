//! The association graph: an append-only table of edges between running-catalog
//! ids and the sources that contributed to them.

use std::collections::HashMap;
use std::fmt;

use crate::source::SourceId;

/// Position of an association in the append-only edge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssociationId(pub u64);

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How an edge came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationMethod {
    /// `source_id == target_id`: the detection founded a new entry.
    New,
    /// `target_id` is a detection merged into (or force-measured for) entry `source_id`.
    Single,
    /// Entry `source_id` was split off ancestor entry `target_id`;
    /// `source_id` is also the detection that founded it.
    SplitSurvivor,
    /// `source_id == target_id`: the entry was split and delisted,
    /// its history stays reachable under its id.
    SplitIdentity,
}

/// One edge of the association graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// Edge id.
    pub id: AssociationId,
    /// Running-catalog id owning the edge.
    pub source_id: SourceId,
    /// Contributing detection or ancestor entry.
    pub target_id: SourceId,
    /// Angular distance between the two in arcsec.
    pub distance_arcsec: f64,
    /// De Ruiter radius between the two.
    pub r: f64,
    /// How the edge came about.
    pub method: AssociationMethod,
}

impl Association {
    /// The detection this edge adds to the light curve of `source_id`, if any.
    pub fn contributed_detection(&self) -> Option<SourceId> {
        match self.method {
            AssociationMethod::New | AssociationMethod::Single => Some(self.target_id),
            AssociationMethod::SplitSurvivor => Some(self.source_id),
            AssociationMethod::SplitIdentity => None,
        }
    }

    /// The ancestor entry this edge points to, if any.
    pub fn ancestor(&self) -> Option<SourceId> {
        match self.method {
            AssociationMethod::SplitSurvivor => Some(self.target_id),
            _ => None,
        }
    }
}

/// An association that is not committed yet and has no id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAssociation {
    /// Running-catalog id owning the edge.
    pub source_id: SourceId,
    /// Contributing detection or ancestor entry.
    pub target_id: SourceId,
    /// Angular distance in arcsec.
    pub distance_arcsec: f64,
    /// De Ruiter radius.
    pub r: f64,
    /// How the edge came about.
    pub method: AssociationMethod,
}

impl PendingAssociation {
    /// Self-referential edge with zero distance.
    pub fn identity(id: SourceId, method: AssociationMethod) -> Self {
        Self {
            source_id: id,
            target_id: id,
            distance_arcsec: 0.,
            r: 0.,
            method,
        }
    }
}

/// Edge arena with lookups by either end.
#[derive(Debug, Clone, Default)]
pub struct AssociationGraph {
    edges: Vec<Association>,
    by_source: HashMap<SourceId, Vec<usize>>,
    by_target: HashMap<SourceId, Vec<usize>>,
}

impl AssociationGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether there are no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Append an edge and return its id.
    pub fn push(&mut self, pending: PendingAssociation) -> AssociationId {
        let index = self.edges.len();
        let id = AssociationId(index as u64);
        self.by_source.entry(pending.source_id).or_default().push(index);
        self.by_target.entry(pending.target_id).or_default().push(index);
        self.edges.push(Association {
            id,
            source_id: pending.source_id,
            target_id: pending.target_id,
            distance_arcsec: pending.distance_arcsec,
            r: pending.r,
            method: pending.method,
        });
        id
    }

    /// Edge by id.
    pub fn get(&self, id: AssociationId) -> Option<&Association> {
        self.edges.get(id.0 as usize)
    }

    /// Edges owned by running-catalog id `source`, in insertion order.
    pub fn from_source(&self, source: SourceId) -> impl Iterator<Item = &Association> {
        self.by_source
            .get(&source)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Edges pointing at `target`, in insertion order.
    pub fn to_target(&self, target: SourceId) -> impl Iterator<Item = &Association> {
        self.by_target
            .get(&target)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// All edges in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Association> {
        self.edges.iter()
    }
}
