//! Core types for the multi-version R*-tree:
//! - Error and result types
//! - Identifier aliases and the `NEW_PAGE` sentinel
//! - Construction-time options and the persisted header
//! - Statistics snapshot
//! - Observer, visitor and comparator contracts

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::node::Node;
use crate::region::{Point, TimeInterval, TimeRegion};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the tree engine and its storage collaborator.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("page {0} not found in storage")]
    PageNotFound(PageId),

    #[error("corrupt tree state: {0}")]
    CorruptState(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a persisted node version in the storage collaborator.
/// Opaque to the engine; only `NEW_PAGE` is distinguished.
pub type PageId = u64;

/// Passed to `StorageManager::write` to request allocation of a fresh page.
pub const NEW_PAGE: PageId = PageId::MAX;

/// Caller-supplied identifier of an indexed data object.
pub type ObjectId = u64;

// ============================================================================
// Configuration
// ============================================================================

/// R-tree insertion/split strategy. Only `RStar` is implemented; the
/// simpler variants are kept for header compatibility and rejected at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeVariant {
    Linear,
    Quadratic,
    RStar,
}

/// Construction-time tunables. `dimension` is required; everything else
/// defaults to the classical values.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub dimension: u32,
    pub index_capacity: u32,
    pub leaf_capacity: u32,
    pub fill_factor: f64,
    pub tree_variant: TreeVariant,
    /// The R*-tree near-minimum-overlap constant: how many of the least
    /// area-enlarging candidates are examined for overlap enlargement at
    /// the level above the leaves.
    pub near_minimum_overlap_factor: u32,
    /// The R*-tree split constant bounding the minimum group size as a
    /// fraction of capacity.
    pub split_distribution_factor: f64,
    /// Fraction of entries evicted and reinserted on a first overflow.
    pub reinsert_factor: f64,
    pub ensure_tight_mbrs: bool,
    pub index_pool_capacity: usize,
    pub leaf_pool_capacity: usize,
    pub region_pool_capacity: usize,
    pub point_pool_capacity: usize,
    /// Fill ratio above which a node prefers version-copy over in-place
    /// growth.
    pub strong_version_overflow: f64,
    /// Fill ratio below which a deletion prefers version-copy-with-exclusion
    /// over leaving a sparse live node.
    pub version_underflow: f64,
}

impl TreeOptions {
    pub fn new(dimension: u32) -> Self {
        Self {
            dimension,
            index_capacity: 100,
            leaf_capacity: 100,
            fill_factor: 0.7,
            tree_variant: TreeVariant::RStar,
            near_minimum_overlap_factor: 32,
            split_distribution_factor: 0.4,
            reinsert_factor: 0.3,
            ensure_tight_mbrs: true,
            index_pool_capacity: 100,
            leaf_pool_capacity: 100,
            region_pool_capacity: 1000,
            point_pool_capacity: 500,
            strong_version_overflow: 0.8,
            version_underflow: 0.3,
        }
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.dimension == 0 {
            return Err(TreeError::Configuration(
                "dimension is required and must be positive".into(),
            ));
        }
        if self.index_capacity < 4 || self.leaf_capacity < 4 {
            return Err(TreeError::Configuration(
                "index and leaf capacity must be at least 4".into(),
            ));
        }
        if !(0.0 < self.fill_factor && self.fill_factor <= 1.0) {
            return Err(TreeError::Configuration("fill factor must be in (0, 1]".into()));
        }
        if !(0.0 < self.split_distribution_factor && self.split_distribution_factor < 0.5) {
            return Err(TreeError::Configuration(
                "split distribution factor must be in (0, 0.5)".into(),
            ));
        }
        if !(0.0 < self.reinsert_factor && self.reinsert_factor < 1.0) {
            return Err(TreeError::Configuration(
                "reinsert factor must be in (0, 1)".into(),
            ));
        }
        if !(0.0 < self.strong_version_overflow && self.strong_version_overflow <= 1.0)
            || !(0.0 < self.version_underflow && self.version_underflow < 1.0)
        {
            return Err(TreeError::Configuration(
                "version thresholds must be fill ratios in (0, 1]".into(),
            ));
        }
        if self.tree_variant != TreeVariant::RStar {
            return Err(TreeError::Configuration(
                "only the RStar tree variant is implemented".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Roots and Header
// ============================================================================

/// One historical root: the storage identifier of a root node version and
/// the interval during which it was the root. Closed when superseded,
/// never removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootEntry {
    pub id: PageId,
    pub start: f64,
    pub end: f64,
}

impl RootEntry {
    pub fn is_alive(&self) -> bool {
        self.end == f64::INFINITY
    }

    pub fn interval(&self) -> TimeInterval {
        TimeInterval::new(self.start, self.end)
    }
}

/// Magic number for header identification ("MVRT").
pub const MAGIC: u32 = 0x4D56_5254;

/// Header format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header record persisted at a well-known page. Carries the tunables, the
/// logical clock and the full ordered root list, so an existing tree can be
/// reopened from storage alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub dimension: u32,
    pub index_capacity: u32,
    pub leaf_capacity: u32,
    pub fill_factor: f64,
    pub tree_variant: TreeVariant,
    pub near_minimum_overlap_factor: u32,
    pub split_distribution_factor: f64,
    pub reinsert_factor: f64,
    pub ensure_tight_mbrs: bool,
    pub strong_version_overflow: f64,
    pub version_underflow: f64,
    pub current_time: f64,
    pub next_position: u64,
    pub live_data: u64,
    pub node_versions: u64,
    pub height: u32,
    pub roots: Vec<RootEntry>,
}

impl Header {
    pub fn from_options(opts: &TreeOptions) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            dimension: opts.dimension,
            index_capacity: opts.index_capacity,
            leaf_capacity: opts.leaf_capacity,
            fill_factor: opts.fill_factor,
            tree_variant: opts.tree_variant,
            near_minimum_overlap_factor: opts.near_minimum_overlap_factor,
            split_distribution_factor: opts.split_distribution_factor,
            reinsert_factor: opts.reinsert_factor,
            ensure_tight_mbrs: opts.ensure_tight_mbrs,
            strong_version_overflow: opts.strong_version_overflow,
            version_underflow: opts.version_underflow,
            current_time: 0.0,
            next_position: 0,
            live_data: 0,
            node_versions: 0,
            height: 0,
            roots: Vec::new(),
        }
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.magic != MAGIC {
            return Err(TreeError::Configuration(
                "malformed header (bad magic)".into(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(TreeError::Configuration(format!(
                "unsupported header format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn to_options(&self) -> TreeOptions {
        let mut opts = TreeOptions::new(self.dimension);
        opts.index_capacity = self.index_capacity;
        opts.leaf_capacity = self.leaf_capacity;
        opts.fill_factor = self.fill_factor;
        opts.tree_variant = self.tree_variant;
        opts.near_minimum_overlap_factor = self.near_minimum_overlap_factor;
        opts.split_distribution_factor = self.split_distribution_factor;
        opts.reinsert_factor = self.reinsert_factor;
        opts.ensure_tight_mbrs = self.ensure_tight_mbrs;
        opts.strong_version_overflow = self.strong_version_overflow;
        opts.version_underflow = self.version_underflow;
        opts
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Read-only snapshot of engine counters. Structural counts (`live_data`,
/// `node_versions`, `tree_height`) are persisted with the header; operation
/// counters cover the lifetime of this instance.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub reads: u64,
    pub writes: u64,
    pub node_versions: u64,
    pub live_data: u64,
    pub tree_height: u32,
    pub splits: u64,
    pub reinserts: u64,
    pub version_copies: u64,
}

// ============================================================================
// Observer, Visitor and Comparator Contracts
// ============================================================================

/// Which storage operation a command hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    ReadNode,
    WriteNode,
    DeleteNode,
}

/// Synchronous observer invoked immediately after the corresponding storage
/// operation, in registration order. Purely for instrumentation; must not
/// be relied upon for correctness.
pub trait NodeCommand: Send + Sync {
    fn execute(&self, node: &Node);
}

/// Callback contract at query boundaries: one notification per qualifying
/// node visited and one per qualifying data match. Returning `false` from a
/// data or pair notification terminates the query early.
pub trait Visitor {
    fn visit_node(&mut self, _node: &Node) {}

    fn visit_data(&mut self, id: ObjectId, region: &TimeRegion, data: &[u8]) -> bool;

    /// Self-join matches arrive as unordered pairs with `a < b`.
    fn visit_pair(&mut self, a: ObjectId, b: ObjectId) -> bool {
        let _ = (a, b);
        true
    }
}

/// Pluggable lower-bound distance for nearest-neighbor search. Both
/// overloads must be admissible (never overestimate the true distance) for
/// the branch-and-bound order to be correct.
pub trait NearestNeighborComparator {
    fn minimum_distance_to_shape(&self, query: &Point, shape: &TimeRegion) -> f64;

    fn minimum_distance_to_data(&self, query: &Point, region: &TimeRegion, data: &[u8]) -> f64;
}

/// Euclidean point-to-box distance, the default comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanComparator;

impl NearestNeighborComparator for EuclideanComparator {
    fn minimum_distance_to_shape(&self, query: &Point, shape: &TimeRegion) -> f64 {
        shape.region.minimum_distance(query)
    }

    fn minimum_distance_to_data(&self, query: &Point, region: &TimeRegion, _data: &[u8]) -> f64 {
        region.region.minimum_distance(query)
    }
}

/// Caller-driven traversal: the strategy inspects each fetched node and
/// names the next page to fetch, or `None` to stop.
pub trait QueryStrategy {
    fn get_next_entry(&mut self, node: &Node) -> Option<PageId>;
}
