//! Versioned node model.
//!
//! A node is a container of entries, tagged leaf or index, carrying its own
//! `TimeRegion`: the spatial MBR spans every entry the version ever held
//! (closed entries were live earlier inside the version's validity
//! interval, so historical descents still need to reach them), and the
//! temporal interval is the span during which this exact version is the
//! current realization of its tree position. The same logical position is
//! realized by a chain of versions over time, so a node tracks a stable
//! `position` identity distinct from its storage identifier.

use serde::{Deserialize, Serialize};

use crate::region::{Region, TimeInterval, TimeRegion};
use crate::split::Bounded;
use crate::types::{ObjectId, PageId, NEW_PAGE};

/// An entry in a leaf node: an opaque data identifier plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub region: TimeRegion,
    pub id: ObjectId,
    pub data: Vec<u8>,
}

/// A child reference in an index node, pointing at a child node version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub region: TimeRegion,
    pub id: PageId,
}

/// Node payload: leaves hold data entries, index nodes hold child
/// references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf(Vec<LeafEntry>),
    Index(Vec<ChildEntry>),
}

/// One node version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Storage identifier of this version; `NEW_PAGE` until first written.
    /// Not persisted, the storage layer owns the identifier space.
    #[serde(skip)]
    pub id: PageId,
    /// Stable tree-position identity shared by all versions at a position.
    pub position: u64,
    /// Height above the leaves; leaves are level 0.
    pub level: u32,
    /// Spatial MBR over all entries plus this version's validity interval.
    pub region: TimeRegion,
    pub kind: NodeKind,
}

impl Node {
    pub fn new_leaf(position: u64, t: f64, dimension: usize) -> Self {
        Self::new(position, 0, t, dimension, NodeKind::Leaf(Vec::new()))
    }

    pub fn new_index(position: u64, level: u32, t: f64, dimension: usize) -> Self {
        Self::new(position, level, t, dimension, NodeKind::Index(Vec::new()))
    }

    fn new(position: u64, level: u32, t: f64, dimension: usize, kind: NodeKind) -> Self {
        Self {
            id: NEW_PAGE,
            position,
            level,
            region: TimeRegion::alive(Region::empty(dimension), t),
            kind,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(entries) => entries.len(),
            NodeKind::Index(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries whose interval is still open.
    pub fn live_count(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(entries) => entries.iter().filter(|e| e.region.is_alive()).count(),
            NodeKind::Index(children) => children.iter().filter(|c| c.region.is_alive()).count(),
        }
    }

    /// Recompute the spatial MBR from every entry, live and closed. The
    /// validity interval is left untouched.
    pub fn recompute_mbr(&mut self) {
        let mut mbr = Region::empty(self.region.dimension());
        match &self.kind {
            NodeKind::Leaf(entries) => {
                for e in entries {
                    mbr.combine(&e.region.region);
                }
            }
            NodeKind::Index(children) => {
                for c in children {
                    mbr.combine(&c.region.region);
                }
            }
        }
        self.region.region = mbr;
    }

    /// Lazily enlarge the spatial MBR to cover `r`.
    pub fn enlarge_mbr(&mut self, r: &Region) {
        self.region.region.combine(r);
    }

    /// Close this version at `t`: the validity interval ends, and every
    /// still-open entry is clamped to `t` so that entry intervals stay
    /// contained in the node interval. The successor version carries the
    /// live copies onward.
    pub fn close(&mut self, t: f64) {
        self.region.interval.close(t);
        match &mut self.kind {
            NodeKind::Leaf(entries) => {
                for e in entries {
                    e.region.interval.close(t);
                }
            }
            NodeKind::Index(children) => {
                for c in children {
                    c.region.interval.close(t);
                }
            }
        }
    }

    /// The entry a parent holds for this version.
    pub fn to_child_entry(&self) -> ChildEntry {
        ChildEntry {
            region: self.region.clone(),
            id: self.id,
        }
    }

    /// Drop all content so the shell can go back to a node pool.
    pub fn clear_for_reuse(&mut self) {
        self.id = NEW_PAGE;
        match &mut self.kind {
            NodeKind::Leaf(entries) => entries.clear(),
            NodeKind::Index(children) => children.clear(),
        }
    }
}

// ============================================================================
// Entry abstraction shared by leaf and index algorithms
// ============================================================================

/// An entry detached from its node, tagged with the level it belongs to.
/// Used to carry forced-reinsertion work back to the top of the tree.
#[derive(Debug, Clone)]
pub enum Payload {
    Leaf(LeafEntry),
    Child(ChildEntry),
}

impl Payload {
    pub fn region(&self) -> &TimeRegion {
        match self {
            Payload::Leaf(e) => &e.region,
            Payload::Child(e) => &e.region,
        }
    }
}

/// Shared behavior of leaf and child entries, so the insertion, version
/// copy and split machinery is written once.
pub trait TreeEntry: Bounded + Clone + Sized {
    fn time_region(&self) -> &TimeRegion;

    fn interval(&self) -> &TimeInterval;

    /// Clamp the entry's start time up to `t` when it is copied into a node
    /// version that begins at `t`. The uncut history stays in the closed
    /// predecessor.
    fn clamp_start(&mut self, t: f64);

    fn entries(node: &Node) -> &Vec<Self>;

    fn entries_mut(node: &mut Node) -> &mut Vec<Self>;

    fn kind_from(entries: Vec<Self>) -> NodeKind;

    fn into_payload(self) -> Payload;
}

impl Bounded for LeafEntry {
    fn bounds(&self) -> &Region {
        &self.region.region
    }
}

impl Bounded for ChildEntry {
    fn bounds(&self) -> &Region {
        &self.region.region
    }
}

impl TreeEntry for LeafEntry {
    fn time_region(&self) -> &TimeRegion {
        &self.region
    }

    fn interval(&self) -> &TimeInterval {
        &self.region.interval
    }

    fn clamp_start(&mut self, t: f64) {
        if self.region.interval.start < t {
            self.region.interval.start = t;
        }
    }

    fn entries(node: &Node) -> &Vec<Self> {
        match &node.kind {
            NodeKind::Leaf(entries) => entries,
            NodeKind::Index(_) => panic!("leaf entries requested from an index node"),
        }
    }

    fn entries_mut(node: &mut Node) -> &mut Vec<Self> {
        match &mut node.kind {
            NodeKind::Leaf(entries) => entries,
            NodeKind::Index(_) => panic!("leaf entries requested from an index node"),
        }
    }

    fn kind_from(entries: Vec<Self>) -> NodeKind {
        NodeKind::Leaf(entries)
    }

    fn into_payload(self) -> Payload {
        Payload::Leaf(self)
    }
}

impl TreeEntry for ChildEntry {
    fn time_region(&self) -> &TimeRegion {
        &self.region
    }

    fn interval(&self) -> &TimeInterval {
        &self.region.interval
    }

    fn clamp_start(&mut self, t: f64) {
        if self.region.interval.start < t {
            self.region.interval.start = t;
        }
    }

    fn entries(node: &Node) -> &Vec<Self> {
        match &node.kind {
            NodeKind::Index(children) => children,
            NodeKind::Leaf(_) => panic!("child entries requested from a leaf node"),
        }
    }

    fn entries_mut(node: &mut Node) -> &mut Vec<Self> {
        match &mut node.kind {
            NodeKind::Index(children) => children,
            NodeKind::Leaf(_) => panic!("child entries requested from a leaf node"),
        }
    }

    fn kind_from(entries: Vec<Self>) -> NodeKind {
        NodeKind::Index(entries)
    }

    fn into_payload(self) -> Payload {
        Payload::Child(self)
    }
}
