//! The multi-version R*-tree engine.
//!
//! Every mutation happens at a fresh logical timestamp. Inserts descend the
//! current root and resolve into one of three outcomes at each touched node:
//! in-place growth, a version copy (a new node version superseding the old
//! one at the same tree position), or a structural R*-split, with forced
//! reinsertion tried once per level before splitting. Deletes close the
//! matching entry's validity interval instead of removing it, so historical
//! queries keep resolving through closed roots and closed node versions.
//!
//! Single-writer, cooperative-reader: mutations take `&mut self`, queries
//! `&self`; the engine itself performs no locking beyond its pools and
//! counters.

use std::cmp::{self, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use log::warn;

use crate::node::{ChildEntry, LeafEntry, Node, NodeKind, Payload, TreeEntry};
use crate::pool::Pool;
use crate::region::{Point, Region, TimeInterval, TimeRegion};
use crate::split::{rstar_split, Bounded};
use crate::storage::StorageManager;
use crate::types::{
    CommandType, EuclideanComparator, Header, NearestNeighborComparator, NodeCommand, ObjectId,
    PageId, QueryStrategy, RootEntry, Statistics, TreeError, TreeOptions, TreeResult, Visitor,
    NEW_PAGE,
};

// ============================================================================
// Operation state
// ============================================================================

/// Per-operation scratch state threaded through the recursive mutation path.
/// Reset for every top-level insert or delete.
struct OpContext {
    /// The operation's timestamp; reinserted entries share it.
    time: f64,
    /// At most one version-copy cascade per operation.
    has_version_copied: bool,
    /// Deletions never trigger forced reinsertion.
    allow_reinsert: bool,
    /// Levels that already saw a forced reinsertion this operation; a second
    /// overflow at such a level splits.
    reinserted: HashSet<u32>,
    /// Entries evicted by forced reinsertion, waiting to re-enter from the
    /// top at their recorded level.
    pending: Vec<(u32, Payload)>,
}

impl OpContext {
    fn new(time: f64, allow_reinsert: bool) -> Self {
        Self {
            time,
            has_version_copied: false,
            allow_reinsert,
            reinserted: HashSet::new(),
            pending: Vec::new(),
        }
    }
}

/// What happened to the node version a mutation step landed on.
enum Superseded {
    /// The old version was closed at the operation time and kept for
    /// history.
    Closed,
    /// The old version's interval would have been empty, so it was
    /// physically removed.
    Deleted,
}

/// Result of applying a mutation to one node, reported to the parent.
enum AddOutcome {
    /// The node absorbed the change in place; carries its current spatial
    /// MBR so ancestors can refresh theirs.
    Fit(Region),
    /// The node version was superseded by one (version copy, reinsertion)
    /// or two (split) replacement versions the parent must now link.
    Replaced {
        superseded: Superseded,
        children: Vec<ChildEntry>,
    },
}

/// Which spatial predicate a range query applies at the leaves. Descent
/// always uses intersection; time is always interval intersection.
#[derive(Clone, Copy)]
enum RangePredicate {
    Intersection,
    Containment,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    splits: AtomicU64,
    reinserts: AtomicU64,
    version_copies: AtomicU64,
}

// ============================================================================
// Nearest-neighbor candidates
// ============================================================================

enum NnCandidate {
    Node(PageId),
    Data {
        id: ObjectId,
        region: TimeRegion,
        data: Vec<u8>,
    },
}

/// Heap entry ordered by ascending lower-bound distance; ties are broken
/// arbitrarily by pop order.
struct NnEntry {
    distance: f64,
    candidate: NnCandidate,
}

impl PartialEq for NnEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for NnEntry {}

impl PartialOrd for NnEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NnEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(cmp::Ordering::Equal)
    }
}

// ============================================================================
// The tree
// ============================================================================

/// A multi-version R*-tree over a storage collaborator `S`.
pub struct MvrTree<S: StorageManager> {
    storage: S,
    header_id: PageId,
    opts: TreeOptions,
    /// Chronological root history; at most the last entry is open.
    roots: Vec<RootEntry>,
    current_time: f64,
    /// Next stable tree-position identity.
    next_position: u64,
    live_data: u64,
    node_versions: u64,
    height: u32,
    counters: Counters,
    leaf_pool: Pool<Node>,
    index_pool: Pool<Node>,
    region_pool: Pool<Region>,
    point_pool: Pool<Point>,
    read_commands: Vec<Box<dyn NodeCommand>>,
    write_commands: Vec<Box<dyn NodeCommand>>,
    delete_commands: Vec<Box<dyn NodeCommand>>,
}

impl<S: StorageManager> MvrTree<S> {
    /// Create a fresh tree, persisting its header immediately.
    pub fn create(storage: S, opts: TreeOptions) -> TreeResult<Self> {
        opts.validate()?;
        let header = Header::from_options(&opts);
        let mut tree = Self::assemble(storage, NEW_PAGE, opts, header);
        tree.store_header()?;
        Ok(tree)
    }

    /// Reopen an existing tree from its header page.
    pub fn open(storage: S, header_id: PageId) -> TreeResult<Self> {
        let bytes = storage.read(header_id)?;
        let (header, _): (Header, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(|e| TreeError::Configuration(format!("malformed header: {e}")))?;
        header.validate()?;
        let opts = header.to_options();
        opts.validate()?;
        Ok(Self::assemble(storage, header_id, opts, header))
    }

    fn assemble(storage: S, header_id: PageId, opts: TreeOptions, header: Header) -> Self {
        let leaf_pool = Pool::new(opts.leaf_pool_capacity);
        let index_pool = Pool::new(opts.index_pool_capacity);
        let region_pool = Pool::new(opts.region_pool_capacity);
        let point_pool = Pool::new(opts.point_pool_capacity);
        Self {
            storage,
            header_id,
            opts,
            roots: header.roots,
            current_time: header.current_time,
            next_position: header.next_position,
            live_data: header.live_data,
            node_versions: header.node_versions,
            height: header.height,
            counters: Counters::default(),
            leaf_pool,
            index_pool,
            region_pool,
            point_pool,
            read_commands: Vec::new(),
            write_commands: Vec::new(),
            delete_commands: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The current logical time.
    pub fn now(&self) -> f64 {
        self.current_time
    }

    pub fn options(&self) -> &TreeOptions {
        &self.opts
    }

    /// Storage identifier of the header page; pass it back to [`open`].
    ///
    /// [`open`]: MvrTree::open
    pub fn header_id(&self) -> PageId {
        self.header_id
    }

    /// Number of historical roots, the open one included.
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            node_versions: self.node_versions,
            live_data: self.live_data,
            tree_height: self.height,
            splits: self.counters.splits.load(Ordering::Relaxed),
            reinserts: self.counters.reinserts.load(Ordering::Relaxed),
            version_copies: self.counters.version_copies.load(Ordering::Relaxed),
        }
    }

    /// Register an observer fired after every matching storage operation,
    /// in registration order.
    pub fn add_command(&mut self, command: Box<dyn NodeCommand>, kind: CommandType) {
        match kind {
            CommandType::ReadNode => self.read_commands.push(command),
            CommandType::WriteNode => self.write_commands.push(command),
            CommandType::DeleteNode => self.delete_commands.push(command),
        }
    }

    /// Persist the header and flush the storage collaborator.
    pub fn flush(&mut self) -> TreeResult<()> {
        self.store_header()?;
        self.storage.flush()
    }

    // ------------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------------

    /// Insert `data` under `id` with spatial extent `region`, valid from the
    /// next logical instant onward.
    pub fn insert(&mut self, data: &[u8], region: &Region, id: ObjectId) -> TreeResult<()> {
        self.check_dimension(region.dimension())?;
        self.current_time += 1.0;
        let t = self.current_time;
        let entry = LeafEntry {
            region: TimeRegion::alive(region.clone(), t),
            id,
            data: data.to_vec(),
        };

        if self.current_root().is_none() {
            let position = self.allocate_position();
            let node = self.make_version::<LeafEntry>(position, 0, vec![entry], t)?;
            self.roots.push(RootEntry {
                id: node.id,
                start: t,
                end: f64::INFINITY,
            });
            self.height = 1;
            self.release_node(node);
        } else {
            let mut ctx = OpContext::new(t, true);
            ctx.pending.push((0, Payload::Leaf(entry)));
            self.drain_pending(&mut ctx)?;
        }
        self.live_data += 1;
        self.store_header()
    }

    /// Process the primary entry plus everything forced reinsertion evicts,
    /// each from the top of the tree at its recorded level.
    fn drain_pending(&mut self, ctx: &mut OpContext) -> TreeResult<()> {
        while let Some((level, payload)) = ctx.pending.pop() {
            let root_id = self
                .current_root()
                .ok_or_else(|| TreeError::CorruptState("no live root during insertion".into()))?
                .id;
            let outcome = self.insert_payload(root_id, payload, level, true, ctx)?;
            self.resolve_root_outcome(outcome, ctx.time)?;
        }
        Ok(())
    }

    fn insert_payload(
        &mut self,
        node_id: PageId,
        payload: Payload,
        target_level: u32,
        is_root: bool,
        ctx: &mut OpContext,
    ) -> TreeResult<AddOutcome> {
        let mut node = self.read_node(node_id)?;
        if node.level == target_level {
            return match payload {
                Payload::Leaf(entry) => self.apply_add::<LeafEntry>(node, vec![entry], is_root, ctx),
                Payload::Child(entry) => {
                    self.apply_add::<ChildEntry>(node, vec![entry], is_root, ctx)
                }
            };
        }

        let child_index = self.choose_child(&node, &payload.region().region)?;
        let child_id = ChildEntry::entries(&node)[child_index].id;
        match self.insert_payload(child_id, payload, target_level, false, ctx)? {
            AddOutcome::Fit(child_mbr) => {
                self.refresh_child_entry(&mut node, child_index, &child_mbr);
                self.write_node(&mut node)?;
                let mbr = node.region.region.clone();
                self.release_node(node);
                Ok(AddOutcome::Fit(mbr))
            }
            AddOutcome::Replaced {
                superseded,
                children,
            } => {
                self.unlink_child_entry(&mut node, child_index, &superseded, ctx.time);
                self.apply_add::<ChildEntry>(node, children, is_root, ctx)
            }
        }
    }

    /// The three-way decision: absorb in place, version-copy, or overflow
    /// into forced reinsertion / split. Shared by leaf and index levels.
    fn apply_add<E: TreeEntry>(
        &mut self,
        mut node: Node,
        new: Vec<E>,
        is_root: bool,
        ctx: &mut OpContext,
    ) -> TreeResult<AddOutcome> {
        let t = ctx.time;
        let capacity = self.capacity_of(&node);
        let total_after = node.len() + new.len();
        let live_after = node.live_count() + new.len();
        // A version born at t cannot be superseded at t with any history
        // worth keeping, and the cascade guard allows one copy per op.
        let may_version_copy =
            node.region.interval.start < t && !ctx.has_version_copied;

        if total_after <= capacity {
            let threshold =
                self.opts.strong_version_overflow * self.opts.fill_factor * capacity as f64;
            if live_after as f64 > threshold && may_version_copy {
                ctx.has_version_copied = true;
                self.counters.version_copies.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "strong version overflow at position {}: {} live of {}",
                    node.position, live_after, capacity
                );
                let mut survivors = self.live_entries::<E>(&node);
                survivors.extend(new);
                for e in &mut survivors {
                    e.clamp_start(t);
                }
                let successor =
                    self.make_version::<E>(node.position, node.level, survivors, t)?;
                let children = vec![successor.to_child_entry()];
                self.release_node(successor);
                let superseded = self.supersede(node, t)?;
                return Ok(AddOutcome::Replaced {
                    superseded,
                    children,
                });
            }

            if self.opts.ensure_tight_mbrs {
                E::entries_mut(&mut node).extend(new);
                node.recompute_mbr();
            } else {
                let mut grown = Region::empty(self.opts.dimension as usize);
                for e in &new {
                    grown.combine(e.bounds());
                }
                E::entries_mut(&mut node).extend(new);
                node.enlarge_mbr(&grown);
            }
            self.write_node(&mut node)?;
            let mbr = node.region.region.clone();
            self.release_node(node);
            return Ok(AddOutcome::Fit(mbr));
        }

        // Overflow. Only live entries move into replacement versions; the
        // closed predecessor keeps the full history.
        let mut survivors = self.live_entries::<E>(&node);
        survivors.extend(new);
        for e in &mut survivors {
            e.clamp_start(t);
        }

        if survivors.len() <= capacity {
            // The overflow is dead weight: the live set alone still fits,
            // so a version copy sheds the closed entries. Mandatory here,
            // the cascade guard cannot defer it.
            ctx.has_version_copied = true;
            self.counters.version_copies.fetch_add(1, Ordering::Relaxed);
            debug!(
                "overflow of closed entries at position {}: {} live of {}",
                node.position,
                survivors.len(),
                capacity
            );
            let successor = self.make_version::<E>(node.position, node.level, survivors, t)?;
            let children = vec![successor.to_child_entry()];
            self.release_node(successor);
            let superseded = self.supersede(node, t)?;
            return Ok(AddOutcome::Replaced {
                superseded,
                children,
            });
        }

        if ctx.allow_reinsert && !is_root && !ctx.reinserted.contains(&node.level) {
            ctx.reinserted.insert(node.level);
            self.counters.reinserts.fetch_add(1, Ordering::Relaxed);
            let evicted = self.pick_farthest(&mut survivors);
            debug!(
                "forced reinsertion of {} entries at level {}",
                evicted.len(),
                node.level
            );
            let level = node.level;
            let successor = self.make_version::<E>(node.position, level, survivors, t)?;
            let children = vec![successor.to_child_entry()];
            self.release_node(successor);
            let superseded = self.supersede(node, t)?;
            for entry in evicted {
                ctx.pending.push((level, entry.into_payload()));
            }
            return Ok(AddOutcome::Replaced {
                superseded,
                children,
            });
        }

        self.counters.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "splitting position {} at level {} ({} live entries)",
            node.position,
            node.level,
            survivors.len()
        );
        let (first, second) = rstar_split(survivors, self.opts.split_distribution_factor);
        let position = node.position;
        let level = node.level;
        let sibling_position = self.allocate_position();
        let left = self.make_version::<E>(position, level, first, t)?;
        let right = self.make_version::<E>(sibling_position, level, second, t)?;
        let children = vec![left.to_child_entry(), right.to_child_entry()];
        self.release_node(left);
        self.release_node(right);
        let superseded = self.supersede(node, t)?;
        Ok(AddOutcome::Replaced {
            superseded,
            children,
        })
    }

    /// Install the outcome of a mutation that reached the root: a lone
    /// replacement takes the old root's place, two replacements grow a new
    /// index root above them.
    fn resolve_root_outcome(&mut self, outcome: AddOutcome, t: f64) -> TreeResult<()> {
        let AddOutcome::Replaced {
            superseded,
            children,
        } = outcome
        else {
            return Ok(());
        };

        let new_root_id = if children.len() == 1 {
            children[0].id
        } else {
            let position = self.allocate_position();
            let root = self.make_version::<ChildEntry>(position, self.height, children, t)?;
            self.height += 1;
            let id = root.id;
            self.release_node(root);
            id
        };

        match superseded {
            Superseded::Deleted => {
                // The superseded root version opened at t and never served
                // a query; its RootEntry is repointed rather than closed.
                let current = self.roots.last_mut().ok_or_else(|| {
                    TreeError::CorruptState("root replaced on an empty root list".into())
                })?;
                current.id = new_root_id;
            }
            Superseded::Closed => {
                if let Some(current) = self.roots.last_mut() {
                    current.end = t;
                }
                self.roots.push(RootEntry {
                    id: new_root_id,
                    start: t,
                    end: f64::INFINITY,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Close the live entry matching both `region` (exactly) and `id` at the
    /// next logical instant. Returns `Ok(false)` when no live entry matches;
    /// a miss leaves no trace, the clock included.
    pub fn delete(&mut self, region: &Region, id: ObjectId) -> TreeResult<bool> {
        self.check_dimension(region.dimension())?;
        let Some(root) = self.current_root() else {
            return Ok(false);
        };
        let root_id = root.id;
        let previous_time = self.current_time;
        self.current_time += 1.0;
        let mut ctx = OpContext::new(self.current_time, false);
        match self.delete_in(root_id, region, id, true, &mut ctx)? {
            None => {
                self.current_time = previous_time;
                Ok(false)
            }
            Some(outcome) => {
                self.resolve_root_outcome(outcome, ctx.time)?;
                self.live_data = self.live_data.saturating_sub(1);
                self.store_header()?;
                Ok(true)
            }
        }
    }

    fn delete_in(
        &mut self,
        node_id: PageId,
        region: &Region,
        id: ObjectId,
        is_root: bool,
        ctx: &mut OpContext,
    ) -> TreeResult<Option<AddOutcome>> {
        let mut node = self.read_node(node_id)?;
        let t = ctx.time;

        if node.is_leaf() {
            let found = LeafEntry::entries(&node)
                .iter()
                .position(|e| e.region.is_alive() && e.id == id && e.region.region == *region);
            let Some(index) = found else {
                self.release_node(node);
                return Ok(None);
            };
            LeafEntry::entries_mut(&mut node)[index].region.interval.close(t);

            let live = node.live_count();
            let capacity = self.capacity_of(&node);
            let underflow = (live as f64) < self.opts.version_underflow * capacity as f64;
            if live > 0
                && underflow
                && node.region.interval.start < t
                && !ctx.has_version_copied
            {
                // Version copy with the dead entries excluded, so the live
                // version stays reasonably full without condensation.
                ctx.has_version_copied = true;
                self.counters.version_copies.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "version underflow at position {}: {} live of {}",
                    node.position, live, capacity
                );
                let mut survivors = self.live_entries::<LeafEntry>(&node);
                for e in &mut survivors {
                    e.clamp_start(t);
                }
                let successor =
                    self.make_version::<LeafEntry>(node.position, node.level, survivors, t)?;
                let children = vec![successor.to_child_entry()];
                self.release_node(successor);
                let superseded = self.supersede(node, t)?;
                return Ok(Some(AddOutcome::Replaced {
                    superseded,
                    children,
                }));
            }

            if self.opts.ensure_tight_mbrs {
                node.recompute_mbr();
            }
            self.write_node(&mut node)?;
            let mbr = node.region.region.clone();
            self.release_node(node);
            return Ok(Some(AddOutcome::Fit(mbr)));
        }

        let candidates: Vec<(usize, PageId)> = ChildEntry::entries(&node)
            .iter()
            .enumerate()
            .filter(|(_, c)| c.region.is_alive() && c.region.region.intersects(region))
            .map(|(i, c)| (i, c.id))
            .collect();
        for (child_index, child_id) in candidates {
            match self.delete_in(child_id, region, id, false, ctx)? {
                None => continue,
                Some(AddOutcome::Fit(child_mbr)) => {
                    self.refresh_child_entry(&mut node, child_index, &child_mbr);
                    self.write_node(&mut node)?;
                    let mbr = node.region.region.clone();
                    self.release_node(node);
                    return Ok(Some(AddOutcome::Fit(mbr)));
                }
                Some(AddOutcome::Replaced {
                    superseded,
                    children,
                }) => {
                    self.unlink_child_entry(&mut node, child_index, &superseded, t);
                    return self
                        .apply_add::<ChildEntry>(node, children, is_root, ctx)
                        .map(Some);
                }
            }
        }
        self.release_node(node);
        Ok(None)
    }

    // ------------------------------------------------------------------------
    // Mutation helpers
    // ------------------------------------------------------------------------

    /// Least-enlargement child choice; the level immediately above the
    /// leaves additionally minimizes overlap enlargement among the
    /// `near_minimum_overlap_factor` best candidates.
    fn choose_child(&self, node: &Node, r: &Region) -> TreeResult<usize> {
        let children = ChildEntry::entries(node);
        let live: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.region.is_alive())
            .map(|(i, _)| i)
            .collect();
        if live.is_empty() {
            return Err(TreeError::CorruptState(format!(
                "index node at position {} has no live children",
                node.position
            )));
        }

        let mut ranked: Vec<(f64, usize)> = live
            .iter()
            .map(|&i| (children[i].region.region.enlargement(r), i))
            .collect();
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(cmp::Ordering::Equal));

        if node.level == 1 {
            ranked.truncate(self.opts.near_minimum_overlap_factor as usize);
            let dimension = self.opts.dimension as usize;
            let mut combined = self
                .region_pool
                .acquire_with(|| Region::empty(dimension));
            let mut best = ranked[0].1;
            let mut best_overlap = f64::INFINITY;
            let mut best_enlargement = f64::INFINITY;
            let mut best_area = f64::INFINITY;
            for &(enlargement, i) in &ranked {
                combined.assign(&children[i].region.region);
                combined.combine(r);
                let mut overlap = 0.0;
                for &j in &live {
                    if j == i {
                        continue;
                    }
                    let sibling = &children[j].region.region;
                    overlap += combined.intersecting_area(sibling)
                        - children[i].region.region.intersecting_area(sibling);
                }
                let area = children[i].region.region.area();
                let better = overlap < best_overlap
                    || (overlap == best_overlap && enlargement < best_enlargement)
                    || (overlap == best_overlap
                        && enlargement == best_enlargement
                        && area < best_area);
                if better {
                    best_overlap = overlap;
                    best_enlargement = enlargement;
                    best_area = area;
                    best = i;
                }
            }
            self.region_pool.release(combined);
            return Ok(best);
        }

        let mut best = ranked[0].1;
        let mut best_enlargement = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for &(enlargement, i) in &ranked {
            let area = children[i].region.region.area();
            if enlargement < best_enlargement
                || (enlargement == best_enlargement && area < best_area)
            {
                best_enlargement = enlargement;
                best_area = area;
                best = i;
            }
        }
        Ok(best)
    }

    /// Evict the `reinsert_factor` fraction of entries farthest from the
    /// group's MBR center, farthest first.
    fn pick_farthest<E: TreeEntry>(&self, entries: &mut Vec<E>) -> Vec<E> {
        let dimension = self.opts.dimension as usize;
        let mut mbr = Region::empty(dimension);
        for e in entries.iter() {
            mbr.combine(e.bounds());
        }
        let mut center = self.point_pool.acquire_with(|| Point::new(Vec::new()));
        let mut entry_center = self.point_pool.acquire_with(|| Point::new(Vec::new()));
        mbr.center(&mut center);

        let mut ranked: Vec<(f64, usize)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                e.bounds().center(&mut entry_center);
                (center.distance(&entry_center), i)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(cmp::Ordering::Equal));
        self.point_pool.release(center);
        self.point_pool.release(entry_center);

        let count = ((entries.len() as f64 * self.opts.reinsert_factor).ceil() as usize)
            .clamp(1, entries.len() - 1);
        let mut evict = vec![false; entries.len()];
        for &(_, i) in ranked.iter().take(count) {
            evict[i] = true;
        }

        let mut removed = Vec::with_capacity(count);
        let mut kept = Vec::with_capacity(entries.len() - count);
        for (i, e) in entries.drain(..).enumerate() {
            if evict[i] {
                removed.push(e);
            } else {
                kept.push(e);
            }
        }
        *entries = kept;
        removed
    }

    /// Clone the still-open entries of `node`. The clones are the seed of a
    /// successor version; callers clamp their starts to the operation time.
    fn live_entries<E: TreeEntry>(&self, node: &Node) -> Vec<E> {
        E::entries(node)
            .iter()
            .filter(|e| e.interval().is_alive())
            .cloned()
            .collect()
    }

    /// Build, write and return a fresh node version opened at `t`.
    fn make_version<E: TreeEntry>(
        &mut self,
        position: u64,
        level: u32,
        entries: Vec<E>,
        t: f64,
    ) -> TreeResult<Node> {
        let dimension = self.opts.dimension as usize;
        let mut node = if level == 0 {
            self.leaf_pool
                .acquire_with(|| Node::new_leaf(0, 0.0, dimension))
        } else {
            self.index_pool
                .acquire_with(|| Node::new_index(0, 1, 0.0, dimension))
        };
        node.id = NEW_PAGE;
        node.position = position;
        node.level = level;
        node.kind = E::kind_from(entries);
        node.region = TimeRegion::alive(Region::empty(dimension), t);
        node.recompute_mbr();
        self.write_node(&mut node)?;
        Ok(node)
    }

    /// Retire a superseded node version: close it at `t` and keep it, or
    /// physically delete it when its interval would be empty (it opened at
    /// `t` inside this same operation, so no query can ever need it).
    fn supersede(&mut self, mut node: Node, t: f64) -> TreeResult<Superseded> {
        if node.region.interval.start >= t {
            self.delete_node(&node)?;
            self.release_node(node);
            Ok(Superseded::Deleted)
        } else {
            node.close(t);
            self.write_node(&mut node)?;
            self.release_node(node);
            Ok(Superseded::Closed)
        }
    }

    /// Refresh the parent entry for a child that absorbed a change in place,
    /// then the parent's own MBR.
    fn refresh_child_entry(&mut self, node: &mut Node, child_index: usize, child_mbr: &Region) {
        {
            let children = ChildEntry::entries_mut(node);
            if self.opts.ensure_tight_mbrs {
                children[child_index].region.region.assign(child_mbr);
            } else {
                children[child_index].region.region.combine(child_mbr);
            }
        }
        if self.opts.ensure_tight_mbrs {
            node.recompute_mbr();
        } else {
            node.enlarge_mbr(child_mbr);
        }
    }

    /// Detach the parent entry of a superseded child: closed children keep
    /// a closed entry for history, deleted ones vanish entirely.
    fn unlink_child_entry(
        &mut self,
        node: &mut Node,
        child_index: usize,
        superseded: &Superseded,
        t: f64,
    ) {
        let children = ChildEntry::entries_mut(node);
        match superseded {
            Superseded::Deleted => {
                children.remove(child_index);
            }
            Superseded::Closed => {
                children[child_index].region.interval.close(t);
            }
        }
    }

    fn current_root(&self) -> Option<&RootEntry> {
        self.roots.last().filter(|r| r.is_alive())
    }

    fn allocate_position(&mut self) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    fn capacity_of(&self, node: &Node) -> usize {
        if node.is_leaf() {
            self.opts.leaf_capacity as usize
        } else {
            self.opts.index_capacity as usize
        }
    }

    fn check_dimension(&self, dimension: usize) -> TreeResult<()> {
        if dimension != self.opts.dimension as usize {
            return Err(TreeError::InvalidOperation(format!(
                "shape dimension {} does not match tree dimension {}",
                dimension, self.opts.dimension
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Node I/O
    // ------------------------------------------------------------------------

    fn read_node(&self, id: PageId) -> TreeResult<Node> {
        let bytes = self.storage.read(id)?;
        let (mut node, _): (Node, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(|e| TreeError::Serialization(e.to_string()))?;
        node.id = id;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        for command in &self.read_commands {
            command.execute(&node);
        }
        Ok(node)
    }

    fn write_node(&mut self, node: &mut Node) -> TreeResult<()> {
        let bytes = bincode::serde::encode_to_vec(&*node, bincode::config::legacy())
            .map_err(|e| TreeError::Serialization(e.to_string()))?;
        let fresh = node.id == NEW_PAGE;
        node.id = self.storage.write(node.id, &bytes)?;
        if fresh {
            self.node_versions += 1;
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        for command in &self.write_commands {
            command.execute(node);
        }
        Ok(())
    }

    fn delete_node(&mut self, node: &Node) -> TreeResult<()> {
        self.storage.delete(node.id)?;
        self.node_versions = self.node_versions.saturating_sub(1);
        for command in &self.delete_commands {
            command.execute(node);
        }
        Ok(())
    }

    fn release_node(&self, mut node: Node) {
        let leaf = node.is_leaf();
        node.clear_for_reuse();
        if leaf {
            self.leaf_pool.release(node);
        } else {
            self.index_pool.release(node);
        }
    }

    fn store_header(&mut self) -> TreeResult<()> {
        let header = Header {
            current_time: self.current_time,
            next_position: self.next_position,
            live_data: self.live_data,
            node_versions: self.node_versions,
            height: self.height,
            roots: self.roots.clone(),
            ..Header::from_options(&self.opts)
        };
        let bytes = bincode::serde::encode_to_vec(&header, bincode::config::legacy())
            .map_err(|e| TreeError::Serialization(e.to_string()))?;
        self.header_id = self.storage.write(self.header_id, &bytes)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Range queries
    // ------------------------------------------------------------------------

    /// Report every entry whose region is spatially contained in the query
    /// region and whose interval intersects the query interval.
    pub fn contains_what_query(
        &self,
        query: &TimeRegion,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        self.range_query(RangePredicate::Containment, query, visitor)
    }

    /// Report every entry intersecting the query in both space and time.
    pub fn intersects_with_query(
        &self,
        query: &TimeRegion,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        self.range_query(RangePredicate::Intersection, query, visitor)
    }

    /// Report every entry whose region covers `point` during `interval`.
    pub fn point_location_query(
        &self,
        point: &Point,
        interval: &TimeInterval,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        let query = TimeRegion::new(Region::from_point(point), *interval);
        self.range_query(RangePredicate::Intersection, &query, visitor)
    }

    /// Report every unordered pair of distinct entries that both qualify
    /// under the query and mutually intersect in space and time. Pairs
    /// arrive with the smaller identifier first.
    pub fn self_join_query(&self, query: &TimeRegion, visitor: &mut dyn Visitor) -> TreeResult<()> {
        self.check_dimension(query.dimension())?;
        let mut seen_nodes = HashSet::new();
        let mut seen_data = HashSet::new();
        let mut matches: Vec<(ObjectId, TimeRegion)> = Vec::new();

        let mut stack: Vec<PageId> = self
            .roots
            .iter()
            .filter(|r| r.interval().intersects(&query.interval))
            .map(|r| r.id)
            .collect();
        while let Some(id) = stack.pop() {
            if !seen_nodes.insert(id) {
                continue;
            }
            let node = self.read_node(id)?;
            visitor.visit_node(&node);
            match &node.kind {
                NodeKind::Leaf(entries) => {
                    for e in entries {
                        if e.region.intersects(query) && seen_data.insert(e.id) {
                            matches.push((e.id, e.region.clone()));
                        }
                    }
                }
                NodeKind::Index(children) => {
                    for c in children {
                        if c.region.intersects(query) {
                            stack.push(c.id);
                        }
                    }
                }
            }
            self.release_node(node);
        }

        matches.sort_by_key(|(id, _)| *id);
        for i in 0..matches.len() {
            for j in (i + 1)..matches.len() {
                if matches[i].1.intersects(&matches[j].1)
                    && !visitor.visit_pair(matches[i].0, matches[j].0)
                {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn range_query(
        &self,
        predicate: RangePredicate,
        query: &TimeRegion,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        self.check_dimension(query.dimension())?;
        // An object can live in several node versions across root history;
        // each identifier is reported at most once per query.
        let mut seen_nodes = HashSet::new();
        let mut seen_data = HashSet::new();
        for root in &self.roots {
            if !root.interval().intersects(&query.interval) {
                continue;
            }
            if !self.range_recursive(
                root.id,
                predicate,
                query,
                visitor,
                &mut seen_nodes,
                &mut seen_data,
            )? {
                break;
            }
        }
        Ok(())
    }

    fn range_recursive(
        &self,
        id: PageId,
        predicate: RangePredicate,
        query: &TimeRegion,
        visitor: &mut dyn Visitor,
        seen_nodes: &mut HashSet<PageId>,
        seen_data: &mut HashSet<ObjectId>,
    ) -> TreeResult<bool> {
        if !seen_nodes.insert(id) {
            return Ok(true);
        }
        let node = self.read_node(id)?;
        visitor.visit_node(&node);
        let mut keep_going = true;
        match &node.kind {
            NodeKind::Leaf(entries) => {
                for e in entries {
                    let hit = match predicate {
                        RangePredicate::Intersection => e.region.intersects(query),
                        RangePredicate::Containment => {
                            query.interval.intersects(&e.region.interval)
                                && query.region.contains(&e.region.region)
                        }
                    };
                    if hit
                        && seen_data.insert(e.id)
                        && !visitor.visit_data(e.id, &e.region, &e.data)
                    {
                        keep_going = false;
                        break;
                    }
                }
            }
            NodeKind::Index(children) => {
                let targets: Vec<PageId> = children
                    .iter()
                    .filter(|c| c.region.intersects(query))
                    .map(|c| c.id)
                    .collect();
                for child_id in targets {
                    if !self.range_recursive(
                        child_id, predicate, query, visitor, seen_nodes, seen_data,
                    )? {
                        keep_going = false;
                        break;
                    }
                }
            }
        }
        self.release_node(node);
        Ok(keep_going)
    }

    // ------------------------------------------------------------------------
    // Nearest-neighbor search
    // ------------------------------------------------------------------------

    /// Branch-and-bound k-nearest-neighbor with Euclidean distance.
    pub fn nearest_neighbor_query(
        &self,
        k: u32,
        query: &Point,
        interval: &TimeInterval,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        self.nearest_neighbor_query_with(k, query, interval, &EuclideanComparator, visitor)
    }

    /// Branch-and-bound k-nearest-neighbor with a caller-supplied distance
    /// comparator. Both comparator overloads must be admissible lower
    /// bounds, otherwise the non-decreasing pop order does not hold. Reports
    /// fewer than `k` objects when the index holds fewer live objects in
    /// `interval`.
    pub fn nearest_neighbor_query_with(
        &self,
        k: u32,
        query: &Point,
        interval: &TimeInterval,
        comparator: &dyn NearestNeighborComparator,
        visitor: &mut dyn Visitor,
    ) -> TreeResult<()> {
        self.check_dimension(query.dimension())?;
        let mut heap: BinaryHeap<Reverse<NnEntry>> = BinaryHeap::new();
        let mut seen_nodes = HashSet::new();
        let mut seen_data = HashSet::new();

        for root in &self.roots {
            if root.interval().intersects(interval) && seen_nodes.insert(root.id) {
                heap.push(Reverse(NnEntry {
                    distance: 0.0,
                    candidate: NnCandidate::Node(root.id),
                }));
            }
        }

        let mut confirmed = 0;
        while confirmed < k {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            match entry.candidate {
                NnCandidate::Node(id) => {
                    let node = self.read_node(id)?;
                    visitor.visit_node(&node);
                    match &node.kind {
                        NodeKind::Leaf(entries) => {
                            for e in entries {
                                if !e.region.interval.intersects(interval)
                                    || !seen_data.insert(e.id)
                                {
                                    continue;
                                }
                                let distance =
                                    comparator.minimum_distance_to_data(query, &e.region, &e.data);
                                heap.push(Reverse(NnEntry {
                                    distance,
                                    candidate: NnCandidate::Data {
                                        id: e.id,
                                        region: e.region.clone(),
                                        data: e.data.clone(),
                                    },
                                }));
                            }
                        }
                        NodeKind::Index(children) => {
                            for c in children {
                                if c.region.interval.intersects(interval)
                                    && seen_nodes.insert(c.id)
                                {
                                    let distance =
                                        comparator.minimum_distance_to_shape(query, &c.region);
                                    heap.push(Reverse(NnEntry {
                                        distance,
                                        candidate: NnCandidate::Node(c.id),
                                    }));
                                }
                            }
                        }
                    }
                    self.release_node(node);
                }
                NnCandidate::Data { id, region, data } => {
                    confirmed += 1;
                    if !visitor.visit_data(id, &region, &data) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Caller-driven traversal
    // ------------------------------------------------------------------------

    /// Hand node fetching over to `strategy`: starting from the current
    /// root, fetch whatever page the strategy names next until it stops.
    pub fn query_strategy(&self, strategy: &mut dyn QueryStrategy) -> TreeResult<()> {
        let Some(root) = self.current_root() else {
            return Ok(());
        };
        let mut next = Some(root.id);
        while let Some(id) = next {
            let node = self.read_node(id)?;
            next = strategy.get_next_entry(&node);
            self.release_node(node);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Whole-structure consistency walk over every root, open and closed:
    /// entries must be contained in their node's bounds in both space and
    /// time, and levels must decrease by exactly one per edge. Diagnostics
    /// only, never part of the mutation path.
    pub fn is_valid(&self) -> TreeResult<bool> {
        let mut seen = HashSet::new();
        for root in &self.roots {
            if !self.validate_node(root.id, None, &mut seen)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn validate_node(
        &self,
        id: PageId,
        expected_level: Option<u32>,
        seen: &mut HashSet<PageId>,
    ) -> TreeResult<bool> {
        let node = self.read_node(id)?;
        if let Some(level) = expected_level {
            if node.level != level {
                warn!(
                    "page {}: level {} where the parent expects {}",
                    id, node.level, level
                );
                self.release_node(node);
                return Ok(false);
            }
        }
        if !seen.insert(id) {
            self.release_node(node);
            return Ok(true);
        }

        let mut ok = true;
        match &node.kind {
            NodeKind::Leaf(entries) => {
                if node.level != 0 {
                    warn!("page {}: leaf node at level {}", id, node.level);
                    ok = false;
                }
                for e in entries {
                    if !node.region.region.contains(&e.region.region)
                        || !node.region.interval.contains_interval(&e.region.interval)
                    {
                        warn!("page {}: entry {} escapes the node bounds", id, e.id);
                        ok = false;
                    }
                }
            }
            NodeKind::Index(children) => {
                if node.level == 0 {
                    warn!("page {}: index node at level 0", id);
                    ok = false;
                } else {
                    for c in children {
                        if !node.region.region.contains(&c.region.region)
                            || !node.region.interval.contains_interval(&c.region.interval)
                        {
                            warn!("page {}: child {} escapes the node bounds", id, c.id);
                            ok = false;
                        }
                    }
                    for c in children {
                        if !self.validate_node(c.id, Some(node.level - 1), seen)? {
                            ok = false;
                        }
                    }
                }
            }
        }
        self.release_node(node);
        Ok(ok)
    }
}

impl<S: StorageManager> fmt::Display for MvrTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "multi-version r*-tree: dimension={} height={} live={} versions={} time={}",
            self.opts.dimension, self.height, self.live_data, self.node_versions, self.current_time
        )?;
        for (i, root) in self.roots.iter().enumerate() {
            if root.is_alive() {
                writeln!(f, "  root {:>3}: page {:>6} [{}, +inf)", i, root.id, root.start)?;
            } else {
                writeln!(
                    f,
                    "  root {:>3}: page {:>6} [{}, {})",
                    i, root.id, root.start, root.end
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskStorage, MemoryStorage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collector {
        ids: Vec<ObjectId>,
        nodes: usize,
        pairs: Vec<(ObjectId, ObjectId)>,
    }

    impl Visitor for Collector {
        fn visit_node(&mut self, _node: &Node) {
            self.nodes += 1;
        }

        fn visit_data(&mut self, id: ObjectId, _region: &TimeRegion, _data: &[u8]) -> bool {
            self.ids.push(id);
            true
        }

        fn visit_pair(&mut self, a: ObjectId, b: ObjectId) -> bool {
            self.pairs.push((a, b));
            true
        }
    }

    fn boxr(lx: f64, ly: f64, hx: f64, hy: f64) -> Region {
        Region::new(vec![lx, ly], vec![hx, hy])
    }

    fn point_region(x: f64, y: f64) -> Region {
        boxr(x, y, x, y)
    }

    fn new_tree() -> MvrTree<MemoryStorage> {
        MvrTree::create(MemoryStorage::new(), TreeOptions::new(2)).unwrap()
    }

    fn small_tree(leaf: u32, index: u32) -> MvrTree<MemoryStorage> {
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = leaf;
        opts.index_capacity = index;
        MvrTree::create(MemoryStorage::new(), opts).unwrap()
    }

    fn intersecting_ids<S: StorageManager>(
        tree: &MvrTree<S>,
        region: &Region,
        interval: TimeInterval,
    ) -> Vec<ObjectId> {
        let mut collector = Collector::default();
        tree.intersects_with_query(
            &TimeRegion::new(region.clone(), interval),
            &mut collector,
        )
        .unwrap();
        collector.ids.sort_unstable();
        collector.ids
    }

    #[test]
    fn test_insert_and_query_round_trip() {
        let mut tree = new_tree();
        tree.insert(b"a", &boxr(0.0, 0.0, 1.0, 1.0), 1).unwrap();
        tree.insert(b"b", &boxr(5.0, 5.0, 6.0, 6.0), 2).unwrap();
        tree.insert(b"c", &boxr(0.5, 0.5, 5.5, 5.5), 3).unwrap();

        let now = tree.now();
        assert_eq!(
            intersecting_ids(&tree, &boxr(-1.0, -1.0, 10.0, 10.0), TimeInterval::at(now)),
            vec![1, 2, 3]
        );
        assert_eq!(
            intersecting_ids(&tree, &boxr(0.0, 0.0, 0.4, 0.4), TimeInterval::at(now)),
            vec![1]
        );
        assert_eq!(
            intersecting_ids(&tree, &boxr(20.0, 20.0, 30.0, 30.0), TimeInterval::at(now)),
            Vec::<ObjectId>::new()
        );
    }

    #[test]
    fn test_query_respects_insertion_times() {
        let mut tree = new_tree();
        tree.insert(b"", &point_region(0.0, 0.0), 1).unwrap(); // t = 1
        tree.insert(b"", &point_region(1.0, 1.0), 2).unwrap(); // t = 2

        let everywhere = boxr(-10.0, -10.0, 10.0, 10.0);
        assert!(intersecting_ids(&tree, &everywhere, TimeInterval::at(0.5)).is_empty());
        assert_eq!(
            intersecting_ids(&tree, &everywhere, TimeInterval::at(1.5)),
            vec![1]
        );
        assert_eq!(
            intersecting_ids(&tree, &everywhere, TimeInterval::at(2.0)),
            vec![1, 2]
        );
    }

    #[test]
    fn test_delete_closes_history() {
        let mut tree = new_tree();
        let r = boxr(0.0, 0.0, 1.0, 1.0);
        tree.insert(b"x", &r, 7).unwrap(); // t = 1
        assert!(tree.delete(&r, 7).unwrap()); // t = 2

        let everywhere = boxr(-10.0, -10.0, 10.0, 10.0);
        // Alive before the delete, gone at and after it.
        assert_eq!(
            intersecting_ids(&tree, &everywhere, TimeInterval::at(1.5)),
            vec![7]
        );
        assert!(intersecting_ids(&tree, &everywhere, TimeInterval::at(2.0)).is_empty());
        assert!(intersecting_ids(&tree, &everywhere, TimeInterval::at(tree.now())).is_empty());

        // Already closed: a second delete misses.
        assert!(!tree.delete(&r, 7).unwrap());
    }

    #[test]
    fn test_delete_not_found_leaves_no_trace() {
        let mut tree = new_tree();
        assert!(!tree.delete(&boxr(0.0, 0.0, 1.0, 1.0), 1).unwrap());
        assert_eq!(tree.now(), 0.0);

        tree.insert(b"", &point_region(0.0, 0.0), 1).unwrap();
        let before = tree.now();
        // Right id, wrong region: the match is exact on both.
        assert!(!tree.delete(&boxr(0.0, 0.0, 2.0, 2.0), 1).unwrap());
        // Wrong id, right region.
        assert!(!tree.delete(&point_region(0.0, 0.0), 99).unwrap());
        assert_eq!(tree.now(), before);
        assert_eq!(tree.statistics().live_data, 1);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let mut tree = new_tree();
        let r = Region::new(vec![0.0], vec![1.0]);
        assert!(matches!(
            tree.insert(b"", &r, 1),
            Err(TreeError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_five_point_line_splits_once() {
        let mut tree = small_tree(4, 4);
        for i in 0..5u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }

        let stats = tree.statistics();
        assert_eq!(stats.splits, 1);
        assert_eq!(stats.reinserts, 0, "root overflow must not reinsert");
        assert_eq!(stats.tree_height, 2);

        // The new root holds the two leaf halves; together they carry all
        // five points and do not overlap.
        let root = tree.read_node(tree.current_root().unwrap().id).unwrap();
        assert!(!root.is_leaf());
        let children = ChildEntry::entries(&root);
        let live: Vec<_> = children.iter().filter(|c| c.region.is_alive()).collect();
        assert_eq!(live.len(), 2);
        assert_eq!(
            live[0].region.region.intersecting_area(&live[1].region.region),
            0.0
        );

        let mut total = 0;
        for child in live {
            let leaf = tree.read_node(child.id).unwrap();
            assert!(leaf.is_leaf());
            let count = leaf.live_count();
            assert!(count >= 2, "split produced an unbalanced leaf of {count}");
            total += count;
        }
        assert_eq!(total, 5);

        assert_eq!(
            intersecting_ids(&tree, &boxr(-1.0, -1.0, 10.0, 10.0), TimeInterval::at(tree.now())),
            vec![0, 1, 2, 3, 4]
        );
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_forced_reinsertion_below_root() {
        let mut tree = small_tree(4, 4);
        let mut rng = StdRng::seed_from_u64(42);
        let mut expected = Vec::new();
        for id in 0..40u64 {
            let x: f64 = rng.gen_range(0.0..100.0);
            let y: f64 = rng.gen_range(0.0..100.0);
            tree.insert(b"", &point_region(x, y), id).unwrap();
            expected.push(id);
        }

        let stats = tree.statistics();
        assert!(stats.reinserts > 0, "deep overflow never reinserted");
        assert!(stats.splits > 0);
        assert_eq!(
            intersecting_ids(
                &tree,
                &boxr(-1.0, -1.0, 101.0, 101.0),
                TimeInterval::at(tree.now())
            ),
            expected
        );
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_strong_version_overflow_copies() {
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 8;
        opts.index_capacity = 8;
        opts.fill_factor = 1.0;
        opts.strong_version_overflow = 0.5; // copy beyond 4 live entries
        let mut tree = MvrTree::create(MemoryStorage::new(), opts).unwrap();

        for i in 0..6u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }

        let stats = tree.statistics();
        assert!(stats.version_copies > 0);
        assert_eq!(stats.splits, 0);
        assert!(tree.root_count() > 1, "root version copies must close roots");

        // Every historical instant still sees exactly the objects inserted
        // by then.
        let everywhere = boxr(-1.0, -1.0, 10.0, 10.0);
        for i in 0..6u64 {
            let t = (i + 1) as f64;
            let expected: Vec<ObjectId> = (0..=i).collect();
            assert_eq!(intersecting_ids(&tree, &everywhere, TimeInterval::at(t)), expected);
        }
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_version_underflow_on_delete() {
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 8;
        opts.index_capacity = 8;
        opts.version_underflow = 0.5; // copy below 4 live entries
        let mut tree = MvrTree::create(MemoryStorage::new(), opts).unwrap();

        for i in 0..5u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }
        assert!(tree.delete(&point_region(0.0, 0.0), 0).unwrap());
        assert!(tree.delete(&point_region(1.0, 0.0), 1).unwrap()); // 3 live, under 4

        let stats = tree.statistics();
        assert!(stats.version_copies > 0, "underflow never version-copied");
        assert_eq!(stats.live_data, 3);

        let everywhere = boxr(-1.0, -1.0, 10.0, 10.0);
        assert_eq!(
            intersecting_ids(&tree, &everywhere, TimeInterval::at(5.0)),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(
            intersecting_ids(&tree, &everywhere, TimeInterval::at(tree.now())),
            vec![2, 3, 4]
        );
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_duplicate_elimination_across_versions() {
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 8;
        opts.index_capacity = 8;
        opts.fill_factor = 1.0;
        opts.strong_version_overflow = 0.5;
        let mut tree = MvrTree::create(MemoryStorage::new(), opts).unwrap();
        for i in 0..6u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }

        // A query spanning the whole history crosses several roots and
        // several versions of the same objects; each id shows up once.
        let span = TimeInterval::new(0.0, tree.now() + 1.0);
        let ids = intersecting_ids(&tree, &boxr(-1.0, -1.0, 10.0, 10.0), span);
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_temporal_contiguity_per_position() {
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 4;
        opts.index_capacity = 4;
        opts.strong_version_overflow = 0.9;
        let mut tree = MvrTree::create(MemoryStorage::new(), opts).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut live: Vec<(u64, Region)> = Vec::new();
        for id in 0..60u64 {
            let x: f64 = rng.gen_range(0.0..50.0);
            let y: f64 = rng.gen_range(0.0..50.0);
            let r = point_region(x, y);
            tree.insert(b"", &r, id).unwrap();
            live.push((id, r));
            if id % 5 == 4 {
                let victim = live.remove(rng.gen_range(0..live.len()));
                assert!(tree.delete(&victim.1, victim.0).unwrap());
            }
        }

        // Gather every reachable node version and group their validity
        // intervals by tree position.
        let mut seen = HashSet::new();
        let mut stack: Vec<PageId> = tree.roots.iter().map(|r| r.id).collect();
        let mut by_position: std::collections::HashMap<u64, Vec<TimeInterval>> =
            std::collections::HashMap::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = tree.read_node(id).unwrap();
            by_position
                .entry(node.position)
                .or_default()
                .push(node.region.interval);
            if let NodeKind::Index(children) = &node.kind {
                stack.extend(children.iter().map(|c| c.id));
            }
        }

        for (position, mut intervals) in by_position {
            intervals.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
            for pair in intervals.windows(2) {
                assert_eq!(
                    pair[0].end, pair[1].start,
                    "gap or overlap at position {position}"
                );
            }
            let open = intervals.iter().filter(|i| i.is_alive()).count();
            assert!(open <= 1, "position {position} has {open} open versions");
        }

        // Root history is contiguous as well, with one open tail.
        for pair in tree.roots.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(tree.roots.iter().filter(|r| r.is_alive()).count(), 1);
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let mut tree = small_tree(8, 8);
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = Vec::new();
        for id in 0..50u64 {
            let x: f64 = rng.gen_range(0.0..100.0);
            let y: f64 = rng.gen_range(0.0..100.0);
            tree.insert(b"", &point_region(x, y), id).unwrap();
            points.push((id, x, y));
        }

        let query = Point::new(vec![37.0, 62.0]);
        let mut collector = Collector::default();
        tree.nearest_neighbor_query(10, &query, &TimeInterval::at(tree.now()), &mut collector)
            .unwrap();
        assert_eq!(collector.ids.len(), 10);

        let mut brute: Vec<f64> = points
            .iter()
            .map(|(_, x, y)| ((x - 37.0).powi(2) + (y - 62.0).powi(2)).sqrt())
            .collect();
        brute.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let by_id: std::collections::HashMap<u64, (f64, f64)> =
            points.iter().map(|&(id, x, y)| (id, (x, y))).collect();
        let mut previous = 0.0;
        for (rank, id) in collector.ids.iter().enumerate() {
            let (x, y) = by_id[id];
            let distance = ((x - 37.0).powi(2) + (y - 62.0).powi(2)).sqrt();
            assert!(distance >= previous, "results out of distance order");
            assert!(
                (distance - brute[rank]).abs() < 1e-9,
                "rank {rank}: got {distance}, brute force says {}",
                brute[rank]
            );
            previous = distance;
        }
    }

    #[test]
    fn test_knn_with_fewer_objects_than_k() {
        let mut tree = new_tree();
        tree.insert(b"", &point_region(0.0, 0.0), 1).unwrap();
        tree.insert(b"", &point_region(1.0, 0.0), 2).unwrap();
        tree.insert(b"", &point_region(2.0, 0.0), 3).unwrap();

        let mut collector = Collector::default();
        tree.nearest_neighbor_query(
            10,
            &Point::new(vec![0.0, 0.0]),
            &TimeInterval::at(tree.now()),
            &mut collector,
        )
        .unwrap();
        assert_eq!(collector.ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_knn_respects_time() {
        let mut tree = new_tree();
        let near = point_region(0.0, 0.0);
        tree.insert(b"", &near, 1).unwrap(); // t = 1
        assert!(tree.delete(&near, 1).unwrap()); // t = 2
        tree.insert(b"", &point_region(100.0, 100.0), 2).unwrap(); // t = 3

        let origin = Point::new(vec![0.0, 0.0]);
        let mut current = Collector::default();
        tree.nearest_neighbor_query(1, &origin, &TimeInterval::at(tree.now()), &mut current)
            .unwrap();
        assert_eq!(current.ids, vec![2]);

        let mut historical = Collector::default();
        tree.nearest_neighbor_query(1, &origin, &TimeInterval::at(1.0), &mut historical)
            .unwrap();
        assert_eq!(historical.ids, vec![1]);
    }

    #[test]
    fn test_contains_what_query() {
        let mut tree = new_tree();
        tree.insert(b"", &boxr(1.0, 1.0, 2.0, 2.0), 1).unwrap();
        tree.insert(b"", &boxr(1.0, 1.0, 9.0, 9.0), 2).unwrap(); // overlaps, not contained
        tree.insert(b"", &boxr(3.0, 3.0, 4.0, 4.0), 3).unwrap();

        let mut collector = Collector::default();
        tree.contains_what_query(
            &TimeRegion::new(boxr(0.0, 0.0, 5.0, 5.0), TimeInterval::at(tree.now())),
            &mut collector,
        )
        .unwrap();
        collector.ids.sort_unstable();
        assert_eq!(collector.ids, vec![1, 3]);
    }

    #[test]
    fn test_point_location_query() {
        let mut tree = new_tree();
        tree.insert(b"", &boxr(0.0, 0.0, 2.0, 2.0), 1).unwrap();
        tree.insert(b"", &boxr(1.0, 1.0, 3.0, 3.0), 2).unwrap();
        tree.insert(b"", &boxr(5.0, 5.0, 6.0, 6.0), 3).unwrap();

        let mut collector = Collector::default();
        tree.point_location_query(
            &Point::new(vec![1.5, 1.5]),
            &TimeInterval::at(tree.now()),
            &mut collector,
        )
        .unwrap();
        collector.ids.sort_unstable();
        assert_eq!(collector.ids, vec![1, 2]);
    }

    #[test]
    fn test_self_join_pairs() {
        let mut tree = new_tree();
        tree.insert(b"", &boxr(0.0, 0.0, 2.0, 2.0), 1).unwrap();
        tree.insert(b"", &boxr(1.0, 1.0, 3.0, 3.0), 2).unwrap();
        tree.insert(b"", &boxr(2.5, 2.5, 4.0, 4.0), 3).unwrap();
        tree.insert(b"", &boxr(10.0, 10.0, 11.0, 11.0), 4).unwrap();

        let mut collector = Collector::default();
        tree.self_join_query(
            &TimeRegion::new(boxr(-1.0, -1.0, 20.0, 20.0), TimeInterval::at(tree.now())),
            &mut collector,
        )
        .unwrap();
        collector.pairs.sort_unstable();
        assert_eq!(collector.pairs, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_visitor_early_termination() {
        struct StopAfterOne(usize);
        impl Visitor for StopAfterOne {
            fn visit_data(&mut self, _id: ObjectId, _region: &TimeRegion, _data: &[u8]) -> bool {
                self.0 += 1;
                false
            }
        }

        let mut tree = new_tree();
        for i in 0..10u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }
        let mut visitor = StopAfterOne(0);
        tree.intersects_with_query(
            &TimeRegion::new(boxr(-1.0, -1.0, 20.0, 20.0), TimeInterval::at(tree.now())),
            &mut visitor,
        )
        .unwrap();
        assert_eq!(visitor.0, 1);
    }

    #[test]
    fn test_validator_flags_corrupt_node() {
        let mut tree = small_tree(4, 4);
        for i in 0..5u64 {
            tree.insert(b"", &point_region(i as f64 * 10.0, 0.0), i).unwrap();
        }
        assert!(tree.is_valid().unwrap());

        // Shrink the root's MBR so its children escape it.
        let root_id = tree.current_root().unwrap().id;
        let mut root = tree.read_node(root_id).unwrap();
        root.region.region = boxr(0.0, 0.0, 0.1, 0.1);
        tree.write_node(&mut root).unwrap();
        assert!(!tree.is_valid().unwrap());
    }

    #[test]
    fn test_command_hooks_fire() {
        struct Counting(Arc<AtomicU64>);
        impl NodeCommand for Counting {
            fn execute(&self, _node: &Node) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let reads = Arc::new(AtomicU64::new(0));
        let writes = Arc::new(AtomicU64::new(0));
        let deletes = Arc::new(AtomicU64::new(0));

        let mut tree = new_tree();
        tree.add_command(Box::new(Counting(reads.clone())), CommandType::ReadNode);
        tree.add_command(Box::new(Counting(writes.clone())), CommandType::WriteNode);
        tree.add_command(Box::new(Counting(deletes.clone())), CommandType::DeleteNode);

        tree.insert(b"", &point_region(0.0, 0.0), 1).unwrap();
        assert!(writes.load(Ordering::Relaxed) > 0);
        assert_eq!(reads.load(Ordering::Relaxed), 0);

        let _ = intersecting_ids(&tree, &boxr(-1.0, -1.0, 1.0, 1.0), TimeInterval::at(tree.now()));
        assert!(reads.load(Ordering::Relaxed) > 0);

        // Physical deletes fire the delete hooks.
        let mut orphan = Node::new_leaf(99, 1.0, 2);
        tree.write_node(&mut orphan).unwrap();
        tree.delete_node(&orphan).unwrap();
        assert_eq!(deletes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_header_persists_across_reopen() {
        let storage = Arc::new(MemoryStorage::new());
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 8;
        opts.index_capacity = 8;

        let header_id;
        {
            let mut tree = MvrTree::create(storage.clone(), opts).unwrap();
            for i in 0..20u64 {
                tree.insert(b"payload", &point_region(i as f64, i as f64), i)
                    .unwrap();
            }
            assert!(tree.delete(&point_region(3.0, 3.0), 3).unwrap());
            tree.flush().unwrap();
            header_id = tree.header_id();
        }

        let tree = MvrTree::open(storage, header_id).unwrap();
        assert_eq!(tree.options().leaf_capacity, 8);
        assert_eq!(tree.now(), 21.0);
        assert_eq!(tree.statistics().live_data, 19);
        let ids = intersecting_ids(
            &tree,
            &boxr(-1.0, -1.0, 30.0, 30.0),
            TimeInterval::at(tree.now()),
        );
        assert_eq!(ids.len(), 19);
        assert!(!ids.contains(&3));
        // History survives the reopen too.
        assert!(intersecting_ids(
            &tree,
            &boxr(-1.0, -1.0, 30.0, 30.0),
            TimeInterval::at(4.0)
        )
        .contains(&3));
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_open_rejects_malformed_header() {
        let storage = MemoryStorage::new();
        let id = storage.write(NEW_PAGE, b"not a header").unwrap();
        assert!(matches!(
            MvrTree::open(storage, id),
            Err(TreeError::Configuration(_))
        ));
    }

    #[test]
    fn test_disk_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.mvr");
        let mut opts = TreeOptions::new(2);
        opts.leaf_capacity = 4;
        opts.index_capacity = 4;

        let header_id;
        {
            let storage = DiskStorage::create(&path).unwrap();
            let mut tree = MvrTree::create(storage, opts).unwrap();
            for i in 0..30u64 {
                tree.insert(b"disk", &point_region((i % 10) as f64, (i / 10) as f64), i)
                    .unwrap();
            }
            assert!(tree.delete(&point_region(0.0, 0.0), 0).unwrap());
            assert!(tree.is_valid().unwrap());
            tree.flush().unwrap();
            header_id = tree.header_id();
        }

        let storage = DiskStorage::open(&path).unwrap();
        let tree = MvrTree::open(storage, header_id).unwrap();
        let ids = intersecting_ids(
            &tree,
            &boxr(-1.0, -1.0, 11.0, 11.0),
            TimeInterval::at(tree.now()),
        );
        assert_eq!(ids, (1..30).collect::<Vec<_>>());
        assert!(tree.is_valid().unwrap());
    }

    #[test]
    fn test_query_strategy_walks_to_a_leaf() {
        struct FirstChild {
            levels: Vec<u32>,
        }
        impl QueryStrategy for FirstChild {
            fn get_next_entry(&mut self, node: &Node) -> Option<PageId> {
                self.levels.push(node.level);
                match &node.kind {
                    NodeKind::Index(children) => {
                        children.iter().find(|c| c.region.is_alive()).map(|c| c.id)
                    }
                    NodeKind::Leaf(_) => None,
                }
            }
        }

        let mut tree = small_tree(4, 4);
        for i in 0..20u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }
        let mut strategy = FirstChild { levels: Vec::new() };
        tree.query_strategy(&mut strategy).unwrap();
        let height = tree.statistics().tree_height;
        assert_eq!(strategy.levels.len() as u32, height);
        assert_eq!(*strategy.levels.last().unwrap(), 0);
    }

    #[test]
    fn test_statistics_and_display() {
        let mut tree = small_tree(4, 4);
        for i in 0..12u64 {
            tree.insert(b"", &point_region(i as f64, 0.0), i).unwrap();
        }
        let stats = tree.statistics();
        assert_eq!(stats.live_data, 12);
        assert!(stats.node_versions > 0);
        assert!(stats.tree_height >= 2);
        assert!(stats.writes > 0);

        let rendered = format!("{tree}");
        assert!(rendered.contains("multi-version r*-tree"));
        assert!(rendered.contains("root   0"));
        assert!(rendered.contains("+inf"));
    }
}
