//! A multi-version R*-tree: a spatial index that answers containment,
//! intersection, point-location, self-join and nearest-neighbor queries not
//! just over the current dataset but over any historical state, identified
//! by a logical timestamp.
//!
//! Every insert and delete happens at a fresh logical instant. Instead of
//! overwriting nodes, the tree closes node versions and opens successors, so
//! a query carrying a temporal predicate resolves through the root that was
//! current at that time and sees exactly the entries that were live then.
//! Deletion closes an entry's validity interval rather than erasing it.
//!
//! Nodes are persisted through a pluggable [`StorageManager`]; an in-memory
//! and a paged on-disk implementation ship with the crate.
//!
//! ```
//! use mvrtree::{
//!     MemoryStorage, MvrTree, ObjectId, Region, TimeInterval, TimeRegion, TreeOptions, Visitor,
//! };
//!
//! # fn main() -> mvrtree::TreeResult<()> {
//! let mut tree = MvrTree::create(MemoryStorage::new(), TreeOptions::new(2))?;
//! tree.insert(b"poi", &Region::new(vec![1.0, 1.0], vec![2.0, 2.0]), 42)?;
//!
//! struct Ids(Vec<ObjectId>);
//! impl Visitor for Ids {
//!     fn visit_data(&mut self, id: ObjectId, _region: &TimeRegion, _data: &[u8]) -> bool {
//!         self.0.push(id);
//!         true
//!     }
//! }
//!
//! let mut found = Ids(Vec::new());
//! tree.intersects_with_query(
//!     &TimeRegion::new(
//!         Region::new(vec![0.0, 0.0], vec![3.0, 3.0]),
//!         TimeInterval::at(tree.now()),
//!     ),
//!     &mut found,
//! )?;
//! assert_eq!(found.0, vec![42]);
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod pool;
pub mod region;
pub mod split;
pub mod storage;
pub mod tree;
pub mod types;

pub use node::{ChildEntry, LeafEntry, Node, NodeKind};
pub use pool::Pool;
pub use region::{Point, Region, TimeInterval, TimeRegion};
pub use storage::{DiskStorage, MemoryStorage, StorageManager, DEFAULT_PAGE_SIZE};
pub use tree::MvrTree;
pub use types::{
    CommandType, EuclideanComparator, Header, NearestNeighborComparator, NodeCommand, ObjectId,
    PageId, QueryStrategy, RootEntry, Statistics, TreeError, TreeOptions, TreeResult, TreeVariant,
    Visitor, NEW_PAGE,
};
