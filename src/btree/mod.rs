//! # B+Tree Layer
//!
//! The ordered-map machinery between the record manager and the index
//! layer:
//!
//! - [`leaf`] / [`interior`]: slotted node layouts with 4-byte key-prefix
//!   hints, one node per page.
//! - [`tree`]: insert/search/delete with split propagation, plus
//!   re-descending bidirectional cursors.
//! - [`table`]: the duplicate-aware multimap used by every index, with
//!   the inline-array / nested-tree threshold representation.
//!
//! Keys are plain byte strings compared lexicographically; callers obtain
//! logical ordering through the order-preserving encodings in
//! [`crate::encoding`].

mod interior;
mod leaf;
mod table;
mod tree;

pub use interior::{InteriorNode, InteriorNodeMut, INTERIOR_CONTENT_START, INTERIOR_SLOT_SIZE};
pub use leaf::{
    extract_prefix, LeafNode, LeafNodeMut, SearchResult, Slot, LEAF_CONTENT_START, MAX_CELL_SIZE,
    SLOT_SIZE,
};
pub use table::{MemberCursor, PairCursor, Table};
pub use tree::{create_root, free_tree, BTree, TreeCursor, TreeReader};
