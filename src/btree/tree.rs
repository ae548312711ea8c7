//! # B+Tree
//!
//! Ordered byte-key map, one node per page, over a [`RecordFile`]. All
//! pairs live in leaf nodes; interior nodes carry separators and child
//! pointers; leaves are linked left to right for range walks.
//!
//! ## Write path
//!
//! ```text
//! 1. Descend from the root, stacking interior pages.
//! 2. Insert into the leaf; if it cannot host the cell, split it.
//! 3. Splits promote a separator into the parent; interior inserts are
//!    done as a logical read-modify-rebuild of the node, splitting
//!    further up as needed. A root split allocates a new root.
//! ```
//!
//! Split points are chosen by accumulated byte size rather than cell
//! count, so pages with wildly uneven cell sizes still split into halves
//! that fit.
//!
//! Deletion removes the cell and leaves the page in place; underflowed
//! pages are not merged. The workload above this tree (directory entries
//! and index tuples) deletes far less than it inserts, and freed cell
//! space is reclaimed by the in-page compactor.
//!
//! ## Read path
//!
//! [`TreeReader`] performs lookups and hands out [`TreeCursor`]s. A cursor
//! holds the last key it returned and re-descends for each step, so it
//! stays valid across leaf boundaries without back-links. Cursors borrow
//! the file immutably: the borrow checker rules out mutation while any
//! cursor is live.

use eyre::{bail, ensure, Result};

use super::interior::{InteriorNode, InteriorNodeMut, INTERIOR_CONTENT_START, INTERIOR_SLOT_SIZE};
use super::leaf::{LeafNode, LeafNodeMut, SearchResult, MAX_CELL_SIZE};
use crate::encoding::varint::varint_len;
use crate::storage::{PageHeader, PageType, RecordFile, PAGE_SIZE};

/// Allocates and initializes an empty leaf to serve as a tree root.
pub fn create_root(file: &mut RecordFile) -> Result<u32> {
    let page_no = file.allocate()?;
    LeafNodeMut::init(file.page_mut(page_no)?)?;
    Ok(page_no)
}

/// Returns every page of the tree rooted at `root` to the free chain.
pub fn free_tree(file: &mut RecordFile, root: u32) -> Result<()> {
    let mut stack = vec![root];
    let mut pages = Vec::new();

    while let Some(page_no) = stack.pop() {
        pages.push(page_no);
        let data = file.page(page_no)?;
        let header = PageHeader::from_bytes(data)?;
        if header.page_type() == PageType::BTreeInterior {
            stack.extend(InteriorNode::from_page(data)?.child_pages()?);
        }
    }

    for page_no in pages {
        file.free(page_no)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InsertResult {
    Done,
    Split { separator: Vec<u8>, new_page: u32 },
}

/// Mutable handle on a tree. Holds the root page number, which may move
/// when the root splits; callers persist `root()` after mutations.
#[derive(Debug)]
pub struct BTree<'a> {
    file: &'a mut RecordFile,
    root: u32,
}

impl<'a> BTree<'a> {
    pub fn open(file: &'a mut RecordFile, root: u32) -> Result<Self> {
        ensure!(root != 0, "tree root page cannot be 0");
        ensure!(
            root < file.page_count(),
            "tree root page {} out of bounds (page_count={})",
            root,
            file.page_count()
        );
        Ok(Self { file, root })
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn reader(&self) -> TreeReader<'_> {
        TreeReader {
            file: self.file,
            root: self.root,
        }
    }

    /// Inserts `key` -> `value`. Returns `true` when a new pair was
    /// created. An existing key is overwritten when `replace` is set and
    /// left untouched otherwise (returning `false` either way).
    pub fn insert(&mut self, key: &[u8], value: &[u8], replace: bool) -> Result<bool> {
        let cell_size = key.len() + varint_len(value.len() as u64) + value.len();
        ensure!(
            cell_size <= MAX_CELL_SIZE,
            "cell of {} bytes exceeds page capacity {}",
            cell_size,
            MAX_CELL_SIZE
        );

        let (leaf_page, path) = self.descend_to_leaf(key)?;

        let mut inserted = true;
        {
            let data = self.file.page_mut(leaf_page)?;
            let mut leaf = LeafNodeMut::from_page(data)?;
            match leaf.find_key(key) {
                SearchResult::Found(idx) => {
                    if !replace {
                        return Ok(false);
                    }
                    leaf.delete_cell(idx)?;
                    inserted = false;
                }
                SearchResult::NotFound(_) => {}
            }
            if leaf.can_host(key, value) {
                leaf.insert_cell(key, value)?;
                return Ok(inserted);
            }
        }

        let result = self.split_leaf(leaf_page, key, value)?;
        if let InsertResult::Split {
            separator,
            new_page,
        } = result
        {
            self.propagate_split(path, separator, leaf_page, new_page)?;
        }
        Ok(inserted)
    }

    /// Removes `key`, reporting whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let (leaf_page, _) = self.descend_to_leaf(key)?;
        let data = self.file.page_mut(leaf_page)?;
        let mut leaf = LeafNodeMut::from_page(data)?;
        match leaf.find_key(key) {
            SearchResult::Found(idx) => {
                leaf.delete_cell(idx)?;
                Ok(true)
            }
            SearchResult::NotFound(_) => Ok(false),
        }
    }

    fn descend_to_leaf(&self, key: &[u8]) -> Result<(u32, Vec<u32>)> {
        let mut path = Vec::new();
        let mut current = self.root;

        loop {
            let data = self.file.page(current)?;
            let header = PageHeader::from_bytes(data)?;
            match header.page_type() {
                PageType::BTreeLeaf => return Ok((current, path)),
                PageType::BTreeInterior => {
                    let node = InteriorNode::from_page(data)?;
                    let (child, _) = node.find_child(key)?;
                    path.push(current);
                    current = child;
                }
                other => bail!("unexpected page type {other:?} at page {current} during descent"),
            }
        }
    }

    fn split_leaf(&mut self, page_no: u32, key: &[u8], value: &[u8]) -> Result<InsertResult> {
        let new_page_no = self.file.allocate()?;

        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut values: Vec<Vec<u8>> = Vec::new();
        let next_leaf;
        {
            let data = self.file.page(page_no)?;
            let leaf = LeafNode::from_page(data)?;
            for i in 0..leaf.cell_count() {
                keys.push(leaf.key_at(i)?.to_vec());
                values.push(leaf.value_at(i)?.to_vec());
            }
            next_leaf = leaf.next_leaf();
        }

        let pos = keys.partition_point(|k| k.as_slice() < key);
        keys.insert(pos, key.to_vec());
        values.insert(pos, value.to_vec());

        let mid = split_point(&keys, &values);
        let separator = keys[mid].clone();

        {
            let data = self.file.page_mut(page_no)?;
            let mut left = LeafNodeMut::init(data)?;
            for i in 0..mid {
                left.insert_cell(&keys[i], &values[i])?;
            }
            left.set_next_leaf(new_page_no);
        }
        {
            let data = self.file.page_mut(new_page_no)?;
            let mut right = LeafNodeMut::init(data)?;
            for i in mid..keys.len() {
                right.insert_cell(&keys[i], &values[i])?;
            }
            right.set_next_leaf(next_leaf);
        }

        Ok(InsertResult::Split {
            separator,
            new_page: new_page_no,
        })
    }

    fn propagate_split(
        &mut self,
        mut path: Vec<u32>,
        separator: Vec<u8>,
        left_child: u32,
        right_child: u32,
    ) -> Result<()> {
        let mut separator = separator;
        let mut left = left_child;
        let mut right = right_child;

        while let Some(parent) = path.pop() {
            match self.insert_into_interior(parent, &separator, right)? {
                InsertResult::Done => return Ok(()),
                InsertResult::Split {
                    separator: promoted,
                    new_page,
                } => {
                    separator = promoted;
                    left = parent;
                    right = new_page;
                }
            }
        }

        // The split reached the top: grow the tree by one level.
        let new_root = self.file.allocate()?;
        let data = self.file.page_mut(new_root)?;
        let mut root = InteriorNodeMut::init(data, right)?;
        root.insert_separator(&separator, left)?;
        self.root = new_root;
        Ok(())
    }

    /// Inserts a separator produced by a child split. The node is read
    /// into its logical form (separators + children), modified, and
    /// rebuilt; when the result no longer fits it is rebuilt as two nodes
    /// and the middle separator is promoted.
    fn insert_into_interior(
        &mut self,
        page_no: u32,
        separator: &[u8],
        right_child: u32,
    ) -> Result<InsertResult> {
        let mut seps: Vec<Vec<u8>>;
        let mut children: Vec<u32>;
        {
            let data = self.file.page(page_no)?;
            let node = InteriorNode::from_page(data)?;
            seps = Vec::with_capacity(node.cell_count() + 1);
            for i in 0..node.cell_count() {
                seps.push(node.key_at(i)?.to_vec());
            }
            children = node.child_pages()?;
        }

        // The split child keeps the low half, so it stays in place; the
        // new page slots in immediately to its right.
        let pos = seps.partition_point(|s| s.as_slice() < separator);
        seps.insert(pos, separator.to_vec());
        children.insert(pos + 1, right_child);

        let total: usize = seps.iter().map(|s| s.len() + INTERIOR_SLOT_SIZE).sum();
        if INTERIOR_CONTENT_START + total <= PAGE_SIZE {
            write_interior(self.file, page_no, &seps, &children)?;
            return Ok(InsertResult::Done);
        }

        let mid = seps.len() / 2;
        let promoted = seps[mid].clone();
        let new_page_no = self.file.allocate()?;

        write_interior(self.file, page_no, &seps[..mid], &children[..=mid])?;
        write_interior(self.file, new_page_no, &seps[mid + 1..], &children[mid + 1..])?;

        Ok(InsertResult::Split {
            separator: promoted,
            new_page: new_page_no,
        })
    }
}

/// Rebuilds `page_no` as an interior node with the given separators and
/// children (`children.len() == seps.len() + 1`).
fn write_interior(
    file: &mut RecordFile,
    page_no: u32,
    seps: &[Vec<u8>],
    children: &[u32],
) -> Result<()> {
    ensure!(
        children.len() == seps.len() + 1,
        "interior rebuild mismatch: {} separators, {} children",
        seps.len(),
        children.len()
    );
    let data = file.page_mut(page_no)?;
    let mut node = InteriorNodeMut::init(data, children[seps.len()])?;
    for (i, sep) in seps.iter().enumerate() {
        node.insert_separator(sep, children[i])?;
    }
    Ok(())
}

/// Picks a split index balancing the byte size of the two halves.
fn split_point(keys: &[Vec<u8>], values: &[Vec<u8>]) -> usize {
    let sizes: Vec<usize> = keys
        .iter()
        .zip(values)
        .map(|(k, v)| k.len() + varint_len(v.len() as u64) + v.len())
        .collect();
    let total: usize = sizes.iter().sum();

    let mut acc = 0usize;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, keys.len() - 1);
        }
    }
    keys.len() / 2
}

/// Read-only view of a tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeReader<'a> {
    file: &'a RecordFile,
    root: u32,
}

impl<'a> TreeReader<'a> {
    pub fn new(file: &'a RecordFile, root: u32) -> Self {
        Self { file, root }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut current = self.root;
        loop {
            let data = self.file.page(current)?;
            let header = PageHeader::from_bytes(data)?;
            match header.page_type() {
                PageType::BTreeLeaf => {
                    let leaf = LeafNode::from_page(data)?;
                    return match leaf.find_key(key) {
                        SearchResult::Found(idx) => Ok(Some(leaf.value_at(idx)?.to_vec())),
                        SearchResult::NotFound(_) => Ok(None),
                    };
                }
                PageType::BTreeInterior => {
                    let node = InteriorNode::from_page(data)?;
                    current = node.find_child(key)?.0;
                }
                other => bail!("unexpected page type {other:?} at page {current} during search"),
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Cursor positioned before the smallest key.
    pub fn cursor(&self) -> TreeCursor<'a> {
        TreeCursor {
            file: self.file,
            root: self.root,
            origin: Vec::new(),
            include_origin: true,
            current: None,
        }
    }

    /// Cursor positioned just before `key` (the next step forward yields
    /// the first key at or above it).
    pub fn cursor_at(&self, key: &[u8]) -> TreeCursor<'a> {
        TreeCursor {
            file: self.file,
            root: self.root,
            origin: key.to_vec(),
            include_origin: true,
            current: None,
        }
    }

    /// Smallest pair at or above `bound` (strictly above when `inclusive`
    /// is false), found by one descent plus a walk along the leaf chain.
    fn min_above(&self, bound: &[u8], inclusive: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut current = self.root;
        loop {
            let data = self.file.page(current)?;
            let header = PageHeader::from_bytes(data)?;
            match header.page_type() {
                PageType::BTreeLeaf => break,
                PageType::BTreeInterior => {
                    current = InteriorNode::from_page(data)?.find_child(bound)?.0;
                }
                other => bail!("unexpected page type {other:?} at page {current} during seek"),
            }
        }

        loop {
            let data = self.file.page(current)?;
            let leaf = LeafNode::from_page(data)?;
            let start = match leaf.find_key(bound) {
                SearchResult::Found(idx) => {
                    if inclusive {
                        idx
                    } else {
                        idx + 1
                    }
                }
                SearchResult::NotFound(idx) => idx,
            };
            if start < leaf.cell_count() {
                return Ok(Some((
                    leaf.key_at(start)?.to_vec(),
                    leaf.value_at(start)?.to_vec(),
                )));
            }
            let next = leaf.next_leaf();
            if next == 0 {
                return Ok(None);
            }
            current = next;
        }
    }

    /// Largest pair strictly below `bound`. Leaves carry no back-links,
    /// so this recurses down the candidate children right to left.
    fn max_below(&self, page_no: u32, bound: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let data = self.file.page(page_no)?;
        let header = PageHeader::from_bytes(data)?;
        match header.page_type() {
            PageType::BTreeLeaf => {
                let leaf = LeafNode::from_page(data)?;
                for i in (0..leaf.cell_count()).rev() {
                    let k = leaf.key_at(i)?;
                    if k < bound {
                        return Ok(Some((k.to_vec(), leaf.value_at(i)?.to_vec())));
                    }
                }
                Ok(None)
            }
            PageType::BTreeInterior => {
                let node = InteriorNode::from_page(data)?;
                let children = node.child_pages()?;
                let (_, idx) = node.find_child(bound)?;
                let start = idx.unwrap_or(children.len() - 1);
                for i in (0..=start).rev() {
                    if let Some(found) = self.max_below(children[i], bound)? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
            other => bail!("unexpected page type {other:?} at page {page_no} during seek"),
        }
    }
}

/// Bidirectional cursor. Each step re-descends from the root using the
/// last returned key as the bound, so it survives any sequence of next
/// and previous calls without positional state in the pages.
#[derive(Debug)]
pub struct TreeCursor<'a> {
    file: &'a RecordFile,
    root: u32,
    origin: Vec<u8>,
    include_origin: bool,
    current: Option<Vec<u8>>,
}

impl TreeCursor<'_> {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reader = TreeReader {
            file: self.file,
            root: self.root,
        };
        let (bound, inclusive) = match &self.current {
            Some(key) => (key.as_slice(), false),
            None => (self.origin.as_slice(), self.include_origin),
        };
        match reader.min_above(bound, inclusive)? {
            Some((key, value)) => {
                self.current = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }

    pub fn previous(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reader = TreeReader {
            file: self.file,
            root: self.root,
        };
        let bound = match &self.current {
            Some(key) => key.as_slice(),
            None => self.origin.as_slice(),
        };
        match reader.max_below(self.root, bound)? {
            Some((key, value)) => {
                self.current = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_tree() -> (tempfile::TempDir, RecordFile, u32) {
        let dir = tempdir().unwrap();
        let mut file = RecordFile::create(dir.path().join("t.db")).unwrap();
        let root = create_root(&mut file).unwrap();
        (dir, file, root)
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let (_dir, file, root) = make_tree();
        assert_eq!(TreeReader::new(&file, root).get(b"k").unwrap(), None);
    }

    #[test]
    fn insert_and_get_single_pair() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();
        assert!(tree.insert(b"cn=a", b"1", false).unwrap());
        assert_eq!(tree.reader().get(b"cn=a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.reader().get(b"cn=b").unwrap(), None);
    }

    #[test]
    fn insert_without_replace_preserves_value() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();
        tree.insert(b"k", b"old", false).unwrap();
        assert!(!tree.insert(b"k", b"new", false).unwrap());
        assert_eq!(tree.reader().get(b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn insert_with_replace_overwrites() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();
        tree.insert(b"k", b"old", false).unwrap();
        assert!(!tree.insert(b"k", b"replacement", true).unwrap());
        assert_eq!(
            tree.reader().get(b"k").unwrap(),
            Some(b"replacement".to_vec())
        );
    }

    #[test]
    fn many_inserts_split_and_stay_findable() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();

        for i in 0..2000 {
            let key = format!("key{i:06}");
            let value = format!("value{i:06}");
            tree.insert(key.as_bytes(), value.as_bytes(), false).unwrap();
        }
        assert!(tree.root() != root, "root must have split");

        let reader = tree.reader();
        for i in 0..2000 {
            let key = format!("key{i:06}");
            let expected = format!("value{i:06}");
            assert_eq!(
                reader.get(key.as_bytes()).unwrap(),
                Some(expected.into_bytes()),
                "missing {key}"
            );
        }
    }

    #[test]
    fn descending_inserts_stay_findable() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();

        for i in (0..1500).rev() {
            let key = format!("key{i:06}");
            tree.insert(key.as_bytes(), b"v", false).unwrap();
        }
        let reader = tree.reader();
        for i in 0..1500 {
            let key = format!("key{i:06}");
            assert!(reader.get(key.as_bytes()).unwrap().is_some(), "missing {key}");
        }
    }

    #[test]
    fn interleaved_inserts_split_interior_correctly() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();

        // Insert in an order that forces mid-node splits, not just
        // rightmost appends.
        let value = vec![0xCD; 120];
        for i in 0..4000 {
            let shuffled = (i * 2654435761u64) % 4000;
            let key = format!("key{shuffled:06}");
            tree.insert(key.as_bytes(), &value, false).unwrap();
        }
        let reader = tree.reader();
        for i in 0..4000 {
            let key = format!("key{i:06}");
            assert!(reader.get(key.as_bytes()).unwrap().is_some(), "missing {key}");
        }
    }

    #[test]
    fn remove_deletes_only_the_target() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();

        tree.insert(b"a", b"1", false).unwrap();
        tree.insert(b"b", b"2", false).unwrap();
        tree.insert(b"c", b"3", false).unwrap();

        assert!(tree.remove(b"b").unwrap());
        assert!(!tree.remove(b"b").unwrap());

        let reader = tree.reader();
        assert_eq!(reader.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reader.get(b"b").unwrap(), None);
        assert_eq!(reader.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn cursor_walks_in_key_order_across_leaves() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();

        for i in 0..1200 {
            let key = format!("key{i:06}");
            tree.insert(key.as_bytes(), b"v", false).unwrap();
        }

        let new_root = tree.root();
        let reader = TreeReader::new(&file, new_root);
        let mut cursor = reader.cursor();
        let mut seen = 0;
        let mut last: Option<Vec<u8>> = None;
        while let Some((key, _)) = cursor.next().unwrap() {
            if let Some(prev) = &last {
                assert!(prev < &key, "cursor out of order");
            }
            last = Some(key);
            seen += 1;
        }
        assert_eq!(seen, 1200);
    }

    #[test]
    fn cursor_seeks_and_steps_backward() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();
        for key in [b"b".as_slice(), b"d", b"f", b"h"] {
            tree.insert(key, b"v", false).unwrap();
        }

        let reader = TreeReader::new(&file, root);
        let mut cursor = reader.cursor_at(b"e");
        assert_eq!(cursor.next().unwrap().unwrap().0, b"f".to_vec());
        assert_eq!(cursor.previous().unwrap().unwrap().0, b"d".to_vec());
        assert_eq!(cursor.previous().unwrap().unwrap().0, b"b".to_vec());
        assert!(cursor.previous().unwrap().is_none());
        assert_eq!(cursor.next().unwrap().unwrap().0, b"d".to_vec());
    }

    #[test]
    fn free_tree_returns_all_pages() {
        let dir = tempdir().unwrap();
        let mut file = RecordFile::create(dir.path().join("t.db")).unwrap();
        let root = create_root(&mut file).unwrap();
        {
            let mut tree = BTree::open(&mut file, root).unwrap();
            for i in 0..1200 {
                let key = format!("key{i:06}");
                tree.insert(key.as_bytes(), b"some value bytes", false)
                    .unwrap();
            }
            let final_root = tree.root();
            free_tree(&mut file, final_root).unwrap();
        }

        let allocated = file.page_count() - 1;
        assert_eq!(file.free_page_count().unwrap(), allocated);
    }

    #[test]
    fn large_values_round_trip() {
        let (_dir, mut file, root) = make_tree();
        let mut tree = BTree::open(&mut file, root).unwrap();
        let big = vec![0xEE; 8000];
        tree.insert(b"big", &big, false).unwrap();
        tree.insert(b"big2", &big, false).unwrap();
        tree.insert(b"big3", &big, false).unwrap();
        assert_eq!(tree.reader().get(b"big2").unwrap(), Some(big));
    }
}
