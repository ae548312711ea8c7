//! # Duplicate-Aware Table
//!
//! A `Table` is the multimap the indices are built from: `key -> {member}`
//! over one record file. The member set for a key is stored in one of two
//! representations, switched by the duplicate limit:
//!
//! ```text
//! inline:  [0x01][varint n][n x (varint len, member bytes)]   sorted
//! nested:  [0x02][u32 root][u64 count]
//! ```
//!
//! Small sets live inline in the primary tree's value cell. Once a set
//! outgrows the duplicate limit (or the inline byte budget), it is
//! promoted to a nested B+tree in the same file whose keys are the
//! members; shrinking back below the limit demotes it again. Both
//! transitions happen inside the mutation that crosses the threshold.
//!
//! The primary tree root lives in the file header; nested roots live in
//! the primary value cells and are rewritten there whenever a nested
//! insert or remove moves them.

use eyre::{bail, ensure, Result};

use super::tree::{create_root, free_tree, BTree, TreeCursor, TreeReader};
use crate::encoding::varint::{decode_varint, encode_varint, varint_len};
use crate::storage::RecordFile;

const TAG_INLINE: u8 = 0x01;
const TAG_NESTED: u8 = 0x02;

/// Inline sets beyond this many encoded bytes are promoted regardless of
/// the duplicate limit, keeping primary cells comfortably inside a page.
const INLINE_BYTES_MAX: usize = 4096;

#[derive(Debug)]
enum DupSet {
    Inline(Vec<Vec<u8>>),
    Nested { root: u32, count: u64 },
}

fn encode_inline(members: &[Vec<u8>]) -> Vec<u8> {
    let mut size = 1 + varint_len(members.len() as u64);
    for m in members {
        size += varint_len(m.len() as u64) + m.len();
    }

    let mut buf = vec![0u8; size];
    buf[0] = TAG_INLINE;
    let mut at = 1;
    at += encode_varint(members.len() as u64, &mut buf[at..]);
    for m in members {
        at += encode_varint(m.len() as u64, &mut buf[at..]);
        buf[at..at + m.len()].copy_from_slice(m);
        at += m.len();
    }
    debug_assert_eq!(at, size);
    buf
}

fn encode_nested(root: u32, count: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 13];
    buf[0] = TAG_NESTED;
    buf[1..5].copy_from_slice(&root.to_le_bytes());
    buf[5..13].copy_from_slice(&count.to_le_bytes());
    buf
}

fn decode_dupset(bytes: &[u8]) -> Result<DupSet> {
    ensure!(!bytes.is_empty(), "empty duplicate-set value");
    match bytes[0] {
        TAG_INLINE => {
            let mut at = 1;
            let (n, used) = decode_varint(&bytes[at..])?;
            at += used;
            let mut members = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (len, used) = decode_varint(&bytes[at..])?;
                at += used;
                let end = at + len as usize;
                ensure!(end <= bytes.len(), "truncated inline duplicate set");
                members.push(bytes[at..end].to_vec());
                at = end;
            }
            Ok(DupSet::Inline(members))
        }
        TAG_NESTED => {
            ensure!(bytes.len() == 13, "malformed nested duplicate-set value");
            let root = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
            let count = u64::from_le_bytes(bytes[5..13].try_into().unwrap());
            Ok(DupSet::Nested { root, count })
        }
        tag => bail!("unknown duplicate-set tag {tag:#04x}"),
    }
}

#[derive(Debug)]
pub struct Table {
    file: RecordFile,
    dup_limit: usize,
}

impl Table {
    pub fn open_or_create(path: impl AsRef<std::path::Path>, dup_limit: usize) -> Result<Self> {
        ensure!(dup_limit >= 1, "duplicate limit must be at least 1");
        let file = RecordFile::open_or_create(path)?;
        Ok(Self { file, dup_limit })
    }

    pub fn file(&self) -> &RecordFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut RecordFile {
        &mut self.file
    }

    fn primary_root(&self) -> Result<u32> {
        self.file.root_page()
    }

    fn ensure_primary_root(&mut self) -> Result<u32> {
        let root = self.file.root_page()?;
        if root != 0 {
            return Ok(root);
        }
        let root = create_root(&mut self.file)?;
        self.file.set_root_page(root)?;
        Ok(root)
    }

    fn read_set(&self, key: &[u8]) -> Result<Option<DupSet>> {
        let root = self.primary_root()?;
        if root == 0 {
            return Ok(None);
        }
        match TreeReader::new(&self.file, root).get(key)? {
            Some(bytes) => Ok(Some(decode_dupset(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes `value` under `key` in the primary tree, persisting a moved
    /// root.
    fn write_primary(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.ensure_primary_root()?;
        let mut tree = BTree::open(&mut self.file, root)?;
        tree.insert(key, value, true)?;
        let new_root = tree.root();
        if new_root != root {
            self.file.set_root_page(new_root)?;
        }
        Ok(())
    }

    fn remove_primary(&mut self, key: &[u8]) -> Result<()> {
        let root = self.primary_root()?;
        if root == 0 {
            return Ok(());
        }
        let mut tree = BTree::open(&mut self.file, root)?;
        tree.remove(key)?;
        Ok(())
    }

    fn bump_pairs(&mut self, delta: i64) -> Result<()> {
        let count = self.file.pair_count()?;
        self.file.set_pair_count(count.saturating_add_signed(delta))?;
        Ok(())
    }

    /// Adds the `(key, member)` pair. Idempotent: returns `false` when the
    /// pair is already present.
    pub fn add(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.read_set(key)? {
            None => {
                self.write_primary(key, &encode_inline(&[member.to_vec()]))?;
                self.bump_pairs(1)?;
                Ok(true)
            }
            Some(DupSet::Inline(mut members)) => {
                let pos = match members.binary_search_by(|m| m.as_slice().cmp(member)) {
                    Ok(_) => return Ok(false),
                    Err(pos) => pos,
                };
                members.insert(pos, member.to_vec());

                let encoded = encode_inline(&members);
                if members.len() > self.dup_limit || encoded.len() > INLINE_BYTES_MAX {
                    self.promote(key, &members)?;
                } else {
                    self.write_primary(key, &encoded)?;
                }
                self.bump_pairs(1)?;
                Ok(true)
            }
            Some(DupSet::Nested { root, count }) => {
                let mut tree = BTree::open(&mut self.file, root)?;
                if !tree.insert(member, &[], false)? {
                    return Ok(false);
                }
                let new_root = tree.root();
                self.write_primary(key, &encode_nested(new_root, count + 1))?;
                self.bump_pairs(1)?;
                Ok(true)
            }
        }
    }

    /// Moves an inline member set into a fresh nested tree.
    fn promote(&mut self, key: &[u8], members: &[Vec<u8>]) -> Result<()> {
        let initial = create_root(&mut self.file)?;
        let mut tree = BTree::open(&mut self.file, initial)?;
        for member in members {
            tree.insert(member, &[], false)?;
        }
        let root = tree.root();
        self.write_primary(key, &encode_nested(root, members.len() as u64))
    }

    /// Removes the `(key, member)` pair. Returns `false` when absent.
    pub fn drop_pair(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.read_set(key)? {
            None => Ok(false),
            Some(DupSet::Inline(mut members)) => {
                let pos = match members.binary_search_by(|m| m.as_slice().cmp(member)) {
                    Ok(pos) => pos,
                    Err(_) => return Ok(false),
                };
                members.remove(pos);
                if members.is_empty() {
                    self.remove_primary(key)?;
                } else {
                    self.write_primary(key, &encode_inline(&members))?;
                }
                self.bump_pairs(-1)?;
                Ok(true)
            }
            Some(DupSet::Nested { root, count }) => {
                let mut tree = BTree::open(&mut self.file, root)?;
                if !tree.remove(member)? {
                    return Ok(false);
                }
                let new_root = tree.root();
                let remaining = count - 1;

                if remaining == 0 {
                    free_tree(&mut self.file, new_root)?;
                    self.remove_primary(key)?;
                } else if remaining <= self.dup_limit as u64 {
                    self.demote(key, new_root, remaining)?;
                } else {
                    self.write_primary(key, &encode_nested(new_root, remaining))?;
                }
                self.bump_pairs(-1)?;
                Ok(true)
            }
        }
    }

    /// Folds a shrunken nested tree back into an inline set when it fits
    /// the inline budgets; keeps it nested otherwise.
    fn demote(&mut self, key: &[u8], root: u32, count: u64) -> Result<()> {
        let mut members = Vec::with_capacity(count as usize);
        {
            let mut cursor = TreeReader::new(&self.file, root).cursor();
            while let Some((member, _)) = cursor.next()? {
                members.push(member);
            }
        }

        let encoded = encode_inline(&members);
        if encoded.len() > INLINE_BYTES_MAX {
            self.write_primary(key, &encode_nested(root, count))?;
            return Ok(());
        }

        free_tree(&mut self.file, root)?;
        self.write_primary(key, &encoded)
    }

    /// Removes `key` and every member under it, returning how many pairs
    /// were dropped.
    pub fn drop_key(&mut self, key: &[u8]) -> Result<u64> {
        let dropped = match self.read_set(key)? {
            None => return Ok(0),
            Some(DupSet::Inline(members)) => members.len() as u64,
            Some(DupSet::Nested { root, count }) => {
                free_tree(&mut self.file, root)?;
                count
            }
        };
        self.remove_primary(key)?;
        self.bump_pairs(-(dropped as i64))?;
        Ok(dropped)
    }

    pub fn has(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.read_set(key)? {
            None => Ok(false),
            Some(DupSet::Inline(members)) => {
                Ok(members.binary_search_by(|m| m.as_slice().cmp(member)).is_ok())
            }
            Some(DupSet::Nested { root, .. }) => {
                TreeReader::new(&self.file, root).contains(member)
            }
        }
    }

    /// Least member under `key`, if any.
    pub fn first_member(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.read_set(key)? {
            None => Ok(None),
            Some(DupSet::Inline(members)) => Ok(members.into_iter().next()),
            Some(DupSet::Nested { root, .. }) => {
                let mut cursor = TreeReader::new(&self.file, root).cursor();
                Ok(cursor.next()?.map(|(member, _)| member))
            }
        }
    }

    /// Total pairs across all keys.
    pub fn count(&self) -> Result<u64> {
        self.file.pair_count()
    }

    /// Members under a single key.
    pub fn count_key(&self, key: &[u8]) -> Result<u64> {
        match self.read_set(key)? {
            None => Ok(0),
            Some(DupSet::Inline(members)) => Ok(members.len() as u64),
            Some(DupSet::Nested { count, .. }) => Ok(count),
        }
    }

    /// Cursor over the members of `key`, in member order.
    pub fn members(&self, key: &[u8]) -> Result<MemberCursor<'_>> {
        match self.read_set(key)? {
            None => Ok(MemberCursor::Empty),
            Some(DupSet::Inline(members)) => Ok(MemberCursor::Inline {
                members: members.into_iter(),
            }),
            Some(DupSet::Nested { root, .. }) => Ok(MemberCursor::Nested {
                cursor: TreeReader::new(&self.file, root).cursor(),
            }),
        }
    }

    /// Cursor over every `(key, member)` pair, keys ascending, members
    /// ascending within a key.
    pub fn pairs(&self) -> Result<PairCursor<'_>> {
        let root = self.primary_root()?;
        let primary = if root == 0 {
            None
        } else {
            Some(TreeReader::new(&self.file, root).cursor())
        };
        Ok(PairCursor {
            file: &self.file,
            primary,
            current_key: None,
            members: MemberCursor::Empty,
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file.commit()
    }
}

/// Cursor over the members of one key.
pub enum MemberCursor<'a> {
    Empty,
    Inline { members: std::vec::IntoIter<Vec<u8>> },
    Nested { cursor: TreeCursor<'a> },
}

impl MemberCursor<'_> {
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            MemberCursor::Empty => Ok(None),
            MemberCursor::Inline { members } => Ok(members.next()),
            MemberCursor::Nested { cursor } => Ok(cursor.next()?.map(|(member, _)| member)),
        }
    }
}

/// Cursor over every pair of a table.
pub struct PairCursor<'a> {
    file: &'a RecordFile,
    primary: Option<TreeCursor<'a>>,
    current_key: Option<Vec<u8>>,
    members: MemberCursor<'a>,
}

impl PairCursor<'_> {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(member) = self.members.next()? {
                let key = self
                    .current_key
                    .clone()
                    .expect("member cursor without current key");
                return Ok(Some((key, member)));
            }

            let Some(primary) = self.primary.as_mut() else {
                return Ok(None);
            };
            match primary.next()? {
                Some((key, value)) => {
                    self.members = match decode_dupset(&value)? {
                        DupSet::Inline(members) => MemberCursor::Inline {
                            members: members.into_iter(),
                        },
                        DupSet::Nested { root, .. } => MemberCursor::Nested {
                            cursor: TreeReader::new(self.file, root).cursor(),
                        },
                    };
                    self.current_key = Some(key);
                }
                None => return Ok(None),
            }
        }
    }
}
