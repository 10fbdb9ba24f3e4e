//! The B+ tree driver.
//!
//! The tree stores only downward links. Every mutation descends from the
//! root recording the visited nodes and the child index taken out of each
//! parent in two parallel bounded stacks; structural changes (splits,
//! borrows, merges, root transitions) are then propagated back up the
//! recorded path. There are no parent pointers on disk.
//!
//! Every node read and write goes through the buffer pool, and every
//! mutation is written through to the backing file before the operation
//! returns, so between operations the file is the durable source of truth
//! and cached nodes are byte-identical to their blocks.
//!
//! Rebalancing tie-breaks are deterministic: borrow from the left sibling
//! first, merge into the left sibling first, allocate from the free-list
//! head and otherwise at the file tail. For a given operation sequence the
//! tree shape, the block offsets and the free-list order are fully
//! reproducible.

use crate::cache::{LruCache, NodeRef, MIN_CACHE_BLOCKS};
use crate::errors::Result;
use crate::file::{BlockFile, FileHeader, HEADER_SIZE};
use crate::node::{Node, NodeKind, Offset, MAX_DEPTH, NONE};
use bincode::{Decode, Encode};
use std::path::Path;
use std::sync::MutexGuard;
use tracing::{debug, info, trace};

type PathStack<K, V, const N: usize> = heapless::Vec<NodeRef<K, V, N>, MAX_DEPTH>;
type IndexStack = heapless::Vec<usize, MAX_DEPTH>;

/// Locks a node handle. Handles are only ever contended by the operation
/// that holds them, so a failed lock is a caller bug, not a race.
fn lock<K, V, const N: usize>(node: &NodeRef<K, V, N>) -> Result<MutexGuard<'_, Node<K, V, N>>> {
    node.try_lock()
        .map_err(|_| err!(Storage, "Node handle is already locked"))
}

/// An on-disk B+ tree mapping fixed-size keys to fixed-size values.
///
/// `N` is the in-node slot count including the spare insert slot; the tree
/// degree is `D = N - 1`. Leaves hold up to `D` entries, internal nodes up
/// to `D - 1` separators.
///
/// All operations take `&mut self`: tree operations are strictly
/// single-writer and the borrow checker serializes callers. Duplicate keys
/// are rejected on insert. An I/O error mid-mutation leaves the file in an
/// indeterminate (but memory-safe) state; drop the instance and reopen.
pub struct BPlusTree<K, V, const N: usize>
where
    K: Copy + Ord + Default + Encode + Decode<()>,
    V: Copy + Default + Encode + Decode<()>,
{
    file: BlockFile,
    cache: LruCache<K, V, N>,
    file_size: u64,
    freelist_head: Offset,
    root: Offset,
    sequential_head: Offset,
    closed: bool,
}

impl<K, V, const N: usize> BPlusTree<K, V, N>
where
    K: Copy + Ord + Default + Encode + Decode<()>,
    V: Copy + Default + Encode + Decode<()>,
{
    const DEGREE: usize = Node::<K, V, N>::DEGREE;
    const LEAF_MAX: usize = Node::<K, V, N>::LEAF_MAX;
    const LEAF_MIN: usize = Node::<K, V, N>::LEAF_MIN;
    const INTERNAL_MAX: usize = Node::<K, V, N>::INTERNAL_MAX;
    const INTERNAL_MIN: usize = Node::<K, V, N>::INTERNAL_MIN;
    const BLOCK_SIZE: u64 = Node::<K, V, N>::BLOCK_SIZE as u64;

    /// Creates a fresh tree file. Fails if the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<()> {
        BlockFile::create(path)
    }

    /// Opens an existing tree file. The header must match the actual file
    /// shape or the open fails with a format error.
    ///
    /// `cache_capacity` is the number of buffer pool frames; it is clamped
    /// up to [`MIN_CACHE_BLOCKS`] so one mutation's working set always fits.
    pub fn open<P: AsRef<Path>>(path: P, cache_capacity: usize) -> Result<Self> {
        let file = BlockFile::open(path)?;
        let header = file.read_header()?;

        let actual = file.len()?;
        if header.file_size != actual {
            return Err(err!(
                Format,
                "Header records {} bytes but the file has {}",
                header.file_size,
                actual
            ));
        }
        if header.file_size < HEADER_SIZE as u64
            || (header.file_size - HEADER_SIZE as u64) % Self::BLOCK_SIZE != 0
        {
            return Err(err!(
                Format,
                "File length {} does not hold a {} byte header plus whole {} byte blocks",
                header.file_size,
                HEADER_SIZE,
                Self::BLOCK_SIZE
            ));
        }

        let capacity = cache_capacity.max(MIN_CACHE_BLOCKS);
        info!(
            path = %file.path().display(),
            blocks = (header.file_size - HEADER_SIZE as u64) / Self::BLOCK_SIZE,
            capacity,
            "Opened B+ tree"
        );
        Ok(BPlusTree {
            file,
            cache: LruCache::new(capacity),
            file_size: header.file_size,
            freelist_head: header.freelist_head,
            root: header.root,
            sequential_head: header.sequential_head,
            closed: false,
        })
    }

    /// Flushes the buffer pool, rewrites the header, and releases the file,
    /// in that order.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cache.flush_all(&mut self.file)?;
        self.file.write_header(&FileHeader {
            file_size: self.file_size,
            freelist_head: self.freelist_head,
            root: self.root,
            sequential_head: self.sequential_head,
        })?;
        self.file.flush()?;
        info!(path = %self.file.path().display(), "Closed B+ tree");
        Ok(())
    }

    /// Offset of the root node, [`NONE`] when the tree is empty.
    pub fn root_offset(&self) -> Offset {
        self.root
    }

    /// Looks up `key`, returning its value when present.
    pub fn search(&mut self, key: &K) -> Result<Option<V>> {
        if self.root == NONE {
            return Ok(None);
        }
        let (path, _) = self.descend(key)?;
        let leaf = lock(&path[path.len() - 1])?;
        let at = leaf.lower_bound(key);
        if at < leaf.size && leaf.keys[at] == *key {
            Ok(Some(leaf.vals[at]))
        } else {
            Ok(None)
        }
    }

    /// Inserts `(key, value)`. A key that is already present is rejected
    /// with [`Error::Duplicate`](crate::Error::Duplicate).
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        if self.root == NONE {
            let root_ref = self.allocate(NodeKind::Leaf)?;
            let root_offset = {
                let mut root = lock(&root_ref)?;
                root.leaf_insert(key, value);
                self.save(&root)?;
                root.offset
            };
            self.root = root_offset;
            debug!(root = root_offset, "Planted root leaf");
            return Ok(());
        }

        let (path, _) = self.descend(&key)?;
        let leaf_depth = path.len() - 1;

        {
            let mut leaf = lock(&path[leaf_depth])?;
            let at = leaf.lower_bound(&key);
            if at < leaf.size && leaf.keys[at] == key {
                return Err(err!(Duplicate, "Key already present in leaf {}", leaf.offset));
            }
            if leaf.size < Self::LEAF_MAX {
                leaf.leaf_insert(key, value);
                self.save(&leaf)?;
                return Ok(());
            }
        }

        // The leaf is full: insert into the spare slot and split off the
        // rightmost LEAF_MIN entries into a fresh right sibling.
        let new_ref = self.allocate(NodeKind::Leaf)?;
        let (mut carry_key, mut carry_child) = {
            let mut cur = lock(&path[leaf_depth])?;
            let mut new = lock(&new_ref)?;
            cur.leaf_insert(key, value);

            let keep = Self::DEGREE + 1 - Self::LEAF_MIN;
            new.keys[..Self::LEAF_MIN].copy_from_slice(&cur.keys[keep..Self::DEGREE + 1]);
            new.vals[..Self::LEAF_MIN].copy_from_slice(&cur.vals[keep..Self::DEGREE + 1]);
            new.size = Self::LEAF_MIN;
            cur.size = keep;

            new.prev = cur.offset;
            new.next = cur.next;
            if cur.next != NONE {
                let next_ref = self.load(cur.next)?;
                let mut next = lock(&next_ref)?;
                next.prev = new.offset;
                self.save(&next)?;
            }
            cur.next = new.offset;
            self.save(&new)?;
            self.save(&cur)?;
            debug!(left = cur.offset, right = new.offset, "Split leaf");
            (new.keys[0], new.offset)
        };

        // Carry the promoted separator up the recorded path.
        let mut level = leaf_depth;
        while level > 0 {
            level -= 1;
            let has_room = { lock(&path[level])?.size < Self::INTERNAL_MAX };
            if has_room {
                let mut node = lock(&path[level])?;
                node.separator_insert(carry_key, carry_child);
                self.save(&node)?;
                return Ok(());
            }

            let split_ref = self.allocate(NodeKind::Internal)?;
            let mut node = lock(&path[level])?;
            let mut new = lock(&split_ref)?;
            node.separator_insert(carry_key, carry_child);

            // The key between the two halves moves up and lands in neither.
            node.size = Self::DEGREE - Self::INTERNAL_MIN - 1;
            new.size = Self::INTERNAL_MIN;
            let from = Self::DEGREE - Self::INTERNAL_MIN;
            new.keys[..Self::INTERNAL_MIN].copy_from_slice(&node.keys[from..Self::DEGREE]);
            new.children[..Self::INTERNAL_MIN + 1]
                .copy_from_slice(&node.children[from..Self::DEGREE + 1]);
            self.save(&node)?;
            self.save(&new)?;
            debug!(left = node.offset, right = new.offset, "Split internal node");
            carry_key = node.keys[node.size];
            carry_child = new.offset;
        }

        // The promotion escaped the old root.
        let root_ref = self.allocate(NodeKind::Internal)?;
        let root_offset = {
            let mut root = lock(&root_ref)?;
            root.size = 1;
            root.keys[0] = carry_key;
            root.children[0] = self.root;
            root.children[1] = carry_child;
            self.save(&root)?;
            root.offset
        };
        self.root = root_offset;
        debug!(root = root_offset, "Grew a new root");
        Ok(())
    }

    /// Removes `key`. Returns whether a matching key was present.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        if self.root == NONE {
            return Ok(false);
        }
        let (path, child_index) = self.descend(key)?;
        let leaf_depth = path.len() - 1;

        {
            let mut leaf = lock(&path[leaf_depth])?;
            if !leaf.leaf_remove(key) {
                return Ok(false);
            }
            self.save(&leaf)?;
            if leaf.size >= Self::LEAF_MIN {
                return Ok(true);
            }
        }

        if leaf_depth == 0 {
            // A root leaf may run below the minimum; it is only released
            // once it holds nothing at all.
            let is_empty = { lock(&path[0])?.size == 0 };
            if is_empty {
                self.deallocate(&path[0])?;
                self.root = NONE;
                debug!("Removed last entry; tree is empty");
            }
            return Ok(true);
        }

        if self.borrow_leaf(&path, &child_index, leaf_depth)? {
            return Ok(true);
        }
        let (mut carry_key, mut carry_child) =
            self.merge_leaf(&path, &child_index, leaf_depth)?;

        // Walk the ancestors below the root; the root-level erase always
        // runs afterwards, and collapse is decided only there.
        let mut level = leaf_depth - 1;
        while level > 0 {
            {
                let mut node = lock(&path[level])?;
                node.remove_child(&carry_key, carry_child);
                self.save(&node)?;
                if node.size >= Self::INTERNAL_MIN {
                    return Ok(true);
                }
            }
            if self.borrow_internal(&path, &child_index, level)? {
                return Ok(true);
            }
            let merged = self.merge_internal(&path, &child_index, level)?;
            carry_key = merged.0;
            carry_child = merged.1;
            level -= 1;
        }

        let sole_child = {
            let mut root = lock(&path[0])?;
            root.remove_child(&carry_key, carry_child);
            self.save(&root)?;
            if root.size == 0 {
                Some(root.children[0])
            } else {
                None
            }
        };
        if let Some(child) = sole_child {
            self.deallocate(&path[0])?;
            self.root = child;
            debug!(root = child, "Collapsed root into its only child");
        }
        Ok(true)
    }

    /// Returns all entries with `low <= key < high` in ascending key order.
    pub fn range(&mut self, low: K, high: K) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        if self.root == NONE {
            return Ok(out);
        }
        let (path, _) = self.descend(&low)?;
        let mut cur = path[path.len() - 1].clone();
        let mut start = { lock(&cur)?.lower_bound(&low) };
        loop {
            let next = {
                let node = lock(&cur)?;
                for at in start..node.size {
                    if node.keys[at] >= high {
                        return Ok(out);
                    }
                    out.push((node.keys[at], node.vals[at]));
                }
                node.next
            };
            if next == NONE {
                return Ok(out);
            }
            cur = self.load(next)?;
            start = 0;
        }
    }

    /// Descends from the root to the leaf responsible for `key`, recording
    /// each visited node and the child index taken out of its parent.
    fn descend(&mut self, key: &K) -> Result<(PathStack<K, V, N>, IndexStack)> {
        let mut path = PathStack::new();
        let mut child_index = IndexStack::new();
        let root = self.root;
        let mut cur = self.load(root)?;
        if path.push(cur.clone()).is_err() || child_index.push(0).is_err() {
            panic!("Tree deeper than MAX_DEPTH ({})", MAX_DEPTH);
        }
        loop {
            let (child, taken) = {
                let node = lock(&cur)?;
                if node.kind != NodeKind::Internal {
                    break;
                }
                let at = if *key >= node.keys[0] {
                    node.upper_bound(key)
                } else {
                    0
                };
                (node.children[at], at)
            };
            cur = self.load(child)?;
            if path.push(cur.clone()).is_err() || child_index.push(taken).is_err() {
                panic!("Tree deeper than MAX_DEPTH ({})", MAX_DEPTH);
            }
        }
        Ok((path, child_index))
    }

    /// Tries to refill an underfull leaf from a sibling, left first. The
    /// parent separator is rewritten to the new boundary key.
    fn borrow_leaf(
        &mut self,
        path: &PathStack<K, V, N>,
        child_index: &IndexStack,
        level: usize,
    ) -> Result<bool> {
        let at = child_index[level];
        let parent_ref = &path[level - 1];

        if at > 0 {
            let left_off = { lock(parent_ref)?.children[at - 1] };
            let left_ref = self.load(left_off)?;
            let mut left = lock(&left_ref)?;
            if left.size > Self::LEAF_MIN {
                let mut node = lock(&path[level])?;
                let mut parent = lock(parent_ref)?;
                let node_size = node.size;
                node.keys.copy_within(0..node_size, 1);
                node.vals.copy_within(0..node_size, 1);
                node.keys[0] = left.keys[left.size - 1];
                node.vals[0] = left.vals[left.size - 1];
                parent.keys[at - 1] = node.keys[0];
                left.size -= 1;
                node.size += 1;
                self.save(&parent)?;
                self.save(&node)?;
                self.save(&left)?;
                trace!(node = node.offset, from = left.offset, "Borrowed leaf entry");
                return Ok(true);
            }
        }

        let parent_size = { lock(parent_ref)?.size };
        if at < parent_size {
            let right_off = { lock(parent_ref)?.children[at + 1] };
            let right_ref = self.load(right_off)?;
            let mut right = lock(&right_ref)?;
            if right.size > Self::LEAF_MIN {
                let mut node = lock(&path[level])?;
                let mut parent = lock(parent_ref)?;
                let node_size = node.size;
                let right_size = right.size;
                node.keys[node_size] = right.keys[0];
                node.vals[node_size] = right.vals[0];
                right.keys.copy_within(1..right_size, 0);
                right.vals.copy_within(1..right_size, 0);
                parent.keys[at] = right.keys[0];
                right.size -= 1;
                node.size += 1;
                self.save(&parent)?;
                self.save(&node)?;
                self.save(&right)?;
                trace!(node = node.offset, from = right.offset, "Borrowed leaf entry");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fuses an underfull leaf into a sibling, left first, re-stitching the
    /// leaf list over the dropped node. Returns the parent separator between
    /// the pair and the dropped offset, for the caller to erase upstream.
    fn merge_leaf(
        &mut self,
        path: &PathStack<K, V, N>,
        child_index: &IndexStack,
        level: usize,
    ) -> Result<(K, Offset)> {
        let at = child_index[level];
        let parent_ref = &path[level - 1];
        let node_ref = &path[level];

        if at > 0 {
            // Append this node's entries onto its left sibling.
            let (mid_key, target_off) = {
                let parent = lock(parent_ref)?;
                (parent.keys[at - 1], parent.children[at - 1])
            };
            let target_ref = self.load(target_off)?;
            let (dropped, stitch_next) = {
                let mut target = lock(&target_ref)?;
                let node = lock(node_ref)?;
                let (ts, ns) = (target.size, node.size);
                target.keys[ts..ts + ns].copy_from_slice(&node.keys[..ns]);
                target.vals[ts..ts + ns].copy_from_slice(&node.vals[..ns]);
                target.size = ts + ns;
                target.next = node.next;
                (node.offset, node.next)
            };
            if stitch_next != NONE {
                let next_ref = self.load(stitch_next)?;
                let mut next = lock(&next_ref)?;
                next.prev = target_off;
                self.save(&next)?;
            }
            self.deallocate(node_ref)?;
            let target = lock(&target_ref)?;
            self.save(&target)?;
            debug!(into = target_off, dropped, "Merged leaf into left sibling");
            Ok((mid_key, dropped))
        } else {
            // No left sibling: push this node's entries into the right one.
            let (mid_key, target_off) = {
                let parent = lock(parent_ref)?;
                (parent.keys[at], parent.children[at + 1])
            };
            let target_ref = self.load(target_off)?;
            let (dropped, stitch_prev) = {
                let mut target = lock(&target_ref)?;
                let node = lock(node_ref)?;
                let (ts, ns) = (target.size, node.size);
                target.keys.copy_within(0..ts, ns);
                target.vals.copy_within(0..ts, ns);
                target.keys[..ns].copy_from_slice(&node.keys[..ns]);
                target.vals[..ns].copy_from_slice(&node.vals[..ns]);
                target.size = ts + ns;
                target.prev = node.prev;
                (node.offset, node.prev)
            };
            if stitch_prev != NONE {
                let prev_ref = self.load(stitch_prev)?;
                let mut prev = lock(&prev_ref)?;
                prev.next = target_off;
                self.save(&prev)?;
            }
            self.deallocate(node_ref)?;
            let target = lock(&target_ref)?;
            self.save(&target)?;
            debug!(into = target_off, dropped, "Merged leaf into right sibling");
            Ok((mid_key, dropped))
        }
    }

    /// Tries to refill an underfull internal node from a sibling, left
    /// first: the parent separator rotates down and the boundary key of the
    /// lending sibling rotates up.
    fn borrow_internal(
        &mut self,
        path: &PathStack<K, V, N>,
        child_index: &IndexStack,
        level: usize,
    ) -> Result<bool> {
        let at = child_index[level];
        let parent_ref = &path[level - 1];

        if at > 0 {
            let left_off = { lock(parent_ref)?.children[at - 1] };
            let left_ref = self.load(left_off)?;
            let mut left = lock(&left_ref)?;
            if left.size > Self::INTERNAL_MIN {
                let mut node = lock(&path[level])?;
                let mut parent = lock(parent_ref)?;
                let node_size = node.size;
                node.keys.copy_within(0..node_size, 1);
                node.children.copy_within(0..node_size + 1, 1);
                node.keys[0] = parent.keys[at - 1];
                node.children[0] = left.children[left.size];
                parent.keys[at - 1] = left.keys[left.size - 1];
                left.size -= 1;
                node.size += 1;
                self.save(&parent)?;
                self.save(&node)?;
                self.save(&left)?;
                trace!(node = node.offset, from = left.offset, "Borrowed separator");
                return Ok(true);
            }
        }

        let parent_size = { lock(parent_ref)?.size };
        if at < parent_size {
            let right_off = { lock(parent_ref)?.children[at + 1] };
            let right_ref = self.load(right_off)?;
            let mut right = lock(&right_ref)?;
            if right.size > Self::INTERNAL_MIN {
                let mut node = lock(&path[level])?;
                let mut parent = lock(parent_ref)?;
                let node_size = node.size;
                let right_size = right.size;
                node.keys[node_size] = parent.keys[at];
                node.children[node_size + 1] = right.children[0];
                parent.keys[at] = right.keys[0];
                right.keys.copy_within(1..right_size, 0);
                right.children.copy_within(1..right_size + 1, 0);
                right.size -= 1;
                node.size += 1;
                self.save(&parent)?;
                self.save(&node)?;
                self.save(&right)?;
                trace!(node = node.offset, from = right.offset, "Borrowed separator");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fuses an underfull internal node into a sibling, left first. The
    /// parent separator between the pair drops down between the two key
    /// groups. Returns that separator and the dropped offset.
    fn merge_internal(
        &mut self,
        path: &PathStack<K, V, N>,
        child_index: &IndexStack,
        level: usize,
    ) -> Result<(K, Offset)> {
        let at = child_index[level];
        let parent_ref = &path[level - 1];
        let node_ref = &path[level];

        if at > 0 {
            let (mid_key, target_off) = {
                let parent = lock(parent_ref)?;
                (parent.keys[at - 1], parent.children[at - 1])
            };
            let target_ref = self.load(target_off)?;
            let dropped = {
                let mut target = lock(&target_ref)?;
                let node = lock(node_ref)?;
                let (ts, ns) = (target.size, node.size);
                target.keys[ts] = mid_key;
                target.keys[ts + 1..ts + 1 + ns].copy_from_slice(&node.keys[..ns]);
                target.children[ts + 1..ts + ns + 2].copy_from_slice(&node.children[..ns + 1]);
                target.size = ts + ns + 1;
                node.offset
            };
            self.deallocate(node_ref)?;
            let target = lock(&target_ref)?;
            self.save(&target)?;
            debug!(into = target_off, dropped, "Merged internal node into left sibling");
            Ok((mid_key, dropped))
        } else {
            let (mid_key, target_off) = {
                let parent = lock(parent_ref)?;
                (parent.keys[at], parent.children[at + 1])
            };
            let target_ref = self.load(target_off)?;
            let dropped = {
                let mut target = lock(&target_ref)?;
                let node = lock(node_ref)?;
                let (ts, ns) = (target.size, node.size);
                target.keys.copy_within(0..ts, ns + 1);
                target.children.copy_within(0..ts + 1, ns + 1);
                target.keys[ns] = mid_key;
                target.keys[..ns].copy_from_slice(&node.keys[..ns]);
                target.children[..ns + 1].copy_from_slice(&node.children[..ns + 1]);
                target.size = ts + ns + 1;
                node.offset
            };
            self.deallocate(node_ref)?;
            let target = lock(&target_ref)?;
            self.save(&target)?;
            debug!(into = target_off, dropped, "Merged internal node into right sibling");
            Ok((mid_key, dropped))
        }
    }

    /// Hands out a node, reusing the free-list head when one exists and
    /// extending the file by one block otherwise. A fresh tail block is
    /// first initialized on disk as a free block so the free-list threading
    /// is well-defined before its first reuse.
    fn allocate(&mut self, kind: NodeKind) -> Result<NodeRef<K, V, N>> {
        if self.freelist_head == NONE {
            let offset = self.file_size;
            let block = Node::<K, V, N>::empty(NodeKind::Free, offset);
            self.file.write_block(&block)?;
            self.freelist_head = offset;
            self.file_size += Self::BLOCK_SIZE;
            trace!(offset, "Extended file by one block");
        }
        let head = self.freelist_head;
        let node_ref = self.load(head)?;
        {
            let mut node = lock(&node_ref)?;
            self.freelist_head = node.next;
            node.kind = kind;
            node.next = NONE;
            node.prev = NONE;
            node.size = 0;
        }
        trace!(offset = head, "Allocated node");
        Ok(node_ref)
    }

    /// Marks a node free, threads it onto the free-list, and drops it from
    /// the buffer pool; the eviction persists the free block to disk.
    fn deallocate(&mut self, node_ref: &NodeRef<K, V, N>) -> Result<()> {
        let offset = {
            let mut node = lock(node_ref)?;
            node.kind = NodeKind::Free;
            node.next = self.freelist_head;
            node.offset
        };
        if !self.cache.remove(offset, &mut self.file)? {
            // Not resident; the free state still has to reach the disk.
            let node = lock(node_ref)?;
            self.save(&node)?;
        }
        self.freelist_head = offset;
        trace!(offset, "Freed node");
        Ok(())
    }

    fn load(&mut self, offset: Offset) -> Result<NodeRef<K, V, N>> {
        self.cache.get(offset, &mut self.file)
    }

    /// Write-through: persists the node to its block immediately. The
    /// cached copy is the node itself, so disk and cache stay identical
    /// between operations.
    fn save(&mut self, node: &Node<K, V, N>) -> Result<()> {
        self.file.write_block(node)
    }
}

impl<K, V, const N: usize> Drop for BPlusTree<K, V, N>
where
    K: Copy + Ord + Default + Encode + Decode<()>,
    V: Copy + Default + Encode + Decode<()>,
{
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.shutdown() {
                tracing::warn!("Failed to close tree cleanly: {}", e);
            }
        }
    }
}
