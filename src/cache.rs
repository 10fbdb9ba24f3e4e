//! Write-through LRU buffer pool for decoded nodes.
//!
//! Frames live in one array. Cached frames form an intrusive ring through
//! `prev`/`next` with frame 0 as the sentinel (most recently used right
//! after the sentinel, least recently used right before it); unused frames
//! form a free-list threaded through `next`. A hash table maps a node's
//! file offset to its frame for O(1) lookup.
//!
//! The pool is pin-free: a [`NodeRef`] handed out by [`LruCache::get`] is
//! only guaranteed to stay coherent with the cache until the next call that
//! may evict, so a single operation must not keep more nodes resident than
//! the capacity contract allows. [`MIN_CACHE_BLOCKS`] (4 frames per level
//! of the deepest possible tree) is the floor that keeps one mutation's
//! working set — the root-to-leaf path, immediate siblings, and a freshly
//! allocated node — safe from eviction. Forcing out a frame whose node is
//! still locked is a capacity violation and panics; it is never silently
//! recovered.

use crate::errors::Result;
use crate::node::{Node, Offset, MAX_DEPTH};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Smallest usable pool: the worst-case working set of one mutation.
pub const MIN_CACHE_BLOCKS: usize = 4 * MAX_DEPTH;

/// Shared handle to a cached node. Lock it to read or mutate; the mutex
/// doubles as the pin detector for eviction.
pub type NodeRef<K, V, const N: usize> = Arc<Mutex<Node<K, V, N>>>;

/// The cache's view of the backing store: fill a node from a block, and
/// persist a node when it leaves the pool. Under write-through every cached
/// node is already durable, but the evict callback runs unconditionally.
pub trait NodeIo<K, V, const N: usize> {
    fn load(&mut self, offset: Offset, node: &mut Node<K, V, N>) -> Result<()>;
    fn evict(&mut self, node: &Node<K, V, N>) -> Result<()>;
}

/// Sentinel index shared by the LRU ring head and the free-list terminator.
const LIST_END: usize = 0;

struct Frame<K, V, const N: usize> {
    prev: usize,
    next: usize,
    node: Option<NodeRef<K, V, N>>,
}

pub struct LruCache<K, V, const N: usize> {
    frames: Vec<Frame<K, V, N>>,
    table: HashMap<Offset, usize>,
    free_head: usize,
}

impl<K, V, const N: usize> LruCache<K, V, N>
where
    K: Copy + Ord + Default,
    V: Copy + Default,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Buffer pool needs at least one frame");
        let mut frames = Vec::with_capacity(capacity + 1);
        for i in 0..=capacity {
            frames.push(Frame {
                prev: LIST_END,
                next: if i > 0 && i < capacity { i + 1 } else { LIST_END },
                node: None,
            });
        }
        LruCache {
            frames,
            table: HashMap::new(),
            free_head: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, offset: Offset) -> bool {
        self.table.contains_key(&offset)
    }

    /// Returns the node at `offset`, loading it through `io` on a miss and
    /// evicting the least recently used frame when the pool is full.
    pub fn get(&mut self, offset: Offset, io: &mut impl NodeIo<K, V, N>) -> Result<NodeRef<K, V, N>> {
        if let Some(&index) = self.table.get(&offset) {
            self.detach(index);
            self.attach_front(index);
            return self
                .frames[index]
                .node
                .clone()
                .ok_or_else(|| err!(Storage, "Cached frame {} holds no node", index));
        }

        let index = if self.free_head != LIST_END {
            let index = self.free_head;
            self.free_head = self.frames[index].next;
            index
        } else {
            self.evict_tail(io)?
        };

        let mut node = Node::empty(crate::node::NodeKind::Free, offset);
        if let Err(e) = io.load(offset, &mut node) {
            // Frame goes back to the free-list; the pool stays consistent.
            self.frames[index].next = self.free_head;
            self.free_head = index;
            return Err(e);
        }
        trace!(offset, frame = index, "Loaded node into the pool");

        let node_ref = Arc::new(Mutex::new(node));
        self.frames[index].node = Some(node_ref.clone());
        self.attach_front(index);
        self.table.insert(offset, index);
        Ok(node_ref)
    }

    /// Drops the node at `offset` from the pool, running the evict callback.
    /// Returns whether a frame was removed.
    pub fn remove(&mut self, offset: Offset, io: &mut impl NodeIo<K, V, N>) -> Result<bool> {
        let index = match self.table.get(&offset) {
            Some(&index) => index,
            None => return Ok(false),
        };
        self.expire(index, io)?;
        self.detach(index);
        self.frames[index].node = None;
        self.frames[index].next = self.free_head;
        self.free_head = index;
        self.table.remove(&offset);
        trace!(offset, frame = index, "Removed node from the pool");
        Ok(true)
    }

    /// Runs the evict callback over every cached node, then releases all
    /// frames back to the free-list.
    pub fn flush_all(&mut self, io: &mut impl NodeIo<K, V, N>) -> Result<()> {
        let mut index = self.frames[LIST_END].next;
        while index != LIST_END {
            self.expire(index, io)?;
            index = self.frames[index].next;
        }
        let mut index = self.frames[LIST_END].next;
        while index != LIST_END {
            let next = self.frames[index].next;
            self.frames[index].node = None;
            self.frames[index].next = self.free_head;
            self.free_head = index;
            index = next;
        }
        self.frames[LIST_END].next = LIST_END;
        self.frames[LIST_END].prev = LIST_END;
        self.table.clear();
        Ok(())
    }

    /// Invokes the evict callback on the frame's node. Panics if the node
    /// is still locked — by the capacity contract that can only mean the
    /// pool is too small for the operation in flight.
    fn expire(&mut self, index: usize, io: &mut impl NodeIo<K, V, N>) -> Result<()> {
        let node_ref = self.frames[index]
            .node
            .as_ref()
            .ok_or_else(|| err!(Storage, "Cached frame {} holds no node", index))?;
        let node = match node_ref.try_lock() {
            Ok(node) => node,
            Err(_) => panic!(
                "Buffer pool capacity violation: evicting a node still in use \
                 (frame {}, capacity {})",
                index,
                self.capacity()
            ),
        };
        io.evict(&node)
    }

    /// Evicts the least recently used frame and returns it for reuse.
    fn evict_tail(&mut self, io: &mut impl NodeIo<K, V, N>) -> Result<usize> {
        let tail = self.frames[LIST_END].prev;
        if tail == LIST_END {
            panic!("Buffer pool capacity violation: no frame available for eviction");
        }
        self.expire(tail, io)?;
        let offset = {
            let node_ref = self.frames[tail]
                .node
                .as_ref()
                .ok_or_else(|| err!(Storage, "Cached frame {} holds no node", tail))?;
            let node = match node_ref.try_lock() {
                Ok(node) => node,
                Err(_) => panic!("Buffer pool capacity violation: evicted node relocked"),
            };
            node.offset
        };
        self.detach(tail);
        self.frames[tail].node = None;
        self.table.remove(&offset);
        trace!(offset, frame = tail, "Evicted LRU node");
        Ok(tail)
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = (self.frames[index].prev, self.frames[index].next);
        self.frames[prev].next = next;
        self.frames[next].prev = prev;
    }

    fn attach_front(&mut self, index: usize) {
        let head = self.frames[LIST_END].next;
        self.frames[index].prev = LIST_END;
        self.frames[index].next = head;
        self.frames[head].prev = index;
        self.frames[LIST_END].next = index;
    }

    /// Cached offsets, most recently used first.
    #[cfg(test)]
    fn offsets(&self) -> Vec<Offset> {
        let mut out = Vec::new();
        let mut index = self.frames[LIST_END].next;
        while index != LIST_END {
            let node = self.frames[index].node.as_ref().unwrap().lock().unwrap();
            out.push(node.offset);
            index = self.frames[index].next;
        }
        out
    }
}
