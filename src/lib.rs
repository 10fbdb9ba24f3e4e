//! An on-disk B+ tree index mapping fixed-size keys to fixed-size values.
//!
//! All node storage lives in a single backing file partitioned into
//! fixed-size blocks behind a small header; a write-through LRU buffer pool
//! mediates every block read and write. The tree supports point lookup,
//! insertion, deletion and half-open range scans, and persists across
//! process restarts.
//!
//! ```no_run
//! use diskbtree::BPlusTree;
//!
//! // Degree 4: nodes carry 5 slots, one spare for insert-then-split.
//! type Tree = BPlusTree<u32, u64, 5>;
//!
//! # fn main() -> Result<(), diskbtree::Error> {
//! Tree::create("users.bpt")?;
//! let mut tree = Tree::open("users.bpt", 128)?;
//! tree.insert(10, 100)?;
//! assert_eq!(tree.search(&10)?, Some(100));
//! tree.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Format
//!
//! Multi-byte scalars are little-endian fixed-width; the file is not
//! portable to big-endian readers. A single sentinel (`u64::MAX`) marks an
//! absent root, absent leaf siblings and the end of the block free-list.
//! Key and value types must be `Copy` and encode to exactly their
//! `size_of` under bincode's fixed-int configuration — plain integers and
//! fixed byte arrays qualify.
//!
//! ## Durability and concurrency
//!
//! Writes are write-through: when an operation returns, its mutations are
//! on disk. The header (root, free-list head, file size) is rewritten on
//! `close` and by `Drop`. There is no write-ahead log; a crash mid-mutation
//! can leave the tree unusable. Operations are strictly single-writer and
//! take `&mut self`; independent trees over distinct files are independent.

#[macro_use]
mod errors;
pub mod cache;
pub mod encoding;
pub mod file;
pub mod node;
pub mod tree;

pub use errors::{Error, Result};
pub use node::{Node, NodeKind, Offset, MAX_DEPTH, NONE};
pub use tree::BPlusTree;
