//! The backing file: a seekable container of fixed-size blocks behind a
//! small persisted header.
//!
//! The file is grow-only. Blocks are never returned to the filesystem;
//! reclaimed blocks are threaded onto the free-list and reused. All I/O is
//! positioned whole-block reads and writes.

use crate::cache::NodeIo;
use crate::encoding::{decode_node, encode_node};
use crate::errors::Result;
use crate::node::{Node, Offset, NONE};
use bincode::{config, Decode, Encode};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Persisted at offset 0: `{file_size, freelist_head, root, sequential_head}`.
///
/// On a freshly created file `file_size` equals [`HEADER_SIZE`] — the header
/// is the whole file until the first block is allocated. `sequential_head`
/// is reserved for the leftmost-leaf offset; it is zeroed on create and
/// carried through untouched.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_size: u64,
    pub freelist_head: Offset,
    pub root: Offset,
    pub sequential_head: Offset,
}

/// Four fixed-width little-endian u64 fields.
pub const HEADER_SIZE: usize = 32;

pub struct BlockFile {
    file: std::fs::File,
    path: PathBuf,
}

impl BlockFile {
    /// Creates a fresh tree file holding only the initial header. Fails if
    /// the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut this = BlockFile {
            file,
            path: path.to_path_buf(),
        };
        this.write_header(&FileHeader {
            file_size: HEADER_SIZE as u64,
            freelist_head: NONE,
            root: NONE,
            sequential_head: 0,
        })?;
        this.flush()?;
        info!(path = %this.path.display(), "Created tree file");
        Ok(())
    }

    /// Opens an existing tree file. Fails if the file is missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(BlockFile {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_header(&self) -> Result<FileHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut buf, 0).map_err(|e| {
            err!(
                Format,
                "File too short for a tree header ({} bytes needed): {}",
                HEADER_SIZE,
                e
            )
        })?;
        let (header, _) = bincode::decode_from_slice(
            &buf,
            config::standard().with_fixed_int_encoding(),
        )
        .map_err(|e| err!(Format, "Failed to decode tree header. {}", e))?;
        Ok(header)
    }

    pub fn write_header(&mut self, header: &FileHeader) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        bincode::encode_into_slice(
            header,
            &mut buf,
            config::standard().with_fixed_int_encoding(),
        )
        .map_err(|e| err!(Format, "Failed to encode tree header. {}", e))?;
        self.file.write_all_at(&buf, 0)?;
        Ok(())
    }

    pub fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: Offset, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads and decodes the block at `offset`.
    pub fn read_block<K, V, const N: usize>(&self, offset: Offset) -> Result<Node<K, V, N>>
    where
        K: Copy + Ord + Default + Decode<()>,
        V: Copy + Default + Decode<()>,
    {
        let mut buf = vec![0u8; Node::<K, V, N>::BLOCK_SIZE];
        self.read_at(offset, &mut buf)?;
        decode_node(&buf)
    }

    /// Encodes `node` and writes its block at `node.offset`. Block padding
    /// is zeroed, so on-disk bytes are deterministic.
    pub fn write_block<K, V, const N: usize>(&mut self, node: &Node<K, V, N>) -> Result<()>
    where
        K: Copy + Ord + Default + Encode,
        V: Copy + Default + Encode,
    {
        let mut buf = vec![0u8; Node::<K, V, N>::BLOCK_SIZE];
        encode_node(node, &mut buf)?;
        self.write_at(node.offset, &buf)
    }
}

impl<K, V, const N: usize> NodeIo<K, V, N> for BlockFile
where
    K: Copy + Ord + Default + Encode + Decode<()>,
    V: Copy + Default + Encode + Decode<()>,
{
    fn load(&mut self, offset: Offset, node: &mut Node<K, V, N>) -> Result<()> {
        *node = self.read_block(offset)?;
        Ok(())
    }

    fn evict(&mut self, node: &Node<K, V, N>) -> Result<()> {
        // Write-through keeps cached nodes clean, but eviction still
        // persists unconditionally.
        self.write_block(node)
    }
}
