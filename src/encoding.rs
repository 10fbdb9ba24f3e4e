//! Block codec: one node to or from one fixed-size block buffer.
//!
//! All multi-byte scalars are little-endian fixed-width (bincode with fixed
//! integer encoding); the format is not portable to big-endian readers. The
//! tag byte is padded to offset alignment, then `offset` and `next` follow
//! unconditionally. A free block carries nothing else. Allocated nodes add
//! `prev`, `size`, `D` key slots and `D` payload slots (values for a leaf,
//! child offsets for an internal node — the two overlay the same trailing
//! region). Only the first `size` key/payload slots are meaningful; the
//! codec never trusts padding bytes.

use crate::errors::Result;
use crate::node::{Node, NodeKind, Offset};
use bincode::{config, decode_from_slice, encode_into_slice, Decode, Encode};

/// Encodes one fixed-width scalar into its region of the block buffer.
fn put<T: Encode>(value: &T, region: &mut [u8]) -> Result<()> {
    encode_into_slice(value, region, config::standard().with_fixed_int_encoding())
        .map_err(|e| err!(Format, "Failed to encode node field. {}", e))?;
    Ok(())
}

/// Decodes one fixed-width scalar from its region of the block buffer.
fn take<T: Decode<()>>(region: &[u8]) -> Result<T> {
    let (value, _) = decode_from_slice(region, config::standard().with_fixed_int_encoding())
        .map_err(|e| err!(Format, "Failed to decode node field. {}", e))?;
    Ok(value)
}

/// Serializes `node` into `buf`. Bytes of `buf` outside the written fields
/// are left untouched, so the caller may hand in a dirty buffer.
pub fn encode_node<K, V, const N: usize>(node: &Node<K, V, N>, buf: &mut [u8]) -> Result<()>
where
    K: Copy + Ord + Default + Encode,
    V: Copy + Default + Encode,
{
    let block = Node::<K, V, N>::BLOCK_SIZE;
    if buf.len() < block {
        return Err(err!(
            Format,
            "Block buffer too small: {} < {}",
            buf.len(),
            block
        ));
    }

    buf[Node::<K, V, N>::KIND_POS] = node.kind.as_tag();
    put(&node.offset, &mut buf[Node::<K, V, N>::OFFSET_POS..])?;
    put(&node.next, &mut buf[Node::<K, V, N>::NEXT_POS..])?;
    if node.kind == NodeKind::Free {
        return Ok(());
    }
    put(&node.prev, &mut buf[Node::<K, V, N>::PREV_POS..])?;
    put(&(node.size as u64), &mut buf[Node::<K, V, N>::SIZE_POS..])?;

    let key_size = Node::<K, V, N>::KEY_SIZE;
    let mut at = Node::<K, V, N>::KEYS_POS;
    for i in 0..Node::<K, V, N>::DEGREE {
        put(&node.keys[i], &mut buf[at..at + key_size])?;
        at += key_size;
    }

    let mut at = Node::<K, V, N>::PAYLOAD_POS;
    if node.kind == NodeKind::Leaf {
        let val_size = Node::<K, V, N>::VAL_SIZE;
        for i in 0..Node::<K, V, N>::DEGREE {
            put(&node.vals[i], &mut buf[at..at + val_size])?;
            at += val_size;
        }
    } else {
        let child_size = Node::<K, V, N>::CHILD_SIZE;
        for i in 0..Node::<K, V, N>::DEGREE {
            put(&node.children[i], &mut buf[at..at + child_size])?;
            at += child_size;
        }
    }
    Ok(())
}

/// Deserializes a node from `buf`. Padding slots come back as defaults;
/// an unknown tag byte or an impossible `size` is a format error.
pub fn decode_node<K, V, const N: usize>(buf: &[u8]) -> Result<Node<K, V, N>>
where
    K: Copy + Ord + Default + Decode<()>,
    V: Copy + Default + Decode<()>,
{
    let block = Node::<K, V, N>::BLOCK_SIZE;
    if buf.len() < block {
        return Err(err!(
            Format,
            "Block buffer too small: {} < {}",
            buf.len(),
            block
        ));
    }

    let kind = NodeKind::from_tag(buf[Node::<K, V, N>::KIND_POS])?;
    let offset: Offset = take(&buf[Node::<K, V, N>::OFFSET_POS..])?;
    let mut node = Node::<K, V, N>::empty(kind, offset);
    node.next = take(&buf[Node::<K, V, N>::NEXT_POS..])?;
    if kind == NodeKind::Free {
        return Ok(node);
    }
    node.prev = take(&buf[Node::<K, V, N>::PREV_POS..])?;

    let size: u64 = take(&buf[Node::<K, V, N>::SIZE_POS..])?;
    let capacity = if kind == NodeKind::Leaf {
        Node::<K, V, N>::LEAF_MAX
    } else {
        Node::<K, V, N>::INTERNAL_MAX
    };
    if size as usize > capacity {
        return Err(err!(
            Format,
            "Node at {} claims {} entries, capacity is {}",
            offset,
            size,
            capacity
        ));
    }
    node.size = size as usize;

    let key_size = Node::<K, V, N>::KEY_SIZE;
    let mut at = Node::<K, V, N>::KEYS_POS;
    for i in 0..node.size {
        node.keys[i] = take(&buf[at..at + key_size])?;
        at += key_size;
    }

    let mut at = Node::<K, V, N>::PAYLOAD_POS;
    if kind == NodeKind::Leaf {
        let val_size = Node::<K, V, N>::VAL_SIZE;
        for i in 0..node.size {
            node.vals[i] = take(&buf[at..at + val_size])?;
            at += val_size;
        }
    } else {
        let child_size = Node::<K, V, N>::CHILD_SIZE;
        for i in 0..node.size + 1 {
            node.children[i] = take(&buf[at..at + child_size])?;
            at += child_size;
        }
    }
    Ok(node)
}
