//! End-to-end tests driving the tree through its public surface, plus an
//! offline checker that walks the closed file block by block and verifies
//! the structural invariants.

use diskbtree::file::{BlockFile, FileHeader, HEADER_SIZE};
use diskbtree::{BPlusTree, Error, Node, NodeKind, Offset, NONE};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

type Tree = BPlusTree<u32, u64, 5>; // degree 4: LEAF_MIN = 2, INTERNAL_MIN = 1
type TestNode = Node<u32, u64, 5>;

const BLOCK: u64 = TestNode::BLOCK_SIZE as u64;

fn new_tree(name: &str) -> (TempDir, PathBuf, Tree) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(name);
    Tree::create(&path).unwrap();
    let tree = Tree::open(&path, 128).unwrap();
    (dir, path, tree)
}

/// Value encoding for the lettered scenarios: a=1, b=2, ...
fn v(c: char) -> u64 {
    c as u64 - 'a' as u64 + 1
}

/// Builds the eleven-key tree used by scenarios 3 through 6.
fn build_scenario_tree(tree: &mut Tree) {
    for (k, c) in [
        (10, 'a'),
        (20, 'b'),
        (30, 'c'),
        (40, 'd'),
        (50, 'e'),
        (5, 'f'),
        (15, 'g'),
        (25, 'h'),
        (35, 'i'),
        (45, 'j'),
        (55, 'k'),
    ] {
        tree.insert(k, v(c)).unwrap();
    }
}

/// Snapshot of a closed tree file: the header and every decoded block.
struct FileScan {
    header: FileHeader,
    blocks: HashMap<Offset, TestNode>,
}

fn scan_file(path: &Path) -> FileScan {
    let file = BlockFile::open(path).unwrap();
    let header = file.read_header().unwrap();
    assert_eq!(header.file_size, file.len().unwrap());
    let mut blocks = HashMap::new();
    let mut offset = HEADER_SIZE as u64;
    while offset < header.file_size {
        blocks.insert(offset, file.read_block::<u32, u64, 5>(offset).unwrap());
        offset += BLOCK;
    }
    FileScan { header, blocks }
}

/// Walks a subtree collecting leaves and entries, checking key order,
/// occupancy bounds, separator placement and uniform leaf depth. Returns
/// the subtree's (min, max) key.
fn walk(
    scan: &FileScan,
    offset: Offset,
    depth: usize,
    is_root: bool,
    leaf_depth: &mut Option<usize>,
    leaves: &mut Vec<Offset>,
    entries: &mut Vec<(u32, u64)>,
) -> (u32, u32) {
    let node = scan
        .blocks
        .get(&offset)
        .unwrap_or_else(|| panic!("no block at reachable offset {}", offset));
    assert_eq!(node.offset, offset, "node identity matches its block offset");
    let keys = &node.keys[..node.size];
    assert!(
        keys.windows(2).all(|w| w[0] < w[1]),
        "keys strictly increase in node {}",
        offset
    );

    match node.kind {
        NodeKind::Leaf => {
            assert!(node.size >= 1);
            assert!(node.size <= TestNode::LEAF_MAX);
            if !is_root {
                assert!(
                    node.size >= TestNode::LEAF_MIN,
                    "leaf {} under-occupied: {}",
                    offset,
                    node.size
                );
            }
            match *leaf_depth {
                Some(d) => assert_eq!(d, depth, "all leaves sit at the same depth"),
                None => *leaf_depth = Some(depth),
            }
            leaves.push(offset);
            for i in 0..node.size {
                entries.push((node.keys[i], node.vals[i]));
            }
            (node.keys[0], node.keys[node.size - 1])
        }
        NodeKind::Internal => {
            assert!(node.size >= 1, "internal root keeps at least one key");
            assert!(node.size <= TestNode::INTERNAL_MAX);
            if !is_root {
                assert!(
                    node.size >= TestNode::INTERNAL_MIN,
                    "internal node {} under-occupied: {}",
                    offset,
                    node.size
                );
            }
            let mut low = 0;
            let mut high = 0;
            for i in 0..=node.size {
                let (cmin, cmax) = walk(
                    scan,
                    node.children[i],
                    depth + 1,
                    false,
                    leaf_depth,
                    leaves,
                    entries,
                );
                if i == 0 {
                    low = cmin;
                } else {
                    // Splits and borrows set the separator to the right
                    // subtree's smallest key; a later removal of that key
                    // leaves the separator stale but still ordering.
                    assert!(
                        node.keys[i - 1] <= cmin,
                        "separator {:?} exceeds right subtree minimum {:?}",
                        node.keys[i - 1],
                        cmin
                    );
                }
                if i < node.size {
                    assert!(
                        cmax < node.keys[i],
                        "subtree maximum {:?} reaches separator {:?}",
                        cmax,
                        node.keys[i]
                    );
                }
                high = cmax;
            }
            (low, high)
        }
        NodeKind::Free => panic!("free block {} reachable from the root", offset),
    }
}

/// Full structural audit of a closed file against the expected contents.
fn check_file(path: &Path, expected: &BTreeMap<u32, u64>) {
    let scan = scan_file(path);

    // Free-list: every hop lands on a FREE block, visited exactly once.
    let mut free = Vec::new();
    let mut offset = scan.header.freelist_head;
    while offset != NONE {
        let node = scan
            .blocks
            .get(&offset)
            .unwrap_or_else(|| panic!("free-list points outside the file: {}", offset));
        assert_eq!(node.kind, NodeKind::Free);
        assert!(!free.contains(&offset), "free-list cycle at {}", offset);
        free.push(offset);
        offset = node.next;
    }

    if scan.header.root == NONE {
        assert!(expected.is_empty(), "empty tree must hold no entries");
        assert!(
            scan.blocks.values().all(|b| b.kind == NodeKind::Free),
            "an empty tree's file contains only free blocks"
        );
        assert_eq!(free.len(), scan.blocks.len());
        return;
    }

    let mut leaf_depth = None;
    let mut leaves = Vec::new();
    let mut entries = Vec::new();
    walk(
        &scan,
        scan.header.root,
        0,
        true,
        &mut leaf_depth,
        &mut leaves,
        &mut entries,
    );

    let want: Vec<(u32, u64)> = expected.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(entries, want, "in-order walk yields the expected entries");

    // The leaf chain mirrors the in-order leaf sequence, both directions.
    for (i, &offset) in leaves.iter().enumerate() {
        let node = &scan.blocks[&offset];
        let prev = if i == 0 { NONE } else { leaves[i - 1] };
        let next = if i + 1 == leaves.len() { NONE } else { leaves[i + 1] };
        assert_eq!(node.prev, prev, "prev link of leaf {}", offset);
        assert_eq!(node.next, next, "next link of leaf {}", offset);
    }

    // Reachable blocks and the free-list partition the file.
    let mut reachable: Vec<Offset> = leaves.clone();
    fn internals(scan: &FileScan, offset: Offset, out: &mut Vec<Offset>) {
        let node = &scan.blocks[&offset];
        if node.kind == NodeKind::Internal {
            out.push(offset);
            for i in 0..=node.size {
                internals(scan, node.children[i], out);
            }
        }
    }
    internals(&scan, scan.header.root, &mut reachable);
    let mut all: Vec<Offset> = reachable.iter().chain(free.iter()).copied().collect();
    all.sort_unstable();
    let mut file_offsets: Vec<Offset> = scan.blocks.keys().copied().collect();
    file_offsets.sort_unstable();
    assert_eq!(
        all, file_offsets,
        "reachable blocks and the free-list partition the file exactly"
    );
}

#[test]
fn scenario_1_degree_inserts_stay_in_one_leaf() {
    let (_dir, path, mut tree) = new_tree("s1.bpt");
    for (k, c) in [(10, 'a'), (20, 'b'), (30, 'c'), (40, 'd')] {
        tree.insert(k, v(c)).unwrap();
    }
    let root = tree.root_offset();
    tree.close().unwrap();

    let scan = scan_file(&path);
    assert_eq!(scan.header.file_size, HEADER_SIZE as u64 + BLOCK);
    let leaf = &scan.blocks[&root];
    assert_eq!(leaf.kind, NodeKind::Leaf);
    assert_eq!(&leaf.keys[..leaf.size], &[10, 20, 30, 40]);
}

#[test]
fn scenario_2_fifth_insert_splits_the_leaf() {
    let (_dir, path, mut tree) = new_tree("s2.bpt");
    for (k, c) in [(10, 'a'), (20, 'b'), (30, 'c'), (40, 'd'), (50, 'e')] {
        tree.insert(k, v(c)).unwrap();
    }
    // The key 40 now lives in the right leaf.
    assert_eq!(tree.search(&40).unwrap(), Some(v('d')));
    tree.close().unwrap();

    let scan = scan_file(&path);
    let root = &scan.blocks[&scan.header.root];
    assert_eq!(root.kind, NodeKind::Internal);
    assert_eq!(&root.keys[..root.size], &[40]);

    let left = &scan.blocks[&root.children[0]];
    let right = &scan.blocks[&root.children[1]];
    assert_eq!(&left.keys[..left.size], &[10, 20, 30]);
    assert_eq!(&right.keys[..right.size], &[40, 50]);
}

#[test]
fn scenario_3_leaf_traversal_is_sorted() {
    let (_dir, path, mut tree) = new_tree("s3.bpt");
    build_scenario_tree(&mut tree);

    let keys: Vec<u32> = tree
        .range(0, u32::MAX)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 55]);
    tree.close().unwrap();

    let expected: BTreeMap<u32, u64> = [
        (5, v('f')),
        (10, v('a')),
        (15, v('g')),
        (20, v('b')),
        (25, v('h')),
        (30, v('c')),
        (35, v('i')),
        (40, v('d')),
        (45, v('j')),
        (50, v('e')),
        (55, v('k')),
    ]
    .into_iter()
    .collect();
    check_file(&path, &expected);
}

#[test]
fn scenario_4_remove_keeps_occupancy_above_minimum() {
    let (_dir, path, mut tree) = new_tree("s4.bpt");
    build_scenario_tree(&mut tree);

    assert!(tree.remove(&25).unwrap());
    assert_eq!(tree.search(&25).unwrap(), None);
    assert_eq!(tree.search(&20).unwrap(), Some(v('b')));
    assert_eq!(tree.search(&30).unwrap(), Some(v('c')));
    tree.close().unwrap();

    let expected: BTreeMap<u32, u64> = [
        (5, v('f')),
        (10, v('a')),
        (15, v('g')),
        (20, v('b')),
        (30, v('c')),
        (35, v('i')),
        (40, v('d')),
        (45, v('j')),
        (50, v('e')),
        (55, v('k')),
    ]
    .into_iter()
    .collect();
    // check_file asserts every non-root leaf still holds >= LEAF_MIN entries.
    check_file(&path, &expected);
}

#[test]
fn scenario_5_range_scan() {
    let (_dir, _path, mut tree) = new_tree("s5.bpt");
    build_scenario_tree(&mut tree);

    assert_eq!(
        tree.range(15, 45).unwrap(),
        vec![
            (15, v('g')),
            (20, v('b')),
            (25, v('h')),
            (30, v('c')),
            (35, v('i')),
            (40, v('d')),
        ]
    );
}

#[test]
fn scenario_6_reopen_answers_identically() {
    let (_dir, path, mut tree) = new_tree("s6.bpt");
    build_scenario_tree(&mut tree);
    let before = tree.range(15, 45).unwrap();
    tree.close().unwrap();

    let mut reopened = Tree::open(&path, 128).unwrap();
    assert_eq!(reopened.range(15, 45).unwrap(), before);
    assert_eq!(
        reopened.range(0, u32::MAX).unwrap().len(),
        11,
        "every committed entry survives the restart"
    );
}

#[test]
fn range_is_half_open() {
    let (_dir, _path, mut tree) = new_tree("half_open.bpt");
    build_scenario_tree(&mut tree);

    assert_eq!(tree.range(20, 20).unwrap(), vec![]);
    assert_eq!(tree.range(20, 21).unwrap(), vec![(20, v('b'))]);
    assert_eq!(tree.range(21, 22).unwrap(), vec![]);
    assert_eq!(tree.range(0, 5).unwrap(), vec![]);
    assert_eq!(tree.range(55, u32::MAX).unwrap(), vec![(55, v('k'))]);
}

#[test]
fn duplicate_insert_is_rejected() {
    let (_dir, _path, mut tree) = new_tree("dup.bpt");
    tree.insert(10, 1).unwrap();
    assert!(matches!(tree.insert(10, 2), Err(Error::Duplicate(_))));
    // The first insert's value survives.
    assert_eq!(tree.search(&10).unwrap(), Some(1));
}

#[test]
fn search_and_remove_of_absent_keys_are_not_errors() {
    let (_dir, _path, mut tree) = new_tree("absent.bpt");
    assert_eq!(tree.search(&7).unwrap(), None);
    assert!(!tree.remove(&7).unwrap());
    tree.insert(7, 70).unwrap();
    assert!(tree.remove(&7).unwrap());
    assert_eq!(tree.search(&7).unwrap(), None);
    assert!(!tree.remove(&7).unwrap());
}

#[test]
fn delete_down_to_empty_leaves_only_free_blocks() {
    let (_dir, path, mut tree) = new_tree("drain.bpt");
    for k in 1..=50u32 {
        tree.insert(k, u64::from(k) * 10).unwrap();
    }
    let len_when_full = std::fs::metadata(&path).unwrap().len();
    for k in 1..=50u32 {
        assert!(tree.remove(&k).unwrap(), "key {} should be present", k);
    }
    assert_eq!(tree.root_offset(), NONE);
    assert_eq!(tree.range(0, u32::MAX).unwrap(), vec![]);
    tree.close().unwrap();

    check_file(&path, &BTreeMap::new());
    // Grow-only: draining the tree reclaims blocks, never file bytes.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_when_full);
}

#[test]
fn freed_blocks_are_reused_after_reopen() {
    let (_dir, path, mut tree) = new_tree("reuse.bpt");
    for k in 1..=50u32 {
        tree.insert(k, u64::from(k)).unwrap();
    }
    for k in 1..=50u32 {
        tree.remove(&k).unwrap();
    }
    tree.close().unwrap();
    let drained_len = std::fs::metadata(&path).unwrap().len();

    let mut tree = Tree::open(&path, 128).unwrap();
    for k in 1..=50u32 {
        tree.insert(k, u64::from(k)).unwrap();
    }
    tree.close().unwrap();
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        drained_len,
        "rebuilding the tree runs entirely off the free-list"
    );
}

#[test]
fn forced_eviction_at_minimum_capacity() {
    let (_dir, path, tree) = new_tree("evict.bpt");
    drop(tree);
    // Reopen with the smallest pool the capacity contract allows; several
    // hundred keys guarantee the working set dwarfs the pool.
    let mut tree = Tree::open(&path, 1).unwrap();
    let mut keys: Vec<u32> = (0..500).map(|i| (i * 7919) % 10_000).collect();
    keys.sort_unstable();
    keys.dedup();
    for &k in &keys {
        tree.insert(k, u64::from(k) + 1).unwrap();
    }
    for &k in &keys {
        assert_eq!(tree.search(&k).unwrap(), Some(u64::from(k) + 1));
    }
    let scanned: Vec<u32> = tree
        .range(0, u32::MAX)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(scanned, keys);
    tree.close().unwrap();

    let expected: BTreeMap<u32, u64> =
        keys.iter().map(|&k| (k, u64::from(k) + 1)).collect();
    check_file(&path, &expected);
}

#[test]
fn randomized_soak_matches_a_shadow_map() {
    let (_dir, path, mut tree) = new_tree("soak.bpt");
    let mut rng = StdRng::seed_from_u64(0xB7EE);
    let mut shadow: BTreeMap<u32, u64> = BTreeMap::new();

    for step in 0..4000usize {
        let key: u32 = rng.gen_range(0..400);
        match rng.gen_range(0..100) {
            0..=54 => {
                let value: u64 = rng.gen();
                if shadow.contains_key(&key) {
                    assert!(matches!(tree.insert(key, value), Err(Error::Duplicate(_))));
                } else {
                    tree.insert(key, value).unwrap();
                    shadow.insert(key, value);
                }
            }
            55..=84 => {
                assert_eq!(tree.remove(&key).unwrap(), shadow.remove(&key).is_some());
            }
            _ => {
                assert_eq!(tree.search(&key).unwrap(), shadow.get(&key).copied());
            }
        }

        if step % 500 == 499 {
            let got = tree.range(0, u32::MAX).unwrap();
            let want: Vec<(u32, u64)> = shadow.iter().map(|(&k, &v)| (k, v)).collect();
            assert_eq!(got, want, "full scan diverged at step {}", step);
        }
    }

    let lo = rng.gen_range(0..200);
    let hi = lo + rng.gen_range(0..200);
    let got = tree.range(lo, hi).unwrap();
    let want: Vec<(u32, u64)> = shadow
        .range(lo..hi)
        .map(|(&k, &v)| (k, v))
        .collect();
    assert_eq!(got, want);

    tree.close().unwrap();
    check_file(&path, &shadow);

    let mut reopened = Tree::open(&path, 128).unwrap();
    for key in 0..400u32 {
        assert_eq!(reopened.search(&key).unwrap(), shadow.get(&key).copied());
    }
}
