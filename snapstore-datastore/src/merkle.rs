//! Merkle tree construction and diffing over a snapshot's file set (§4.6).

use std::collections::{BTreeMap, BTreeSet};

use snapstore_api_types::{DiffEntry, DiffKind};

use crate::hasher::Hasher;
use crate::model::{FileRecord, MerkleNode};

enum Entry {
    File {
        size: u64,
        file_id: i64,
        hash: snapstore_api_types::Digest,
    },
    Dir(BTreeMap<String, Entry>),
}

/// Builds the Merkle tree for a snapshot's files. Children of every
/// directory are sorted by name (guaranteed by `BTreeMap` iteration
/// order); a directory's hash covers `name || 0x00 || hash` for each
/// child in that order, so reordering never happens and the hash is
/// purely a function of the (name, hash) pairs.
pub fn build(files: &[FileRecord]) -> MerkleNode {
    let mut root: BTreeMap<String, Entry> = BTreeMap::new();

    for file in files {
        let components: Vec<&str> = file.path.split('/').filter(|c| !c.is_empty()).collect();
        insert(&mut root, &components, file);
    }

    finalize("", root)
}

fn insert(tree: &mut BTreeMap<String, Entry>, components: &[&str], file: &FileRecord) {
    match components {
        [] => {}
        [leaf] => {
            tree.insert(
                leaf.to_string(),
                Entry::File {
                    size: file.size,
                    file_id: file.file_id,
                    hash: file.content_hash,
                },
            );
        }
        [dir, rest @ ..] => {
            let entry = tree
                .entry(dir.to_string())
                .or_insert_with(|| Entry::Dir(BTreeMap::new()));
            if let Entry::Dir(children) = entry {
                insert(children, rest, file);
            }
            // a path component colliding with a file entry of the same
            // name is a caller bug (two FileRecords can't share a path);
            // silently ignored rather than panicking mid-build.
        }
    }
}

fn finalize(name: &str, tree: BTreeMap<String, Entry>) -> MerkleNode {
    let mut children = Vec::with_capacity(tree.len());
    for (child_name, entry) in tree {
        children.push(match entry {
            Entry::File {
                size,
                file_id,
                hash,
            } => MerkleNode::File {
                name: child_name,
                size,
                file_id,
                hash,
            },
            Entry::Dir(sub) => finalize(&child_name, sub),
        });
    }

    let size = children.iter().map(MerkleNode::size).sum();

    let mut hasher = Hasher::new();
    for child in &children {
        hasher.update(child.name().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(child.hash());
    }

    MerkleNode::Directory {
        name: name.to_string(),
        size,
        children,
        hash: hasher.finish(),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Diffs two Merkle trees, pruning unchanged subtrees. A node whose type
/// changed between snapshots (file ↔ directory) reports as the old node
/// wholesale deleted and the new node wholesale added.
pub fn diff(old_root: &MerkleNode, new_root: &MerkleNode) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    diff_same_path(old_root, new_root, "", &mut out);
    out
}

fn diff_same_path(old: &MerkleNode, new: &MerkleNode, path: &str, out: &mut Vec<DiffEntry>) {
    if old.hash() == new.hash() {
        return;
    }

    match (old, new) {
        (MerkleNode::File { .. }, MerkleNode::File { .. }) => {
            out.push(DiffEntry {
                path: path.to_string(),
                kind: DiffKind::Modified,
            });
        }
        (
            MerkleNode::Directory { children: oc, .. },
            MerkleNode::Directory { children: nc, .. },
        ) => {
            let o_map: BTreeMap<&str, &MerkleNode> =
                oc.iter().map(|n| (n.name(), n)).collect();
            let n_map: BTreeMap<&str, &MerkleNode> =
                nc.iter().map(|n| (n.name(), n)).collect();
            let names: BTreeSet<&str> = o_map.keys().chain(n_map.keys()).copied().collect();

            for name in names {
                let child_path = join(path, name);
                match (o_map.get(name), n_map.get(name)) {
                    (Some(o), Some(n)) => diff_same_path(o, n, &child_path, out),
                    (Some(o), None) => collect_deleted(o, &child_path, out),
                    (None, Some(n)) => collect_added(n, &child_path, out),
                    (None, None) => unreachable!(),
                }
            }
        }
        _ => {
            collect_deleted(old, path, out);
            collect_added(new, path, out);
        }
    }
}

fn collect_added(node: &MerkleNode, path: &str, out: &mut Vec<DiffEntry>) {
    match node {
        MerkleNode::File { .. } => out.push(DiffEntry {
            path: path.to_string(),
            kind: DiffKind::Added,
        }),
        MerkleNode::Directory { children, .. } => {
            for child in children {
                collect_added(child, &join(path, child.name()), out);
            }
        }
    }
}

fn collect_deleted(node: &MerkleNode, path: &str, out: &mut Vec<DiffEntry>) {
    match node {
        MerkleNode::File { .. } => out.push(DiffEntry {
            path: path.to_string(),
            kind: DiffKind::Deleted,
        }),
        MerkleNode::Directory { children, .. } => {
            for child in children {
                collect_deleted(child, &join(path, child.name()), out);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file(path: &str, hash_seed: u8) -> FileRecord {
        FileRecord {
            file_id: 0,
            snapshot_id: 0,
            path: path.to_string(),
            size: 10,
            mtime: 0,
            content_hash: [hash_seed; 32],
            chunk_hashes: vec![[hash_seed; 32]],
            symlink_target: None,
        }
    }

    #[test]
    fn build_is_deterministic_regardless_of_insertion_order() {
        let a = vec![file("dir/b.txt", 2), file("dir/a.txt", 1), file("root.txt", 3)];
        let b = vec![file("root.txt", 3), file("dir/a.txt", 1), file("dir/b.txt", 2)];

        assert_eq!(build(&a).hash(), build(&b).hash());
    }

    #[test]
    fn diff_of_identical_trees_is_empty() {
        let files = vec![file("a.txt", 1), file("dir/b.txt", 2)];
        let tree = build(&files);
        assert!(diff(&tree, &tree).is_empty());
    }

    #[test]
    fn diff_reports_added_deleted_and_modified() {
        let old = build(&[file("keep.txt", 1), file("gone.txt", 2)]);
        let new = build(&[file("keep.txt", 1), file("fresh.txt", 3)]);

        let mut entries = diff(&old, &new);
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            entries,
            vec![
                DiffEntry {
                    path: "fresh.txt".into(),
                    kind: DiffKind::Added,
                },
                DiffEntry {
                    path: "gone.txt".into(),
                    kind: DiffKind::Deleted,
                },
            ]
        );
    }

    #[test]
    fn diff_prunes_unchanged_subtrees() {
        let old = build(&[file("dir/a.txt", 1), file("dir/b.txt", 2), file("top.txt", 9)]);
        let new = build(&[file("dir/a.txt", 1), file("dir/b.txt", 2), file("top.txt", 10)]);

        let entries = diff(&old, &new);
        assert_eq!(
            entries,
            vec![DiffEntry {
                path: "top.txt".into(),
                kind: DiffKind::Modified,
            }]
        );
    }

    #[test]
    fn diff_reports_type_change_as_delete_plus_add() {
        let old = build(&[file("thing", 1)]);
        // "thing" becomes a directory containing "thing/inner"
        let new = build(&[file("thing/inner", 2)]);

        let mut entries = diff(&old, &new);
        entries.sort_by(|a, b| a.path.cmp(&b.path).then(format!("{:?}", a.kind).cmp(&format!("{:?}", b.kind))));

        assert_eq!(
            entries,
            vec![
                DiffEntry {
                    path: "thing".into(),
                    kind: DiffKind::Deleted,
                },
                DiffEntry {
                    path: "thing/inner".into(),
                    kind: DiffKind::Added,
                },
            ]
        );
    }
}
