// Copyright 2021 The Jujutsu Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bulk, deterministic tree rewrite from a change-set (`spec.md` §4.C,
//! `write_tree`). Grounded on the accumulate-then-rewrite-once pattern in
//! this crate's `fix.rs` (`MergedTreeBuilder`/`tree_builder.write_tree()`
//! called once per commit after collecting every path's new value), scaled
//! from a single-parent merged tree to the plain backend trees this crate
//! operates on.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::backend::{Backend, BackendError, Mode, Oid, TreeEntry};
use crate::error::InvariantViolation;
use crate::subpath::SubPath;

/// `None` means delete at that path.
pub type Change = Option<(Mode, Oid)>;

#[derive(Default)]
struct DirChanges {
    leaf: BTreeMap<String, Change>,
    sub: BTreeMap<String, DirChanges>,
}

fn group_changes(changes: BTreeMap<SubPath, Change>) -> DirChanges {
    let mut root = DirChanges::default();
    for (path, change) in changes {
        let mut components: Vec<&str> = path.components().collect();
        let leaf_name = components.pop().expect("SubPath always has >=1 component");
        let mut dir = &mut root;
        for component in components {
            dir = dir.sub.entry(component.to_owned()).or_default();
        }
        dir.leaf.insert(leaf_name.to_owned(), change);
    }
    root
}

type BoxedTreeFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Oid>, BackendError>> + Send + 'a>>;

/// Rewrites one directory level and everything below it. Returns `None` if
/// the resulting tree is empty, signaling the caller to remove this
/// directory's entry from its own parent (`spec.md` §4.C: "a directory
/// becoming an empty tree is removed from its parent").
fn write_dir<'a>(
    backend: &'a dyn Backend,
    base: Option<&'a Oid>,
    changes: &'a DirChanges,
) -> BoxedTreeFuture<'a> {
    Box::pin(async move {
        let mut entries: BTreeMap<String, TreeEntry> = BTreeMap::new();
        if let Some(base_oid) = base {
            for entry in backend.read_tree(base_oid).await? {
                entries.insert(entry.name.clone(), entry);
            }
        }

        for (name, change) in &changes.leaf {
            if changes.sub.contains_key(name) {
                panic!(
                    "{}",
                    InvariantViolation(format!(
                        "path {name:?} is targeted as both a file and a directory in the same \
                         write_tree call"
                    ))
                );
            }
            match change {
                Some((mode, oid)) => {
                    entries.insert(
                        name.clone(),
                        TreeEntry {
                            name: name.clone(),
                            mode: *mode,
                            oid: oid.clone(),
                        },
                    );
                }
                None => {
                    entries.remove(name);
                }
            }
        }

        for (name, sub_changes) in &changes.sub {
            let sub_base = entries.get(name).and_then(|entry| {
                if entry.mode == Mode::Tree {
                    Some(entry.oid.clone())
                } else {
                    None
                }
            });
            let new_sub = write_dir(backend, sub_base.as_ref(), sub_changes).await?;
            match new_sub {
                Some(oid) => {
                    entries.insert(
                        name.clone(),
                        TreeEntry {
                            name: name.clone(),
                            mode: Mode::Tree,
                            oid,
                        },
                    );
                }
                None => {
                    entries.remove(name);
                }
            }
        }

        if entries.is_empty() {
            return Ok(None);
        }
        let ordered: Vec<TreeEntry> = entries.into_values().collect();
        Ok(Some(backend.write_tree(&ordered).await?))
    })
}

/// Builds a new tree from `base_tree` (or an empty tree, if `None`) plus
/// `changes`. Deterministic: subtree children are always written in
/// name-sorted order regardless of iteration order of the input map.
pub async fn write_tree(
    backend: &dyn Backend,
    base_tree: Option<&Oid>,
    changes: BTreeMap<SubPath, Change>,
) -> Result<Oid, BackendError> {
    let dir_changes = group_changes(changes);
    match write_dir(backend, base_tree, &dir_changes).await? {
        Some(oid) => Ok(oid),
        None => backend.write_tree(&[]).await,
    }
}
