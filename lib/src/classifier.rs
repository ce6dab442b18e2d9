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

//! Diffs two meta-trees, via a conflicted index, into simple changes,
//! sub-internal changes, and genuine conflicts (`spec.md` §4.E). Grounded
//! on this crate's `fix.rs` pattern of scanning a tree once and bucketing
//! paths by what kind of rewrite they need before doing any of the actual
//! rewriting.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::backend::{Backend, BackendError, Mode, Oid};
use crate::gitmodules::{self, GitModulesError, GitmodulesMap};
use crate::index::{ConflictSides, Index};
use crate::subpath::SubPath;

/// One sub-repository's old/new/ancestor pinned commit, produced by
/// classification (`spec.md` §3: `SubmoduleChange`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleChange {
    pub path: SubPath,
    pub old_sha: Oid,
    pub new_sha: Oid,
    pub ancestor_sha: Option<Oid>,
}

/// A change to an ordinary (non-submodule) path: `None` is a deletion,
/// `Some` an addition or update (mode/oid).
pub type SimpleChange = Option<(Mode, Oid)>;

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub simple_changes: BTreeMap<SubPath, SimpleChange>,
    pub sub_changes: Vec<SubmoduleChange>,
    pub conflicts: Vec<SubPath>,
    pub urls: GitmodulesMap,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error(transparent)]
    GitModules(#[from] GitModulesError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("url for {path} changed from {old:?} to {new:?}; URL changes are not currently supported")]
    UrlChangeRefused { path: SubPath, old: String, new: String },
}

/// URL-change refusal (`spec.md` §4.E): before classification, compare the
/// `.gitmodules` blobs at the operation's two endpoints; any path present on
/// both sides with a different URL is a fatal operation error.
pub fn refuse_url_changes(ours: &GitmodulesMap, theirs: &GitmodulesMap) -> Result<(), ClassifierError> {
    for entry in ours.iter() {
        if let Some(other) = theirs.get(&entry.path) {
            if other.url != entry.url {
                return Err(ClassifierError::UrlChangeRefused {
                    path: entry.path.clone(),
                    old: entry.url.clone(),
                    new: other.url.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Classifies a merge-conflicted `index` against `target_tree` (`spec.md`
/// §4.E). `head` and `target` are the two commits the merge-base workaround
/// needs to probe.
pub async fn classify(
    backend: &dyn Backend,
    index: &mut Index,
    target_tree: &Oid,
    head: &Oid,
    target: &Oid,
) -> Result<Classification, ClassifierError> {
    apply_merge_base_workaround(backend, index, head, target).await?;

    let gitmodules_path = gitmodules::gitmodules_path();
    let mut sub_changes = Vec::new();
    let mut conflicts = Vec::new();
    let mut urls: Option<GitmodulesMap> = None;

    let conflicted_paths: Vec<(SubPath, ConflictSides)> =
        index.conflicts().map(|(p, sides)| (p.clone(), sides)).collect();

    for (path, sides) in &conflicted_paths {
        if *path == gitmodules_path {
            let ancestor_blob = match &sides.ancestor {
                Some((_, oid)) => Some(backend.read_blob(oid).await?),
                None => None,
            };
            let ours_blob = match &sides.ours {
                Some((_, oid)) => backend.read_blob(oid).await?,
                None => Vec::new(),
            };
            let theirs_blob = match &sides.theirs {
                Some((_, oid)) => backend.read_blob(oid).await?,
                None => Vec::new(),
            };
            urls = Some(gitmodules::resolve_module_file_conflicts(
                ancestor_blob.as_deref(),
                &ours_blob,
                &theirs_blob,
            )?);
            continue;
        }

        let all_gitlinks = [&sides.ours, &sides.theirs]
            .into_iter()
            .flatten()
            .all(|(mode, _)| *mode == Mode::Gitlink);
        if sides.ours.is_some() && sides.theirs.is_some() && all_gitlinks {
            let (_, ours_oid) = sides.ours.as_ref().unwrap();
            let (_, theirs_oid) = sides.theirs.as_ref().unwrap();
            sub_changes.push(SubmoduleChange {
                path: path.clone(),
                old_sha: ours_oid.clone(),
                new_sha: theirs_oid.clone(),
                ancestor_sha: sides.ancestor.as_ref().map(|(_, oid)| oid.clone()),
            });
        } else {
            conflicts.push(path.clone());
        }
    }

    index.conflict_cleanup();
    let base_tree = None; // conflict_cleanup leaves a flat set of Normal entries; rebuild from scratch.
    let changes: BTreeMap<SubPath, SimpleChange> = index
        .iter()
        .map(|(path, entries)| {
            let entry = entries.iter().find(|e| e.stage == crate::index::Stage::Normal);
            (path.clone(), entry.map(|e| (e.mode, e.oid.clone())))
        })
        .collect();
    let new_tree_oid = crate::tree_builder::write_tree(backend, base_tree, changes).await?;

    let mut simple_changes = BTreeMap::new();
    diff_trees(backend, Some(&new_tree_oid), Some(target_tree), String::new(), &mut simple_changes).await?;
    let sub_change_paths: std::collections::HashSet<&SubPath> = sub_changes.iter().map(|c| &c.path).collect();
    let conflict_paths: std::collections::HashSet<&SubPath> = conflicts.iter().collect();
    simple_changes.retain(|path, _| !sub_change_paths.contains(path) && !conflict_paths.contains(path));

    Ok(Classification {
        simple_changes,
        sub_changes,
        conflicts,
        urls: urls.unwrap_or_default(),
    })
}

/// §4.E step 2: for any path with only {ours, theirs}, both gitlinks, try
/// each merge-base between `head`/`target`; if one's tree contains that
/// path at a sha different from `theirs`, synthesize it as the ancestor.
/// Prevents libgit2-style merge drivers from misreporting an ordinary
/// modify/modify as an add/add conflict (`spec.md` §9).
async fn apply_merge_base_workaround(
    backend: &dyn Backend,
    index: &mut Index,
    head: &Oid,
    target: &Oid,
) -> Result<(), ClassifierError> {
    let candidates = backend.merge_bases(head, target).await?;
    let ambiguous: Vec<(SubPath, Oid)> = index
        .conflicts()
        .filter_map(|(path, sides)| {
            if sides.ancestor.is_some() {
                return None;
            }
            match (&sides.ours, &sides.theirs) {
                (Some((m1, _)), Some((m2, theirs_oid))) if *m1 == Mode::Gitlink && *m2 == Mode::Gitlink => {
                    Some((path.clone(), theirs_oid.clone()))
                }
                _ => None,
            }
        })
        .collect();

    for (path, theirs_oid) in ambiguous {
        for base in &candidates {
            let base_commit = backend.read_commit(base).await?;
            if let Some(found) = find_in_tree(backend, &base_commit.tree, &path).await? {
                if found.1 != theirs_oid {
                    let sides = index.conflicts().find(|(p, _)| **p == path).map(|(_, s)| s).unwrap();
                    index.conflict_add(path.clone(), Some(found), sides.ours, sides.theirs);
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn find_in_tree(backend: &dyn Backend, tree: &Oid, path: &SubPath) -> Result<Option<(Mode, Oid)>, BackendError> {
    let mut current = tree.clone();
    let components: Vec<&str> = path.components().collect();
    for (idx, component) in components.iter().enumerate() {
        let entries = backend.read_tree(&current).await?;
        let Some(entry) = entries.into_iter().find(|e| e.name == *component) else {
            return Ok(None);
        };
        if idx == components.len() - 1 {
            return Ok(Some((entry.mode, entry.oid)));
        }
        if entry.mode != Mode::Tree {
            return Ok(None);
        }
        current = entry.oid;
    }
    Ok(None)
}

/// Recursive leaf-level diff of two optional trees into a flat path map,
/// `None` on a side meaning "absent". Reused from the same flattening
/// pattern `MemoryBackend::merge_commits` uses for its own 3-way diff.
fn diff_trees<'a>(
    backend: &'a dyn Backend,
    old: Option<&'a Oid>,
    new: Option<&'a Oid>,
    prefix: String,
    out: &'a mut BTreeMap<SubPath, SimpleChange>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BackendError>> + Send + 'a>> {
    Box::pin(async move {
        let mut old_entries: BTreeMap<String, (Mode, Oid)> = BTreeMap::new();
        let mut new_entries: BTreeMap<String, (Mode, Oid)> = BTreeMap::new();
        if let Some(old) = old {
            for e in backend.read_tree(old).await? {
                old_entries.insert(e.name, (e.mode, e.oid));
            }
        }
        if let Some(new) = new {
            for e in backend.read_tree(new).await? {
                new_entries.insert(e.name, (e.mode, e.oid));
            }
        }
        let mut names: Vec<&String> = old_entries.keys().chain(new_entries.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            let path_str = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            let old_val = old_entries.get(name);
            let new_val = new_entries.get(name);
            match (old_val, new_val) {
                (Some((m1, o1)), Some((m2, o2))) if m1 == m2 && o1 == o2 => {}
                (Some((Mode::Tree, old_oid)), Some((Mode::Tree, new_oid))) => {
                    diff_trees(backend, Some(old_oid), Some(new_oid), path_str, out).await?;
                }
                (Some((Mode::Tree, old_oid)), None) => {
                    diff_trees(backend, Some(old_oid), None, path_str, out).await?;
                }
                (None, Some((Mode::Tree, new_oid))) => {
                    diff_trees(backend, None, Some(new_oid), path_str, out).await?;
                }
                (_, Some((mode, oid))) => {
                    out.insert(SubPath::new(path_str).expect("flattened tree path is always valid"), Some((*mode, oid.clone())));
                }
                (Some(_), None) => {
                    out.insert(SubPath::new(path_str).expect("flattened tree path is always valid"), None);
                }
                (None, None) => {}
            }
        }
        Ok(())
    })
}
