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

//! Inlines sub-repository trees into a single linear content history
//! (`spec.md` §4.I). The persistent note-backed change cache and batched
//! note writes are grounded on this crate's `operation log` command, which
//! also walks a commit-like graph while consulting and refilling a
//! persistent cache to avoid recomputing work already done in a prior run
//! (`cli/src/commands/operation/log.rs`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{Backend, BackendError, CommitData, Mode, Oid, Signature};
use crate::gitmodules::GitmodulesMap;
use crate::subpath::SubPath;
use crate::tree_builder::Change;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    GitModules(#[from] crate::gitmodules::GitModulesError),
}

/// `meta_sha -> stitched_sha`; `None` records "unstitchable"
/// (`spec.md` §3: `ConvertedNote`).
pub type ConvertedMap = HashMap<Oid, Option<Oid>>;

/// `{path -> new sub sha}` for one meta-commit, cached so a repeated stitch
/// run doesn't recompute the sub-tree diff.
pub type SubChangeCache = HashMap<Oid, BTreeMap<SubPath, Oid>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceNote {
    pub meta_repo_commit: Oid,
    pub submodule_commits: BTreeMap<SubPath, Oid>,
}

/// A path's disposition under the requested stitch: inlined, kept as a
/// gitlink, or dropped entirely (outside `join_root`).
pub enum PathDisposition {
    Inline(SubPath),
    KeepAsSubmodule(SubPath),
    Drop,
}

pub trait StitchPolicy: Send + Sync {
    fn adjust_path(&self, path: &SubPath) -> Option<SubPath>;
    fn keep_as_submodule(&self, path: &SubPath) -> bool;
    fn skip_empty(&self) -> bool {
        true
    }
}

fn disposition(policy: &dyn StitchPolicy, path: &SubPath) -> PathDisposition {
    match policy.adjust_path(path) {
        None => PathDisposition::Drop,
        Some(adjusted) if policy.keep_as_submodule(path) => PathDisposition::KeepAsSubmodule(adjusted),
        Some(adjusted) => PathDisposition::Inline(adjusted),
    }
}

/// Notes refs the engine reads/writes, per `spec.md` §6.
pub const CONVERTED_NOTES_REF: &str = "refs/notes/stitched/converted";
pub const REFERENCE_NOTES_REF: &str = "refs/notes/stitched/reference";
pub const CHANGE_CACHE_NOTES_REF: &str = "refs/notes/stitched/submodule-change-cache";

const NOTE_BATCH_SIZE: usize = 10_000;

/// Step 1: ancestors of `target` not already converted, topologically
/// sorted by generation (oldest/most-root first), tie-broken by sha.
pub async fn list_unconverted_ancestors(
    backend: &dyn Backend,
    target: &Oid,
    converted: &ConvertedMap,
) -> Result<Vec<Oid>, StitchError> {
    let mut frontier = vec![target.clone()];
    let mut seen = HashSet::new();
    let mut unconverted = Vec::new();
    while let Some(commit) = frontier.pop() {
        if converted.contains_key(&commit) || !seen.insert(commit.clone()) {
            continue;
        }
        unconverted.push(commit.clone());
        frontier.extend(backend.parents(&commit).await?);
    }

    let mut with_gen = Vec::new();
    for commit in unconverted {
        with_gen.push((generation(backend, &commit, converted).await?, commit));
    }
    with_gen.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(with_gen.into_iter().map(|(_, oid)| oid).collect())
}

fn generation<'a>(
    backend: &'a dyn Backend,
    commit: &'a Oid,
    converted: &'a ConvertedMap,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32, StitchError>> + Send + 'a>> {
    Box::pin(async move {
        let parents = backend.parents(commit).await?;
        let unconverted_parents: Vec<&Oid> = parents.iter().filter(|p| !converted.contains_key(*p)).collect();
        if unconverted_parents.is_empty() {
            return Ok(0);
        }
        let mut max = 0;
        for parent in unconverted_parents {
            max = max.max(generation(backend, parent, converted).await?);
        }
        Ok(max + 1)
    })
}

/// Step 2: per-commit sub-changes (new sha per changed path), filled from
/// `cache` where present and computed (then cached) otherwise.
pub async fn sub_changes_for(
    backend: &dyn Backend,
    commit: &Oid,
    cache: &mut SubChangeCache,
) -> Result<BTreeMap<SubPath, Oid>, StitchError> {
    if let Some(cached) = cache.get(commit) {
        return Ok(cached.clone());
    }
    let commit_data = backend.read_commit(commit).await?;
    let parent_tree = if let Some(parent) = commit_data.parents.first() {
        Some(backend.read_commit(parent).await?.tree)
    } else {
        None
    };
    let mut gitlinks = BTreeMap::new();
    collect_gitlinks(backend, &commit_data.tree, parent_tree.as_ref(), String::new(), &mut gitlinks).await?;
    cache.insert(commit.clone(), gitlinks.clone());
    Ok(gitlinks)
}

fn collect_gitlinks<'a>(
    backend: &'a dyn Backend,
    tree: &'a Oid,
    parent_tree: Option<&'a Oid>,
    prefix: String,
    out: &'a mut BTreeMap<SubPath, Oid>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StitchError>> + Send + 'a>> {
    Box::pin(async move {
        let entries = backend.read_tree(tree).await?;
        let parent_entries: BTreeMap<String, (Mode, Oid)> = if let Some(parent) = parent_tree {
            backend.read_tree(parent).await?.into_iter().map(|e| (e.name, (e.mode, e.oid))).collect()
        } else {
            BTreeMap::new()
        };
        for entry in entries {
            let path_str = if prefix.is_empty() { entry.name.clone() } else { format!("{prefix}/{}", entry.name) };
            match entry.mode {
                Mode::Gitlink => {
                    let unchanged = parent_entries.get(&entry.name).is_some_and(|(m, o)| *m == Mode::Gitlink && *o == entry.oid);
                    if !unchanged {
                        out.insert(SubPath::new(path_str).expect("flattened tree path is valid"), entry.oid);
                    }
                }
                Mode::Tree => {
                    let sub_parent = parent_entries.get(&entry.name).and_then(|(m, o)| (*m == Mode::Tree).then(|| o.clone()));
                    collect_gitlinks(backend, &entry.oid, sub_parent.as_ref(), path_str, out).await?;
                }
                _ => {}
            }
        }
        Ok(())
    })
}

/// Step 3 (optional): protects every to-be-inlined sub sha from GC with a
/// synthetic ref. Fetch failures are logged by the caller and treated as
/// "this commit becomes unstitchable", not propagated as a hard error.
pub async fn protect_fetched_shas(
    sub_backend: &dyn Backend,
    shas: &[Oid],
) -> Vec<(Oid, Result<(), BackendError>)> {
    let mut results = Vec::new();
    for sha in shas {
        let outcome = sub_backend.set_ref(&crate::synthetic_ref::synthetic_ref_name(sha), sha, true).await;
        results.push((sha.clone(), outcome));
    }
    results
}

/// Step 4: stitches one commit given its (already-converted) mapped
/// parents and a way to resolve each changed sub path's backend.
pub async fn stitch_commit(
    meta_backend: &dyn Backend,
    sub_backend_for: &dyn Fn(&SubPath) -> Option<Arc<dyn Backend>>,
    policy: &dyn StitchPolicy,
    commit: &Oid,
    stitched_parents: &[Oid],
    sub_changes: &BTreeMap<SubPath, Oid>,
    kept_gitmodules: &mut GitmodulesMap,
) -> Result<Option<(Oid, BTreeMap<SubPath, Oid>)>, StitchError> {
    let commit_data = meta_backend.read_commit(commit).await?;
    let mut changes: BTreeMap<SubPath, Change> = BTreeMap::new();
    let mut submodule_commits = BTreeMap::new();
    let mut kept_changed = false;

    for (path, sub_sha) in sub_changes {
        match disposition(policy, path) {
            PathDisposition::Drop => {}
            PathDisposition::KeepAsSubmodule(adjusted) => {
                // `kept_gitmodules` is expected to already carry this path's
                // URL (copied forward by the caller from the original
                // `.gitmodules` map); we only touch the gitlink entry.
                changes.insert(adjusted.clone(), Some((Mode::Gitlink, sub_sha.clone())));
                kept_changed = true;
            }
            PathDisposition::Inline(adjusted) => {
                let Some(sub_backend) = sub_backend_for(path) else {
                    continue; // unresolvable sub: caller records this commit unstitchable.
                };
                let sub_commit = sub_backend.read_commit(sub_sha).await.map_err(StitchError::Backend)?;
                changes.insert(adjusted.clone(), Some((Mode::Tree, sub_commit.tree)));
                submodule_commits.insert(path.clone(), sub_sha.clone());
            }
        }
    }

    if kept_changed {
        changes.insert(crate::gitmodules::gitmodules_path(), Some((Mode::File, meta_backend.write_blob(&kept_gitmodules.serialize()).await?)));
    }

    let first_parent_tree = if let Some(parent) = stitched_parents.first() {
        Some(meta_backend.read_commit(parent).await?.tree)
    } else {
        None
    };
    let new_tree = crate::tree_builder::write_tree(meta_backend, first_parent_tree.as_ref(), changes).await?;

    if policy.skip_empty() {
        if let (Some(parent), Some(parent_tree)) = (stitched_parents.first(), &first_parent_tree) {
            if new_tree == *parent_tree {
                return Ok(Some((parent.clone(), submodule_commits)));
            }
        }
        if stitched_parents.is_empty() && meta_backend.read_tree(&new_tree).await?.is_empty() {
            return Ok(None);
        }
    }

    let message = compose_message(meta_backend, &commit_data, sub_changes, sub_backend_for).await?;
    let stitched = meta_backend
        .write_commit(&CommitData {
            tree: new_tree,
            parents: stitched_parents.to_vec(),
            author: commit_data.author,
            committer: commit_data.committer,
            message,
            encoding: commit_data.encoding,
        })
        .await?;
    Ok(Some((stitched, submodule_commits)))
}

async fn compose_message(
    _meta_backend: &dyn Backend,
    commit_data: &CommitData,
    sub_changes: &BTreeMap<SubPath, Oid>,
    sub_backend_for: &dyn Fn(&SubPath) -> Option<Arc<dyn Backend>>,
) -> Result<String, StitchError> {
    let mut message = commit_data.message.clone();
    for (path, sha) in sub_changes {
        let Some(sub_backend) = sub_backend_for(path) else { continue };
        let Ok(sub_commit) = sub_backend.read_commit(sha).await else { continue };
        if differs(&commit_data.author, &sub_commit.author) || commit_data.message != sub_commit.message {
            message.push_str(&format!("\n\nFrom '{path}':\n{}", sub_commit.message));
        }
    }
    Ok(message)
}

fn differs(a: &Signature, b: &Signature) -> bool {
    a.name != b.name || a.email != b.email || a.timestamp != b.timestamp
}

/// Batches note writes, flushing every [`NOTE_BATCH_SIZE`] records or at
/// the end of the run (`spec.md` §4.I step 5).
pub struct NoteBatcher<'a> {
    backend: &'a dyn Backend,
    notes_ref: &'a str,
    pending: usize,
}

impl<'a> NoteBatcher<'a> {
    pub fn new(backend: &'a dyn Backend, notes_ref: &'a str) -> Self {
        NoteBatcher { backend, notes_ref, pending: 0 }
    }

    pub async fn write(&mut self, key: &Oid, value: &[u8]) -> Result<(), StitchError> {
        self.backend.notes_write(self.notes_ref, key, value).await?;
        self.pending += 1;
        Ok(())
    }

    pub fn should_flush(&self) -> bool {
        self.pending >= NOTE_BATCH_SIZE
    }

    pub fn reset(&mut self) {
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn sig() -> Signature {
        Signature { name: "t".into(), email: "t@example.com".into(), timestamp: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap() }
    }

    struct InlineEverything;
    impl StitchPolicy for InlineEverything {
        fn adjust_path(&self, path: &SubPath) -> Option<SubPath> {
            Some(path.clone())
        }
        fn keep_as_submodule(&self, _path: &SubPath) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn list_unconverted_ancestors_excludes_converted_commits() {
        let backend = MemoryBackend::new();
        let tree = backend.write_tree(&[]).await.unwrap();
        let root = backend
            .write_commit(&CommitData { tree: tree.clone(), parents: vec![], author: sig(), committer: sig(), message: "root".into(), encoding: None })
            .await
            .unwrap();
        let child = backend
            .write_commit(&CommitData { tree, parents: vec![root.clone()], author: sig(), committer: sig(), message: "child".into(), encoding: None })
            .await
            .unwrap();

        let mut converted = ConvertedMap::new();
        converted.insert(root.clone(), Some(root.clone()));
        let unconverted = list_unconverted_ancestors(&backend, &child, &converted).await.unwrap();
        assert_eq!(unconverted, vec![child]);
    }

    #[tokio::test]
    async fn stitch_commit_inlines_submodule_tree() {
        let meta = MemoryBackend::new();
        let sub: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let sub_blob = sub.write_blob(b"sub contents").await.unwrap();
        let sub_tree = sub
            .write_tree(&[crate::backend::TreeEntry { name: "file".into(), mode: Mode::File, oid: sub_blob }])
            .await
            .unwrap();
        let sub_commit = sub
            .write_commit(&CommitData { tree: sub_tree, parents: vec![], author: sig(), committer: sig(), message: "sub change".into(), encoding: None })
            .await
            .unwrap();

        let meta_tree = meta
            .write_tree(&[crate::backend::TreeEntry { name: "vendor".into(), mode: Mode::Gitlink, oid: sub_commit.clone() }])
            .await
            .unwrap();
        let meta_commit = meta
            .write_commit(&CommitData { tree: meta_tree, parents: vec![], author: sig(), committer: sig(), message: "pin vendor".into(), encoding: None })
            .await
            .unwrap();

        let path = SubPath::new("vendor").unwrap();
        let mut sub_changes = BTreeMap::new();
        sub_changes.insert(path.clone(), sub_commit);
        let sub_for_path = sub.clone();
        let lookup = move |p: &SubPath| -> Option<Arc<dyn Backend>> { if *p == path { Some(sub_for_path.clone()) } else { None } };

        let mut kept = GitmodulesMap::new();
        let policy = InlineEverything;
        let (stitched, submodule_commits) = stitch_commit(&meta, &lookup, &policy, &meta_commit, &[], &sub_changes, &mut kept)
            .await
            .unwrap()
            .unwrap();
        let stitched_commit = meta.read_commit(&stitched).await.unwrap();
        let entries = meta.read_tree(&stitched_commit.tree).await.unwrap();
        let vendor = entries.iter().find(|e| e.name == "vendor").unwrap();
        assert_eq!(vendor.mode, Mode::Tree);
        assert_eq!(submodule_commits.len(), 1);
    }
}
