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

//! Inverse of [`crate::stitch`] (`spec.md` §4.J): given a stitched commit,
//! reconstructs a meta-commit plus one new sub-commit per changed sub path.
//! Shares `stitch.rs`'s walk-to-known-mapping shape, since both engines are
//! the same "walk back to a cached boundary, then replay forward" pattern
//! over a commit DAG.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{Backend, BackendError, CommitData, Mode, Oid, Signature};
use crate::gitmodules::GitmodulesMap;
use crate::subpath::SubPath;
use crate::synthetic_ref::{push_synthetic_refs, ReferencedSub, SyntheticRefError};
use crate::tree_builder::Change;

#[derive(Debug, Error)]
pub enum DestitchError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no sub-repository configured at {0} to destitch a change under it")]
    UnknownSubPath(SubPath),
    #[error(transparent)]
    SyntheticRef(#[from] SyntheticRefError),
}

/// `stitched_sha -> {metaRepoCommit, submoduleCommits}` (`spec.md` §3:
/// `ReferenceNote`, reused here keyed the other direction), persisted under
/// `refs/notes/git-meta/destitched`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestitchedMapping {
    pub meta_repo_commit: Oid,
    pub submodule_commits: BTreeMap<SubPath, Oid>,
}

pub type DestitchedMap = std::collections::HashMap<Oid, DestitchedMapping>;

pub const DESTITCHED_NOTES_REF: &str = "refs/notes/git-meta/destitched";

/// A sub-repository path known at a point in (destitched) history: which
/// prefix in the stitched tree it corresponds to, and where its previously
/// destitched commit (or, on first occurrence, its existing remote sha)
/// lives.
#[derive(Debug, Clone)]
pub struct KnownSub {
    pub path: SubPath,
    pub previous_sha: Oid,
}

/// Step 1: walk from `commit` back until a commit with a known destitched
/// mapping, oldest-first.
pub async fn walk_to_known_mapping(
    backend: &dyn Backend,
    commit: &Oid,
    known: &DestitchedMap,
) -> Result<Vec<Oid>, DestitchError> {
    let mut chain = Vec::new();
    let mut current = commit.clone();
    loop {
        if known.contains_key(&current) {
            break;
        }
        chain.push(current.clone());
        let parents = backend.parents(&current).await?;
        match parents.into_iter().next() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    chain.reverse();
    Ok(chain)
}

/// Step 2: changed sub paths for `commit`, matched against the currently
/// known sub-config path prefixes by diffing its tree against its first
/// parent's.
pub async fn changed_sub_paths(
    backend: &dyn Backend,
    commit: &Oid,
    known_subs: &[KnownSub],
) -> Result<Vec<(SubPath, Oid)>, DestitchError> {
    let commit_data = backend.read_commit(commit).await?;
    let parent_tree = if let Some(parent) = commit_data.parents.first() {
        Some(backend.read_commit(parent).await?.tree)
    } else {
        None
    };
    let mut changed = Vec::new();
    for sub in known_subs {
        let new_tree = read_prefix_tree(backend, &commit_data.tree, &sub.path).await?;
        let old_tree = match &parent_tree {
            Some(tree) => read_prefix_tree(backend, tree, &sub.path).await?,
            None => None,
        };
        if new_tree != old_tree {
            if let Some(tree) = new_tree {
                changed.push((sub.path.clone(), tree));
            }
        }
    }
    Ok(changed)
}

async fn read_prefix_tree(backend: &dyn Backend, tree: &Oid, path: &SubPath) -> Result<Option<Oid>, BackendError> {
    let mut current = tree.clone();
    for component in path.components() {
        let entries = backend.read_tree(&current).await?;
        let Some(entry) = entries.into_iter().find(|e| e.name == component) else {
            return Ok(None);
        };
        if entry.mode != Mode::Tree {
            return Ok(None);
        }
        current = entry.oid;
    }
    Ok(Some(current))
}

/// Step 3: creates a new sub-commit on top of `known.previous_sha` whose
/// tree is `new_subtree`, with the original commit's author/committer
/// and a message noting which meta-commit produced it.
pub async fn make_sub_commit(
    sub_backend: &dyn Backend,
    known: &KnownSub,
    new_subtree: &Oid,
    meta_commit_data: &CommitData,
) -> Result<Oid, DestitchError> {
    sub_backend
        .write_commit(&CommitData {
            tree: new_subtree.clone(),
            parents: vec![known.previous_sha.clone()],
            author: meta_commit_data.author.clone(),
            committer: meta_commit_data.committer.clone(),
            message: meta_commit_data.message.clone(),
            encoding: meta_commit_data.encoding.clone(),
        })
        .await
        .map_err(DestitchError::Backend)
}

/// Step 4: builds the meta-commit's tree, re-inserting a gitlink at each
/// affected path pointing at its new sub-commit, on top of `meta_parent`'s
/// tree (or empty, for the first destitched commit).
pub async fn build_meta_commit(
    meta_backend: &dyn Backend,
    meta_parent_tree: Option<&Oid>,
    meta_parents: Vec<Oid>,
    new_sub_commits: &BTreeMap<SubPath, Oid>,
    stitched_commit_data: &CommitData,
) -> Result<Oid, DestitchError> {
    let changes: BTreeMap<SubPath, Change> =
        new_sub_commits.iter().map(|(path, sha)| (path.clone(), Some((Mode::Gitlink, sha.clone())))).collect();
    let tree = crate::tree_builder::write_tree(meta_backend, meta_parent_tree, changes).await?;
    let commit = meta_backend
        .write_commit(&CommitData {
            tree,
            parents: meta_parents,
            author: stitched_commit_data.author.clone(),
            committer: stitched_commit_data.committer.clone(),
            message: stitched_commit_data.message.clone(),
            encoding: stitched_commit_data.encoding.clone(),
        })
        .await?;
    Ok(commit)
}

/// Runs steps 1–4 for `commit`, given a resolver from sub path to its
/// backend and a table of currently-known subs. Returns the new meta-commit
/// and, for each destitched commit along the walk, its
/// [`DestitchedMapping`] (for the caller to record under
/// [`DESTITCHED_NOTES_REF`] and push synthetic refs for).
pub async fn destitch(
    meta_backend: &dyn Backend,
    sub_backend_for: impl Fn(&SubPath) -> Option<Arc<dyn Backend>>,
    commit: &Oid,
    known: &DestitchedMap,
    known_subs: &[KnownSub],
) -> Result<Vec<(Oid, DestitchedMapping, Oid)>, DestitchError> {
    let chain = walk_to_known_mapping(meta_backend, commit, known).await?;
    let mut mappings = Vec::new();
    let mut previous_by_path: BTreeMap<SubPath, Oid> =
        known_subs.iter().map(|s| (s.path.clone(), s.previous_sha.clone())).collect();
    let mut previous_meta_commit: Option<Oid> = None;

    for stitched in &chain {
        let commit_data = meta_backend.read_commit(stitched).await?;
        let current_known: Vec<KnownSub> = previous_by_path
            .iter()
            .map(|(path, sha)| KnownSub { path: path.clone(), previous_sha: sha.clone() })
            .collect();
        let changed = changed_sub_paths(meta_backend, stitched, &current_known).await?;

        let mut new_sub_commits = BTreeMap::new();
        for (path, new_subtree) in changed {
            let previous_sha = previous_by_path
                .get(&path)
                .cloned()
                .ok_or_else(|| DestitchError::UnknownSubPath(path.clone()))?;
            let sub_backend = sub_backend_for(&path).ok_or_else(|| DestitchError::UnknownSubPath(path.clone()))?;
            let new_sha = make_sub_commit(sub_backend.as_ref(), &KnownSub { path: path.clone(), previous_sha }, &new_subtree, &commit_data).await?;
            previous_by_path.insert(path.clone(), new_sha.clone());
            new_sub_commits.insert(path, new_sha);
        }

        let meta_parent_tree = match previous_meta_commit.as_ref() {
            Some(parent) => Some(meta_backend.read_commit(parent).await?.tree),
            None => None,
        };
        let meta_parents = previous_meta_commit.clone().into_iter().collect();
        let meta_commit = build_meta_commit(meta_backend, meta_parent_tree.as_ref(), meta_parents, &new_sub_commits, &commit_data).await?;

        mappings.push((
            stitched.clone(),
            DestitchedMapping { meta_repo_commit: meta_commit.clone(), submodule_commits: new_sub_commits },
            meta_commit.clone(),
        ));
        previous_meta_commit = Some(meta_commit);
    }

    Ok(mappings)
}

/// Step 5 plus steps 1–4: runs [`destitch`], then for each destitched
/// commit records its [`DestitchedMapping`] as a note under
/// [`DESTITCHED_NOTES_REF`] on `meta_backend` and pushes a synthetic ref
/// for every new sub-commit from the sub's own backend, so the new commit
/// is reachable at its hosting remote before anything can reference it.
pub async fn destitch_and_publish(
    meta_backend: &dyn Backend,
    sub_backend_for: impl Fn(&SubPath) -> Option<Arc<dyn Backend>>,
    commit: &Oid,
    known: &DestitchedMap,
    known_subs: &[KnownSub],
    gitmodules: &GitmodulesMap,
    meta_remote_url: &str,
) -> Result<Vec<(Oid, DestitchedMapping, Oid)>, DestitchError> {
    let mappings = destitch(meta_backend, &sub_backend_for, commit, known, known_subs).await?;

    for (stitched_sha, mapping, _meta_commit) in &mappings {
        let encoded = serde_json::to_vec(mapping).expect("DestitchedMapping always serializes");
        meta_backend.notes_write(DESTITCHED_NOTES_REF, stitched_sha, &encoded).await?;

        for (path, sub_sha) in &mapping.submodule_commits {
            let sub_backend = sub_backend_for(path).ok_or_else(|| DestitchError::UnknownSubPath(path.clone()))?;
            push_synthetic_refs(
                sub_backend.as_ref(),
                gitmodules,
                meta_remote_url,
                &[],
                &[ReferencedSub { path: path.clone(), sha: sub_sha.clone() }],
            )
            .await?;
        }
    }

    Ok(mappings)
}
