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

//! Drives a classification's sub-repository rewrites and the final
//! meta-commit (`spec.md` §4.F). The bounded parallel fan-out over
//! independent sub-paths mirrors the `JoinSet` + `Semaphore` pattern this
//! crate's `run` command uses to cap concurrent child processes
//! (`cli/src/commands/run.rs`), narrowed from "run an arbitrary command per
//! revision" to "rewrite one sub-repository's commit range".

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backend::{Backend, BackendError, CommitData, Mode, Oid, Signature};
use crate::classifier::{Classification, SubmoduleChange};
use crate::gitmodules;
use crate::index::Index;
use crate::opener::{OpenPolicy, Opener, OpenerError};
use crate::subpath::SubPath;

/// The result of rewriting one sub-repository (`spec.md` §4.F steps 2–3).
#[derive(Debug, Clone)]
pub struct SubResult {
    pub path: SubPath,
    pub new_sha: Oid,
    /// Set when the rewrite was a plain fast-forward: no new commit, the
    /// sub's history already contained `new_sha` as a descendant.
    pub ffwd: bool,
    /// `new_sub_sha -> original_sub_sha` for every commit this rewrite
    /// produced, in application order.
    pub rewritten: Vec<(Oid, Oid)>,
    /// Set if the rewrite stopped on a conflicted cherry-pick; holds the
    /// original sub commit sha whose pick conflicted.
    pub conflicted_at: Option<Oid>,
    /// Whether this driver run opened the sub itself (used to decide
    /// whether to close it again once finished, per `spec.md` §4.F step 4).
    pub opened_by_driver: bool,
}

impl SubResult {
    pub fn is_conflicted(&self) -> bool {
        self.conflicted_at.is_some()
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Opener(#[from] OpenerError),
    #[error(transparent)]
    Fetch(#[from] crate::error::FetchError),
    #[error(transparent)]
    GitModules(#[from] crate::gitmodules::GitModulesError),
}

/// A single sub-repository commit to replay, supplied by the caller (the
/// driver itself has no opinion on how the range `[old .. new]` was
/// enumerated — that's the backend's `walk_ancestors`/`parents`).
pub type CherryPickFn = dyn for<'a> Fn(
        &'a dyn Backend,
        &'a Oid,
        &'a Oid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CherryPickOutcome, BackendError>> + Send + 'a>>
    + Send
    + Sync;

/// The result of picking one original sub commit onto the sub's current
/// rewritten head.
#[derive(Debug, Clone)]
pub enum CherryPickOutcome {
    Applied(Oid),
    Conflicted,
}

/// Either every sub finished cleanly and the meta-commit was written, or at
/// least one conflicted and the operation is incomplete (`spec.md` §4.F
/// step 5).
#[derive(Debug, Clone)]
pub enum DriveResult {
    Completed { meta_commit: Oid },
    Incomplete { conflicted: Vec<SubResult>, messages: Vec<String> },
}

/// How many sub-repositories the driver rewrites concurrently. Mirrors
/// `num_parallel` in `spec.md` §4.F's "(addition) Concurrency
/// implementation".
pub struct DriveOptions {
    pub num_parallel: usize,
    pub bare: bool,
}

impl Default for DriveOptions {
    fn default() -> Self {
        DriveOptions { num_parallel: 4, bare: false }
    }
}

/// Runs a classification to completion: simple changes first, then the
/// parallel sub-repository rewrites, then (if nothing conflicted) the
/// meta-tree/meta-commit write.
#[allow(clippy::too_many_arguments)]
pub async fn drive(
    meta_backend: &dyn Backend,
    opener: &Arc<Opener>,
    index: &mut Index,
    classification: Classification,
    base_tree: Option<&Oid>,
    parents: Vec<Oid>,
    author: Signature,
    committer: Signature,
    message: String,
    pick: Arc<CherryPickFn>,
    options: DriveOptions,
) -> Result<DriveResult, DriverError> {
    // Step 1-2: simple deletions/additions/fast-forwards go straight into
    // the index; they need no sub-repository work.
    for (path, change) in &classification.simple_changes {
        match change {
            Some((mode, oid)) => index.stage(path.clone(), *mode, oid.clone()),
            None => index.unstage(path),
        }
    }

    // Step 3: rewrite every SubmoduleChange with bounded concurrency.
    let semaphore = Arc::new(Semaphore::new(options.num_parallel.max(1)));
    let mut joinset: JoinSet<Result<SubResult, DriverError>> = JoinSet::new();
    for change in classification.sub_changes.clone() {
        let semaphore = semaphore.clone();
        let opener = opener.clone();
        let pick = pick.clone();
        let bare = options.bare;
        joinset.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            rewrite_sub(opener.as_ref(), change, bare, pick.as_ref()).await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = joinset.join_next().await {
        let result = joined.expect("sub-repository rewrite task never panics")?;
        tracing::debug!(path = %result.path, ffwd = result.ffwd, conflicted = result.is_conflicted(), "sub-repository rewrite finished");
        results.push(result);
    }
    results.sort_by(|a, b| a.path.cmp(&b.path));

    let conflicted: Vec<SubResult> = results.iter().filter(|r| r.is_conflicted()).cloned().collect();
    if !conflicted.is_empty() {
        tracing::info!(count = conflicted.len(), "drive stopping short: sub-repositories conflicted");
    }

    // Stage every rewritten sub's new head, successful or not: a conflicted
    // sub still needs its pinned gitlink set to the attempted new sha so
    // the user's working tree shows the conflict.
    for result in &results {
        index.stage(result.path.clone(), Mode::Gitlink, result.new_sha.clone());
    }

    // Step 4: close subs this driver opened that produced no commits and no
    // conflicts.
    for result in &results {
        if result.opened_by_driver && result.rewritten.is_empty() && !result.is_conflicted() {
            opener.close(&result.path);
        }
    }

    if !classification.urls.is_empty() {
        gitmodules::write_urls(index, meta_backend, &classification.urls).await?;
    }

    if !conflicted.is_empty() {
        let messages = conflicted
            .iter()
            .map(|r| format!("conflict rewriting sub-repository at {}: original commit {}", r.path, r.conflicted_at.as_ref().unwrap()))
            .collect();
        return Ok(DriveResult::Incomplete { conflicted, messages });
    }

    // Step 5: write the meta-tree and meta-commit.
    let changes: BTreeMap<SubPath, Option<(Mode, Oid)>> = index
        .iter()
        .map(|(path, entries)| {
            let entry = entries.iter().find(|e| e.stage == crate::index::Stage::Normal);
            (path.clone(), entry.map(|e| (e.mode, e.oid.clone())))
        })
        .collect();
    let meta_tree = crate::tree_builder::write_tree(meta_backend, base_tree, changes).await?;
    let meta_commit = meta_backend
        .write_commit(&CommitData {
            tree: meta_tree,
            parents,
            author,
            committer,
            message,
            encoding: None,
        })
        .await?;
    tracing::info!(meta_commit = %meta_commit, "drive completed");
    Ok(DriveResult::Completed { meta_commit })
}

async fn rewrite_sub(
    opener: &Opener,
    change: SubmoduleChange,
    bare: bool,
    pick: &CherryPickFn,
) -> Result<SubResult, DriverError> {
    let policy = if bare { OpenPolicy::ForceBare } else { OpenPolicy::LazyOpen };
    let was_open_before = opener.is_open(&change.path);
    let sub_repo = opener.get_subrepo(&change.path, policy, change.old_sha.clone()).await?;
    let opened_by_driver = !bare && !was_open_before && sub_repo.is_open;

    let backend = opener
        .backend_for(&change.path)
        .ok_or_else(|| OpenerError::NotRegistered(change.path.clone()))?;

    let fetcher = opener.fetcher();
    fetcher.fetch_sha(&sub_repo, &change.path, &change.old_sha).await?;
    fetcher.fetch_sha(&sub_repo, &change.path, &change.new_sha).await?;

    if backend.descendant_of(&change.new_sha, &change.old_sha).await? {
        return Ok(SubResult {
            path: change.path,
            new_sha: change.new_sha,
            ffwd: true,
            rewritten: Vec::new(),
            conflicted_at: None,
            opened_by_driver,
        });
    }

    let range = sub_range(backend.as_ref(), &change.ancestor_sha.clone().unwrap_or_else(|| change.old_sha.clone()), &change.new_sha).await?;
    let mut current_head = change.old_sha.clone();
    let mut rewritten = Vec::new();
    for original in range {
        match pick(backend.as_ref(), &current_head, &original).await? {
            CherryPickOutcome::Applied(new_sha) => {
                rewritten.push((new_sha.clone(), original));
                current_head = new_sha;
            }
            CherryPickOutcome::Conflicted => {
                return Ok(SubResult {
                    path: change.path,
                    new_sha: current_head,
                    ffwd: false,
                    rewritten,
                    conflicted_at: Some(original),
                    opened_by_driver,
                });
            }
        }
    }

    Ok(SubResult {
        path: change.path,
        new_sha: current_head,
        ffwd: false,
        rewritten,
        conflicted_at: None,
        opened_by_driver,
    })
}

/// The ordered list of original commits in `(ancestor, head]`, oldest
/// first, suitable for sequential replay.
async fn sub_range(backend: &dyn Backend, ancestor: &Oid, head: &Oid) -> Result<Vec<Oid>, BackendError> {
    let excluded = backend.walk_ancestors(std::slice::from_ref(ancestor)).await?;
    let excluded: std::collections::HashSet<Oid> = excluded.into_iter().collect();
    let mut included = backend.walk_ancestors(std::slice::from_ref(head)).await?;
    included.retain(|oid| !excluded.contains(oid));
    // Topologically order oldest-first by generation (fewest steps from a
    // commit with no unexcluded parent), same tie-break rule the stitch
    // engine uses (sha order).
    let mut with_gen = Vec::new();
    for oid in included {
        let mut depth = 0usize;
        let mut frontier = vec![oid.clone()];
        let mut seen = std::collections::HashSet::new();
        while let Some(next) = frontier.pop() {
            if excluded.contains(&next) || !seen.insert(next.clone()) {
                continue;
            }
            let parents = backend.parents(&next).await?;
            if parents.iter().all(|p| excluded.contains(p)) {
                depth = depth.max(seen.len());
            }
            frontier.extend(parents);
        }
        with_gen.push((depth, oid));
    }
    with_gen.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(with_gen.into_iter().map(|(_, oid)| oid).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::TreeEntry;
    use crate::gitmodules::GitmodulesMap;

    fn sig() -> Signature {
        Signature {
            name: "t".into(),
            email: "t@example.com".into(),
            timestamp: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
        }
    }

    fn noop_pick() -> Arc<CherryPickFn> {
        Arc::new(|_backend, _head, _original| Box::pin(async { Ok(CherryPickOutcome::Conflicted) }))
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn drive_applies_simple_addition_and_writes_meta_commit() {
        init_tracing();
        let backend = MemoryBackend::new();
        let mut index = Index::new();
        let blob = backend.write_blob(b"hi").await.unwrap();

        let classification = Classification {
            simple_changes: BTreeMap::from([(SubPath::new("readme").unwrap(), Some((Mode::File, blob)))]),
            sub_changes: vec![],
            conflicts: vec![],
            urls: GitmodulesMap::new(),
        };

        let opener = Arc::new(Opener::new(None, GitmodulesMap::new()));
        let result = drive(
            &backend,
            &opener,
            &mut index,
            classification,
            None,
            vec![],
            sig(),
            sig(),
            "add readme".into(),
            noop_pick(),
            DriveOptions::default(),
        )
        .await
        .unwrap();

        match result {
            DriveResult::Completed { meta_commit } => {
                let commit = backend.read_commit(&meta_commit).await.unwrap();
                let entries = backend.read_tree(&commit.tree).await.unwrap();
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "readme");
            }
            DriveResult::Incomplete { .. } => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn drive_fast_forwards_submodule_change_without_calling_pick() {
        init_tracing();
        let backend = MemoryBackend::new();
        let mut index = Index::new();

        let old_commit = backend
            .write_commit(&CommitData {
                tree: backend.write_tree(&[]).await.unwrap(),
                parents: vec![],
                author: sig(),
                committer: sig(),
                message: "old".into(),
                encoding: None,
            })
            .await
            .unwrap();
        let new_commit = backend
            .write_commit(&CommitData {
                tree: backend.write_tree(&[]).await.unwrap(),
                parents: vec![old_commit.clone()],
                author: sig(),
                committer: sig(),
                message: "new".into(),
                encoding: None,
            })
            .await
            .unwrap();

        let sub_path = SubPath::new("vendor/libfoo").unwrap();
        let opener = Arc::new(Opener::new(None, GitmodulesMap::new()));
        opener.register_subrepo(sub_path.clone(), Arc::new(MemoryBackend::new()));
        // Share the commits into the registered sub backend directly since
        // there's no remote link set up for this test.
        let sub_backend = opener.backend_for(&sub_path).unwrap();
        let tree = sub_backend.write_tree(&[]).await.unwrap();
        let sub_old = sub_backend
            .write_commit(&CommitData { tree: tree.clone(), parents: vec![], author: sig(), committer: sig(), message: "old".into(), encoding: None })
            .await
            .unwrap();
        let sub_new = sub_backend
            .write_commit(&CommitData { tree, parents: vec![sub_old.clone()], author: sig(), committer: sig(), message: "new".into(), encoding: None })
            .await
            .unwrap();

        let classification = Classification {
            simple_changes: BTreeMap::new(),
            sub_changes: vec![SubmoduleChange {
                path: sub_path.clone(),
                old_sha: sub_old,
                new_sha: sub_new.clone(),
                ancestor_sha: None,
            }],
            conflicts: vec![],
            urls: GitmodulesMap::new(),
        };

        let result = drive(
            &backend,
            &opener,
            &mut index,
            classification,
            None,
            vec![old_commit],
            sig(),
            sig(),
            "cherry-pick".into(),
            noop_pick(),
            DriveOptions::default(),
        )
        .await
        .unwrap();

        match result {
            DriveResult::Completed { meta_commit } => {
                let commit = backend.read_commit(&meta_commit).await.unwrap();
                let vendor = backend.read_tree(&commit.tree).await.unwrap();
                let vendor_entries = backend.read_tree(&vendor.iter().find(|e| e.name == "vendor").unwrap().oid).await.unwrap();
                let libfoo = vendor_entries.iter().find(|e| e.name == "libfoo").unwrap();
                assert_eq!(libfoo.mode, Mode::Gitlink);
                assert_eq!(libfoo.oid, sub_new);
            }
            DriveResult::Incomplete { .. } => panic!("expected completion, not a conflict"),
        }
        let _ = new_commit;
    }
}
