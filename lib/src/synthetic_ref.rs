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

//! Keeps sub-repository commits referenced by a meta-commit reachable in
//! their hosting remote via `refs/commits/<sha>` synthetic refs, and
//! validates incoming pushes honor that contract (`spec.md` §4.H). The
//! skip-list regex caching is grounded on this crate's `fix.rs` use of
//! `once_cell::sync::OnceCell` to lazily compile a tool-invocation regex
//! once per process rather than per call.

use std::collections::HashSet;

use once_cell::sync::OnceCell;
use regex::Regex;
use thiserror::Error;

use crate::backend::{Backend, BackendError, Oid};
use crate::gitmodules::{resolve_url, GitModulesError, GitmodulesMap};
use crate::subpath::SubPath;

#[derive(Debug, Error)]
pub enum SyntheticRefError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    GitModules(#[from] GitModulesError),
    #[error("synthetic ref push for sub at {path} to {url} failed")]
    SubPushFailed {
        path: SubPath,
        url: String,
        #[source]
        source: BackendError,
    },
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("pre-receive rejected update of synthetic ref {ref_name}: target {target} does not equal its own sha")]
    SyntheticRefMismatch { ref_name: String, target: Oid },
    #[error("pre-receive rejected commit {0}: sub path {1} has no synthetic ref protecting its pinned commit")]
    MissingSyntheticRef(Oid, SubPath),
}

pub fn synthetic_ref_name(sub_sha: &Oid) -> String {
    format!("refs/commits/{}", sub_sha.hex())
}

pub const OK_NOTES_REF: &str = "refs/notes/git-meta/subrepo-check";

/// Compiles `pattern` once per distinct pattern string instead of on every
/// call; a fresh process still compiles it exactly once.
fn compiled(pattern: &str) -> Result<&'static Regex, SyntheticRefError> {
    static CACHE: OnceCell<std::sync::Mutex<std::collections::HashMap<String, &'static Regex>>> = OnceCell::new();
    let cache = CACHE.get_or_init(|| std::sync::Mutex::new(std::collections::HashMap::new()));
    let mut guard = cache.lock().unwrap();
    if let Some(regex) = guard.get(pattern) {
        return Ok(regex);
    }
    let compiled = Regex::new(pattern).map_err(|source| SyntheticRefError::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let leaked: &'static Regex = Box::leak(Box::new(compiled));
    guard.insert(pattern.to_owned(), leaked);
    Ok(leaked)
}

/// Optional skip-lists read from config (`spec.md` §6:
/// `gitmeta.skipsyntheticrefpattern`, `gitmeta.skipsyntheticrefpathpattern`).
#[derive(Debug, Clone, Default)]
pub struct SkipPatterns {
    pub url_pattern: Option<String>,
    pub path_pattern: Option<String>,
}

impl SkipPatterns {
    fn skips_url(&self, url: &str) -> Result<bool, SyntheticRefError> {
        match &self.url_pattern {
            Some(pattern) => Ok(compiled(pattern)?.is_match(url)),
            None => Ok(false),
        }
    }

    fn skips_path(&self, path: &SubPath) -> Result<bool, SyntheticRefError> {
        match &self.path_pattern {
            Some(pattern) => Ok(compiled(pattern)?.is_match(path.as_str())),
            None => Ok(false),
        }
    }
}

/// One sub-repository commit referenced by the meta-commits being pushed.
#[derive(Debug, Clone)]
pub struct ReferencedSub {
    pub path: SubPath,
    pub sha: Oid,
}

/// Push side (`spec.md` §4.H): pushes each referenced sub commit to
/// `refs/commits/<sha>` at the URL resolved against `remote_url`, skipping
/// any already covered by the remote tracking branch's descendant graph.
/// Returns the set of sub paths actually pushed (for tests/observability).
pub async fn push_synthetic_refs(
    backend: &dyn Backend,
    gitmodules: &GitmodulesMap,
    remote_url: &str,
    tracking_pins: &[(SubPath, Oid)],
    referenced: &[ReferencedSub],
) -> Result<HashSet<SubPath>, SyntheticRefError> {
    let mut pushed = HashSet::new();
    for sub in referenced {
        if let Some((_, tracked_sha)) = tracking_pins.iter().find(|(p, _)| *p == sub.path) {
            if backend.descendant_of(tracked_sha, &sub.sha).await? {
                continue;
            }
        }
        let url = gitmodules.resolved_url(&sub.path, Some(remote_url))?;
        let ref_name = synthetic_ref_name(&sub.sha);
        backend
            .push(&url, &ref_name, &sub.sha, true)
            .await
            .map_err(|source| SyntheticRefError::SubPushFailed { path: sub.path.clone(), url, source })?;
        pushed.insert(sub.path.clone());
    }
    Ok(pushed)
}

/// Meta pre-receive (`spec.md` §4.H): walk from `new` back toward `old` or
/// any OK-noted ancestor; for each walked commit that changes a sub path,
/// require a synthetic ref for that sub's new pinned sha in its hosting
/// remote. On success, writes an OK note for every commit checked.
pub async fn meta_pre_receive(
    meta_backend: &dyn Backend,
    sub_backend_for: impl Fn(&SubPath) -> Option<std::sync::Arc<dyn Backend>>,
    old: Option<&Oid>,
    new: &Oid,
    changed_paths_of: impl Fn(&Oid) -> Vec<(SubPath, Oid)>,
    skip: &SkipPatterns,
    gitmodules: &GitmodulesMap,
) -> Result<(), SyntheticRefError> {
    let mut to_check = vec![new.clone()];
    let mut checked = HashSet::new();
    let mut ok_commits = Vec::new();

    while let Some(commit) = to_check.pop() {
        if !checked.insert(commit.clone()) {
            continue;
        }
        if Some(&commit) == old {
            continue;
        }
        if meta_backend.notes_read(OK_NOTES_REF, &commit).await?.is_some() {
            continue;
        }

        for (path, sha) in changed_paths_of(&commit) {
            if skip.skips_path(&path)? {
                tracing::debug!(path = %path, "synthetic-ref check skipped: path pattern");
                continue;
            }
            let url = gitmodules.resolved_url(&path, None).unwrap_or_default();
            if !url.is_empty() && skip.skips_url(&url)? {
                tracing::debug!(path = %path, url, "synthetic-ref check skipped: url pattern");
                continue;
            }
            let Some(sub_backend) = sub_backend_for(&path) else {
                return Err(SyntheticRefError::MissingSyntheticRef(sha, path));
            };
            let ref_name = synthetic_ref_name(&sha);
            match sub_backend.resolve(&ref_name).await? {
                Some(target) if target == sha => {}
                Some(target) => return Err(SyntheticRefError::SyntheticRefMismatch { ref_name, target }),
                None => return Err(SyntheticRefError::MissingSyntheticRef(sha, path)),
            }
        }

        ok_commits.push(commit.clone());
        let parents = meta_backend.parents(&commit).await?;
        to_check.extend(parents);
    }

    for commit in ok_commits {
        meta_backend.notes_write(OK_NOTES_REF, &commit, b"ok").await?;
    }
    Ok(())
}

/// Submodule pre-receive (`spec.md` §4.H): for updates to
/// `refs/commits/<sha>`, reject unless the new value equals `<sha>`.
pub fn submodule_pre_receive(ref_name: &str, new_value: &Oid) -> Result<(), SyntheticRefError> {
    let Some(hex) = ref_name.strip_prefix("refs/commits/") else {
        return Ok(()); // other refs are unchecked
    };
    let expected = Oid::from_hex(hex).map_err(|_| SyntheticRefError::SyntheticRefMismatch {
        ref_name: ref_name.to_owned(),
        target: new_value.clone(),
    })?;
    if expected != *new_value {
        return Err(SyntheticRefError::SyntheticRefMismatch { ref_name: ref_name.to_owned(), target: new_value.clone() });
    }
    Ok(())
}
