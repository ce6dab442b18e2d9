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

//! Lazy materialization of sub-repositories (`spec.md` §4.D). `Opener`
//! tracks each sub-repository's open/closed state and on-demand fetch of a
//! commit that isn't locally reachable yet, via a URL resolved against the
//! meta-repository's own origin. Grounded on the lazy-initialization
//! pattern this crate's `git::ref::fetch` command uses to resolve a remote
//! before dialing it (`cli/src/commands/git/ref/fetch.rs`), generalized
//! from "one remote" to "one remote per sub-repository path".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::backend::{Backend, BackendError, Oid};
use crate::error::{ExitCode, FetchError};
use crate::file_util::{self, IoResultExt, PathError};
use crate::gitmodules::{GitModulesError, GitmodulesMap};
use crate::subpath::SubPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Open only if not already open; leave a clean-closed sub alone.
    LazyOpen,
    /// Force a workdir to exist even if the sub was closed.
    ForceOpen,
    /// Force bare: only the object database is guaranteed, no workdir.
    ForceBare,
}

#[derive(Debug, Clone)]
pub struct SubRepo {
    pub path: SubPath,
    pub is_open: bool,
    pub pinned: Oid,
    /// The workdir materialized for this sub-repository, if the opener was
    /// configured with [`MaterializationRoots`] and `path` was opened (not
    /// `force_bare`).
    pub workdir: Option<PathBuf>,
}

/// Filesystem roots an [`Opener`] materializes an opened sub-repository
/// under (`spec.md` §4.D): a module directory mirroring `.git/modules/<path>`
/// that backs the gitlink pointer file, a workdir root each sub is checked
/// out under, and an optional template directory copied into every freshly
/// created workdir.
#[derive(Debug, Clone)]
pub struct MaterializationRoots {
    pub modules_dir: PathBuf,
    pub workdir_root: PathBuf,
    pub template_dir: Option<PathBuf>,
}

impl MaterializationRoots {
    /// Builds the roots from the two filesystem locations the embedder
    /// controls and `meta.submoduletemplatepath` (`spec.md` §4.K), if set.
    pub fn new(modules_dir: PathBuf, workdir_root: PathBuf, settings: &crate::config::Settings) -> Self {
        MaterializationRoots {
            modules_dir,
            workdir_root,
            template_dir: settings.submodule_template_path().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenerError {
    #[error("sub-repository at {0} has no object store registered with the opener")]
    NotRegistered(SubPath),
    #[error(transparent)]
    GitModules(#[from] GitModulesError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Materialize(#[from] PathError),
}

impl ExitCode for OpenerError {
    fn exit_code(&self) -> i32 {
        1
    }
}

/// `Opener(meta_repo, meta_head)` from `spec.md` §4.D. The object store for
/// each sub-repository is supplied by the embedder via
/// [`Opener::register_subrepo`] rather than discovered from a filesystem:
/// this crate treats "does an on-disk clone of this sub exist" as the
/// embedder's concern and "is it logically open" as its own.
pub struct Opener {
    meta_origin_url: Option<String>,
    gitmodules: GitmodulesMap,
    subrepo_backends: RwLock<HashMap<SubPath, Arc<dyn Backend>>>,
    open_state: RwLock<HashMap<SubPath, bool>>,
    materialization: Option<MaterializationRoots>,
}

impl Opener {
    pub fn new(meta_origin_url: Option<String>, gitmodules: GitmodulesMap) -> Self {
        Opener {
            meta_origin_url,
            gitmodules,
            subrepo_backends: RwLock::new(HashMap::new()),
            open_state: RwLock::new(HashMap::new()),
            materialization: None,
        }
    }

    /// Enables on-disk materialization: from now on, opening a sub-repository
    /// (any policy but `force_bare`) creates its module directory and workdir
    /// under `roots`, writes the gitlink pointer file, copies
    /// `roots.template_dir`'s contents into a freshly created workdir, and
    /// configures its `origin` remote to the resolved submodule URL.
    pub fn with_materialization_roots(mut self, roots: MaterializationRoots) -> Self {
        self.materialization = Some(roots);
        self
    }

    /// Wires up the content-addressed store backing `path`. Idempotent:
    /// opening is defined in terms of this registration plus tracked
    /// open/closed state, both of which a second call leaves consistent.
    pub fn register_subrepo(&self, path: SubPath, backend: Arc<dyn Backend>) {
        tracing::debug!(path = %path, "registering sub-repository object store");
        self.subrepo_backends.write().unwrap().insert(path, backend);
    }

    pub fn is_open(&self, path: &SubPath) -> bool {
        self.open_state.read().unwrap().get(path).copied().unwrap_or(false)
    }

    /// Returns the object store registered for `path`, if any.
    pub fn backend_for(&self, path: &SubPath) -> Option<Arc<dyn Backend>> {
        self.subrepo_backends.read().unwrap().get(path).cloned()
    }

    /// `get_subrepo(path, policy)` from `spec.md` §4.D. Opening is
    /// idempotent: calling it twice with the same arguments leaves the same
    /// observable state. When materialization roots are configured and
    /// `policy` isn't `force_bare`, also materializes the sub-repository on
    /// disk (see [`Opener::with_materialization_roots`]).
    pub async fn get_subrepo(&self, path: &SubPath, policy: OpenPolicy, pinned: Oid) -> Result<SubRepo, OpenerError> {
        let backend = self
            .subrepo_backends
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| OpenerError::NotRegistered(path.clone()))?;
        let is_open = match policy {
            OpenPolicy::LazyOpen => self.is_open(path),
            OpenPolicy::ForceOpen => true,
            OpenPolicy::ForceBare => false,
        };
        tracing::debug!(path = %path, ?policy, is_open, "opening sub-repository");

        let workdir = if is_open {
            match &self.materialization {
                Some(roots) => Some(self.materialize(roots, path, backend.as_ref()).await?),
                None => None,
            }
        } else {
            None
        };

        self.open_state.write().unwrap().insert(path.clone(), is_open);
        Ok(SubRepo { path: path.clone(), is_open, pinned, workdir })
    }

    /// Creates (if absent) `path`'s module directory and workdir under
    /// `roots`, writes the workdir's gitlink pointer file, copies a fresh
    /// workdir's contents from `roots.template_dir`, and configures `origin`
    /// on `backend`. Idempotent: re-materializing an already-open sub leaves
    /// its workdir contents and pointer file untouched.
    async fn materialize(&self, roots: &MaterializationRoots, path: &SubPath, backend: &dyn Backend) -> Result<PathBuf, OpenerError> {
        let module_dir = roots.modules_dir.join(path.as_std_path());
        create_dir_all(&module_dir)?;

        let workdir = roots.workdir_root.join(path.as_std_path());
        let freshly_created = !workdir.is_dir();
        create_dir_all(&workdir)?;

        if freshly_created {
            if let Some(template_dir) = &roots.template_dir {
                copy_template_dir(template_dir, &workdir)?;
            }
        }

        let pointer = workdir.join(".git");
        if !pointer.is_file() {
            let relative_gitdir = file_util::relative_path(&workdir, &module_dir);
            std::fs::write(&pointer, format!("gitdir: {}\n", relative_gitdir.display())).context(&pointer)?;
        }

        let url = self.gitmodules.resolved_url(path, self.meta_origin_url.as_deref())?;
        backend.set_remote_url("origin", &url).await?;

        Ok(workdir)
    }

    /// Closes `path`: the object database (and its registration) stays, but
    /// the sub is no longer considered to have a materialized workdir. If
    /// materialization is configured and a workdir exists for `path`, also
    /// clears its contents (the gitlink pointer file included), mirroring
    /// `git submodule deinit`'s on-disk effect.
    pub fn close(&self, path: &SubPath) {
        self.open_state.write().unwrap().insert(path.clone(), false);
        if let Some(roots) = &self.materialization {
            let workdir = roots.workdir_root.join(path.as_std_path());
            if workdir.is_dir() {
                if let Err(error) = file_util::remove_dir_contents(&workdir) {
                    tracing::debug!(path = %path, %error, "failed to clear workdir contents on close");
                }
            }
        }
    }

    pub fn fetcher(&self) -> Fetcher<'_> {
        Fetcher { opener: self }
    }
}

/// Closed over the meta-repository's origin URL (`spec.md` §4.D:
/// `fetcher()` returns a `Fetcher` closed over the meta-repo's origin URL).
pub struct Fetcher<'a> {
    opener: &'a Opener,
}

impl Fetcher<'_> {
    /// No-op if `sha` is already reachable in `sub_repo`'s store. Otherwise
    /// resolves the sub's URL against the meta origin URL and fetches `sha`
    /// from there; on failure surfaces a [`FetchError`] carrying the
    /// resolved URL.
    pub async fn fetch_sha(&self, sub_repo: &SubRepo, path: &SubPath, sha: &Oid) -> Result<(), FetchError> {
        let backend = self
            .opener
            .backend_for(path)
            .ok_or_else(|| FetchError { url: String::new(), cause: BackendError::Other("no store registered".into()) })?;
        if backend.read_commit(sha).await.is_ok() {
            return Ok(());
        }
        let url = self
            .opener
            .gitmodules
            .resolved_url(path, self.opener.meta_origin_url.as_deref())
            .map_err(|e| FetchError { url: String::new(), cause: BackendError::Other(e.to_string()) })?;
        backend
            .fetch(&url, sha)
            .await
            .map_err(|cause| FetchError { url, cause })
    }
}

/// Creates `dir` and every missing ancestor, reusing any that already exist.
/// `std::fs::create_dir_all` would do the same, but this crate's own
/// idempotent single-level primitive ([`file_util::create_or_reuse_dir`]) is
/// used here instead of reaching for another stdlib entry point.
fn create_dir_all(dir: &Path) -> Result<(), PathError> {
    let mut built = PathBuf::new();
    for component in dir.components() {
        built.push(component);
        file_util::create_or_reuse_dir(&built).context(&built)?;
    }
    Ok(())
}

/// Recursively copies `from`'s contents into `to`, skipping any destination
/// file that already exists so a re-materialized workdir never clobbers
/// local edits.
fn copy_template_dir(from: &Path, to: &Path) -> Result<(), PathError> {
    for entry in from.read_dir().context(from)? {
        let entry = entry.context(from)?;
        let src = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type().context(&src)?;
        if file_type.is_dir() {
            create_dir_all(&dest)?;
            copy_template_dir(&src, &dest)?;
        } else if !dest.exists() {
            std::fs::copy(&src, &dest).context(&dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn get_subrepo_fails_when_unregistered() {
        let opener = Opener::new(None, GitmodulesMap::new());
        let path = SubPath::new("vendor/libfoo").unwrap();
        let err = opener.get_subrepo(&path, OpenPolicy::LazyOpen, Oid::from_bytes(&[1])).await.unwrap_err();
        assert_matches!(err, OpenerError::NotRegistered(_));
    }

    #[tokio::test]
    async fn force_bare_marks_closed_even_if_previously_open() {
        let opener = Opener::new(None, GitmodulesMap::new());
        let path = SubPath::new("vendor/libfoo").unwrap();
        opener.register_subrepo(path.clone(), Arc::new(MemoryBackend::new()));
        opener.get_subrepo(&path, OpenPolicy::ForceOpen, Oid::from_bytes(&[1])).await.unwrap();
        assert!(opener.is_open(&path));
        opener.get_subrepo(&path, OpenPolicy::ForceBare, Oid::from_bytes(&[1])).await.unwrap();
        assert!(!opener.is_open(&path));
    }

    #[tokio::test]
    async fn fetch_sha_is_noop_when_already_local() {
        let opener = Opener::new(None, GitmodulesMap::new());
        let path = SubPath::new("vendor/libfoo").unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let blob = backend.write_blob(b"x").await.unwrap();
        let tree = backend
            .write_tree(&[crate::backend::TreeEntry {
                name: "f".into(),
                mode: crate::backend::Mode::File,
                oid: blob,
            }])
            .await
            .unwrap();
        let sig = crate::backend::Signature {
            name: "t".into(),
            email: "t@example.com".into(),
            timestamp: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
        };
        let commit = backend
            .write_commit(&crate::backend::CommitData {
                tree,
                parents: vec![],
                author: sig.clone(),
                committer: sig,
                message: "m".into(),
                encoding: None,
            })
            .await
            .unwrap();
        opener.register_subrepo(path.clone(), backend);
        let sub_repo = opener.get_subrepo(&path, OpenPolicy::LazyOpen, commit.clone()).await.unwrap();
        opener.fetcher().fetch_sha(&sub_repo, &path, &commit).await.unwrap();
    }

    #[tokio::test]
    async fn opening_materializes_module_dir_workdir_pointer_and_origin() {
        let roots_dir = tempfile::tempdir().unwrap();
        let roots = MaterializationRoots {
            modules_dir: roots_dir.path().join("modules"),
            workdir_root: roots_dir.path().join("workdirs"),
            template_dir: None,
        };
        let mut gitmodules = GitmodulesMap::new();
        let path = SubPath::new("vendor/libfoo").unwrap();
        gitmodules.insert(path.clone(), "https://example.com/libfoo.git".into());

        let opener = Opener::new(None, gitmodules).with_materialization_roots(roots);
        let backend = Arc::new(MemoryBackend::new());
        opener.register_subrepo(path.clone(), backend.clone());

        let sub_repo = opener.get_subrepo(&path, OpenPolicy::ForceOpen, Oid::from_bytes(&[1])).await.unwrap();
        let workdir = sub_repo.workdir.expect("materialization roots were configured");
        assert!(workdir.is_dir());
        assert!(roots_dir.path().join("modules/vendor/libfoo").is_dir());

        let pointer = std::fs::read_to_string(workdir.join(".git")).unwrap();
        assert!(pointer.starts_with("gitdir: "));
        assert!(pointer.trim_end().ends_with("modules/vendor/libfoo"));

        assert_eq!(backend.remote_url("origin").as_deref(), Some("https://example.com/libfoo.git"));

        // Re-opening is idempotent: no error, same workdir, pointer untouched.
        let reopened = opener.get_subrepo(&path, OpenPolicy::ForceOpen, Oid::from_bytes(&[1])).await.unwrap();
        assert_eq!(reopened.workdir, Some(workdir.clone()));
        assert_eq!(std::fs::read_to_string(workdir.join(".git")).unwrap(), pointer);
    }

    #[tokio::test]
    async fn closing_a_materialized_sub_clears_its_workdir() {
        let roots_dir = tempfile::tempdir().unwrap();
        let roots = MaterializationRoots {
            modules_dir: roots_dir.path().join("modules"),
            workdir_root: roots_dir.path().join("workdirs"),
            template_dir: None,
        };
        let mut gitmodules = GitmodulesMap::new();
        let path = SubPath::new("vendor/libfoo").unwrap();
        gitmodules.insert(path.clone(), "https://example.com/libfoo.git".into());

        let opener = Opener::new(None, gitmodules).with_materialization_roots(roots);
        opener.register_subrepo(path.clone(), Arc::new(MemoryBackend::new()));
        let sub_repo = opener.get_subrepo(&path, OpenPolicy::ForceOpen, Oid::from_bytes(&[1])).await.unwrap();
        let workdir = sub_repo.workdir.unwrap();
        assert!(workdir.join(".git").is_file());

        opener.close(&path);
        assert!(workdir.is_dir());
        assert_eq!(workdir.read_dir().unwrap().count(), 0);
    }
}
