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

//! The real-world [`Backend`] implementation, wrapping `git2`. `git2`'s
//! `Repository` is blocking and not `Sync`, so every method here opens its
//! own handle inside `tokio::task::spawn_blocking`, the same isolation
//! `jj-lib`'s git backend uses to keep a blocking C library off the async
//! executor.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};

use crate::backend::{Backend, BackendError, CommitData, Mode, Oid, Signature, TreeEntry};
use crate::index::{ConflictSides, Index, Stage};
use crate::subpath::SubPath;

pub struct Git2Backend {
    git_dir: PathBuf,
}

impl Git2Backend {
    pub fn open(git_dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let git_dir = git_dir.into();
        git2::Repository::open(&git_dir).map_err(other)?;
        Ok(Git2Backend { git_dir })
    }

    fn repo(&self) -> Result<git2::Repository, BackendError> {
        git2::Repository::open(&self.git_dir).map_err(other)
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&git2::Repository) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let git_dir = self.git_dir.clone();
        tokio::task::spawn_blocking(move || {
            let repo = git2::Repository::open(&git_dir).map_err(other)?;
            f(&repo)
        })
        .await
        .map_err(|e| BackendError::Other(format!("blocking task panicked: {e}")))?
    }
}

fn other(e: git2::Error) -> BackendError {
    BackendError::Other(e.message().to_owned())
}

fn to_git2_oid(oid: &Oid) -> Result<git2::Oid, BackendError> {
    git2::Oid::from_bytes(oid.as_bytes()).map_err(other)
}

fn from_git2_oid(oid: git2::Oid) -> Oid {
    Oid::from_bytes(oid.as_bytes())
}

fn to_filemode(mode: Mode) -> i32 {
    mode.as_u32() as i32
}

fn from_filemode(mode: i32) -> Result<Mode, BackendError> {
    Mode::from_u32(mode as u32)
        .ok_or_else(|| BackendError::Other(format!("unrecognized tree entry mode {mode:o}")))
}

fn to_signature(sig: &Signature) -> Result<git2::Signature<'static>, BackendError> {
    let offset_minutes = sig.timestamp.offset().local_minus_utc() / 60;
    git2::Signature::new(
        &sig.name,
        &sig.email,
        &git2::Time::new(sig.timestamp.timestamp(), offset_minutes),
    )
    .map_err(other)
}

fn from_signature(sig: &git2::Signature<'_>) -> Result<Signature, BackendError> {
    let when = sig.when();
    let offset = FixedOffset::east_opt(when.offset_minutes() * 60)
        .ok_or_else(|| BackendError::Other("signature has an out-of-range timezone offset".into()))?;
    let timestamp = offset
        .timestamp_opt(when.seconds(), 0)
        .single()
        .ok_or_else(|| BackendError::Other("signature has an unrepresentable timestamp".into()))?;
    Ok(Signature {
        name: sig.name().unwrap_or_default().to_owned(),
        email: sig.email().unwrap_or_default().to_owned(),
        timestamp,
    })
}

#[async_trait]
impl Backend for Git2Backend {
    async fn read_blob(&self, oid: &Oid) -> Result<Vec<u8>, BackendError> {
        let oid = oid.clone();
        self.blocking(move |repo| {
            let git_oid = to_git2_oid(&oid)?;
            let blob = repo.find_blob(git_oid).map_err(|_| BackendError::NotFound(oid.clone()))?;
            Ok(blob.content().to_vec())
        })
        .await
    }

    async fn read_tree(&self, oid: &Oid) -> Result<Vec<TreeEntry>, BackendError> {
        let oid = oid.clone();
        self.blocking(move |repo| {
            let git_oid = to_git2_oid(&oid)?;
            let tree = repo.find_tree(git_oid).map_err(|_| BackendError::NotFound(oid.clone()))?;
            tree.iter()
                .map(|entry| {
                    Ok(TreeEntry {
                        name: entry.name().unwrap_or_default().to_owned(),
                        mode: from_filemode(entry.filemode())?,
                        oid: from_git2_oid(entry.id()),
                    })
                })
                .collect()
        })
        .await
    }

    async fn read_commit(&self, oid: &Oid) -> Result<CommitData, BackendError> {
        let oid = oid.clone();
        self.blocking(move |repo| {
            let git_oid = to_git2_oid(&oid)?;
            let commit = repo.find_commit(git_oid).map_err(|_| BackendError::NotFound(oid.clone()))?;
            let result = Ok(CommitData {
                tree: from_git2_oid(commit.tree_id()),
                parents: commit.parent_ids().map(from_git2_oid).collect(),
                author: from_signature(&commit.author())?,
                committer: from_signature(&commit.committer())?,
                message: commit.message().unwrap_or_default().to_owned(),
                encoding: commit.message_encoding().map(ToOwned::to_owned),
            });
            result
        })
        .await
    }

    async fn write_blob(&self, data: &[u8]) -> Result<Oid, BackendError> {
        let data = data.to_vec();
        self.blocking(move |repo| Ok(from_git2_oid(repo.blob(&data).map_err(other)?))).await
    }

    async fn write_tree(&self, entries: &[TreeEntry]) -> Result<Oid, BackendError> {
        let entries = entries.to_vec();
        self.blocking(move |repo| {
            let mut builder = repo.treebuilder(None).map_err(other)?;
            for entry in &entries {
                let git_oid = to_git2_oid(&entry.oid)?;
                builder
                    .insert(&entry.name, git_oid, to_filemode(entry.mode))
                    .map_err(other)?;
            }
            Ok(from_git2_oid(builder.write().map_err(other)?))
        })
        .await
    }

    async fn write_commit(&self, commit: &CommitData) -> Result<Oid, BackendError> {
        let commit = commit.clone();
        self.blocking(move |repo| {
            let tree_oid = to_git2_oid(&commit.tree)?;
            let tree = repo.find_tree(tree_oid).map_err(other)?;
            let parent_oids = commit
                .parents
                .iter()
                .map(to_git2_oid)
                .collect::<Result<Vec<_>, _>>()?;
            let parents = parent_oids
                .iter()
                .map(|oid| repo.find_commit(*oid))
                .collect::<Result<Vec<_>, _>>()
                .map_err(other)?;
            let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
            let author = to_signature(&commit.author)?;
            let committer = to_signature(&commit.committer)?;
            let oid = repo
                .commit(None, &author, &committer, &commit.message, &tree, &parent_refs)
                .map_err(other)?;
            Ok(from_git2_oid(oid))
        })
        .await
    }

    async fn resolve(&self, ref_or_shorthand: &str) -> Result<Option<Oid>, BackendError> {
        let name = ref_or_shorthand.to_owned();
        self.blocking(move |repo| match repo.revparse_single(&name) {
            Ok(obj) => Ok(Some(from_git2_oid(obj.id()))),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(other(e)),
        })
        .await
    }

    async fn set_ref(&self, name: &str, oid: &Oid, force: bool) -> Result<(), BackendError> {
        let name = name.to_owned();
        let oid = oid.clone();
        self.blocking(move |repo| {
            let git_oid = to_git2_oid(&oid)?;
            if !force {
                if let Ok(reference) = repo.find_reference(&name) {
                    if let Some(current) = reference.target() {
                        let is_ff = repo
                            .graph_descendant_of(git_oid, current)
                            .map_err(other)?
                            || current == git_oid;
                        if !is_ff {
                            return Err(BackendError::RefUpdateNotFastForward { name: name.clone() });
                        }
                    }
                }
            }
            repo.reference(&name, git_oid, true, "gitmeta-core").map_err(other)?;
            Ok(())
        })
        .await
    }

    async fn delete_ref(&self, name: &str) -> Result<(), BackendError> {
        let name = name.to_owned();
        self.blocking(move |repo| {
            match repo.find_reference(&name) {
                Ok(mut reference) => reference.delete().map_err(other),
                Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
                Err(e) => Err(other(e)),
            }
        })
        .await
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, Oid)>, BackendError> {
        let prefix = prefix.to_owned();
        self.blocking(move |repo| {
            let mut out = Vec::new();
            for name in repo.references_glob(&format!("{prefix}*")).map_err(other)? {
                let reference = name.map_err(other)?;
                let Some(name) = reference.name() else { continue };
                if let Some(target) = reference.target() {
                    out.push((name.to_owned(), from_git2_oid(target)));
                }
            }
            Ok(out)
        })
        .await
    }

    async fn walk_ancestors(&self, start: &[Oid]) -> Result<Vec<Oid>, BackendError> {
        let start = start.to_vec();
        self.blocking(move |repo| {
            let mut walk = repo.revwalk().map_err(other)?;
            for oid in &start {
                walk.push(to_git2_oid(oid)?).map_err(other)?;
            }
            walk.map(|r| r.map(from_git2_oid).map_err(other)).collect()
        })
        .await
    }

    async fn parents(&self, oid: &Oid) -> Result<Vec<Oid>, BackendError> {
        self.read_commit(oid).await.map(|c| c.parents)
    }

    async fn merge_bases(&self, a: &Oid, b: &Oid) -> Result<Vec<Oid>, BackendError> {
        let a = a.clone();
        let b = b.clone();
        self.blocking(move |repo| {
            let oids = repo
                .merge_bases(to_git2_oid(&a)?, to_git2_oid(&b)?)
                .map_err(other)?;
            Ok(oids.iter().map(|oid| from_git2_oid(*oid)).collect())
        })
        .await
    }

    async fn descendant_of(&self, candidate: &Oid, ancestor: &Oid) -> Result<bool, BackendError> {
        if candidate == ancestor {
            return Ok(true);
        }
        let candidate = candidate.clone();
        let ancestor = ancestor.clone();
        self.blocking(move |repo| {
            repo.graph_descendant_of(to_git2_oid(&candidate)?, to_git2_oid(&ancestor)?)
                .map_err(other)
        })
        .await
    }

    async fn merge_commits(&self, ours: &Oid, theirs: &Oid) -> Result<Index, BackendError> {
        let ours = ours.clone();
        let theirs = theirs.clone();
        self.blocking(move |repo| {
            let our_commit = repo.find_commit(to_git2_oid(&ours)?).map_err(other)?;
            let their_commit = repo.find_commit(to_git2_oid(&theirs)?).map_err(other)?;
            let git_index = repo.merge_commits(&our_commit, &their_commit, None).map_err(other)?;

            let mut index = Index::new();
            let mut conflicts: std::collections::BTreeMap<SubPath, ConflictSides> = Default::default();
            for entry in git_index.iter() {
                let path = SubPath::new(String::from_utf8_lossy(&entry.path).into_owned())
                    .map_err(|e| BackendError::Other(e.to_string()))?;
                let mode = from_filemode(entry.mode as i32)?;
                let oid = from_git2_oid(entry.id);
                match entry_stage(entry.flags) {
                    0 => index.stage(path, mode, oid),
                    1 => conflicts.entry(path).or_default().ancestor = Some((mode, oid)),
                    2 => conflicts.entry(path).or_default().ours = Some((mode, oid)),
                    3 => conflicts.entry(path).or_default().theirs = Some((mode, oid)),
                    _ => {}
                }
            }
            for (path, sides) in conflicts {
                index.conflict_add(path, sides.ancestor, sides.ours, sides.theirs);
            }
            Ok(index)
        })
        .await
    }

    async fn read_index(&self) -> Result<Index, BackendError> {
        self.blocking(move |repo| {
            let git_index = repo.index().map_err(other)?;
            let mut index = Index::new();
            let mut conflicts: std::collections::BTreeMap<SubPath, ConflictSides> = Default::default();
            for entry in git_index.iter() {
                let path = SubPath::new(String::from_utf8_lossy(&entry.path).into_owned())
                    .map_err(|e| BackendError::Other(e.to_string()))?;
                let mode = from_filemode(entry.mode as i32)?;
                let oid = from_git2_oid(entry.id);
                match entry_stage(entry.flags) {
                    0 => index.stage(path, mode, oid),
                    1 => conflicts.entry(path).or_default().ancestor = Some((mode, oid)),
                    2 => conflicts.entry(path).or_default().ours = Some((mode, oid)),
                    3 => conflicts.entry(path).or_default().theirs = Some((mode, oid)),
                    _ => {}
                }
            }
            for (path, sides) in conflicts {
                index.conflict_add(path, sides.ancestor, sides.ours, sides.theirs);
            }
            Ok(index)
        })
        .await
    }

    async fn write_index(&self, index: &Index) -> Result<(), BackendError> {
        let entries: Vec<_> = index
            .iter()
            .flat_map(|(path, es)| es.iter().map(move |e| (path.clone(), e.clone())))
            .collect();
        self.blocking(move |repo| {
            let mut git_index = repo.index().map_err(other)?;
            git_index.clear().map_err(other)?;
            for (path, entry) in &entries {
                let stage = match entry.stage {
                    Stage::Normal => 0,
                    Stage::Ancestor => 1,
                    Stage::Ours => 2,
                    Stage::Theirs => 3,
                };
                let raw = git2::IndexEntry {
                    ctime: git2::IndexTime::new(0, 0),
                    mtime: git2::IndexTime::new(0, 0),
                    dev: 0,
                    ino: 0,
                    mode: to_filemode(entry.mode) as u32,
                    uid: 0,
                    gid: 0,
                    file_size: 0,
                    id: to_git2_oid(&entry.oid)?,
                    flags: (stage << 12) as u16,
                    flags_extended: 0,
                    path: path.as_str().as_bytes().to_vec(),
                };
                git_index.add_frombuffer(&raw, &[]).map_err(other)?;
            }
            git_index.write().map_err(other)?;
            Ok(())
        })
        .await
    }

    async fn fetch(&self, url: &str, oid: &Oid) -> Result<(), BackendError> {
        if self.read_commit(oid).await.is_ok() {
            return Ok(());
        }
        let url = url.to_owned();
        let oid = oid.clone();
        self.blocking(move |repo| {
            let mut remote = repo.remote_anonymous(&url).map_err(other)?;
            remote
                .fetch(&[oid.hex()], None, None)
                .map_err(|e| BackendError::Network { url: url.clone(), message: e.message().to_owned() })
        })
        .await
    }

    async fn push(&self, url: &str, refname: &str, target: &Oid, force: bool) -> Result<(), BackendError> {
        let url = url.to_owned();
        let refname = refname.to_owned();
        let target = target.clone();
        self.blocking(move |repo| {
            let local_ref = format!("refs/gitmeta-push/{}", target.hex());
            repo.reference(&local_ref, to_git2_oid(&target)?, true, "gitmeta-core push staging")
                .map_err(other)?;
            let mut remote = repo.remote_anonymous(&url).map_err(other)?;
            let prefix = if force { "+" } else { "" };
            let refspec = format!("{prefix}{local_ref}:{refname}");
            let result = remote.push(&[&refspec], None).map_err(|e| BackendError::Network {
                url: url.clone(),
                message: e.message().to_owned(),
            });
            let _ = repo.find_reference(&local_ref).and_then(|mut r| r.delete());
            result
        })
        .await
    }

    async fn notes_read(&self, notes_ref: &str, key: &Oid) -> Result<Option<Vec<u8>>, BackendError> {
        let notes_ref = notes_ref.to_owned();
        let key = key.clone();
        self.blocking(move |repo| match repo.find_note(Some(&notes_ref), to_git2_oid(&key)?) {
            Ok(note) => Ok(note.message().map(|m| m.as_bytes().to_vec())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(other(e)),
        })
        .await
    }

    async fn notes_write(&self, notes_ref: &str, key: &Oid, value: &[u8]) -> Result<(), BackendError> {
        let notes_ref = notes_ref.to_owned();
        let key = key.clone();
        let value = String::from_utf8_lossy(value).into_owned();
        self.blocking(move |repo| {
            let sig = repo.signature().or_else(|_| git2::Signature::now("gitmeta-core", "gitmeta-core@localhost")).map_err(other)?;
            repo.note(&sig, &sig, Some(&notes_ref), to_git2_oid(&key)?, &value, true)
                .map_err(other)?;
            Ok(())
        })
        .await
    }

    async fn set_remote_url(&self, name: &str, url: &str) -> Result<(), BackendError> {
        let name = name.to_owned();
        let url = url.to_owned();
        self.blocking(move |repo| match repo.find_remote(&name) {
            Ok(_) => repo.remote_set_url(&name, &url).map_err(other),
            Err(_) => repo.remote(&name, &url).map(|_| ()).map_err(other),
        })
        .await
    }
}

fn entry_stage(flags: u16) -> u16 {
    (flags >> 12) & 0x3
}

impl std::fmt::Debug for Git2Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Git2Backend").field("git_dir", &self.git_dir).finish()
    }
}

/// Opens or initializes a bare repository at `path`, the shape every
/// meta- and sub-repository object store in this crate takes.
pub fn open_or_init_bare(path: &Path) -> Result<Git2Backend, BackendError> {
    if path.is_dir() && git2::Repository::open_bare(path).is_ok() {
        return Git2Backend::open(path);
    }
    git2::Repository::init_bare(path).map_err(other)?;
    Git2Backend::open(path)
}
