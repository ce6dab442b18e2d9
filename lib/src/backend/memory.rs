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

//! An in-memory, BLAKE2b-addressed [`Backend`]. This is `gitmeta-core`'s
//! analogue of `jj-lib`'s always-available local backend: every unit test
//! in this crate runs against it, and it's suitable for embedding the
//! engine somewhere with no Git installation. Remote fetch/push is
//! simulated by linking two `MemoryBackend`s together with [`MemoryBackend::link_remote`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use blake2::{Blake2b512, Digest};

use super::{Backend, BackendError, CommitData, Mode, Oid, TreeEntry};
use crate::index::Index;

#[derive(Default)]
struct Store {
    blobs: HashMap<Oid, Vec<u8>>,
    trees: HashMap<Oid, Vec<TreeEntry>>,
    commits: HashMap<Oid, CommitData>,
    refs: HashMap<String, Oid>,
    notes: HashMap<String, HashMap<Oid, Vec<u8>>>,
    index: Option<Index>,
}

pub struct MemoryBackend {
    store: RwLock<Store>,
    remotes: RwLock<HashMap<String, Arc<MemoryBackend>>>,
    named_remotes: RwLock<HashMap<String, String>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            store: RwLock::new(Store::default()),
            remotes: RwLock::new(HashMap::new()),
            named_remotes: RwLock::new(HashMap::new()),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Registers `backend` as the object store reachable at `url`, so that
    /// `self.fetch(url, ..)`/`self.push(url, ..)` have somewhere real to go.
    /// Test-only wiring; a real backend resolves `url` over the network
    /// instead.
    pub fn link_remote(&self, url: impl Into<String>, backend: Arc<MemoryBackend>) {
        self.remotes.write().unwrap().insert(url.into(), backend);
    }

    /// The URL last configured for the `name`d remote via
    /// [`Backend::set_remote_url`], if any.
    pub fn remote_url(&self, name: &str) -> Option<String> {
        self.named_remotes.read().unwrap().get(name).cloned()
    }

    fn hash(kind: &str, data: &[u8]) -> Oid {
        let mut hasher = Blake2b512::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        let digest = hasher.finalize();
        Oid::from_bytes(&digest[..32])
    }

    fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
        let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut buf = Vec::new();
        for entry in sorted {
            buf.extend_from_slice(&entry.mode.as_u32().to_le_bytes());
            buf.extend_from_slice(entry.name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(entry.oid.as_bytes());
        }
        buf
    }

    fn encode_commit(commit: &CommitData) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(commit.tree.as_bytes());
        for parent in &commit.parents {
            buf.extend_from_slice(parent.as_bytes());
        }
        buf.extend_from_slice(commit.author.name.as_bytes());
        buf.extend_from_slice(commit.author.email.as_bytes());
        buf.extend_from_slice(commit.committer.name.as_bytes());
        buf.extend_from_slice(commit.committer.email.as_bytes());
        buf.extend_from_slice(commit.message.as_bytes());
        buf
    }

    /// Copies the object closure needed to make `oid` locally resolvable:
    /// the commit, its tree, and every blob/subtree it reaches. Does not
    /// walk parent commits (this is a single-object fetch, not a clone).
    fn copy_commit_closure(&self, remote: &MemoryBackend, oid: &Oid) -> Result<(), BackendError> {
        let already = self.store.read().unwrap().commits.contains_key(oid);
        if already {
            return Ok(());
        }
        let remote_store = remote.store.read().unwrap();
        let commit = remote_store
            .commits
            .get(oid)
            .ok_or_else(|| BackendError::NotFound(oid.clone()))?
            .clone();
        self.copy_tree_closure(&remote_store, &commit.tree)?;
        drop(remote_store);
        self.store.write().unwrap().commits.insert(oid.clone(), commit);
        Ok(())
    }

    fn copy_tree_closure(&self, remote_store: &Store, tree_oid: &Oid) -> Result<(), BackendError> {
        if self.store.read().unwrap().trees.contains_key(tree_oid) {
            return Ok(());
        }
        let entries = remote_store
            .trees
            .get(tree_oid)
            .ok_or_else(|| BackendError::NotFound(tree_oid.clone()))?
            .clone();
        for entry in &entries {
            match entry.mode {
                Mode::Tree => self.copy_tree_closure(remote_store, &entry.oid)?,
                Mode::Gitlink => {
                    // A gitlink's target lives in a different object space
                    // (the sub-repository's own store); nothing to copy here.
                }
                Mode::File | Mode::Executable | Mode::Symlink => {
                    if !self.store.read().unwrap().blobs.contains_key(&entry.oid) {
                        let blob = remote_store
                            .blobs
                            .get(&entry.oid)
                            .ok_or_else(|| BackendError::NotFound(entry.oid.clone()))?
                            .clone();
                        self.store.write().unwrap().blobs.insert(entry.oid.clone(), blob);
                    }
                }
            }
        }
        self.store.write().unwrap().trees.insert(tree_oid.clone(), entries);
        Ok(())
    }

    fn ancestor_set(&self, start: &[Oid]) -> Result<HashSet<Oid>, BackendError> {
        let store = self.store.read().unwrap();
        let mut seen = HashSet::new();
        let mut queue: Vec<Oid> = start.to_vec();
        while let Some(oid) = queue.pop() {
            if !seen.insert(oid.clone()) {
                continue;
            }
            let commit = store
                .commits
                .get(&oid)
                .ok_or_else(|| BackendError::NotFound(oid.clone()))?;
            queue.extend(commit.parents.iter().cloned());
        }
        Ok(seen)
    }

    /// Flattens a tree into `path -> (mode, oid)`, treating gitlinks as
    /// leaves (never traversed into another object space).
    fn flatten_tree<'a>(
        &'a self,
        tree_oid: &'a Oid,
        prefix: String,
        out: &'a mut BTreeMap<String, (Mode, Oid)>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let entries = self.read_tree(tree_oid).await?;
            for entry in entries {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                match entry.mode {
                    Mode::Tree => self.flatten_tree(&entry.oid, path, out).await?,
                    _ => {
                        out.insert(path, (entry.mode, entry.oid));
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read_blob(&self, oid: &Oid) -> Result<Vec<u8>, BackendError> {
        self.store
            .read()
            .unwrap()
            .blobs
            .get(oid)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(oid.clone()))
    }

    async fn read_tree(&self, oid: &Oid) -> Result<Vec<TreeEntry>, BackendError> {
        if oid.as_bytes().is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .read()
            .unwrap()
            .trees
            .get(oid)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(oid.clone()))
    }

    async fn read_commit(&self, oid: &Oid) -> Result<CommitData, BackendError> {
        self.store
            .read()
            .unwrap()
            .commits
            .get(oid)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(oid.clone()))
    }

    async fn write_blob(&self, data: &[u8]) -> Result<Oid, BackendError> {
        let oid = Self::hash("blob", data);
        self.store.write().unwrap().blobs.insert(oid.clone(), data.to_vec());
        Ok(oid)
    }

    async fn write_tree(&self, entries: &[TreeEntry]) -> Result<Oid, BackendError> {
        if entries.is_empty() {
            return Ok(Oid::from_bytes(&[]));
        }
        let encoded = Self::encode_tree(entries);
        let oid = Self::hash("tree", &encoded);
        self.store.write().unwrap().trees.insert(oid.clone(), entries.to_vec());
        Ok(oid)
    }

    async fn write_commit(&self, commit: &CommitData) -> Result<Oid, BackendError> {
        let encoded = Self::encode_commit(commit);
        let oid = Self::hash("commit", &encoded);
        self.store.write().unwrap().commits.insert(oid.clone(), commit.clone());
        Ok(oid)
    }

    async fn resolve(&self, ref_or_shorthand: &str) -> Result<Option<Oid>, BackendError> {
        Ok(self.store.read().unwrap().refs.get(ref_or_shorthand).cloned())
    }

    async fn set_ref(&self, name: &str, oid: &Oid, force: bool) -> Result<(), BackendError> {
        if !force {
            let current = self.store.write().unwrap().refs.get(name).cloned();
            if let Some(current) = current {
                if current != *oid {
                    let is_ff = self.descendant_of(oid, &current).await?;
                    if !is_ff {
                        return Err(BackendError::RefUpdateNotFastForward { name: name.to_owned() });
                    }
                }
            }
        }
        let mut store = self.store.write().unwrap();
        store.refs.insert(name.to_owned(), oid.clone());
        Ok(())
    }

    async fn delete_ref(&self, name: &str) -> Result<(), BackendError> {
        self.store.write().unwrap().refs.remove(name);
        Ok(())
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, Oid)>, BackendError> {
        Ok(self
            .store
            .read()
            .unwrap()
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, oid)| (name.clone(), oid.clone()))
            .collect())
    }

    async fn walk_ancestors(&self, start: &[Oid]) -> Result<Vec<Oid>, BackendError> {
        Ok(self.ancestor_set(start)?.into_iter().collect())
    }

    async fn parents(&self, oid: &Oid) -> Result<Vec<Oid>, BackendError> {
        Ok(self.read_commit(oid).await?.parents)
    }

    async fn merge_bases(&self, a: &Oid, b: &Oid) -> Result<Vec<Oid>, BackendError> {
        let ancestors_a = self.ancestor_set(std::slice::from_ref(a))?;
        let ancestors_b = self.ancestor_set(std::slice::from_ref(b))?;
        let common: HashSet<Oid> = ancestors_a.intersection(&ancestors_b).cloned().collect();
        // Keep only the maximal elements of `common` under the descendant-of
        // partial order (drop any common ancestor that is itself an
        // ancestor of another common ancestor).
        let mut bases = Vec::new();
        'outer: for candidate in &common {
            for other in &common {
                if other != candidate {
                    let other_ancestors = self.ancestor_set(std::slice::from_ref(other))?;
                    if other_ancestors.contains(candidate) {
                        continue 'outer;
                    }
                }
            }
            bases.push(candidate.clone());
        }
        Ok(bases)
    }

    async fn descendant_of(&self, candidate: &Oid, ancestor: &Oid) -> Result<bool, BackendError> {
        if candidate == ancestor {
            return Ok(true);
        }
        Ok(self.ancestor_set(std::slice::from_ref(candidate))?.contains(ancestor))
    }

    async fn merge_commits(&self, ours: &Oid, theirs: &Oid) -> Result<Index, BackendError> {
        let bases = self.merge_bases(ours, theirs).await?;
        let base_tree = if let Some(base) = bases.first() {
            Some(self.read_commit(base).await?.tree)
        } else {
            None
        };
        let ours_tree = self.read_commit(ours).await?.tree;
        let theirs_tree = self.read_commit(theirs).await?.tree;

        let mut base_map = BTreeMap::new();
        let mut ours_map = BTreeMap::new();
        let mut theirs_map = BTreeMap::new();
        if let Some(base_tree) = &base_tree {
            self.flatten_tree(base_tree, String::new(), &mut base_map).await?;
        }
        self.flatten_tree(&ours_tree, String::new(), &mut ours_map).await?;
        self.flatten_tree(&theirs_tree, String::new(), &mut theirs_map).await?;

        let mut paths: Vec<&String> = base_map.keys().chain(ours_map.keys()).chain(theirs_map.keys()).collect();
        paths.sort();
        paths.dedup();

        let mut index = Index::new();
        for path in paths {
            let base_val = base_map.get(path);
            let ours_val = ours_map.get(path);
            let theirs_val = theirs_map.get(path);
            if ours_val == theirs_val {
                if let Some((mode, oid)) = ours_val {
                    index.stage(crate::subpath::SubPath::new(path.clone()).unwrap(), *mode, oid.clone());
                }
                continue;
            }
            if ours_val == base_val {
                if let Some((mode, oid)) = theirs_val {
                    index.stage(crate::subpath::SubPath::new(path.clone()).unwrap(), *mode, oid.clone());
                }
                continue;
            }
            if theirs_val == base_val {
                if let Some((mode, oid)) = ours_val {
                    index.stage(crate::subpath::SubPath::new(path.clone()).unwrap(), *mode, oid.clone());
                }
                continue;
            }
            index.conflict_add(
                crate::subpath::SubPath::new(path.clone()).unwrap(),
                base_val.cloned(),
                ours_val.cloned(),
                theirs_val.cloned(),
            );
        }
        Ok(index)
    }

    async fn read_index(&self) -> Result<Index, BackendError> {
        Ok(self.store.read().unwrap().index.clone().unwrap_or_default())
    }

    async fn write_index(&self, index: &Index) -> Result<(), BackendError> {
        self.store.write().unwrap().index = Some(index.clone());
        Ok(())
    }

    async fn fetch(&self, url: &str, oid: &Oid) -> Result<(), BackendError> {
        if self.store.read().unwrap().commits.contains_key(oid) {
            return Ok(());
        }
        let remote = self
            .remotes
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| BackendError::Network {
                url: url.to_owned(),
                message: "no such remote registered".to_owned(),
            })?;
        self.copy_commit_closure(&remote, oid).map_err(|e| BackendError::Network {
            url: url.to_owned(),
            message: e.to_string(),
        })
    }

    async fn push(&self, url: &str, refname: &str, target: &Oid, force: bool) -> Result<(), BackendError> {
        let remote = self
            .remotes
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| BackendError::Network {
                url: url.to_owned(),
                message: "no such remote registered".to_owned(),
            })?;
        remote.copy_commit_closure(self, target).map_err(|e| BackendError::Network {
            url: url.to_owned(),
            message: e.to_string(),
        })?;
        remote.set_ref(refname, target, force).await.map_err(|e| BackendError::Network {
            url: url.to_owned(),
            message: e.to_string(),
        })
    }

    async fn notes_read(&self, notes_ref: &str, key: &Oid) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self
            .store
            .read()
            .unwrap()
            .notes
            .get(notes_ref)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn notes_write(&self, notes_ref: &str, key: &Oid, value: &[u8]) -> Result<(), BackendError> {
        self.store
            .write()
            .unwrap()
            .notes
            .entry(notes_ref.to_owned())
            .or_default()
            .insert(key.clone(), value.to_vec());
        Ok(())
    }

    async fn set_remote_url(&self, name: &str, url: &str) -> Result<(), BackendError> {
        self.named_remotes.write().unwrap().insert(name.to_owned(), url.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Signature;

    fn sig() -> Signature {
        Signature {
            name: "Test".into(),
            email: "test@example.com".into(),
            timestamp: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
        }
    }

    #[tokio::test]
    async fn write_blob_is_content_addressed() {
        let backend = MemoryBackend::new();
        let a1 = backend.write_blob(b"hello").await.unwrap();
        let a2 = backend.write_blob(b"hello").await.unwrap();
        let b = backend.write_blob(b"world").await.unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[tokio::test]
    async fn fetch_copies_commit_closure_from_linked_remote() {
        let remote = Arc::new(MemoryBackend::new());
        let blob = remote.write_blob(b"contents").await.unwrap();
        let tree = remote
            .write_tree(&[TreeEntry {
                name: "file".into(),
                mode: Mode::File,
                oid: blob,
            }])
            .await
            .unwrap();
        let commit = remote
            .write_commit(&CommitData {
                tree,
                parents: vec![],
                author: sig(),
                committer: sig(),
                message: "initial".into(),
                encoding: None,
            })
            .await
            .unwrap();

        let local = MemoryBackend::new();
        local.link_remote("https://example.com/sub.git", remote);
        assert!(local.read_commit(&commit).await.is_err());
        local.fetch("https://example.com/sub.git", &commit).await.unwrap();
        let fetched = local.read_commit(&commit).await.unwrap();
        assert_eq!(fetched.message, "initial");
    }

    #[tokio::test]
    async fn merge_commits_reports_conflict_on_divergent_edits() {
        let backend = MemoryBackend::new();
        let base_blob = backend.write_blob(b"base").await.unwrap();
        let base_tree = backend
            .write_tree(&[TreeEntry {
                name: "f".into(),
                mode: Mode::File,
                oid: base_blob,
            }])
            .await
            .unwrap();
        let base_commit = backend
            .write_commit(&CommitData {
                tree: base_tree,
                parents: vec![],
                author: sig(),
                committer: sig(),
                message: "base".into(),
                encoding: None,
            })
            .await
            .unwrap();

        let ours_blob = backend.write_blob(b"ours").await.unwrap();
        let ours_tree = backend
            .write_tree(&[TreeEntry {
                name: "f".into(),
                mode: Mode::File,
                oid: ours_blob,
            }])
            .await
            .unwrap();
        let ours_commit = backend
            .write_commit(&CommitData {
                tree: ours_tree,
                parents: vec![base_commit.clone()],
                author: sig(),
                committer: sig(),
                message: "ours".into(),
                encoding: None,
            })
            .await
            .unwrap();

        let theirs_blob = backend.write_blob(b"theirs").await.unwrap();
        let theirs_tree = backend
            .write_tree(&[TreeEntry {
                name: "f".into(),
                mode: Mode::File,
                oid: theirs_blob,
            }])
            .await
            .unwrap();
        let theirs_commit = backend
            .write_commit(&CommitData {
                tree: theirs_tree,
                parents: vec![base_commit],
                author: sig(),
                committer: sig(),
                message: "theirs".into(),
                encoding: None,
            })
            .await
            .unwrap();

        let index = backend.merge_commits(&ours_commit, &theirs_commit).await.unwrap();
        let path = crate::subpath::SubPath::new("f").unwrap();
        assert!(index.is_conflicted(&path));
    }
}
