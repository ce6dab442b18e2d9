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

//! The object-store adapter (`spec.md` §6 / §4.A). `gitmeta-core` never
//! implements Git's on-disk object format itself: it consumes one through
//! the [`Backend`] trait, the way `jj-lib` consumes `git2`/`gix` behind its
//! own `Backend` trait. [`memory::MemoryBackend`] is the backend every unit
//! test in this crate runs against; [`git2_backend::Git2Backend`] is the
//! optional, feature-gated real-world implementation.

#[cfg(feature = "git2")]
pub mod git2_backend;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::index::Index;

/// A content-address. Stored inline up to 32 bytes (enough for SHA-1,
/// SHA-256, or the BLAKE2b-256 hashes `memory::MemoryBackend` uses) so the
/// overwhelming majority of ids never allocate. Serializes as its hex form,
/// since every on-disk JSON document this crate writes (sequencer state,
/// reference notes) wants a sha string, not a byte array.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(SmallVec<[u8; 32]>);

impl Serialize for Oid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Oid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Oid {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Oid(SmallVec::from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Oid(SmallVec::from_vec(hex::decode(s)?)))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.hex())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// The mode of a tree entry. `Gitlink` is the mode that makes a tree entry
/// a submodule binding (`spec.md` glossary: "Gitlink").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    File,
    Executable,
    Symlink,
    Tree,
    /// Mode 0o160000: a pinned sub-repository commit id.
    Gitlink,
}

impl Mode {
    pub fn is_gitlink(self) -> bool {
        matches!(self, Mode::Gitlink)
    }

    /// The raw Git mode bits, for backends that need to serialize them.
    pub fn as_u32(self) -> u32 {
        match self {
            Mode::File => 0o100644,
            Mode::Executable => 0o100755,
            Mode::Symlink => 0o120000,
            Mode::Tree => 0o040000,
            Mode::Gitlink => 0o160000,
        }
    }

    pub fn from_u32(bits: u32) -> Option<Mode> {
        match bits {
            0o100644 | 0o100664 => Some(Mode::File),
            0o100755 => Some(Mode::Executable),
            0o120000 => Some(Mode::Symlink),
            0o040000 => Some(Mode::Tree),
            0o160000 => Some(Mode::Gitlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: Mode,
    pub oid: Oid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: chrono::DateTime<chrono::FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitData {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    /// Original message encoding, preserved verbatim through rewrites per
    /// `spec.md` §4.I step 4 ("create a commit with the original author/
    /// committer/encoding").
    pub encoding: Option<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object {0} not found")]
    NotFound(Oid),
    #[error("ref {0:?} not found")]
    RefNotFound(String),
    #[error("ref update for {name:?} was not a fast-forward and force was not set")]
    RefUpdateNotFastForward { name: String },
    #[error("network operation against {url:?} failed: {message}")]
    Network { url: String, message: String },
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend-specific error: {0}")]
    Other(String),
}

/// The capabilities `gitmeta-core` needs from an object store, exactly the
/// list in `spec.md` §6. Every method is a suspension point (`spec.md` §5):
/// implementations are expected to do their own I/O inside, not block the
/// executor.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn read_blob(&self, oid: &Oid) -> Result<Vec<u8>, BackendError>;
    async fn read_tree(&self, oid: &Oid) -> Result<Vec<TreeEntry>, BackendError>;
    async fn read_commit(&self, oid: &Oid) -> Result<CommitData, BackendError>;

    async fn write_blob(&self, data: &[u8]) -> Result<Oid, BackendError>;
    async fn write_tree(&self, entries: &[TreeEntry]) -> Result<Oid, BackendError>;
    async fn write_commit(&self, commit: &CommitData) -> Result<Oid, BackendError>;

    /// Resolves a ref name or shorthand to an oid, or `None` if it doesn't
    /// exist. Never an error on "not found" — only on a genuine I/O or
    /// corruption failure.
    async fn resolve(&self, ref_or_shorthand: &str) -> Result<Option<Oid>, BackendError>;
    async fn set_ref(&self, name: &str, oid: &Oid, force: bool) -> Result<(), BackendError>;
    async fn delete_ref(&self, name: &str) -> Result<(), BackendError>;
    async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, Oid)>, BackendError>;

    /// All ancestors of `start`, inclusive, in unspecified order. Used by
    /// the stitch engine's ancestor listing (`spec.md` §4.I step 1) and by
    /// synthetic-ref pre-receive's walk (`spec.md` §4.H).
    async fn walk_ancestors(&self, start: &[Oid]) -> Result<Vec<Oid>, BackendError>;
    async fn parents(&self, oid: &Oid) -> Result<Vec<Oid>, BackendError>;
    async fn merge_bases(&self, a: &Oid, b: &Oid) -> Result<Vec<Oid>, BackendError>;
    async fn descendant_of(&self, candidate: &Oid, ancestor: &Oid) -> Result<bool, BackendError>;

    /// A three-way merge of `ours`/`theirs` against their merge base,
    /// producing an [`Index`] whose non-agreeing paths carry conflict
    /// stages (`spec.md` §6: `merge_commits(ours, theirs) ->
    /// tree_index_with_stages`).
    async fn merge_commits(&self, ours: &Oid, theirs: &Oid) -> Result<Index, BackendError>;

    async fn read_index(&self) -> Result<Index, BackendError>;
    async fn write_index(&self, index: &Index) -> Result<(), BackendError>;

    /// No-op if `oid` is already reachable locally. Resolves `url` and
    /// fetches `oid` from there otherwise.
    async fn fetch(&self, url: &str, oid: &Oid) -> Result<(), BackendError>;
    async fn push(
        &self,
        url: &str,
        refname: &str,
        target: &Oid,
        force: bool,
    ) -> Result<(), BackendError>;

    async fn notes_read(&self, notes_ref: &str, key: &Oid) -> Result<Option<Vec<u8>>, BackendError>;
    async fn notes_write(&self, notes_ref: &str, key: &Oid, value: &[u8]) -> Result<(), BackendError>;

    /// Sets (creating if absent) the `name`d remote's URL. Used when opening
    /// a sub-repository to point its `origin` at the resolved submodule URL
    /// (`spec.md` §4.D: "configures the `origin` remote to the resolved
    /// URL").
    async fn set_remote_url(&self, name: &str, url: &str) -> Result<(), BackendError>;
}
