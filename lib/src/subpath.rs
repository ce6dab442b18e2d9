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

//! A normalized, `/`-separated relative path used to key everything that
//! lives inside a meta-tree: submodule bindings, index entries, diff
//! results. Scaled-down analogue of a `RepoPathBuf`: owned, UTF-8, no
//! leading or trailing slash, `.`/`..` components rejected rather than
//! resolved (a meta-tree path is always already normalized on disk).

use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubPath(String);

impl serde::Serialize for SubPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SubPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SubPath::new(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid sub-repository path {0:?}")]
pub struct InvalidSubPath(pub String);

impl SubPath {
    /// Normalizes `s`: strips a trailing `/`, rejects empty components,
    /// `.`, `..`, and backslashes (so callers can't construct a path that
    /// would escape the meta-tree or disagree with a literal tree entry
    /// name).
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidSubPath> {
        let s = s.into();
        let trimmed = s.strip_suffix('/').unwrap_or(&s);
        if trimmed.is_empty() {
            return Err(InvalidSubPath(s));
        }
        for component in trimmed.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(InvalidSubPath(s));
            }
            if component.contains('\\') {
                return Err(InvalidSubPath(s));
            }
        }
        Ok(SubPath(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('/')
    }

    pub fn file_name(&self) -> &str {
        self.components().next_back().unwrap_or(&self.0)
    }

    /// The parent path, or `None` if this is a single top-level component.
    pub fn parent(&self) -> Option<SubPath> {
        let (head, _) = self.0.rsplit_once('/')?;
        Some(SubPath(head.to_owned()))
    }

    pub fn join(&self, component: &str) -> SubPath {
        SubPath(format!("{}/{}", self.0, component))
    }

    pub fn starts_with(&self, prefix: &SubPath) -> bool {
        self.0 == prefix.0 || self.0.starts_with(&format!("{}/", prefix.0))
    }

    /// Strips `prefix` from `self`, returning the remainder (without a
    /// leading slash), or `None` if `self` is not under `prefix`.
    pub fn strip_prefix(&self, prefix: &SubPath) -> Option<&str> {
        if self.0 == prefix.0 {
            Some("")
        } else {
            self.0.strip_prefix(&format!("{}/", prefix.0))
        }
    }

    pub fn as_std_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for SubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SubPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
