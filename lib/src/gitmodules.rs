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

//! The submodule config codec (`spec.md` §4.B): parses and emits the
//! `.gitmodules` blob, and resolves a submodule's relative URL against a
//! base URL. Grounded on this crate's own small hand-rolled parsers
//! (`file_util.rs`'s string-surgery style of path helpers) rather than a
//! general INI library, since the on-disk grammar here is a fixed, narrow
//! subset of git-config syntax.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

use crate::backend::Oid;
use crate::subpath::{InvalidSubPath, SubPath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleEntry {
    pub path: SubPath,
    pub url: String,
}

/// `path -> {url}`, keyed by the path-normalized form (`spec.md` §4.B).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitmodulesMap(BTreeMap<SubPath, SubmoduleEntry>);

#[derive(Debug, Error)]
pub enum GitModulesError {
    #[error("line {line}: expected a `[submodule \"name\"]` header, `key = value`, or a comment")]
    Syntax { line: usize },
    #[error("section {name:?} is missing a `path` key")]
    MissingPath { name: String },
    #[error("section {name:?} is missing a `url` key")]
    MissingUrl { name: String },
    #[error("path {0:?}")]
    InvalidPath(#[from] InvalidSubPath),
    #[error("url {url:?} is relative and no base url was supplied")]
    RelativeUrlWithoutBase { url: String },
    #[error("submodule config blob is conflicted at {0} with no resolvable merge")]
    UnresolvedConflict(SubPath),
}

impl GitmodulesMap {
    pub fn new() -> Self {
        GitmodulesMap::default()
    }

    pub fn get(&self, path: &SubPath) -> Option<&SubmoduleEntry> {
        self.0.get(path)
    }

    pub fn insert(&mut self, path: SubPath, url: String) {
        self.0.insert(path.clone(), SubmoduleEntry { path, url });
    }

    pub fn remove(&mut self, path: &SubPath) -> Option<SubmoduleEntry> {
        self.0.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubmoduleEntry> {
        self.0.values()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parses a `.gitmodules` blob: repeated `[submodule "name"]` sections,
    /// each containing `path = …` and `url = …` lines. Blank lines and `#`/
    /// `;`-prefixed comments are ignored; unknown keys inside a section are
    /// ignored (forward-compatible with keys this crate doesn't model, e.g.
    /// `branch` or `update`).
    pub fn parse(blob: &[u8]) -> Result<Self, GitModulesError> {
        let text = String::from_utf8_lossy(blob);
        let mut map = GitmodulesMap::new();
        let mut current_name: Option<String> = None;
        let mut current_path: Option<String> = None;
        let mut current_url: Option<String> = None;

        let finish_section = |name: &Option<String>,
                               path: Option<String>,
                               url: Option<String>,
                               map: &mut GitmodulesMap|
         -> Result<(), GitModulesError> {
            let Some(name) = name.clone() else { return Ok(()) };
            let path = path.ok_or_else(|| GitModulesError::MissingPath { name: name.clone() })?;
            let url = url.ok_or(GitModulesError::MissingUrl { name })?;
            let path = SubPath::new(path)?;
            map.insert(path, url);
            Ok(())
        };

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let rest = rest.strip_suffix(']').ok_or(GitModulesError::Syntax { line: idx + 1 })?;
                let Some(name_part) = rest.strip_prefix("submodule ") else {
                    return Err(GitModulesError::Syntax { line: idx + 1 });
                };
                let name_part = name_part.trim();
                let name = name_part
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .ok_or(GitModulesError::Syntax { line: idx + 1 })?;

                finish_section(&current_name, current_path.take(), current_url.take(), &mut map)?;
                current_name = Some(name.to_owned());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(GitModulesError::Syntax { line: idx + 1 });
            };
            let key = key.trim();
            let value = value.trim().to_owned();
            match key {
                "path" => current_path = Some(value),
                "url" => current_url = Some(value),
                _ => {} // forward-compatible: ignore unknown keys
            }
        }
        finish_section(&current_name, current_path.take(), current_url.take(), &mut map)?;
        Ok(map)
    }

    /// Emits the canonical text form: sections sorted by path (used as the
    /// section name), tab-indented keys, terminating newline.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for entry in self.0.values() {
            let _ = writeln!(out, "[submodule \"{}\"]", entry.path);
            let _ = writeln!(out, "\tpath = {}", entry.path);
            let _ = writeln!(out, "\turl = {}", entry.url);
        }
        out.into_bytes()
    }

    /// Resolves every entry's URL against `base_url` if it starts with `.`,
    /// returning the resolved absolute URLs without mutating `self` (the
    /// stored URL stays whatever the blob says; only callers that need to
    /// dial out resolve it).
    pub fn resolved_url(&self, path: &SubPath, base_url: Option<&str>) -> Result<String, GitModulesError> {
        let entry = self
            .get(path)
            .ok_or_else(|| GitModulesError::MissingUrl { name: path.to_string() })?;
        resolve_url(&entry.url, base_url)
    }
}

/// A URL beginning with `.` is resolved against `base_url` by path join,
/// stripping any trailing `/` from the result. A relative URL with no base
/// is a fatal configuration error (`spec.md` §4.B).
pub fn resolve_url(url: &str, base_url: Option<&str>) -> Result<String, GitModulesError> {
    if !url.starts_with('.') {
        return Ok(url.to_owned());
    }
    let Some(base) = base_url else {
        return Err(GitModulesError::RelativeUrlWithoutBase { url: url.to_owned() });
    };
    let base = base.strip_suffix('/').unwrap_or(base);
    let mut segments: Vec<&str> = base.split('/').collect();
    for component in url.split('/') {
        match component {
            "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    Ok(joined.strip_suffix('/').unwrap_or(&joined).to_owned())
}

/// Resolves a three-way conflict on the `.gitmodules` blob itself, used by
/// the classifier (`spec.md` §4.E step 3) when the conflicted path is the
/// submodule-config path rather than a gitlink. Unlike an ordinary file
/// conflict, the three sides are parsed and merged key-by-key: a path
/// present with the same URL on both `ours`/`theirs` is kept, a path added
/// or changed on exactly one side is taken from that side, and a path
/// changed differently on both sides is a genuine, unresolved conflict.
pub fn resolve_module_file_conflicts(
    ancestor: Option<&[u8]>,
    ours: &[u8],
    theirs: &[u8],
) -> Result<GitmodulesMap, GitModulesError> {
    let ancestor_map = ancestor.map(GitmodulesMap::parse).transpose()?.unwrap_or_default();
    let ours_map = GitmodulesMap::parse(ours)?;
    let theirs_map = GitmodulesMap::parse(theirs)?;

    let mut paths: Vec<&SubPath> = ancestor_map.0.keys().chain(ours_map.0.keys()).chain(theirs_map.0.keys()).collect();
    paths.sort();
    paths.dedup();

    let mut merged = GitmodulesMap::new();
    for path in paths {
        let base = ancestor_map.get(path).map(|e| &e.url);
        let ours_url = ours_map.get(path).map(|e| &e.url);
        let theirs_url = theirs_map.get(path).map(|e| &e.url);

        let resolved = if ours_url == theirs_url {
            ours_url.cloned()
        } else if ours_url == base {
            theirs_url.cloned()
        } else if theirs_url == base {
            ours_url.cloned()
        } else {
            return Err(GitModulesError::UnresolvedConflict(path.clone()));
        };
        if let Some(url) = resolved {
            merged.insert(path.clone(), url);
        }
    }
    Ok(merged)
}

/// Flushes `map` as a blob and stages it in `index` at the conventional
/// `.gitmodules` path, returning the written blob's id. Always writes and
/// stages regardless of whether the content actually changed (`spec.md`
/// §9 open question: `write_urls` unconditionally flushes).
pub async fn write_urls(
    index: &mut crate::index::Index,
    backend: &dyn crate::backend::Backend,
    map: &GitmodulesMap,
) -> Result<Oid, crate::backend::BackendError> {
    let blob = map.serialize();
    let oid = backend.write_blob(&blob).await?;
    index.stage(gitmodules_path(), crate::backend::Mode::File, oid.clone());
    Ok(oid)
}

pub fn gitmodules_path() -> SubPath {
    SubPath::new(".gitmodules").expect(".gitmodules is always a valid SubPath")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_blob() {
        let blob = b"[submodule \"vendor/libfoo\"]\n\tpath = vendor/libfoo\n\turl = https://example.com/libfoo.git\n";
        let map = GitmodulesMap::parse(blob).unwrap();
        let path = SubPath::new("vendor/libfoo").unwrap();
        assert_eq!(map.get(&path).unwrap().url, "https://example.com/libfoo.git");
    }

    #[test]
    fn roundtrips_through_serialize() {
        let mut map = GitmodulesMap::new();
        map.insert(SubPath::new("b").unwrap(), "u2".into());
        map.insert(SubPath::new("a").unwrap(), "u1".into());
        let blob = map.serialize();
        let reparsed = GitmodulesMap::parse(&blob).unwrap();
        assert_eq!(map, reparsed);
        // Sections are sorted by path regardless of insertion order.
        let text = String::from_utf8(blob).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }

    #[test]
    fn missing_url_is_an_error() {
        let blob = b"[submodule \"x\"]\n\tpath = x\n";
        assert!(matches!(GitmodulesMap::parse(blob), Err(GitModulesError::MissingUrl { .. })));
    }

    #[test]
    fn resolves_relative_url_against_base() {
        let resolved = resolve_url("../libfoo.git", Some("https://example.com/group/meta.git")).unwrap();
        assert_eq!(resolved, "https://example.com/libfoo.git");
    }

    #[test]
    fn relative_url_without_base_is_fatal() {
        assert!(matches!(
            resolve_url("./libfoo.git", None),
            Err(GitModulesError::RelativeUrlWithoutBase { .. })
        ));
    }

    #[test]
    fn absolute_url_is_returned_unchanged() {
        assert_eq!(resolve_url("https://example.com/x.git", None).unwrap(), "https://example.com/x.git");
    }

    #[test]
    fn resolve_module_file_conflicts_keeps_unrelated_additions_from_both_sides() {
        let ours = b"[submodule \"a\"]\n\tpath = a\n\turl = u-a\n";
        let theirs = b"[submodule \"b\"]\n\tpath = b\n\turl = u-b\n";
        let merged = resolve_module_file_conflicts(None, ours, theirs).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn resolve_module_file_conflicts_rejects_divergent_edit_of_same_path() {
        let ancestor = b"[submodule \"a\"]\n\tpath = a\n\turl = base\n";
        let ours = b"[submodule \"a\"]\n\tpath = a\n\turl = ours-url\n";
        let theirs = b"[submodule \"a\"]\n\tpath = a\n\turl = theirs-url\n";
        let result = resolve_module_file_conflicts(Some(ancestor), ours, theirs);
        assert!(matches!(result, Err(GitModulesError::UnresolvedConflict(_))));
    }
}
