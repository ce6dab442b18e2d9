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

//! The index: an ordered `path -> (mode, oid, stage)` mapping (`spec.md`
//! §3, `Index`). Within one path, either exactly one `Normal` entry, or one
//! each of `{Ancestor, Ours, Theirs}` — never mixed, per the stated
//! invariant.

use std::collections::BTreeMap;

use crate::backend::{Mode, Oid};
use crate::subpath::SubPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Normal,
    Ancestor,
    Ours,
    Theirs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub mode: Mode,
    pub oid: Oid,
    pub stage: Stage,
}

/// The conflicting versions recorded for one path, gathered from the three
/// non-normal stages. Any subset may be absent (e.g. add/add has no
/// `ancestor`; delete/modify has no `ours` or no `theirs`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSides {
    pub ancestor: Option<(Mode, Oid)>,
    pub ours: Option<(Mode, Oid)>,
    pub theirs: Option<(Mode, Oid)>,
}

/// `path -> entries`. A path maps to 1 entry at `Stage::Normal`, or up to 3
/// entries at `{Ancestor, Ours, Theirs}`; `BTreeMap<SubPath, _>` keeps
/// iteration in path order for free, which both `write_tree` and the
/// classifier rely on for determinism.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: BTreeMap<SubPath, Vec<IndexEntry>>,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    /// Replaces any existing entry at `path` with a single `Normal` entry.
    pub fn stage(&mut self, path: SubPath, mode: Mode, oid: Oid) {
        self.entries.insert(
            path,
            vec![IndexEntry {
                mode,
                oid,
                stage: Stage::Normal,
            }],
        );
    }

    pub fn unstage(&mut self, path: &SubPath) {
        self.entries.remove(path);
    }

    pub fn get_normal(&self, path: &SubPath) -> Option<&IndexEntry> {
        let entries = self.entries.get(path)?;
        entries.iter().find(|e| e.stage == Stage::Normal)
    }

    pub fn is_conflicted(&self, path: &SubPath) -> bool {
        self.entries
            .get(path)
            .is_some_and(|es| es.iter().any(|e| e.stage != Stage::Normal))
    }

    /// All paths that currently carry a non-normal stage, paired with
    /// whichever of {ancestor, ours, theirs} are present. This is the input
    /// the classifier scans in step 1 of `spec.md` §4.E.
    pub fn conflicts(&self) -> impl Iterator<Item = (&SubPath, ConflictSides)> {
        self.entries.iter().filter_map(|(path, entries)| {
            if entries.iter().all(|e| e.stage == Stage::Normal) {
                return None;
            }
            let mut sides = ConflictSides::default();
            for e in entries {
                let slot = match e.stage {
                    Stage::Ancestor => &mut sides.ancestor,
                    Stage::Ours => &mut sides.ours,
                    Stage::Theirs => &mut sides.theirs,
                    Stage::Normal => continue,
                };
                *slot = Some((e.mode, e.oid.clone()));
            }
            Some((path, sides))
        })
    }

    /// Adds a conflict entry at `path` replacing whatever was there. Any of
    /// `ancestor`/`ours`/`theirs` may be omitted (e.g. add/add conflicts
    /// have no ancestor).
    pub fn conflict_add(
        &mut self,
        path: SubPath,
        ancestor: Option<(Mode, Oid)>,
        ours: Option<(Mode, Oid)>,
        theirs: Option<(Mode, Oid)>,
    ) {
        let mut entries = Vec::with_capacity(3);
        if let Some((mode, oid)) = ancestor {
            entries.push(IndexEntry {
                mode,
                oid,
                stage: Stage::Ancestor,
            });
        }
        if let Some((mode, oid)) = ours {
            entries.push(IndexEntry {
                mode,
                oid,
                stage: Stage::Ours,
            });
        }
        if let Some((mode, oid)) = theirs {
            entries.push(IndexEntry {
                mode,
                oid,
                stage: Stage::Theirs,
            });
        }
        self.entries.insert(path, entries);
    }

    /// Converts every non-normal entry back to `Normal` using the *ours*
    /// side, dropping the rest. A path whose conflict has no `ours` side
    /// (pure deletion) is removed entirely. Used after the classifier has
    /// extracted conflicts for independent processing (`spec.md` §4.C).
    pub fn conflict_cleanup(&mut self) {
        let paths: Vec<SubPath> = self.entries.keys().cloned().collect();
        for path in paths {
            let entries = self.entries.get(&path).unwrap();
            if entries.iter().all(|e| e.stage == Stage::Normal) {
                continue;
            }
            let ours = entries
                .iter()
                .find(|e| e.stage == Stage::Ours)
                .map(|e| (e.mode, e.oid.clone()));
            match ours {
                Some((mode, oid)) => self.stage(path, mode, oid),
                None => {
                    self.entries.remove(&path);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubPath, &[IndexEntry])> {
        self.entries.iter().map(|(p, es)| (p, es.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(b: u8) -> Oid {
        Oid::from_bytes(&[b; 4])
    }

    #[test]
    fn conflict_cleanup_keeps_ours() {
        let mut index = Index::new();
        let path = SubPath::new("a").unwrap();
        index.conflict_add(
            path.clone(),
            Some((Mode::File, oid(1))),
            Some((Mode::File, oid(2))),
            Some((Mode::File, oid(3))),
        );
        index.conflict_cleanup();
        let entry = index.get_normal(&path).unwrap();
        assert_eq!(entry.oid, oid(2));
        assert!(!index.is_conflicted(&path));
    }

    #[test]
    fn conflict_cleanup_drops_path_with_no_ours() {
        let mut index = Index::new();
        let path = SubPath::new("a").unwrap();
        index.conflict_add(path.clone(), Some((Mode::File, oid(1))), None, Some((Mode::File, oid(3))));
        index.conflict_cleanup();
        assert!(index.get_normal(&path).is_none());
        assert!(!index.is_conflicted(&path));
    }

    #[test]
    fn conflicts_reports_only_non_normal_paths() {
        let mut index = Index::new();
        index.stage(SubPath::new("normal").unwrap(), Mode::File, oid(1));
        index.conflict_add(
            SubPath::new("conflicted").unwrap(),
            None,
            Some((Mode::File, oid(2))),
            Some((Mode::File, oid(3))),
        );
        let conflicted: Vec<_> = index.conflicts().map(|(p, _)| p.as_str().to_owned()).collect();
        assert_eq!(conflicted, vec!["conflicted".to_owned()]);
    }
}
