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

//! Persists and resumes multi-commit operations (`spec.md` §4.G). The
//! on-disk write is atomic tmp-file-then-rename, the same pattern this
//! crate's `clear_predecessors` command uses for its own state file
//! (`cli/src/commands/util/clear_predecessors.rs`), adapted from a
//! single-shot write to the advance-after-every-step lifecycle a
//! cherry-pick/rebase/merge sequence needs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::Oid;
use crate::file_util::persist_content_addressed_temp_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerKind {
    CherryPick,
    Rebase,
    Merge,
}

impl SequencerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SequencerKind::CherryPick => "cherry-pick",
            SequencerKind::Rebase => "rebase",
            SequencerKind::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    pub sha: Oid,
    pub ref_name: Option<String>,
}

/// `spec.md` §3: `SequencerState`. Present iff a multi-commit operation is
/// in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerState {
    pub kind: SequencerKind,
    pub original_head: RefTarget,
    pub target: RefTarget,
    pub commits: Vec<Oid>,
    pub current_index: usize,
    pub message: Option<String>,
}

impl SequencerState {
    pub fn remaining(&self) -> &[Oid] {
        &self.commits[self.current_index.min(self.commits.len())..]
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.commits.len()
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed sequencer state at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> SequencerError {
    SequencerError::Io { path: path.to_path_buf(), source }
}

/// The well-known location under the meta-git-dir (`spec.md` §4.G). Kept
/// as a bare filename here; callers join it under their own git-dir root.
pub const SEQUENCER_FILE_NAME: &str = "git-meta-sequencer.json";

/// Reads the sequencer state at `path`, or `None` if no operation is in
/// progress.
pub fn read(path: &Path) -> Result<Option<SequencerState>, SequencerError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let state = serde_json::from_slice(&bytes).map_err(|source| SequencerError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Atomically writes `state` to `path`: write to a sibling tmp file, then
/// rename over the destination, so a crash mid-write never leaves a
/// half-written sequencer file.
pub fn write(path: &Path, state: &SequencerState) -> Result<(), SequencerError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_err(path, e))?;
    let bytes = serde_json::to_vec_pretty(state).expect("SequencerState always serializes");
    std::io::Write::write_all(&mut tmp, &bytes).map_err(|e| io_err(path, e))?;
    persist_content_addressed_temp_file(tmp, path).map_err(|e| io_err(path, e))?;
    tracing::debug!(?path, current_index = state.current_index, total = state.commits.len(), "sequencer state persisted");
    Ok(())
}

/// Advances `current_index` to `new_index` in-place, persisting the new
/// state atomically.
pub fn advance(path: &Path, state: &mut SequencerState, new_index: usize) -> Result<(), SequencerError> {
    state.current_index = new_index;
    write(path, state)
}

/// Deletes the sequencer file on completion or explicit abort. A missing
/// file is not an error: deletion is idempotent.
pub fn delete(path: &Path) -> Result<(), SequencerError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(?path, "sequencer state deleted");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}
