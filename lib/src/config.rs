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

//! Typed access to the config keys this crate reads (`spec.md` §6,
//! `SPEC_FULL.md` §4.K). Grounded on this crate's `UserSettings`-style
//! layered config wrapper: a plain key-value map supplied by the embedding
//! application (typically read out of `git2::Config` by the caller) rather
//! than a TOML loader of its own, since `.gitmodules`/git-config are the
//! only on-disk formats this crate's scope calls for.

use std::collections::HashMap;

use thiserror::Error;

use crate::backend::Signature;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key {0:?}")]
    MissingKey(&'static str),
    #[error("config key {key:?} has value {value:?}, which is not a valid boolean")]
    InvalidBool { key: &'static str, value: String },
}

/// A layered key-value store, populated by the embedder. Keys are the
/// dotted names in `spec.md` §6 (`gitmeta.subrepourlbase`, `user.name`, …).
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Settings { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn subrepo_url_base(&self) -> Option<&str> {
        self.get("gitmeta.subrepourlbase")
    }

    pub fn subrepo_suffix(&self) -> Option<&str> {
        self.get("gitmeta.subreposuffix")
    }

    pub fn subrepo_root_path(&self) -> Option<&str> {
        self.get("gitmeta.subreporootpath")
    }

    pub fn skip_synthetic_ref_pattern(&self) -> Option<&str> {
        self.get("gitmeta.skipsyntheticrefpattern")
    }

    pub fn skip_synthetic_ref_path_pattern(&self) -> Option<&str> {
        self.get("gitmeta.skipsyntheticrefpathpattern")
    }

    pub fn synthetic_ref_notes_repo_path(&self) -> Option<&str> {
        self.get("gitmeta.syntheticrefnotesrepopath")
    }

    pub fn submodule_template_path(&self) -> Option<&str> {
        self.get("meta.submoduletemplatepath")
    }

    /// The signature used for commits this crate writes on the caller's
    /// behalf. Missing `user.name`/`user.email` is a hard [`ConfigError`]
    /// rather than a silent default, per `SPEC_FULL.md` §4.K.
    pub fn signature(&self, timestamp: chrono::DateTime<chrono::FixedOffset>) -> Result<Signature, ConfigError> {
        let name = self.get("user.name").ok_or(ConfigError::MissingKey("user.name"))?;
        let email = self.get("user.email").ok_or(ConfigError::MissingKey("user.email"))?;
        Ok(Signature { name: name.to_owned(), email: email.to_owned(), timestamp })
    }

    fn bool_key(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => match value {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidBool { key, value: value.to_owned() }),
            },
        }
    }

    pub fn pull_rebase(&self) -> Result<Option<bool>, ConfigError> {
        self.bool_key("pull.rebase")
    }

    pub fn branch_rebase(&self, branch: &str) -> Result<Option<bool>, ConfigError> {
        match self.values.get(&format!("branch.{branch}.rebase")) {
            None => Ok(None),
            Some(value) => match value.as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidBool { key: "branch.<b>.rebase", value: value.clone() }),
            },
        }
    }
}
