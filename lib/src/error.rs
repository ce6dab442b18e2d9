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

//! Crate-wide error taxonomy.
//!
//! Every module defines its own `thiserror` enum for the failures specific
//! to it; this module defines the crate-level [`GitMetaError`] that every
//! public entry point returns, plus the two error kinds that cut across
//! modules: [`UserError`] (a violated operation precondition, surfaced
//! verbatim) and [`FetchError`] (a failed remote operation).

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::classifier::ClassifierError;
use crate::config::ConfigError;
use crate::destitch::DestitchError;
use crate::driver::DriverError;
use crate::gitmodules::GitModulesError;
use crate::sequencer::SequencerError;
use crate::stitch::StitchError;
use crate::synthetic_ref::SyntheticRefError;

/// Exit-code contract mirrored from `spec.md` §7: `UserError` maps to -1,
/// `FetchError` to -128. The crate itself never calls `process::exit`; this
/// exists so an embedding CLI can reproduce the documented exit codes.
pub trait ExitCode {
    fn exit_code(&self) -> i32;
}

/// A violated precondition stated in an operation's contract: no commit
/// specified, cannot use flag X without Y, path already exists, branch
/// missing, a URL change was detected, unresolved conflicts before
/// `--continue`, and so on. Surfaced verbatim to the user.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
}

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        UserError {
            message: message.into(),
        }
    }
}

impl ExitCode for UserError {
    fn exit_code(&self) -> i32 {
        -1
    }
}

/// A remote operation (fetch or push) failed. Carries the resolved URL the
/// operation was attempted against and the underlying cause.
#[derive(Debug, Error)]
#[error("fetch failed for {url}: {cause}")]
pub struct FetchError {
    pub url: String,
    #[source]
    pub cause: BackendError,
}

impl ExitCode for FetchError {
    fn exit_code(&self) -> i32 {
        -128
    }
}

/// `continue`/`abort` invoked with no in-progress operation. Always
/// surfaced to the user as a [`UserError`].
#[derive(Debug, Error)]
#[error("no {kind} is in progress")]
pub struct SequencerMissingError {
    pub kind: &'static str,
}

impl From<SequencerMissingError> for UserError {
    fn from(value: SequencerMissingError) -> Self {
        UserError::new(value.to_string())
    }
}

/// An internal invariant was violated by the caller (e.g. the tree builder
/// was asked to treat one path as both a file and a directory). Not part of
/// the public error enum: callers should treat this as a programmer error
/// and let it panic, same as an `assert!` would.
#[derive(Debug)]
pub struct InvariantViolation(pub String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal invariant violated: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

/// The error type returned by every public, fallible entry point in this
/// crate. One variant per component error enum, plus the two cross-cutting
/// kinds.
#[derive(Debug, Error)]
pub enum GitMetaError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    GitModules(#[from] GitModulesError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    SyntheticRef(#[from] SyntheticRefError),
    #[error(transparent)]
    Stitch(#[from] StitchError),
    #[error(transparent)]
    Destitch(#[from] DestitchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ExitCode for GitMetaError {
    fn exit_code(&self) -> i32 {
        match self {
            GitMetaError::User(e) => e.exit_code(),
            GitMetaError::Fetch(e) => e.exit_code(),
            _ => 1,
        }
    }
}
