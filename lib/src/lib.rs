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

//! Core engine for treating a tree of content-addressed sub-repositories
//! as one logical meta-repository.
//!
//! A meta-repository is an ordinary commit graph whose trees mix regular
//! blobs with gitlink entries, each gitlink pointing at a commit in a
//! separately-versioned sub-repository named by a [`gitmodules`] URL. This
//! crate reimplements the handful of operations that make that mixture
//! usable as one unit: merging a meta-commit means classifying every
//! conflicted gitlink and recursively resolving it inside the sub-repo
//! ([`classifier`], [`driver`]); pushing one means proving every
//! referenced sub-commit is reachable on the remote before the meta-commit
//! is accepted ([`synthetic_ref`]); converting between a meta-repository
//! and its flattened, single-history form is its own pair of graph
//! rewrites ([`stitch`], [`destitch`]).
//!
//! None of this depends on an on-disk working copy or a specific Git
//! implementation: every operation here is expressed against the
//! [`backend::Backend`] trait, an async object-store abstraction with an
//! in-memory reference implementation ([`backend::memory`]) that every
//! test in this crate runs against, and an optional `git2`-backed
//! implementation (`backend::git2_backend`, behind the `git2` feature)
//! for talking to a real repository.

pub mod backend;
pub mod classifier;
pub mod config;
pub mod destitch;
pub mod driver;
pub mod error;
pub mod file_util;
pub mod gitmodules;
pub mod index;
pub mod opener;
pub mod sequencer;
pub mod stitch;
pub mod subpath;
pub mod synthetic_ref;
pub mod tree_builder;

pub use backend::Backend;
pub use error::GitMetaError;
pub use subpath::SubPath;
