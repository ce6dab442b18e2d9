// Copyright 2025 The Jujutsu Authors
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

//! Test helpers shared across `gitmeta-core`'s integration tests and unit
//! tests: a scratch [`gitmeta_core::backend::memory::MemoryBackend`] factory
//! plus fixed signatures, and the [`proptest`] submodule-binding state
//! machine consumed by `tree_builder`'s property tests.

pub mod proptest;

use std::sync::Arc;

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::Signature;

/// A fresh, empty backend for one test.
pub fn new_backend() -> Arc<MemoryBackend> {
    MemoryBackend::new().into_arc()
}

/// A deterministic signature, since wall-clock timestamps would make test
/// output non-reproducible.
pub fn test_signature(name: &str) -> Signature {
    Signature {
        name: name.to_owned(),
        email: format!("{name}@example.com"),
        timestamp: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
    }
}
