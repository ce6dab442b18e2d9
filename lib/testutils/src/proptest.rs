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

//! A reference model of the bindings in one meta-tree: which [`SubPath`]s
//! are bound to a submodule, and at what commit. [`Transition`] mirrors the
//! three ways a meta-commit can touch a binding (`spec.md` §4.B/§4.E):
//! binding a new path, repinning an existing one to a different
//! sub-commit, and unbinding a path entirely. Used by the property tests
//! that exercise the classifier and tree builder against arbitrary
//! sequences of these transitions.

use std::collections::BTreeMap;

use gitmeta_core::subpath::SubPath;
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::select;
use proptest_state_machine::ReferenceStateMachine;

/// A 20-byte commit id, the resolution `backend::Oid::from_bytes` and
/// `backend::memory::MemoryBackend` both work in.
pub type FakeSha = [u8; 4];

#[derive(Debug, Clone, Default)]
pub struct BindingState {
    bindings: BTreeMap<SubPath, (String, FakeSha)>,
}

impl BindingState {
    pub fn bindings(&self) -> impl IntoIterator<Item = (&SubPath, &str, FakeSha)> + '_ {
        self.bindings
            .iter()
            .map(|(path, (url, sha))| (path, url.as_str(), *sha))
    }

    pub fn is_bound(&self, path: &SubPath) -> bool {
        self.bindings.contains_key(path)
    }
}

#[derive(Debug, Clone)]
pub enum Transition {
    /// Binds a new submodule at `path` to `url`, pinned at `sha`.
    BindSubmodule {
        path: SubPath,
        url: String,
        sha: FakeSha,
    },
    /// Repins an already-bound path to a different sub-commit, same URL.
    RepinSubmodule { path: SubPath, sha: FakeSha },
    /// Removes the binding at `path` entirely.
    UnbindSubmodule { path: SubPath },
}

fn arb_path_component() -> impl Strategy<Value = String> {
    "(alpha|beta|gamma|delta|[a-z]{1,6})".prop_filter("not a reserved component", |s| {
        s != "." && s != ".."
    })
}

fn arb_sub_path() -> impl Strategy<Value = SubPath> {
    vec(arb_path_component(), 1..4).prop_map(|components| {
        SubPath::new(components.join("/")).expect("generated components are already normalized")
    })
}

fn arb_sha() -> impl Strategy<Value = FakeSha> {
    any::<FakeSha>()
}

fn arb_url() -> impl Strategy<Value = String> {
    "(a|b|c)".prop_map(|name| format!("https://example.com/{name}.git"))
}

fn arb_transition_bind() -> impl Strategy<Value = Transition> {
    (arb_sub_path(), arb_url(), arb_sha())
        .prop_map(|(path, url, sha)| Transition::BindSubmodule { path, url, sha })
}

fn arb_transition_repin(state: &BindingState) -> impl Strategy<Value = Transition> {
    let bound: Vec<SubPath> = state.bindings.keys().cloned().collect();
    (select(bound), arb_sha()).prop_map(|(path, sha)| Transition::RepinSubmodule { path, sha })
}

fn arb_transition_unbind(state: &BindingState) -> impl Strategy<Value = Transition> {
    let bound: Vec<SubPath> = state.bindings.keys().cloned().collect();
    select(bound).prop_map(|path| Transition::UnbindSubmodule { path })
}

impl ReferenceStateMachine for BindingState {
    type State = Self;
    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(BindingState::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        if state.bindings.is_empty() {
            arb_transition_bind().boxed()
        } else {
            prop_oneof![
                2 => arb_transition_bind(),
                3 => arb_transition_repin(state),
                1 => arb_transition_unbind(state),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Transition::BindSubmodule { path, url, sha } => {
                state.bindings.insert(path.clone(), (url.clone(), *sha));
            }
            Transition::RepinSubmodule { path, sha } => {
                if let Some(entry) = state.bindings.get_mut(path) {
                    entry.1 = *sha;
                }
            }
            Transition::UnbindSubmodule { path } => {
                state.bindings.remove(path);
            }
        }
        state
    }
}
