//! Scenario 3 (`spec.md` §8): pushing a meta-commit that advances one sub
//! but leaves another pinned at what the remote tracking branch already
//! has results in exactly one synthetic-ref push.

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::Backend;
use gitmeta_core::backend::CommitData;
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::subpath::SubPath;
use gitmeta_core::synthetic_ref::{push_synthetic_refs, ReferencedSub};
use gitmeta_testutils::{new_backend, test_signature};

async fn commit(backend: &MemoryBackend, message: &str) -> gitmeta_core::backend::Oid {
    let tree = backend.write_tree(&[]).await.unwrap();
    backend
        .write_commit(&CommitData {
            tree,
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: message.into(),
            encoding: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn only_the_advanced_sub_is_pushed() {
    let local = MemoryBackend::new();
    let s0 = commit(&local, "s0").await;
    let t0 = commit(&local, "t0").await;
    let t1 = commit(&local, "t1").await;

    let s_path = SubPath::new("s").unwrap();
    let t_path = SubPath::new("t").unwrap();

    let mut gitmodules = GitmodulesMap::new();
    gitmodules.insert(s_path.clone(), "https://example.com/s.git".into());
    gitmodules.insert(t_path.clone(), "https://example.com/t.git".into());

    local.link_remote("https://example.com/s.git", new_backend());
    local.link_remote("https://example.com/t.git", new_backend());

    let pushed = push_synthetic_refs(
        &local,
        &gitmodules,
        "https://example.com/meta.git",
        &[(s_path.clone(), s0.clone()), (t_path.clone(), t0)],
        &[
            ReferencedSub { path: s_path.clone(), sha: s0 },
            ReferencedSub { path: t_path.clone(), sha: t1.clone() },
        ],
    )
    .await
    .unwrap();

    assert_eq!(pushed.len(), 1);
    assert!(pushed.contains(&t_path));
    assert!(!pushed.contains(&s_path));
}
