//! Scenario 1 (`spec.md` §8): cherry-picking a meta-commit whose only
//! change is a sub-repository fast-forward produces a meta-commit with
//! that one gitlink change, and the sub-repo is fast-forwarded in place
//! without ever calling the cherry-pick callback.

use std::collections::BTreeMap;
use std::sync::Arc;

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::{Backend, CommitData, Mode};
use gitmeta_core::classifier::Classification;
use gitmeta_core::driver::{drive, CherryPickFn, CherryPickOutcome, DriveOptions, DriveResult};
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::index::Index;
use gitmeta_core::opener::Opener;
use gitmeta_core::subpath::SubPath;
use gitmeta_testutils::{new_backend, test_signature};

fn never_called() -> Arc<CherryPickFn> {
    Arc::new(|_backend, _head, _original| {
        Box::pin(async { panic!("fast-forward must not invoke the cherry-pick callback") })
    })
}

#[tokio::test]
async fn cherry_pick_of_sub_only_change_fast_forwards() {
    let meta = MemoryBackend::new();
    let sub = new_backend();

    let sub_tree = sub.write_tree(&[]).await.unwrap();
    let s0 = sub
        .write_commit(&CommitData {
            tree: sub_tree.clone(),
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "s0".into(),
            encoding: None,
        })
        .await
        .unwrap();
    let s1 = sub
        .write_commit(&CommitData {
            tree: sub_tree,
            parents: vec![s0.clone()],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "s1".into(),
            encoding: None,
        })
        .await
        .unwrap();

    let s_path = SubPath::new("vendor/s").unwrap();

    let mut gitmodules = GitmodulesMap::new();
    gitmodules.insert(s_path.clone(), "https://example.com/s.git".into());

    let opener = Arc::new(Opener::new(None, gitmodules.clone()));
    opener.register_subrepo(s_path.clone(), sub.clone());
    opener.get_subrepo(&s_path, gitmeta_core::opener::OpenPolicy::ForceOpen, s0.clone()).await.unwrap();

    let mut index = Index::new();
    let classification = Classification {
        simple_changes: BTreeMap::new(),
        sub_changes: vec![gitmeta_core::classifier::SubmoduleChange {
            path: s_path.clone(),
            old_sha: s0,
            new_sha: s1.clone(),
            ancestor_sha: None,
        }],
        conflicts: vec![],
        urls: GitmodulesMap::new(),
    };

    let result = drive(
        &meta,
        &opener,
        &mut index,
        classification,
        None,
        vec![],
        test_signature("a"),
        test_signature("a"),
        "cherry-pick B".into(),
        never_called(),
        DriveOptions::default(),
    )
    .await
    .unwrap();

    let DriveResult::Completed { meta_commit } = result else {
        panic!("expected the fast-forward to complete without conflict");
    };
    let commit = meta.read_commit(&meta_commit).await.unwrap();
    let top = meta.read_tree(&commit.tree).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, "vendor");
    let vendor_tree = meta.read_tree(&top[0].oid).await.unwrap();
    assert_eq!(vendor_tree.len(), 1);
    assert_eq!(vendor_tree[0].name, "s");
    assert_eq!(vendor_tree[0].mode, Mode::Gitlink);
    assert_eq!(vendor_tree[0].oid, s1);
}
