//! Scenario 2 (`spec.md` §8): cherry-picking a meta-commit that changes
//! two subs, where one fast-forwards cleanly and the other diverges,
//! leaves the clean sub staged and reports only the divergent one as
//! conflicted — the other sub's update is not held hostage by it.

use std::sync::Arc;

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::{Backend, CommitData};
use gitmeta_core::classifier::{Classification, SubmoduleChange};
use gitmeta_core::driver::{drive, CherryPickFn, CherryPickOutcome, DriveOptions, DriveResult};
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::index::Index;
use gitmeta_core::opener::{OpenPolicy, Opener};
use gitmeta_core::subpath::SubPath;
use gitmeta_testutils::{new_backend, test_signature};
use std::collections::BTreeMap;

fn always_conflicted() -> Arc<CherryPickFn> {
    Arc::new(|_backend, _head, _original| Box::pin(async { Ok(CherryPickOutcome::Conflicted) }))
}

async fn commit(backend: &MemoryBackend, parents: Vec<gitmeta_core::backend::Oid>, message: &str) -> gitmeta_core::backend::Oid {
    let tree = backend.write_tree(&[]).await.unwrap();
    backend
        .write_commit(&CommitData {
            tree,
            parents,
            author: test_signature("a"),
            committer: test_signature("a"),
            message: message.into(),
            encoding: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn conflict_in_one_sub_does_not_block_the_other() {
    let meta = MemoryBackend::new();

    // `t` fast-forwards cleanly: t1 is a descendant of t0.
    let t_backend = new_backend();
    let t0 = commit(&t_backend, vec![], "t0").await;
    let t1 = commit(&t_backend, vec![t0.clone()], "t1").await;

    // `s` diverges: s1 is not a descendant of s0 (unrelated history).
    let s_backend = new_backend();
    let s0 = commit(&s_backend, vec![], "s0").await;
    let s1 = commit(&s_backend, vec![], "s1-unrelated").await;

    let s_path = SubPath::new("s").unwrap();
    let t_path = SubPath::new("t").unwrap();

    let opener = Arc::new(Opener::new(None, GitmodulesMap::new()));
    opener.register_subrepo(s_path.clone(), s_backend.clone());
    opener.register_subrepo(t_path.clone(), t_backend.clone());
    opener.get_subrepo(&s_path, OpenPolicy::ForceOpen, s0.clone()).await.unwrap();
    opener.get_subrepo(&t_path, OpenPolicy::ForceOpen, t0.clone()).await.unwrap();

    let mut index = Index::new();
    let classification = Classification {
        simple_changes: BTreeMap::new(),
        sub_changes: vec![
            SubmoduleChange { path: s_path.clone(), old_sha: s0, new_sha: s1, ancestor_sha: None },
            SubmoduleChange { path: t_path.clone(), old_sha: t0, new_sha: t1.clone(), ancestor_sha: None },
        ],
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
        always_conflicted(),
        DriveOptions::default(),
    )
    .await
    .unwrap();

    let DriveResult::Incomplete { conflicted, .. } = result else {
        panic!("expected the divergent sub to be reported as conflicted");
    };
    assert_eq!(conflicted.len(), 1);
    assert_eq!(conflicted[0].path, s_path);

    // `t`'s gitlink is staged at the new sha even though `s` conflicted.
    let staged_t = index.get_normal(&t_path).unwrap();
    assert_eq!(staged_t.oid, t1);
    assert!(index.is_conflicted(&s_path));
}
