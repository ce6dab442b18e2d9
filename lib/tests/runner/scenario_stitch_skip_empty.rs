//! Scenario 5 (`spec.md` §8): stitching a meta-commit that leaves no
//! keep-as-sub paths touched and produces no change to the parent's tree,
//! under `skip_empty`, reuses the parent commit instead of writing a new,
//! content-identical one.

use std::collections::BTreeMap;
use std::sync::Arc;

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::{Backend, CommitData};
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::stitch::stitch_commit;
use gitmeta_core::subpath::SubPath;
use gitmeta_testutils::test_signature;

struct AlwaysDrop;

impl gitmeta_core::stitch::StitchPolicy for AlwaysDrop {
    fn adjust_path(&self, _path: &SubPath) -> Option<SubPath> {
        None
    }

    fn keep_as_submodule(&self, _path: &SubPath) -> bool {
        false
    }
}

#[tokio::test]
async fn no_op_meta_commit_reuses_the_stitched_parent() {
    let meta = MemoryBackend::new();

    let tree = meta.write_tree(&[]).await.unwrap();
    let parent = meta
        .write_commit(&CommitData {
            tree: tree.clone(),
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "already stitched".into(),
            encoding: None,
        })
        .await
        .unwrap();
    let commit = meta
        .write_commit(&CommitData {
            tree,
            parents: vec![parent.clone()],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "touches only .gitmodules".into(),
            encoding: None,
        })
        .await
        .unwrap();

    let mut kept_gitmodules = GitmodulesMap::new();
    let sub_backend_for: &dyn Fn(&SubPath) -> Option<Arc<dyn Backend>> = &|_| None;

    let result = stitch_commit(
        &meta,
        sub_backend_for,
        &AlwaysDrop,
        &commit,
        &[parent.clone()],
        &BTreeMap::new(),
        &mut kept_gitmodules,
    )
    .await
    .unwrap();

    let (stitched, submodule_commits) = result.expect("a no-op commit still yields a mapping");
    assert_eq!(stitched, parent);
    assert!(submodule_commits.is_empty());
}
