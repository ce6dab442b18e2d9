//! Scenario 5 (`spec.md` §8): destitching a stitched commit records the
//! resulting mapping under `refs/notes/git-meta/destitched` and pushes a
//! synthetic ref for every new sub-commit to its hosting remote, so the
//! sub-commit is reachable there before anything can reference it.

use std::sync::Arc;

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::{Backend, CommitData, Mode, TreeEntry};
use gitmeta_core::destitch::{destitch_and_publish, DestitchedMap, KnownSub, DESTITCHED_NOTES_REF};
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::subpath::SubPath;
use gitmeta_core::synthetic_ref::synthetic_ref_name;
use gitmeta_testutils::test_signature;

#[tokio::test]
async fn destitch_publishes_note_and_synthetic_ref_for_changed_sub() {
    let meta = MemoryBackend::new();
    let sub = Arc::new(MemoryBackend::new());
    let sub_remote = Arc::new(MemoryBackend::new());
    sub.link_remote("https://example.com/vendor.git", sub_remote.clone());

    let sub_blob_old = sub.write_blob(b"old").await.unwrap();
    let sub_tree_old = sub.write_tree(&[TreeEntry { name: "f".into(), mode: Mode::File, oid: sub_blob_old }]).await.unwrap();
    let sub_root = sub
        .write_commit(&CommitData {
            tree: sub_tree_old,
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "sub root".into(),
            encoding: None,
        })
        .await
        .unwrap();

    let path = SubPath::new("vendor").unwrap();
    let stitched_blob = meta.write_blob(b"new").await.unwrap();
    let inner_tree = meta.write_tree(&[TreeEntry { name: "f".into(), mode: Mode::File, oid: stitched_blob }]).await.unwrap();
    let stitched_tree = meta.write_tree(&[TreeEntry { name: "vendor".into(), mode: Mode::Tree, oid: inner_tree }]).await.unwrap();
    let stitched_commit = meta
        .write_commit(&CommitData {
            tree: stitched_tree,
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "stitched change".into(),
            encoding: None,
        })
        .await
        .unwrap();

    let known_subs = vec![KnownSub { path: path.clone(), previous_sha: sub_root }];
    let mut gitmodules = GitmodulesMap::new();
    gitmodules.insert(path.clone(), "https://example.com/vendor.git".into());

    let sub_for_lookup: Arc<dyn Backend> = sub.clone();
    let path_for_lookup = path.clone();
    let lookup = move |p: &SubPath| -> Option<Arc<dyn Backend>> {
        if *p == path_for_lookup { Some(sub_for_lookup.clone()) } else { None }
    };

    let mappings = destitch_and_publish(
        &meta,
        lookup,
        &stitched_commit,
        &DestitchedMap::new(),
        &known_subs,
        &gitmodules,
        "https://example.com/meta.git",
    )
    .await
    .unwrap();

    assert_eq!(mappings.len(), 1);
    let (stitched_sha, mapping, _meta_commit) = &mappings[0];
    assert!(meta.notes_read(DESTITCHED_NOTES_REF, stitched_sha).await.unwrap().is_some());

    let new_sub_sha = mapping.submodule_commits.get(&path).unwrap();
    let ref_name = synthetic_ref_name(new_sub_sha);
    assert_eq!(sub_remote.resolve(&ref_name).await.unwrap(), Some(new_sub_sha.clone()));
}
