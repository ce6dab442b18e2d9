//! Scenario 4 (`spec.md` §8): a sub whose URL matches
//! `gitmeta.skipsyntheticrefpattern` is exempt from the synthetic-ref
//! requirement during pre-receive, even though no synthetic ref for it
//! exists anywhere.

use gitmeta_core::backend::memory::MemoryBackend;
use gitmeta_core::backend::{Backend, CommitData, Mode, TreeEntry};
use gitmeta_core::gitmodules::GitmodulesMap;
use gitmeta_core::subpath::SubPath;
use gitmeta_core::synthetic_ref::{meta_pre_receive, SkipPatterns, OK_NOTES_REF};
use gitmeta_testutils::test_signature;

#[tokio::test]
async fn skip_pattern_exempts_a_sub_with_no_synthetic_ref() {
    let meta = MemoryBackend::new();

    let skipped_path = SubPath::new("skip").unwrap();
    let skipped_sha = gitmeta_core::backend::Oid::from_bytes(&[9; 4]);

    let gitlink_tree = meta
        .write_tree(&[TreeEntry { name: "skip".into(), mode: Mode::Gitlink, oid: skipped_sha.clone() }])
        .await
        .unwrap();
    let new = meta
        .write_commit(&CommitData {
            tree: gitlink_tree,
            parents: vec![],
            author: test_signature("a"),
            committer: test_signature("a"),
            message: "add skip sub".into(),
            encoding: None,
        })
        .await
        .unwrap();

    let mut gitmodules = GitmodulesMap::new();
    gitmodules.insert(skipped_path.clone(), "skip".into());

    let skip = SkipPatterns { url_pattern: Some("^skip$".into()), path_pattern: None };

    let changed = {
        let skipped_sha = skipped_sha.clone();
        let new = new.clone();
        let skipped_path = skipped_path.clone();
        move |commit: &gitmeta_core::backend::Oid| -> Vec<(SubPath, gitmeta_core::backend::Oid)> {
            if *commit == new {
                vec![(skipped_path.clone(), skipped_sha.clone())]
            } else {
                vec![]
            }
        }
    };

    meta_pre_receive(&meta, |_| None, None, &new, changed, &skip, &gitmodules)
        .await
        .expect("a skip-pattern URL exempts the sub from the synthetic-ref requirement");

    assert!(meta.notes_read(OK_NOTES_REF, &new).await.unwrap().is_some());
}
