//! Scenario 6 (`spec.md` §8, invariant 5): a user aborting a stalled
//! cherry-pick/rebase deletes the sequencer file, and a subsequent
//! `--continue`/`--abort` sees no operation in progress.

use gitmeta_core::backend::Oid;
use gitmeta_core::sequencer::{advance, delete, read, write, RefTarget, SequencerKind, SequencerState};

fn target(byte: u8) -> RefTarget {
    RefTarget { sha: Oid::from_bytes(&[byte; 4]), ref_name: Some("refs/heads/main".into()) }
}

#[tokio::test]
async fn abort_deletes_state_and_current_index_never_regresses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("git-meta-sequencer.json");

    let mut state = SequencerState {
        kind: SequencerKind::CherryPick,
        original_head: target(1),
        target: target(2),
        commits: vec![Oid::from_bytes(&[3; 4]), Oid::from_bytes(&[4; 4]), Oid::from_bytes(&[5; 4])],
        current_index: 0,
        message: None,
    };
    write(&path, &state).unwrap();

    // The first sub-op of the sequence succeeds: index advances and is
    // persisted, as invariant 5 requires.
    advance(&path, &mut state, 1).unwrap();
    let mid_flight = read(&path).unwrap().unwrap();
    assert_eq!(mid_flight.current_index, 1);
    assert!(!mid_flight.is_complete());

    // The second sub-op conflicts; the user aborts.
    delete(&path).unwrap();
    assert!(read(&path).unwrap().is_none());

    // Aborting twice (e.g. a retried command) is not an error.
    delete(&path).unwrap();
}
