//! Crash-point tests for the write-ahead log.
//!
//! Cutting the log at every possible byte boundary simulates a crash
//! during a write; reopening must always succeed and yield an intact
//! prefix of the original messages.

use tessera_consensus::{ConsensusMessage, StateEvent, TimeoutScheduler, Wal, WalMessage};
use tessera_types::{BlockId, Proposal, Vote, VoteType};

fn messages() -> Vec<WalMessage> {
    let mut out = Vec::new();
    for height in 1..=4i64 {
        out.push(WalMessage::Event(StateEvent::Internal(
            ConsensusMessage::Proposal(Proposal::new(height, 0, -1, BlockId::zero())),
        )));
        out.push(WalMessage::Event(StateEvent::Internal(
            ConsensusMessage::Vote(Vote::new(
                VoteType::Prevote,
                height,
                0,
                BlockId::zero(),
                Default::default(),
                0,
            )),
        )));
        out.push(WalMessage::EndHeight(height));
    }
    out
}

fn written_wal(dir: &std::path::Path) -> (std::path::PathBuf, Vec<WalMessage>) {
    let path = dir.join("wal.log");
    let mut wal = Wal::open(&path, true).unwrap();
    let msgs = messages();
    for msg in &msgs {
        wal.write(msg.clone()).unwrap();
    }
    wal.flush_and_sync().unwrap();
    (path, msgs)
}

fn read_all(wal: &mut Wal) -> Vec<WalMessage> {
    let mut reader = wal.reader().unwrap();
    let mut out = Vec::new();
    while let Some(timed) = reader.next_message().unwrap() {
        out.push(timed.msg);
    }
    out
}

#[test]
fn every_truncation_point_recovers_a_clean_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let (path, original) = written_wal(dir.path());
    let full = std::fs::read(&path).unwrap();

    for cut in 0..=full.len() {
        let case_path = dir.path().join(format!("cut-{cut}.log"));
        std::fs::write(&case_path, &full[..cut]).unwrap();

        let mut wal = Wal::open(&case_path, false)
            .unwrap_or_else(|e| panic!("cut {cut}: reopen failed: {e}"));
        let recovered = read_all(&mut wal);

        // The recovered sequence is a prefix of the original.
        assert!(
            recovered.len() <= original.len(),
            "cut {cut}: recovered more than written"
        );
        assert_eq!(
            recovered[..],
            original[..recovered.len()],
            "cut {cut}: recovered frames diverge"
        );

        // And the log accepts new writes after recovery.
        wal.write_sync(WalMessage::EndHeight(99)).unwrap();
        let after = read_all(&mut wal);
        assert_eq!(after.last(), Some(&WalMessage::EndHeight(99)));
    }
}

#[test]
fn search_lands_after_the_requested_marker_at_every_height() {
    let dir = tempfile::tempdir().unwrap();
    let (path, original) = written_wal(dir.path());
    let mut wal = Wal::open(&path, true).unwrap();

    for height in 1..=3i64 {
        let mut reader = wal.search_for_end_height(height).unwrap().unwrap();
        let next = reader.next_message().unwrap().unwrap();
        // The frame right after EndHeight(h) is height h+1's proposal.
        let marker_index = original
            .iter()
            .position(|m| *m == WalMessage::EndHeight(height))
            .unwrap();
        assert_eq!(next.msg, original[marker_index + 1]);
    }

    // The final marker is the last frame; the reader is exhausted.
    let mut reader = wal.search_for_end_height(4).unwrap().unwrap();
    assert!(reader.next_message().unwrap().is_none());
}

#[tokio::test]
async fn timed_messages_survive_with_write_order() {
    // Interleave timeouts with events, as the state machine does.
    let (timeout_tx, mut timeout_rx) = tokio::sync::mpsc::channel(8);
    let scheduler = TimeoutScheduler::new(timeout_tx);
    scheduler.schedule(
        tessera_consensus::Step::Propose,
        1,
        0,
        std::time::Duration::from_millis(1),
    );
    let fired = timeout_rx.recv().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.log");
    let mut wal = Wal::open(&path, true).unwrap();
    wal.write_sync(WalMessage::Event(StateEvent::Internal(
        ConsensusMessage::Proposal(Proposal::new(1, 0, -1, BlockId::zero())),
    )))
    .unwrap();
    wal.write_sync(WalMessage::Timeout(fired)).unwrap();
    wal.write_sync(WalMessage::EndHeight(1)).unwrap();

    let recovered = read_all(&mut wal);
    assert_eq!(recovered.len(), 3);
    assert!(matches!(recovered[0], WalMessage::Event(_)));
    assert!(matches!(recovered[1], WalMessage::Timeout(t) if t.height == 1));
    assert_eq!(recovered[2], WalMessage::EndHeight(1));
}
