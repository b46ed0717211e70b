//! Cross-module WAL lifecycle: writer, pending-directory recovery, replay.

use std::fs;
use std::path::{Path, PathBuf};

use annex_core::delta::DeltaRecord;
use annex_core::types::{Token, Update, UpdateOp};
use annex_durability::recovery::scan_pending;
use annex_durability::replay::replay_wal_file;
use annex_durability::writer::WalWriter;
use tempfile::TempDir;

fn stage_frames(writer: &mut WalWriter, count: u32) {
    for ordinal in 1..=count {
        let payload = vec![ordinal as u8; 8];
        let update = Update { op: UpdateOp::Add, key: ordinal as u64, payload: &payload };
        let encoded = DeltaRecord::encode_update(&update, ordinal, writer.token());
        writer.append(&encoded).unwrap();
    }
}

fn pending_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_full_lifecycle_writer_to_replay() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    let mut writer = WalWriter::open(&pending, 3, 10).unwrap();
    let token = writer.token();
    stage_frames(&mut writer, 4);
    writer.seal().unwrap();
    writer.mark_ready().unwrap();
    let path = writer.ready_path().to_path_buf();
    writer.close(false);

    let mut keys = Vec::new();
    let outcome = replay_wal_file(&path, token, 1, true, &mut |_, record| {
        keys.push(record.key);
        Ok(())
    })
    .unwrap();
    assert_eq!(outcome.frames_total, 4);
    assert_eq!(keys, vec![1, 2, 3, 4]);
    assert_eq!(pending_count(&pending), 0);
}

#[test]
fn test_recovery_completes_interrupted_publish() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    // Transaction A crashed while writing, transaction B sealed and
    // committed but never published, and a stray file sits alongside.
    let mut crashed = WalWriter::open(&pending, 0, 1).unwrap();
    stage_frames(&mut crashed, 2);
    crashed.close(false);

    let mut sealed = WalWriter::open(&pending, 0, 1).unwrap();
    let sealed_token = sealed.token();
    stage_frames(&mut sealed, 3);
    sealed.seal().unwrap();
    sealed.close(false);

    fs::write(pending.join("leftover.tmp"), b"junk").unwrap();
    assert_eq!(pending_count(&pending), 3);

    // Recovery keeps only the sealed transaction's file, renamed to ready.
    let ready: PathBuf = scan_pending(&pending, sealed_token).unwrap().unwrap();
    assert_eq!(pending_count(&pending), 1);

    let mut replayed = 0;
    replay_wal_file(&ready, sealed_token, 1, true, &mut |_, _| {
        replayed += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(pending_count(&pending), 0);
}

#[test]
fn test_interrupted_replay_resumes_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    let mut writer = WalWriter::open(&pending, 0, 1).unwrap();
    let token = writer.token();
    stage_frames(&mut writer, 5);
    writer.seal().unwrap();
    writer.mark_ready().unwrap();
    let path = writer.ready_path().to_path_buf();
    writer.close(false);

    // First pass dies after frame 2.
    let mut applied = Vec::new();
    let _ = replay_wal_file(&path, token, 1, true, &mut |ordinal, record| {
        if ordinal > 2 {
            return Err(annex_core::error::Error::MapFull);
        }
        applied.push(record.key);
        Ok(())
    })
    .unwrap_err();
    assert!(path.exists());

    // Resume past the recorded tail; only the remaining frames apply.
    replay_wal_file(&path, token, 3, true, &mut |_, record| {
        applied.push(record.key);
        Ok(())
    })
    .unwrap();
    assert_eq!(applied, vec![1, 2, 3, 4, 5]);
    assert!(!path.exists());
}

#[test]
fn test_recovery_then_replay_rejects_header_corruption() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    let mut writer = WalWriter::open(&pending, 0, 1).unwrap();
    let token = writer.token();
    stage_frames(&mut writer, 1);
    writer.seal().unwrap();
    writer.close(false);

    let ready = scan_pending(&pending, token).unwrap().unwrap();

    // Flip a byte in the header's checksummed span.
    let mut bytes = fs::read(&ready).unwrap();
    bytes[13] ^= 0xFF;
    fs::write(&ready, &bytes).unwrap();

    let err = replay_wal_file(&ready, token, 1, true, &mut |_, _| Ok(())).unwrap_err();
    assert!(err.is_corruption());
    assert!(ready.exists());
}

#[test]
fn test_replay_surfaces_embedded_delta_corruption() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    // Frame payload whose own delta CRC is broken, while the frame CRC is
    // recomputed to match: the decode layer must still reject it.
    let mut writer = WalWriter::open(&pending, 0, 1).unwrap();
    let token = writer.token();
    let payload = vec![9u8; 8];
    let update = Update { op: UpdateOp::Add, key: 9, payload: &payload };
    let mut encoded = DeltaRecord::encode_update(&update, 1, token);
    let last = encoded.len() - 1;
    encoded[last] ^= 0xFF;
    writer.append(&encoded).unwrap();
    writer.seal().unwrap();
    writer.mark_ready().unwrap();
    let path = writer.ready_path().to_path_buf();
    writer.close(false);

    let err = replay_wal_file(&path, token, 1, true, &mut |_, _| Ok(())).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_tokens_never_collide_in_pending_names() {
    let dir = TempDir::new().unwrap();
    let pending = dir.path().join("pending");

    let writers: Vec<WalWriter> =
        (0..8).map(|_| WalWriter::open(&pending, 0, 1).unwrap()).collect();
    let mut tokens: Vec<Token> = writers.iter().map(WalWriter::token).collect();
    tokens.sort_by_key(|token| (token.hi, token.lo));
    tokens.dedup();
    assert_eq!(tokens.len(), 8);
    assert_eq!(pending_count(&pending), 8);
}
