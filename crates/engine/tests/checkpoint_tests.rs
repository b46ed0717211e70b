//! Checkpoint protocol: finalize atomicity, retention, pins, map-full.

mod common;

use std::sync::Arc;

use annex_core::error::Error;
use annex_core::kv::{KvEngine, KvWrite};
use annex_core::testing::MemKv;
use annex_core::types::{Token, UpdateOp};
use annex_engine::{Domain, DomainOptions};
use annex_storage::meta::{keys, CheckpointStage, MetaStore};
use common::*;
use tempfile::TempDir;

fn meta_view(env: &Arc<dyn KvEngine>) -> MetaStore {
    MetaStore::new(env.open_dbi("vectors/usearch-meta").unwrap())
}

#[test]
fn test_checkpoint_then_delta() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();

    publish_updates(&env, &domain, &[(UpdateOp::Add, 5)]);
    let snapshot_seq = domain.checkpoint(&handle).unwrap();
    assert_eq!(snapshot_seq, 1);
    assert_eq!(domain.sequences().unwrap(), (1, 1));

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    assert_eq!(meta.checkpoint_pending(&*read).unwrap(), None);
    assert_eq!(meta.get_u64(&*read, keys::LOG_TAIL_SEQ, 99).unwrap(), 1);
    drop(read);

    publish_updates(&env, &domain, &[(UpdateOp::Delete, 5)]);
    assert_eq!(domain.sequences().unwrap().1, 2);
    assert!(!handle.contains(5).unwrap());

    // A fresh activation agrees: snapshot had key 5, the delta removed it.
    let fresh = domain.activate().unwrap();
    assert!(!fresh.contains(5).unwrap());
}

#[test]
fn test_empty_index_checkpoint_finalizes_with_zero_chunks() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();

    let snapshot_seq = domain.checkpoint(&handle).unwrap();
    assert_eq!(snapshot_seq, 0);
    assert_eq!(domain.sequences().unwrap(), (0, 0));

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    assert_eq!(meta.checkpoint_pending(&*read).unwrap(), None);
}

#[test]
fn test_checkpoint_busy_while_pending() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();
    publish_updates(&env, &domain, &[(UpdateOp::Add, 1)]);

    // Plant an in-flight pending record.
    let meta = meta_view(&env);
    let mut txn = env.begin_write().unwrap();
    meta.put_checkpoint_pending(
        &mut *txn,
        annex_storage::meta::CheckpointPending::new(CheckpointStage::Writing, 3, 9, Token::mint()),
    )
    .unwrap();
    txn.commit().unwrap();

    let err = domain.checkpoint_write(&handle).unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
}

#[test]
fn test_finalize_requires_matching_pending() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());

    assert!(domain.checkpoint_finalize(1, 1).unwrap_err().is_not_found());
    assert!(matches!(
        domain.checkpoint_finalize(1, 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_failed_finalize_advances_nothing() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();
    publish_updates(&env, &domain, &[(UpdateOp::Add, 1), (UpdateOp::Add, 2)]);

    let snapshot_seq = domain.checkpoint_write(&handle).unwrap();
    // Finalize against the wrong target fails and leaves the pending record
    // and every sequence untouched.
    let err = domain.checkpoint_finalize(snapshot_seq + 1, snapshot_seq + 1).unwrap_err();
    assert!(matches!(err, Error::Busy(_)));

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    let pending = meta.checkpoint_pending(&*read).unwrap().unwrap();
    assert_eq!(pending.stage(), Some(CheckpointStage::Writing));
    assert_eq!(meta.get_u64(&*read, keys::SNAPSHOT_SEQ, 99).unwrap(), 0);
    assert_eq!(meta.get_u64(&*read, keys::LOG_TAIL_SEQ, 99).unwrap(), 0);
    drop(read);

    // The matching finalize lands everything together.
    domain.checkpoint_finalize(snapshot_seq, snapshot_seq).unwrap();
    let read = env.begin_read().unwrap();
    assert_eq!(meta.checkpoint_pending(&*read).unwrap(), None);
    assert_eq!(meta.get_u64(&*read, keys::SNAPSHOT_SEQ, 99).unwrap(), snapshot_seq);
    assert_eq!(meta.get_u64(&*read, keys::LOG_SEQ, 99).unwrap(), snapshot_seq);
    assert_eq!(meta.get_u64(&*read, keys::LOG_TAIL_SEQ, 99).unwrap(), snapshot_seq);
}

#[test]
fn test_retention_trims_old_snapshots() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();

    // Three checkpoints with retention_count = 2 (the default).
    let mut last_floor = 0;
    for round in 1..=3u64 {
        publish_updates(&env, &domain, &[(UpdateOp::Add, round * 10)]);
        let seq = domain.checkpoint(&handle).unwrap();
        let meta = meta_view(&env);
        let read = env.begin_read().unwrap();
        last_floor = meta.get_u64(&*read, keys::SNAPSHOT_RETAINED_FLOOR, 99).unwrap();
        assert_eq!(seq, round);
    }
    assert_eq!(last_floor, 2);

    // The trimmed snapshot is gone; the retained ones load.
    let catalog =
        annex_storage::SnapshotCatalog::new(env.open_dbi("vectors/usearch-snapshot").unwrap());
    let read = env.begin_read().unwrap();
    assert_eq!(catalog.load(&*read, 1).unwrap(), None);
    assert!(catalog.load(&*read, 2).unwrap().is_some());
    assert!(catalog.load(&*read, 3).unwrap().is_some());
}

#[test]
fn test_live_pin_blocks_trim_and_prune() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();

    publish_updates(&env, &domain, &[(UpdateOp::Add, 1)]);
    domain.checkpoint(&handle).unwrap();
    publish_updates(&env, &domain, &[(UpdateOp::Add, 2), (UpdateOp::Add, 3)]);

    // A reader pins snapshot 1 / log 2 before the next checkpoint.
    let reader = Token::mint();
    domain.pin_reader(reader, 1, 2).unwrap();

    let seq = domain.checkpoint(&handle).unwrap();
    assert_eq!(seq, 3);

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    // Retention floor is clamped to the pinned snapshot.
    assert_eq!(meta.get_u64(&*read, keys::SNAPSHOT_RETAINED_FLOOR, 99).unwrap(), 1);
    // Delta entries at and past the pinned log_seq survive the prune.
    assert_eq!(meta.get_u64(&*read, keys::LOG_TAIL_SEQ, 99).unwrap(), 1);
    drop(read);

    let delta = annex_storage::DeltaLog::new(env.open_dbi("vectors/usearch-delta").unwrap());
    let read = env.begin_read().unwrap();
    let mut surviving = Vec::new();
    delta
        .replay(&*read, 0, u64::MAX, &mut |seq, _| {
            surviving.push(seq);
            Ok(())
        })
        .unwrap();
    assert_eq!(surviving, vec![2, 3]);
    drop(read);

    // Once released, the next checkpoint trims normally.
    domain.release_reader(reader).unwrap();
    publish_updates(&env, &domain, &[(UpdateOp::Add, 4)]);
    domain.checkpoint(&handle).unwrap();
    let read = env.begin_read().unwrap();
    assert!(meta.get_u64(&*read, keys::SNAPSHOT_RETAINED_FLOOR, 99).unwrap() > 1);
}

#[test]
fn test_map_full_preserves_pending_then_recovery_discards() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemKv::new());
    let env: Arc<dyn KvEngine> = kv.clone();
    let options = DomainOptions {
        chunk_bytes: 64,
        checkpoint_chunk_batch: 1,
        ..DomainOptions::default()
    };
    let domain = Domain::open(env.clone(), "vectors", dir.path(), options).unwrap();
    domain.put_init_options(&f32_options()).unwrap();
    let handle = domain.activate().unwrap();

    let updates: Vec<(UpdateOp, u64)> = (1..=40).map(|key| (UpdateOp::Add, key)).collect();
    publish_updates(&env, &domain, &updates);

    // Leave just enough headroom for a couple of chunk batches.
    kv.set_map_size(kv.used_bytes() + 300);
    let err = domain.checkpoint_write(&handle).unwrap_err();
    assert!(err.is_map_full());

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    let pending = meta.checkpoint_pending(&*read).unwrap().unwrap();
    assert_eq!(pending.stage(), Some(CheckpointStage::Writing));
    assert!(pending.chunk_cursor > 0);
    let target = pending.snapshot_seq;
    assert_eq!(meta.get_u64(&*read, keys::SNAPSHOT_SEQ, 99).unwrap(), 0);
    drop(read);

    // Grow the map, reopen: recovery discards the partial snapshot.
    kv.set_map_size(1 << 30);
    domain.close();
    let domain = Domain::open(env.clone(), "vectors", dir.path(), DomainOptions::default())
        .unwrap();
    let read = env.begin_read().unwrap();
    assert_eq!(meta.checkpoint_pending(&*read).unwrap(), None);
    assert_eq!(meta.get_u64(&*read, keys::SNAPSHOT_SEQ, 99).unwrap(), 0);
    let catalog =
        annex_storage::SnapshotCatalog::new(env.open_dbi("vectors/usearch-snapshot").unwrap());
    assert_eq!(catalog.load(&*read, target).unwrap(), None);
    drop(read);

    // A fresh attempt now succeeds end to end.
    let handle = domain.activate().unwrap();
    let seq = domain.checkpoint(&handle).unwrap();
    assert_eq!(seq, 40);
    let fresh = domain.activate().unwrap();
    assert_eq!(fresh.len().unwrap(), 40);
}

#[test]
fn test_nonmapfull_failure_clears_pending() {
    let dir = TempDir::new().unwrap();
    let (_kv, env) = mem_env();
    let domain = open_domain(&env, dir.path());
    let handle = domain.activate().unwrap();
    publish_updates(&env, &domain, &[(UpdateOp::Add, 1)]);

    // A deactivated handle fails serialization before any chunk is written.
    handle.deactivate();
    let err = domain.checkpoint_write(&handle).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let meta = meta_view(&env);
    let read = env.begin_read().unwrap();
    assert_eq!(meta.checkpoint_pending(&*read).unwrap(), None);
}
