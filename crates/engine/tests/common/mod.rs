//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use annex_core::index::{IndexOptions, MetricKind, ScalarKind};
use annex_core::kv::{KvEngine, KvWrite};
use annex_core::testing::MemKv;
use annex_core::types::{Update, UpdateOp};
use annex_engine::{Domain, DomainOptions, TxnContext};

pub const DIMS: u64 = 4;

pub fn f32_options() -> IndexOptions {
    IndexOptions {
        metric: MetricKind::L2Sq,
        scalar: ScalarKind::F32,
        dimensions: DIMS,
        connectivity: 16,
        expansion_add: 128,
        expansion_search: 64,
        multi: false,
    }
}

pub fn vector(components: &[f32]) -> Vec<u8> {
    annex_engine::flat::encode_f32_vector(components)
}

pub fn vector_for(key: u64) -> Vec<u8> {
    let base = key as f32;
    vector(&[base, base + 0.5, -base, base * 2.0])
}

/// Install a per-test-binary tracing subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn mem_env() -> (Arc<MemKv>, Arc<dyn KvEngine>) {
    init_tracing();
    let kv = Arc::new(MemKv::new());
    let env: Arc<dyn KvEngine> = kv.clone();
    (kv, env)
}

pub fn open_domain(env: &Arc<dyn KvEngine>, root: &std::path::Path) -> Domain {
    let domain = Domain::open(env.clone(), "vectors", root, DomainOptions::default()).unwrap();
    if domain.init_options().unwrap().is_none() {
        domain.put_init_options(&f32_options()).unwrap();
    }
    domain
}

/// Stage a batch of updates in one host transaction, seal, commit, publish.
pub fn publish_updates(env: &Arc<dyn KvEngine>, domain: &Domain, updates: &[(UpdateOp, u64)]) {
    let mut txn = env.begin_write().unwrap();
    let mut ctx: Option<TxnContext<'_>> = None;
    for (op, key) in updates {
        let payload = match op {
            UpdateOp::Delete => Vec::new(),
            _ => vector_for(*key),
        };
        let update = Update { op: *op, key: *key, payload: &payload };
        domain.stage(&mut *txn, &update, &mut ctx).unwrap();
    }
    let mut ctx = ctx.expect("at least one update staged");
    ctx.apply_pending(&mut *txn).unwrap();
    txn.commit().unwrap();
    ctx.publish(true).unwrap();
}

/// Stage, seal, and commit without publishing; returns nothing, dropping the
/// context so the sealed WAL stays on disk (a crash between commit and
/// publish).
pub fn commit_without_publish(
    env: &Arc<dyn KvEngine>,
    domain: &Domain,
    updates: &[(UpdateOp, u64)],
) {
    let mut txn = env.begin_write().unwrap();
    let mut ctx: Option<TxnContext<'_>> = None;
    for (op, key) in updates {
        let payload = match op {
            UpdateOp::Delete => Vec::new(),
            _ => vector_for(*key),
        };
        let update = Update { op: *op, key: *key, payload: &payload };
        domain.stage(&mut *txn, &update, &mut ctx).unwrap();
    }
    let mut ctx = ctx.expect("at least one update staged");
    ctx.apply_pending(&mut *txn).unwrap();
    txn.commit().unwrap();
    drop(ctx);
}
