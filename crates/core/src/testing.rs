//! In-memory KV engine for tests
//!
//! `MemKv` implements the [`crate::kv`] contract with copy-on-write
//! semantics close enough to the production store to exercise every domain
//! path: named sub-databases, a single writer against many snapshot readers,
//! read-your-writes inside the write transaction, atomic commit, and a
//! configurable map-size budget so `MapFull` back-pressure is drivable from
//! tests (shrink the budget, watch a checkpoint batch bounce).
//!
//! It is test infrastructure, not a storage engine: transactions clone the
//! committed tables, which is fine at test scale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::kv::{Dbi, KvEngine, KvRead, KvWrite};

/// Approximate per-entry bookkeeping overhead charged against the map size.
const ENTRY_OVERHEAD: usize = 16;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

struct State {
    names: BTreeMap<String, u32>,
    tables: Vec<Table>,
    map_size: usize,
    used: usize,
}

/// In-memory KV engine with LMDB-shaped semantics.
pub struct MemKv {
    state: Mutex<State>,
    writer_gate: Mutex<()>,
    next_txn_id: AtomicU64,
}

impl MemKv {
    /// Create an engine with a 1 GiB map budget.
    pub fn new() -> Self {
        Self::with_map_size(1 << 30)
    }

    /// Create an engine with an explicit map budget in bytes.
    pub fn with_map_size(map_size: usize) -> Self {
        MemKv {
            state: Mutex::new(State {
                names: BTreeMap::new(),
                tables: Vec::new(),
                map_size,
                used: 0,
            }),
            writer_gate: Mutex::new(()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Change the map budget; existing data is untouched, so shrinking below
    /// current usage makes every subsequent `put` fail with `MapFull`.
    pub fn set_map_size(&self, map_size: usize) {
        self.state.lock().map_size = map_size;
    }

    /// Approximate bytes currently charged against the map budget.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    fn next_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemKv {
    fn open_dbi(&self, name: &str) -> Result<Dbi> {
        let mut state = self.state.lock();
        if let Some(&index) = state.names.get(name) {
            return Ok(Dbi(index));
        }
        let index = state.tables.len() as u32;
        state.tables.push(Table::new());
        state.names.insert(name.to_string(), index);
        Ok(Dbi(index))
    }

    fn begin_read(&self) -> Result<Box<dyn KvRead + '_>> {
        let state = self.state.lock();
        Ok(Box::new(ReadTxn { id: self.next_id(), tables: state.tables.clone() }))
    }

    fn begin_write(&self) -> Result<Box<dyn KvWrite + '_>> {
        let gate = self.writer_gate.lock();
        let state = self.state.lock();
        Ok(Box::new(WriteTxn {
            id: self.next_id(),
            engine: self,
            _gate: gate,
            tables: state.tables.clone(),
            used: state.used,
            map_size: state.map_size,
        }))
    }
}

struct ReadTxn {
    id: u64,
    tables: Vec<Table>,
}

fn table(tables: &[Table], dbi: Dbi) -> Result<&Table> {
    tables
        .get(dbi.0 as usize)
        .ok_or(Error::InvalidArgument("unknown sub-database handle"))
}

fn scan_tables(
    tables: &[Table],
    dbi: Dbi,
    start: &[u8],
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    for (key, value) in table(tables, dbi)?.range(start.to_vec()..) {
        if !visit(key, value)? {
            break;
        }
    }
    Ok(())
}

impl KvRead for ReadTxn {
    fn id(&self) -> u64 {
        self.id
    }

    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(table(&self.tables, dbi)?.get(key).cloned())
    }

    fn scan_from(
        &self,
        dbi: Dbi,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        scan_tables(&self.tables, dbi, start, visit)
    }
}

struct WriteTxn<'e> {
    id: u64,
    engine: &'e MemKv,
    _gate: MutexGuard<'e, ()>,
    tables: Vec<Table>,
    used: usize,
    map_size: usize,
}

impl KvRead for WriteTxn<'_> {
    fn id(&self) -> u64 {
        self.id
    }

    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(table(&self.tables, dbi)?.get(key).cloned())
    }

    fn scan_from(
        &self,
        dbi: Dbi,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        scan_tables(&self.tables, dbi, start, visit)
    }
}

impl KvWrite for WriteTxn<'_> {
    fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<()> {
        let table = self
            .tables
            .get_mut(dbi.0 as usize)
            .ok_or(Error::InvalidArgument("unknown sub-database handle"))?;
        let new_cost = key.len() + value.len() + ENTRY_OVERHEAD;
        let old_cost = table
            .get(key)
            .map(|old| key.len() + old.len() + ENTRY_OVERHEAD)
            .unwrap_or(0);
        let used_after = self.used - old_cost + new_cost;
        if used_after > self.map_size {
            return Err(Error::MapFull);
        }
        table.insert(key.to_vec(), value.to_vec());
        self.used = used_after;
        Ok(())
    }

    fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<bool> {
        let table = self
            .tables
            .get_mut(dbi.0 as usize)
            .ok_or(Error::InvalidArgument("unknown sub-database handle"))?;
        match table.remove(key) {
            Some(old) => {
                self.used -= key.len() + old.len() + ENTRY_OVERHEAD;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let WriteTxn { engine, _gate, tables, used, .. } = *self;
        let mut state = engine.state.lock();
        // Sub-databases opened after this transaction began are preserved.
        for (index, table) in tables.into_iter().enumerate() {
            state.tables[index] = table;
        }
        state.used = used;
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
