//! Pool Manager (PM): routes stream requests across one [`super::cpool::ConnectionPool`] per
//! executor and tracks a coarse, advisory view of each pool's stream accounting for routing
//! decisions.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::{
    error::{Error, Result},
    event::PoolEventEmitter,
    options::{PoolManagerOptions, ShutdownMode},
    pool::{cpool, cpool::ConnectionPoolHandle, LoopId, PooledChannel},
    transport::{Dialer, StreamInitializer},
};

/// A coarse, advisory mirror of one pool's stream accounting, used only to pick a pool when
/// the caller has no preferred executor. The pool itself remains the source of truth for
/// actual reservations.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PoolAccounting {
    pub(crate) reserved: u32,
    pub(crate) max_available: u32,
}

impl PoolAccounting {
    fn available(&self) -> u32 {
        self.max_available.saturating_sub(self.reserved)
    }
}

pub(crate) type AccountingTable = Arc<Mutex<HashMap<LoopId, PoolAccounting>>>;

/// Adjusts `max_available` for `executor`'s pool by `delta`, called when a connection
/// manager's SETTINGS-advertised capacity changes.
pub(crate) fn change_stream_capacity(table: &AccountingTable, executor: LoopId, delta: i64) {
    if delta == 0 {
        return;
    }
    let mut table = table.lock().unwrap();
    if let Some(entry) = table.get_mut(&executor) {
        entry.max_available = if delta > 0 {
            entry.max_available.saturating_add(delta as u32)
        } else {
            entry.max_available.saturating_sub((-delta) as u32)
        };
    }
}

/// Decrements `executor`'s pool's `reserved` count by `count`, called when the pool refunds
/// reservations it will no longer fulfill (a connection dropped or started quiescing).
pub(crate) fn return_streams(table: &AccountingTable, executor: LoopId, count: u32) {
    if count == 0 {
        return;
    }
    let mut table = table.lock().unwrap();
    if let Some(entry) = table.get_mut(&executor) {
        entry.reserved = entry.reserved.saturating_sub(count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Inactive,
    Active,
    ShuttingDown,
    Shutdown,
}

/// Fronts a fleet of per-executor connection pools with a single `make_stream` façade.
///
/// Built once, for a fixed set of executors, and run until [`PoolManager::shutdown`].
pub struct PoolManager {
    pools: HashMap<LoopId, ConnectionPoolHandle>,
    accounting: AccountingTable,
    state: Mutex<ManagerState>,
}

impl PoolManager {
    /// Builds a pool manager with one connection pool per entry in `executors`, all dialing
    /// `options.endpoint`. Rejects a non-unique `executors` list: constructing a manager with
    /// two pools bound to the same executor is a programming error.
    pub fn new(
        executors: impl IntoIterator<Item = LoopId>,
        dialer: Arc<dyn Dialer>,
        options: PoolManagerOptions,
        delegate: Option<Arc<dyn crate::event::PoolDelegate>>,
    ) -> Result<Self> {
        let executors: Vec<LoopId> = executors.into_iter().collect();
        let mut seen = HashSet::with_capacity(executors.len());
        for &id in &executors {
            if !seen.insert(id) {
                return Err(Error::duplicate_executor(id));
            }
        }

        let accounting: AccountingTable = Arc::new(Mutex::new(HashMap::new()));
        let emitter = PoolEventEmitter::new(delegate);
        let mut pools = HashMap::with_capacity(executors.len());
        for executor in executors {
            accounting.lock().unwrap().insert(executor, PoolAccounting::default());
            let handle = cpool::spawn(
                executor,
                dialer.clone(),
                options.endpoint.clone(),
                options.tls_config.clone(),
                options.pool_options.clone(),
                accounting.clone(),
                emitter.clone(),
            );
            pools.insert(executor, handle);
        }

        Ok(Self {
            pools,
            accounting,
            state: Mutex::new(ManagerState::Active),
        })
    }

    /// Routes a stream request to `preferred_executor`'s pool if given and known, else to the
    /// pool with the strictly-greatest advisory available-stream count (ties broken by the
    /// lowest executor id, for determinism). Returns the opened stream together with the
    /// executor it was served from.
    pub async fn make_stream(
        &self,
        preferred_executor: Option<LoopId>,
        deadline: Instant,
        initializer: Arc<dyn StreamInitializer>,
    ) -> Result<(PooledChannel, LoopId)> {
        if !self.is_active() {
            return Err(Error::shutdown());
        }

        let executor = {
            let mut table = self.accounting.lock().unwrap();
            let executor = self.choose_executor(&table, preferred_executor)?;
            if let Some(entry) = table.get_mut(&executor) {
                entry.reserved = entry.reserved.saturating_add(1);
            }
            executor
        };

        let pool = self.pools.get(&executor).expect("accounting and pools are kept in sync");
        let channel = pool.make_stream(deadline, initializer).await?;
        Ok((channel, executor))
    }

    fn choose_executor(&self, table: &HashMap<LoopId, PoolAccounting>, preferred: Option<LoopId>) -> Result<LoopId> {
        if let Some(id) = preferred {
            if table.contains_key(&id) {
                return Ok(id);
            }
        }
        let mut best: Option<(LoopId, u32)> = None;
        for (&id, accounting) in table {
            let available = accounting.available();
            let better = match best {
                None => true,
                Some((best_id, best_available)) => {
                    available > best_available || (available == best_available && id < best_id)
                }
            };
            if better {
                best = Some((id, available));
            }
        }
        best.map(|(id, _)| id)
            .ok_or_else(|| Error::internal("pool manager has no configured pools"))
    }

    /// Shuts down every pool. `mode` is forwarded to each pool and, transitively, to every
    /// connection manager it owns. Subsequent calls coalesce onto the same shutdown: later
    /// callers simply wait for the in-flight one to finish.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ManagerState::Shutdown => return,
                ManagerState::ShuttingDown => {
                    // Another caller is already driving shutdown; fall through and await the
                    // same per-pool completions below, which are idempotent on a pool that's
                    // already shutting down or shut down.
                }
                ManagerState::Inactive | ManagerState::Active => {
                    *state = ManagerState::ShuttingDown;
                }
            }
        }

        let pools: Vec<_> = self.pools.values().cloned().collect();
        futures_util::future::join_all(pools.iter().map(|pool| pool.shutdown(mode))).await;

        *self.state.lock().unwrap() = ManagerState::Shutdown;
    }

    fn is_active(&self) -> bool {
        *self.state.lock().unwrap() == ManagerState::Active
    }

    #[cfg(test)]
    pub(crate) fn executor_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_accounting_available_saturates() {
        let acc = PoolAccounting {
            reserved: 5,
            max_available: 3,
        };
        assert_eq!(acc.available(), 0);
    }

    #[test]
    fn change_stream_capacity_and_return_streams_round_trip() {
        let table: AccountingTable = Arc::new(Mutex::new(HashMap::new()));
        table.lock().unwrap().insert(1, PoolAccounting::default());
        change_stream_capacity(&table, 1, 100);
        assert_eq!(table.lock().unwrap()[&1].max_available, 100);
        table.lock().unwrap().get_mut(&1).unwrap().reserved = 10;
        return_streams(&table, 1, 4);
        assert_eq!(table.lock().unwrap()[&1].reserved, 6);
    }
}
