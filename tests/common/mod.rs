//! Common test utilities

use std::sync::Arc;

use ledger_core::engine::LedgerEngine;
use ledger_core::oracle::FixedRateOracle;
use ledger_core::query::QueryService;
use ledger_core::store::MemoryStore;

/// An engine and read facade wired over a fresh in-memory store.
pub struct TestRig {
    pub engine: Arc<LedgerEngine>,
    pub query: Arc<QueryService>,
    pub oracle: Arc<FixedRateOracle>,
}

/// Build an isolated rig per test; nothing is shared between rigs.
pub fn rig() -> TestRig {
    let store = Arc::new(MemoryStore::new());
    let oracle = Arc::new(FixedRateOracle::default());
    let engine = Arc::new(LedgerEngine::new(store.clone(), oracle.clone()));
    let query = Arc::new(QueryService::new(store, oracle.clone()));
    TestRig {
        engine,
        query,
        oracle,
    }
}
