//! API module
//!
//! HTTP API endpoints and middleware.

use std::sync::Arc;

use crate::engine::LedgerEngine;
use crate::query::QueryService;

pub mod middleware;
pub mod routes;

pub use routes::create_router;

/// Shared handler state: the write engine and the read facade.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    pub query: Arc<QueryService>,
}

impl AppState {
    pub fn new(engine: Arc<LedgerEngine>, query: Arc<QueryService>) -> Self {
        Self { engine, query }
    }
}
