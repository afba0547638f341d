pub mod api;
pub mod model;
pub mod service;

use std::sync::Arc;

use axum::Router;
use potline_core::Module;

use service::BatchService;

/// Batch module — lifecycle and quantity ledger for plant batches.
pub struct BatchModule {
    service: Arc<BatchService>,
}

impl BatchModule {
    pub fn new(service: Arc<BatchService>) -> Self {
        Self { service }
    }
}

impl Module for BatchModule {
    fn name(&self) -> &str {
        "batch"
    }

    fn routes(&self) -> Router {
        api::router(self.service.clone())
    }
}
