//! HTTP surface: health, the discovery card, a plain chat endpoint, and
//! the protocol execute/stream endpoints.

pub mod server;

pub use server::start_http_server;

use crate::executor::TaskExecutor;

use std::sync::Arc;

/// Shared state for all HTTP handlers.
pub struct ApiState {
    pub executor: Arc<TaskExecutor>,
}
