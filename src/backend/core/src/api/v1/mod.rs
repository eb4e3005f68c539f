//! V1 API: reindex submission, history, retry queue, and audit export.

pub mod routes;

pub use routes::{v1_router, V1_PREFIX};
