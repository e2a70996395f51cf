//! service-core: Shared infrastructure for the invoicing workspace.
pub mod config;
pub mod error;
pub mod messaging;
pub mod middleware;
pub mod observability;

pub use async_trait;
pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tokio_util;
pub use tracing;
pub use validator;
