pub mod business_context;
pub mod metrics;

pub use business_context::BusinessContext;
pub use metrics::metrics_middleware;
