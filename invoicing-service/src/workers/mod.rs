//! Broker consumers: order events, provider responses and bulk work items.
//!
//! Each handler plugs into `service_core::messaging::QueueConsumer`, which
//! owns the receive loop, prefetch and ack/requeue.

mod bulk;
mod order_events;
mod responses;

pub use bulk::BulkWorker;
pub use order_events::OrderEventHandler;
pub use responses::ResponseHandler;

use service_core::messaging::HandleOutcome;

use crate::services::metrics::MESSAGES_TOTAL;

fn settle(queue: &str, outcome: HandleOutcome, label: &str) -> HandleOutcome {
    MESSAGES_TOTAL.with_label_values(&[queue, label]).inc();
    outcome
}
