//! Postgres implementations of the repository traits on [`Database`](super::Database).

mod bulk_jobs;
mod compare;
mod configs;
mod invoices;
mod orders;
mod sync_logs;
