//! Periodic sweep that re-dispatches failed attempts whose retry is due.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::RetryConfig;
use crate::error::InvoicingError;
use crate::services::invoicing::InvoicingService;
use crate::services::metrics::RETRY_SWEEP_TOTAL;
use crate::services::repository::InvoicingStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub released: usize,
}

pub struct RetryScheduler {
    store: Arc<dyn InvoicingStore>,
    invoicing: InvoicingService,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn InvoicingStore>, invoicing: InvoicingService, config: RetryConfig) -> Self {
        Self {
            store,
            invoicing,
            config,
        }
    }

    /// Claim every attempt due at `now` and start its retry.
    ///
    /// A claim is released again only when the retry failed on transient
    /// infrastructure, so the next sweep picks it up. Business-rule refusals
    /// and publish failures keep the claim; a publish failure has already
    /// scheduled a fresh attempt of its own.
    #[instrument(skip(self), fields(component = "retry_sweep"))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let claimed = self
            .store
            .claim_due_retries(now, self.config.batch_size)
            .await?;
        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for attempt in &claimed {
            match self.invoicing.retry_claimed(attempt).await {
                Ok(next) => {
                    report.dispatched += 1;
                    RETRY_SWEEP_TOTAL.with_label_values(&["dispatched"]).inc();
                    info!(invoice_id = %attempt.invoice_id, sync_log_id = %next.sync_log_id, retry_count = next.retry_count, "Retry started");
                }
                Err(e) if e.is_transient() => {
                    RETRY_SWEEP_TOTAL.with_label_values(&["released"]).inc();
                    warn!(invoice_id = %attempt.invoice_id, error = %e, "Retry hit a transient error, releasing claim");
                    if let Err(release) = self.store.release_retry_claim(attempt.sync_log_id).await {
                        error!(sync_log_id = %attempt.sync_log_id, error = %release, "Failed to release retry claim");
                    } else {
                        report.released += 1;
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    RETRY_SWEEP_TOTAL.with_label_values(&["skipped"]).inc();
                    info!(invoice_id = %attempt.invoice_id, code = e.code(), "Retry skipped");
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                skipped = report.skipped,
                released = report.released,
                "Retry sweep finished"
            );
        }
        Ok(report)
    }

    fn next_wait(&self) -> Duration {
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.interval + Duration::from_millis(jitter)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Retry sweep disabled by configuration");
            return;
        }
        info!(interval_secs = self.config.interval.as_secs(), "Retry sweep started");

        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!(error = %e, "Retry sweep failed");
            }
        }
        info!("Retry sweep stopped");
    }
}
