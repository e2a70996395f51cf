//! Date-bounded comparison between issued invoices and provider documents.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::InvoicingError;
use crate::models::{
    classify, CompareRequest, CompareResult, CompareStatus, InvoiceResponseMessage,
    ProviderDocument, RealtimeEvent, RealtimeEventType, ResponseStatus, MAX_COMPARE_WINDOW_DAYS,
};
use crate::services::config_service::ConfigService;
use crate::services::dispatcher::{compare_request, Dispatcher};
use crate::services::events::EventPublisher;
use crate::services::repository::InvoicingStore;

/// A parsed window bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bound {
    instant: DateTime<Utc>,
    date_only: bool,
}

/// Parse `YYYY-MM-DD` (start of that UTC day) or an RFC 3339 instant.
fn parse_bound(field: &str, raw: &str) -> Result<Bound, InvoicingError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Bound {
            instant: date.and_time(chrono::NaiveTime::MIN).and_utc(),
            date_only: true,
        });
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Bound {
            instant: dt.with_timezone(&Utc),
            date_only: false,
        })
        .map_err(|_| {
            InvoicingError::InvalidDate(format!(
                "{} must be YYYY-MM-DD or an RFC 3339 timestamp, got {:?}",
                field, raw
            ))
        })
}

/// Validated compare window. The span rule applies to the bounds as given;
/// a date-only upper bound then covers its whole day when searching.
pub fn parse_window(
    date_from: &str,
    date_to: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>), InvoicingError> {
    let from = parse_bound("date_from", date_from)?;
    let to = parse_bound("date_to", date_to)?;

    if to.instant < from.instant {
        return Err(InvoicingError::InvalidDate(
            "date_to must not be before date_from".to_string(),
        ));
    }
    if to.instant - from.instant > Duration::days(MAX_COMPARE_WINDOW_DAYS) {
        return Err(InvoicingError::CompareDateRangeTooLarge {
            max_days: MAX_COMPARE_WINDOW_DAYS,
        });
    }

    let search_to = if to.date_only {
        to.instant + Duration::days(1) - Duration::microseconds(1)
    } else {
        to.instant
    };
    Ok((from.instant, search_to))
}

#[derive(Clone)]
pub struct CompareService {
    store: Arc<dyn InvoicingStore>,
    configs: ConfigService,
    dispatcher: Dispatcher,
    realtime: Arc<dyn EventPublisher>,
}

impl CompareService {
    pub fn new(
        store: Arc<dyn InvoicingStore>,
        configs: ConfigService,
        dispatcher: Dispatcher,
        realtime: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            configs,
            dispatcher,
            realtime,
        }
    }

    /// Ask the provider for its documents in the window. Returns the
    /// correlation id that the eventual `invoice.compare_ready` carries.
    #[instrument(skip(self, hints, requested_by), fields(component = "compare"))]
    pub async fn request_comparison(
        &self,
        business_id: Uuid,
        date_from: &str,
        date_to: &str,
        hints: Map<String, Value>,
        requested_by: Option<Uuid>,
    ) -> Result<Uuid, InvoicingError> {
        let (from, to) = parse_window(date_from, date_to)?;

        let config = self
            .configs
            .get_enabled_by_business(business_id)
            .await?
            .ok_or(InvoicingError::ProviderNotConfigured(business_id))?;

        let correlation_id = Uuid::new_v4();
        self.store
            .insert_compare_request(&CompareRequest {
                correlation_id,
                business_id,
                date_from: from,
                date_to: to,
                status: CompareStatus::Pending,
                requested_by,
                created_utc: Utc::now(),
                completed_utc: None,
            })
            .await?;

        let provider_config = config.invoice_config.clone().with_hints(
            hints.into_iter().chain([
                ("date_from".to_string(), json!(date_from.trim())),
                ("date_to".to_string(), json!(date_to.trim())),
            ]),
        );
        self.dispatcher
            .dispatch(&compare_request(
                &config.provider,
                config.invoicing_integration_id,
                provider_config,
                correlation_id,
            ))
            .await?;

        info!(correlation_id = %correlation_id, %from, %to, "Compare requested");
        Ok(correlation_id)
    }

    /// Classify a compare response and announce the result once.
    #[instrument(skip(self, response), fields(component = "compare", correlation_id = ?response.correlation_id))]
    pub async fn handle_response(
        &self,
        response: &InvoiceResponseMessage,
    ) -> Result<Option<CompareResult>, InvoicingError> {
        let Some(correlation_id) = response.correlation_id else {
            warn!("Compare response without correlation id, dropping");
            return Ok(None);
        };
        let Some(request) = self.store.get_compare_request(correlation_id).await? else {
            warn!("Compare response for unknown request, dropping");
            return Ok(None);
        };
        if request.status == CompareStatus::Completed {
            info!("Compare already completed, ignoring duplicate response");
            return Ok(None);
        }

        if response.status == ResponseStatus::Error {
            if self.store.complete_compare_request(correlation_id).await? {
                warn!(error = %response.error_message(), "Provider failed the compare");
                self.realtime.publish(RealtimeEvent::new(
                    RealtimeEventType::CompareReady,
                    request.business_id,
                    json!({
                        "correlation_id": correlation_id,
                        "date_from": request.date_from,
                        "date_to": request.date_to,
                        "error": response.error_message(),
                        "error_code": response.error_code,
                    }),
                ));
            }
            return Ok(None);
        }

        let invoices = self
            .store
            .get_issued_in_range(request.business_id, request.date_from, request.date_to)
            .await?;
        let mut system = Vec::with_capacity(invoices.len());
        for invoice in invoices {
            let items = self.store.get_invoice_items(invoice.invoice_id).await?;
            system.push((invoice, items));
        }
        let documents = ProviderDocument::list_from(response.document_json.as_ref());

        let (summary, items) = classify(system, documents);
        let result = CompareResult {
            correlation_id,
            business_id: request.business_id,
            date_from: request.date_from,
            date_to: request.date_to,
            summary,
            items,
        };

        if !self.store.complete_compare_request(correlation_id).await? {
            return Ok(None);
        }

        let data = serde_json::to_value(&result).map_err(|e| {
            InvoicingError::Infrastructure(service_core::error::AppError::InternalError(
                anyhow::anyhow!("Failed to encode compare result: {}", e),
            ))
        })?;
        self.realtime.publish(RealtimeEvent::new(
            RealtimeEventType::CompareReady,
            request.business_id,
            data,
        ));
        info!(
            matched = summary.matched,
            system_only = summary.system_only,
            provider_only = summary.provider_only,
            "Compare ready"
        );
        Ok(Some(result))
    }
}
