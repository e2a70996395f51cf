mod common;

use chrono::{Duration, Utc};
use common::{money, TestApp};
use serde_json::{json, Map};
use uuid::Uuid;

use invoicing_service::models::{
    Classification, InvoiceResponseMessage, RealtimeEventType, SyncOperation,
};
use invoicing_service::services::{CreateInvoiceIntent, Reconciled};
use invoicing_service::InvoicingError;

async fn issue(app: &TestApp, config: &invoicing_service::models::InvoicingConfig, number: &str) {
    let order = app.order(config, money(150_000));
    app.state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let request = app.take_request();
    app.respond_success(&request, number, &format!("CUFE-{}", number)).await;
}

fn documents_response(correlation_id: Uuid, numbers: &[&str]) -> InvoiceResponseMessage {
    let documents: Vec<_> = numbers
        .iter()
        .map(|n| json!({ "documentNumber": n, "totalAmount": "150000.00", "customerName": "Ana Gomez" }))
        .collect();
    serde_json::from_value(json!({
        "operation": "compare",
        "status": "success",
        "correlation_id": correlation_id,
        "document_json": { "documents": documents }
    }))
    .unwrap()
}

#[tokio::test]
async fn compare_classifies_both_sides_and_announces_once() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, None).await;
    issue(&app, &config, "FEV-1").await;
    issue(&app, &config, "FEV-2").await;

    let today = Utc::now().date_naive();
    let correlation_id = app
        .state()
        .compare
        .request_comparison(
            business_id,
            &(today - Duration::days(1)).to_string(),
            &today.to_string(),
            Map::new(),
            None,
        )
        .await
        .expect("Failed to request comparison");

    let request = app.take_request();
    assert_eq!(request.operation, SyncOperation::Compare);
    assert_eq!(request.correlation_id, correlation_id);
    assert!(request.invoice_id.is_none());
    assert_eq!(request.invoice_data.config["date_to"], today.to_string());

    let response = documents_response(correlation_id, &["FEV-2", "FEV-3"]);
    let outcome = app.components.reconciler.reconcile(&response).await.unwrap();
    assert_eq!(outcome, Reconciled::Compared);

    // A redelivered response does not announce again.
    app.components.reconciler.reconcile(&response).await.unwrap();

    let ready = app.events.of_type(RealtimeEventType::CompareReady);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].business_id, business_id);
    assert_eq!(ready[0].data["correlation_id"], json!(correlation_id));
    assert_eq!(ready[0].data["summary"]["matched"], 1);
    assert_eq!(ready[0].data["summary"]["system_only"], 1);
    assert_eq!(ready[0].data["summary"]["provider_only"], 1);

    let items: Vec<invoicing_service::models::CompareItem> =
        serde_json::from_value(ready[0].data["items"].clone()).unwrap();
    let class_of = |number: &str| {
        items
            .iter()
            .find(|i| i.invoice_number == number)
            .map(|i| i.classification)
    };
    assert_eq!(class_of("FEV-1"), Some(Classification::SystemOnly));
    assert_eq!(class_of("FEV-2"), Some(Classification::Matched));
    assert_eq!(class_of("FEV-3"), Some(Classification::ProviderOnly));
}

#[tokio::test]
async fn compare_window_limits() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    app.config(business_id, None).await;
    let compare = app.state().compare;

    compare
        .request_comparison(business_id, "2026-03-01", "2026-03-08", Map::new(), None)
        .await
        .expect("seven days is accepted");

    let err = compare
        .request_comparison(
            business_id,
            "2026-03-01T00:00:00Z",
            "2026-03-08T00:00:01Z",
            Map::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::CompareDateRangeTooLarge { max_days: 7 }));

    let err = compare
        .request_comparison(business_id, "01/03/2026", "2026-03-02", Map::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::InvalidDate(_)));
}

#[tokio::test]
async fn compare_requires_enabled_config() {
    let app = TestApp::spawn();
    let err = app
        .state()
        .compare
        .request_comparison(Uuid::new_v4(), "2026-03-01", "2026-03-02", Map::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::ProviderNotConfigured(_)));
}

#[tokio::test]
async fn provider_error_still_announces_result() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    app.config(business_id, None).await;

    let correlation_id = app
        .state()
        .compare
        .request_comparison(business_id, "2026-03-01", "2026-03-02", Map::new(), None)
        .await
        .unwrap();

    let response: InvoiceResponseMessage = serde_json::from_value(json!({
        "operation": "compare",
        "status": "error",
        "error": "provider unavailable",
        "error_code": "UNAVAILABLE",
        "correlation_id": correlation_id
    }))
    .unwrap();
    app.components.reconciler.reconcile(&response).await.unwrap();

    let ready = app.events.of_type(RealtimeEventType::CompareReady);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].data["error_code"], "UNAVAILABLE");
}
