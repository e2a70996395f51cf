mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{money, TestApp};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    business_id: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(business_id) = business_id {
        builder = builder.header("X-Business-ID", business_id.to_string());
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn();
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readiness_reports_store_outage() {
    let app = TestApp::spawn();
    let (status, _) = send(&app, "GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);

    app.store.set_unavailable(true);
    let (status, _) = send(&app, "GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn missing_business_header_is_unauthorized() {
    let app = TestApp::spawn();
    let (status, _) = send(&app, "GET", "/api/v1/invoicing/invoices", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_invoice_over_http() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, Some(money(100_000))).await;
    let order = app.order(&config, money(150_000));

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices",
        Some(business_id),
        Some(json!({ "order_id": order.order_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["order_id"], json!(order.order_id));
    assert_eq!(app.take_requests().len(), 1);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices",
        Some(business_id),
        Some(json!({ "order_id": order.order_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "order_already_invoiced");
}

#[tokio::test]
async fn below_minimum_over_http_is_unprocessable() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, Some(money(100_000))).await;
    let order = app.order(&config, money(50_000));

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices",
        Some(business_id),
        Some(json!({ "order_id": order.order_id })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "amount_below_minimum");
}

#[tokio::test]
async fn orders_of_other_businesses_are_not_found() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices",
        Some(Uuid::new_v4()),
        Some(json!({ "order_id": order.order_id })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invoice_detail_and_sync_logs() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, None).await;
    let order = app.order(&config, money(150_000));

    let (_, created) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices",
        Some(business_id),
        Some(json!({ "order_id": order.order_id })),
    )
    .await;
    let invoice_id = created["invoice_id"].as_str().unwrap().to_string();

    let (status, detail) = send(
        &app,
        "GET",
        &format!("/api/v1/invoicing/invoices/{}", invoice_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["items"].as_array().unwrap().len(), 1);

    let (status, logs) = send(
        &app,
        "GET",
        &format!("/api/v1/invoicing/invoices/{}/sync-logs", invoice_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["sync_logs"].as_array().unwrap().len(), 1);

    let (status, list) = send(
        &app,
        "GET",
        "/api/v1/invoicing/invoices?status=pending",
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/invoicing/invoices/{}/credit-notes", invoice_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "credit_note_delegated");
}

#[tokio::test]
async fn bulk_create_is_accepted_with_status_url() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices/bulk",
        Some(business_id),
        Some(json!({ "order_ids": [Uuid::new_v4(), Uuid::new_v4()] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["total_orders"], 2);
    let job_id = body["job_id"].as_str().unwrap();
    assert_eq!(
        body["status_url"],
        format!("/api/v1/invoicing/bulk-jobs/{}", job_id)
    );

    let (status, job) = send(
        &app,
        "GET",
        &format!("/api/v1/invoicing/bulk-jobs/{}", job_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["items"].as_array().unwrap().len(), 2);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/invoicing/invoices/bulk",
        Some(business_id),
        Some(json!({ "order_ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn one_enabled_config_per_business() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let body = || {
        json!({
            "integration_id": Uuid::new_v4(),
            "invoicing_integration_id": Uuid::new_v4(),
            "auto_invoice": true,
            "filters": { "amount": { "min": "100.00" } }
        })
    };

    let (status, first) = send(
        &app,
        "POST",
        "/api/v1/invoicing/configs",
        Some(business_id),
        Some(body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["enabled"], true);

    let (status, conflict) = send(
        &app,
        "POST",
        "/api/v1/invoicing/configs",
        Some(business_id),
        Some(body()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["code"], "active_config_exists");

    let config_id = first["config_id"].as_str().unwrap();
    let (status, disabled) = send(
        &app,
        "POST",
        &format!("/api/v1/invoicing/configs/{}/disable", config_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(disabled["enabled"], false);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/invoicing/configs",
        Some(business_id),
        Some(body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/v1/invoicing/configs/{}", config_id),
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn configured_retry_budget_applies_to_new_configs() {
    let app = TestApp::spawn().with_default_max_retries(6);
    let business_id = Uuid::new_v4();

    let (status, config) = send(
        &app,
        "POST",
        "/api/v1/invoicing/configs",
        Some(business_id),
        Some(json!({
            "integration_id": Uuid::new_v4(),
            "invoicing_integration_id": Uuid::new_v4()
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(config["max_retries"], 6);
}

#[tokio::test]
async fn compare_is_accepted_and_range_checked() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    app.config(business_id, None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/compare",
        Some(business_id),
        Some(json!({ "date_from": "2026-03-01", "date_to": "2026-03-08" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert!(body["correlation_id"].as_str().is_some());

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/compare",
        Some(business_id),
        Some(json!({ "date_from": "2026-03-01", "date_to": "2026-03-09" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "compare_date_range_too_large");
}

#[tokio::test]
async fn stats_and_trends_respond() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();

    let (status, stats) = send(&app, "GET", "/api/v1/invoicing/stats", Some(business_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending_retries"], 0);

    let (status, trends) = send(
        &app,
        "GET",
        "/api/v1/invoicing/trends?start_date=2026-03-01&end_date=2026-03-03",
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trends.as_array().unwrap().len(), 3);

    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/invoicing/summary?start_date=2026-03-05&end_date=2026-03-01",
        Some(business_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connection_without_credentials_is_rejected() {
    let app = TestApp::spawn();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/invoicing/providers/softpymes/test-connection",
        Some(Uuid::new_v4()),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "missing_required_field");
}
