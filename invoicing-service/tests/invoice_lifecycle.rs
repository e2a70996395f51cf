mod common;

use chrono::{Duration, Utc};
use common::{error_response, money, TestApp};
use uuid::Uuid;

use invoicing_service::models::{
    DomainEvent, InvoiceStatus, RealtimeEventType, SyncOperation, SyncStatus,
};
use invoicing_service::services::repository::{
    InvoiceRepository, OrderRepository, SyncLogRepository,
};
use invoicing_service::services::{CancelOutcome, CreateInvoiceIntent, Reconciled};
use invoicing_service::InvoicingError;

#[tokio::test]
async fn happy_path_issues_invoice_and_updates_order() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, Some(money(100_000))).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .expect("Failed to create invoice");
    assert_eq!(invoice.status, InvoiceStatus::Pending);

    let request = app.take_request();
    assert_eq!(request.invoice_id, Some(invoice.invoice_id));
    assert_eq!(request.operation, SyncOperation::Create);
    assert_eq!(request.invoice_data.config["resolution"], "18760000001");

    app.respond_success(&request, "FEV-1", "C1").await;

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Issued);
    assert_eq!(stored.invoice_number.as_deref(), Some("FEV-1"));
    assert_eq!(stored.cufe.as_deref(), Some("C1"));

    let order = app.store.get_order(order.order_id).await.unwrap().unwrap();
    assert_eq!(order.invoice_number.as_deref(), Some("FEV-1"));

    let created = app.events.of_type(RealtimeEventType::InvoiceCreated);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].business_id, business_id);

    let logs = app.store.get_sync_logs(invoice.invoice_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncStatus::Success);
    assert_eq!(logs[0].correlation_id, request.correlation_id);

    let domain: Vec<DomainEvent> = app.broker.drain_json(&app.queues.domain_events);
    assert!(domain.iter().any(|e| e.event_type == "invoice.issued"));
}

#[tokio::test]
async fn duplicate_success_response_issues_once() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let request = app.take_request();

    app.respond_success(&request, "FEV-1", "C1").await;
    app.respond_success(&request, "FEV-9", "C9").await;

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.invoice_number.as_deref(), Some("FEV-1"));
    assert_eq!(app.count(RealtimeEventType::InvoiceCreated), 1);
}

#[tokio::test]
async fn manual_create_below_minimum_is_rejected() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, Some(money(100_000))).await;
    let order = app.order(&config, money(50_000));

    let err = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::manual(
            order.order_id,
            Some(business_id),
            None,
        ))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "amount_below_minimum");
    assert_eq!(err.status_code(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    assert!(app
        .store
        .get_invoices_by_order(order.order_id)
        .await
        .unwrap()
        .is_empty());
    assert!(app.take_requests().is_empty());
}

#[tokio::test]
async fn second_create_for_same_order_conflicts() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    app.state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let request = app.take_request();
    app.respond_success(&request, "FEV-1", "C1").await;

    let err = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap_err();

    assert!(matches!(err, InvoicingError::OrderAlreadyInvoiced(id) if id == order.order_id));
    assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    assert_eq!(
        app.store.get_invoices_by_order(order.order_id).await.unwrap().len(),
        1
    );
    assert!(app.take_requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_creates_for_one_order_issue_one_invoice() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order_id = app.order(&config, money(150_000)).order_id;

    let first = tokio::spawn({
        let invoicing = app.state().invoicing;
        async move {
            invoicing
                .create_invoice(CreateInvoiceIntent::auto(order_id))
                .await
        }
    });
    let second = tokio::spawn({
        let invoicing = app.state().invoicing;
        async move {
            invoicing
                .create_invoice(CreateInvoiceIntent::auto(order_id))
                .await
        }
    });
    let (first, second) = (first.await.unwrap(), second.await.unwrap());

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, InvoicingError::OrderAlreadyInvoiced(_))));

    assert_eq!(
        app.store.get_invoices_by_order(order_id).await.unwrap().len(),
        1
    );
    assert_eq!(app.take_requests().len(), 1);
}

#[tokio::test]
async fn failed_attempt_is_retried_by_sweep_then_issued() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let started = Utc::now();
    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let first = app.take_request();
    app.respond_error(&first, "TIMEOUT").await;

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Failed);

    let logs = app.store.get_sync_logs(invoice.invoice_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncStatus::Failed);
    assert_eq!(logs[0].retry_count, 0);
    assert_eq!(logs[0].error_code.as_deref(), Some("TIMEOUT"));
    let next_retry = logs[0].next_retry_utc.expect("retry should be scheduled");
    assert!(next_retry >= started + Duration::minutes(5));
    assert!(next_retry <= Utc::now() + Duration::minutes(5));

    // Nothing is due yet.
    let early = app.retry_scheduler().sweep_once(Utc::now()).await.unwrap();
    assert_eq!(early.dispatched, 0);

    let report = app
        .retry_scheduler()
        .sweep_once(Utc::now() + Duration::minutes(6))
        .await
        .unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.dispatched, 1);

    let second = app.take_request();
    assert_ne!(second.correlation_id, first.correlation_id);
    assert_eq!(second.invoice_id, Some(invoice.invoice_id));
    assert_eq!(second.operation, SyncOperation::Retry);

    app.respond_success(&second, "FEV-2", "C2").await;

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Issued);
    assert_eq!(stored.invoice_number.as_deref(), Some("FEV-2"));

    let logs = app.store.get_sync_logs(invoice.invoice_id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].status, SyncStatus::Success);
    assert_eq!(logs[1].retry_count, 1);

    assert_eq!(app.count(RealtimeEventType::InvoiceFailed), 1);
    assert_eq!(app.count(RealtimeEventType::InvoiceCreated), 1);
}

#[tokio::test]
async fn retries_stop_after_max_retries() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();

    let mut later = Utc::now();
    for attempt in 0..4 {
        let request = app.take_request();
        app.respond_error(&request, "TIMEOUT").await;

        later = later + Duration::hours(1);
        let report = app.retry_scheduler().sweep_once(later).await.unwrap();
        let expected = if attempt < 3 { 1 } else { 0 };
        assert_eq!(report.dispatched, expected, "sweep after failure {}", attempt);
    }
    assert!(app.take_requests().is_empty());

    let logs = app.store.get_sync_logs(invoice.invoice_id).await.unwrap();
    assert_eq!(logs.len(), 4);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.status, SyncStatus::Failed);
        assert_eq!(log.retry_count, i as i32);
    }
    assert!(logs[3].next_retry_utc.is_none());

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Failed);
    assert_eq!(app.count(RealtimeEventType::InvoiceFailed), 4);

    let err = app
        .state()
        .invoicing
        .retry_invoice(
            invoice.invoice_id,
            None,
            invoicing_service::models::TriggerSource::Manual,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::MaxRetriesExceeded));
}

#[tokio::test]
async fn redelivered_error_for_superseded_attempt_keeps_retry_budget() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let first = app.take_request();
    app.respond_error(&first, "TIMEOUT").await;

    app.state()
        .invoicing
        .retry_invoice(
            invoice.invoice_id,
            None,
            invoicing_service::models::TriggerSource::Manual,
            None,
        )
        .await
        .unwrap();
    let second = app.take_request();

    // The first attempt's error arrives again while the retry is in flight.
    let outcome = app
        .components
        .reconciler
        .reconcile(&error_response(&first, "TIMEOUT"))
        .await
        .unwrap();
    assert_eq!(outcome, Reconciled::Stale);
    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Pending);
    assert_eq!(app.count(RealtimeEventType::InvoiceFailed), 1);

    app.respond_error(&second, "TIMEOUT").await;

    let latest = app
        .store
        .get_latest_sync_log(invoice.invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.retry_count, 1);
    assert_eq!(latest.status, SyncStatus::Failed);
    assert!(latest.next_retry_utc.is_some());
    assert_eq!(app.count(RealtimeEventType::InvoiceFailed), 2);

    let report = app
        .retry_scheduler()
        .sweep_once(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(app.take_request().operation, SyncOperation::Retry);
}

#[tokio::test]
async fn manual_retry_is_refused_while_attempt_is_open() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();

    let err = app
        .state()
        .invoicing
        .retry_invoice(
            invoice.invoice_id,
            Some(config.business_id),
            invoicing_service::models::TriggerSource::Manual,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::RetryNotAllowed(_)));
}

#[tokio::test]
async fn publish_failure_leaves_attempt_failed_and_scheduled() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    app.broker.set_publish_failure(true);
    let err = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::Publish(_)));
    app.broker.set_publish_failure(false);

    let invoices = app.store.get_invoices_by_order(order.order_id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let logs = app.store.get_sync_logs(invoices[0].invoice_id).await.unwrap();
    assert_eq!(logs[0].status, SyncStatus::Failed);
    assert_eq!(logs[0].error_code.as_deref(), Some("PUBLISH_ERROR"));
    assert!(logs[0].next_retry_utc.is_some());

    let report = app
        .retry_scheduler()
        .sweep_once(Utc::now() + Duration::minutes(6))
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(app.take_requests().len(), 1);
}

#[tokio::test]
async fn cancelling_failed_invoice_clears_scheduled_retries() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let request = app.take_request();
    app.respond_error(&request, "TIMEOUT").await;

    let outcome = app
        .state()
        .invoicing
        .cancel_invoice(invoice.invoice_id, Some(config.business_id), None)
        .await
        .unwrap();
    let CancelOutcome::Cancelled(cancelled) = outcome else {
        panic!("expected a local cancellation");
    };
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);

    let logs = app.store.get_sync_logs(invoice.invoice_id).await.unwrap();
    assert!(logs
        .iter()
        .all(|l| l.status != SyncStatus::Cancelled || l.next_retry_utc.is_none()));

    let report = app
        .retry_scheduler()
        .sweep_once(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(app.count(RealtimeEventType::InvoiceCancelled), 1);

    let again = app
        .state()
        .invoicing
        .cancel_invoice(invoice.invoice_id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(again, InvoicingError::InvoiceAlreadyCancelled));
}

#[tokio::test]
async fn cancelling_issued_invoice_goes_through_provider() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();
    let request = app.take_request();
    app.respond_success(&request, "FEV-1", "C1").await;

    let outcome = app
        .state()
        .invoicing
        .cancel_invoice(invoice.invoice_id, None, None)
        .await
        .unwrap();
    assert!(matches!(outcome, CancelOutcome::Requested(_)));

    let cancel = app.take_request();
    assert_eq!(cancel.operation, SyncOperation::Cancel);
    app.respond_success(&cancel, "FEV-1", "C1").await;

    let stored = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Cancelled);
    assert_eq!(app.count(RealtimeEventType::InvoiceCancelled), 1);
}

#[tokio::test]
async fn credit_notes_are_delegated() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));
    let invoice = app
        .state()
        .invoicing
        .create_invoice(CreateInvoiceIntent::auto(order.order_id))
        .await
        .unwrap();

    let err = app
        .state()
        .invoicing
        .create_credit_note(invoice.invoice_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvoicingError::CreditNoteDelegated));
}
