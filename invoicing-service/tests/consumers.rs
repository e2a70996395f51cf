mod common;

use chrono::Utc;
use common::{money, success_response, TestApp};
use serde_json::json;
use service_core::messaging::{
    ConsumerSettings, Delivery, HandleOutcome, MessageBroker, MessageHandler,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use invoicing_service::models::{InvoiceStatus, Order};
use invoicing_service::services::repository::{InvoiceRepository, SyncLogRepository};
use invoicing_service::workers::{OrderEventHandler, ResponseHandler};

fn order_event(order: &Order, event_type: &str) -> Delivery {
    let payload = json!({
        "event_type": event_type,
        "order_id": order.order_id,
        "business_id": order.business_id,
        "integration_id": order.integration_id,
        "total_amount": order.total_amount,
        "is_paid": true,
        "timestamp": Utc::now(),
    });
    Delivery {
        queue: "orders.events".to_string(),
        payload: payload.to_string().into_bytes(),
        receipt: None,
    }
}

fn handler(app: &TestApp) -> OrderEventHandler {
    OrderEventHandler::new(app.state().invoicing.clone())
}

#[tokio::test]
async fn paid_order_event_creates_invoice() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), Some(money(100_000))).await;
    let order = app.order(&config, money(150_000));

    let outcome = handler(&app).handle(&order_event(&order, "order.paid")).await;

    assert_eq!(outcome, HandleOutcome::Ack);
    assert_eq!(
        app.store.get_invoices_by_order(order.order_id).await.unwrap().len(),
        1
    );
    assert_eq!(app.take_requests().len(), 1);
}

#[tokio::test]
async fn filtered_order_event_is_acked_without_invoice() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), Some(money(100_000))).await;
    let order = app.order(&config, money(50_000));

    let outcome = handler(&app).handle(&order_event(&order, "order.created")).await;

    assert_eq!(outcome, HandleOutcome::Ack);
    assert!(app
        .store
        .get_invoices_by_order(order.order_id)
        .await
        .unwrap()
        .is_empty());
    assert!(app.take_requests().is_empty());
}

#[tokio::test]
async fn unrelated_and_malformed_events_are_acked() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let ignored = handler(&app).handle(&order_event(&order, "order.shipped")).await;
    assert_eq!(ignored, HandleOutcome::Ack);

    let malformed = Delivery {
        queue: "orders.events".to_string(),
        payload: b"{not json".to_vec(),
        receipt: None,
    };
    assert_eq!(handler(&app).handle(&malformed).await, HandleOutcome::Ack);
    assert!(app.take_requests().is_empty());
}

#[tokio::test]
async fn store_outage_requeues_order_event() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    app.store.set_unavailable(true);
    let outcome = handler(&app).handle(&order_event(&order, "order.paid")).await;
    app.store.set_unavailable(false);

    assert_eq!(outcome, HandleOutcome::Requeue);
}

#[tokio::test]
async fn failed_create_write_is_requeued_and_redelivery_dispatches() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));
    let delivery = order_event(&order, "order.paid");

    app.store.fail_next("create_invoice_with_items");
    assert_eq!(handler(&app).handle(&delivery).await, HandleOutcome::Requeue);
    assert!(app
        .store
        .get_invoices_by_order(order.order_id)
        .await
        .unwrap()
        .is_empty());
    assert!(app.take_requests().is_empty());

    assert_eq!(handler(&app).handle(&delivery).await, HandleOutcome::Ack);
    let invoices = app.store.get_invoices_by_order(order.order_id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let logs = app.store.get_sync_logs(invoices[0].invoice_id).await.unwrap();
    assert_eq!(logs.len(), 1);

    let request = app.take_request();
    assert_eq!(request.correlation_id, logs[0].correlation_id);
}

#[tokio::test]
async fn responses_for_unknown_invoices_are_acked() {
    let app = TestApp::spawn();
    let handler = ResponseHandler::new(app.components.reconciler.clone());
    let payload = json!({
        "invoice_id": Uuid::new_v4(),
        "status": "success",
        "invoice_number": "FEV-404",
    });
    let delivery = Delivery {
        queue: app.queues.responses.clone(),
        payload: payload.to_string().into_bytes(),
        receipt: None,
    };

    assert_eq!(handler.handle(&delivery).await, HandleOutcome::Ack);
}

#[tokio::test]
async fn running_consumers_drive_an_order_to_issued() {
    let app = TestApp::spawn();
    let config = app.config(Uuid::new_v4(), None).await;
    let order = app.order(&config, money(150_000));

    let shutdown = CancellationToken::new();
    let tasks = app.components.spawn_consumers(
        ConsumerSettings {
            prefetch: 2,
            poll_interval: Duration::from_millis(20),
        },
        &shutdown,
    );

    app.broker
        .publish(
            &app.queues.order_events,
            &order_event(&order, "order.paid").payload,
        )
        .await
        .unwrap();

    let mut request = None;
    for _ in 0..200 {
        if let Some(found) = app.take_requests().pop() {
            request = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let request = request.expect("provider request was not published");

    let response = success_response(&request, "FEV-77", "C77");
    app.broker
        .publish(
            &app.queues.responses,
            serde_json::to_vec(&response).unwrap().as_slice(),
        )
        .await
        .unwrap();

    let invoice_id = request.invoice_id.unwrap();
    let mut issued = false;
    for _ in 0..200 {
        let invoice = app.store.get_invoice(invoice_id).await.unwrap().unwrap();
        if invoice.status == InvoiceStatus::Issued {
            issued = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(issued, "invoice was not issued by the response consumer");
}
