mod common;

use common::{money, TestApp};
use uuid::Uuid;

use invoicing_service::models::{
    BulkCreateMessage, BulkItemStatus, BulkJobStatus, RealtimeEventType, MAX_BULK_ORDERS,
};
use invoicing_service::InvoicingError;

fn take_work(app: &TestApp) -> Vec<BulkCreateMessage> {
    app.broker.drain_json(&app.queues.bulk_create)
}

#[tokio::test]
async fn bulk_job_with_mixed_outcomes_completes_once() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, Some(money(100_000))).await;
    let passes = app.order(&config, money(150_000));
    let below_minimum = app.order(&config, money(50_000));
    let provider_error = app.order(&config, money(150_000));

    let job = app
        .state()
        .bulk
        .create_bulk(
            business_id,
            None,
            &[passes.order_id, below_minimum.order_id, provider_error.order_id],
        )
        .await
        .expect("Failed to create bulk job");
    assert_eq!(job.total_orders, 3);
    assert_eq!(job.status, BulkJobStatus::Processing);

    let work = take_work(&app);
    assert_eq!(work.len(), 3);
    for message in &work {
        app.state().bulk.process(message).await.unwrap();
    }

    // Redelivered work items are ignored.
    app.state().bulk.process(&work[0]).await.unwrap();

    let requests = app.take_requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        if request.invoice_data.order_id == Some(passes.order_id) {
            app.respond_success(request, "FEV-10", "C10").await;
        } else {
            assert_eq!(request.invoice_data.order_id, Some(provider_error.order_id));
            app.respond_error(request, "REJECTED").await;
        }
    }

    let (job, items) = app.state().bulk.get_status(job.job_id, Some(business_id)).await.unwrap();
    assert_eq!(job.processed, 3);
    assert_eq!(job.successful, 1);
    assert_eq!(job.failed, 2);
    assert_eq!(job.status, BulkJobStatus::Completed);
    assert!(job.completed_utc.is_some());

    let status_of = |order_id: Uuid| {
        items
            .iter()
            .find(|i| i.order_id == order_id)
            .map(|i| i.status)
            .expect("item for order")
    };
    assert_eq!(status_of(passes.order_id), BulkItemStatus::Success);
    assert_eq!(status_of(below_minimum.order_id), BulkItemStatus::Failed);
    assert_eq!(status_of(provider_error.order_id), BulkItemStatus::Failed);

    let rejected = items
        .iter()
        .find(|i| i.order_id == below_minimum.order_id)
        .unwrap();
    assert!(rejected.invoice_id.is_none());
    assert!(rejected.error_message.is_some());

    assert!(app.count(RealtimeEventType::BulkJobProgress) >= 3);
    assert_eq!(app.count(RealtimeEventType::BulkJobCompleted), 1);
}

#[tokio::test]
async fn late_retry_success_does_not_reopen_failed_item() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();
    let config = app.config(business_id, None).await;
    let order = app.order(&config, money(150_000));

    let job = app
        .state()
        .bulk
        .create_bulk(business_id, None, &[order.order_id])
        .await
        .unwrap();
    for message in take_work(&app) {
        app.state().bulk.process(&message).await.unwrap();
    }
    let first = app.take_request();
    app.respond_error(&first, "TIMEOUT").await;

    app.retry_scheduler()
        .sweep_once(chrono::Utc::now() + chrono::Duration::minutes(6))
        .await
        .unwrap();
    let retry = app.take_request();
    app.respond_success(&retry, "FEV-11", "C11").await;

    let (job, items) = app.state().bulk.get_status(job.job_id, None).await.unwrap();
    assert_eq!(job.successful + job.failed, job.total_orders);
    assert_eq!(job.failed, 1);
    assert_eq!(items[0].status, BulkItemStatus::Failed);
    assert_eq!(app.count(RealtimeEventType::BulkJobCompleted), 1);
}

#[tokio::test]
async fn bulk_size_limits() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();

    let empty = app.state().bulk.create_bulk(business_id, None, &[]).await;
    assert!(matches!(empty, Err(InvoicingError::InvalidInput(_))));

    let too_many: Vec<Uuid> = (0..MAX_BULK_ORDERS + 1).map(|_| Uuid::new_v4()).collect();
    let rejected = app.state().bulk.create_bulk(business_id, None, &too_many).await;
    assert!(matches!(rejected, Err(InvoicingError::InvalidInput(_))));

    let at_limit: Vec<Uuid> = (0..MAX_BULK_ORDERS).map(|_| Uuid::new_v4()).collect();
    let job = app
        .state()
        .bulk
        .create_bulk(business_id, None, &at_limit)
        .await
        .expect("500 orders should be accepted");
    assert_eq!(job.total_orders, MAX_BULK_ORDERS as i32);
    assert_eq!(take_work(&app).len(), MAX_BULK_ORDERS);
}

#[tokio::test]
async fn duplicate_order_ids_are_rejected() {
    let app = TestApp::spawn();
    let order_id = Uuid::new_v4();
    let result = app
        .state()
        .bulk
        .create_bulk(Uuid::new_v4(), None, &[order_id, order_id])
        .await;
    assert!(matches!(result, Err(InvoicingError::InvalidInput(_))));
}

#[tokio::test]
async fn enqueue_failure_fails_items_and_completes_job() {
    let app = TestApp::spawn();
    let business_id = Uuid::new_v4();

    app.broker.set_publish_failure(true);
    let job = app
        .state()
        .bulk
        .create_bulk(business_id, None, &[Uuid::new_v4(), Uuid::new_v4()])
        .await
        .unwrap();

    assert_eq!(job.failed, 2);
    assert_eq!(job.processed, 2);
    assert_eq!(job.status, BulkJobStatus::Completed);
    assert_eq!(app.count(RealtimeEventType::BulkJobCompleted), 1);
}

#[tokio::test]
async fn jobs_are_scoped_to_their_business() {
    let app = TestApp::spawn();
    let owner = Uuid::new_v4();
    let job = app
        .state()
        .bulk
        .create_bulk(owner, None, &[Uuid::new_v4()])
        .await
        .unwrap();

    let other = app.state().bulk.get_status(job.job_id, Some(Uuid::new_v4())).await;
    assert!(matches!(other, Err(InvoicingError::BulkJobNotFound(_))));

    let (mine, total) = app.state().bulk.list(Some(owner), 1, 20).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(mine[0].job_id, job.job_id);
}
