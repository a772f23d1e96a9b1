//! Store-backed queue behavior against a real Postgres database per test.
//! Pure in-memory ordering logic lives in `queue.rs`'s own `#[cfg(test)]` module.

use std::sync::Arc;

use gateway_core::model::RequestStatus;
use gateway_core::queue::RequestQueue;
use gateway_core::storage::postgres::PostgresStorage;
use gateway_core::storage::Storage;
use gateway_core::ids::RequestId;
use gateway_core::model::Request;

fn sample(provider: &str, priority: i32) -> Request {
    Request::new(provider, "hello", priority, 30)
}

#[sqlx::test]
async fn enqueue_then_next_round_trips(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage.clone(), 10);

    let r = sample("echo", 50);
    let id = r.id;
    queue.enqueue(r).await.unwrap();

    let dequeued = queue.next().await.unwrap();
    assert_eq!(dequeued.id, id);
    assert_eq!(dequeued.status, RequestStatus::Processing);

    let stored = storage.get_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Processing);
}

#[sqlx::test]
async fn higher_priority_is_dequeued_first(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 10);

    let low = sample("echo", 10);
    let high = sample("echo", 90);
    let low_id = low.id;
    let high_id = high.id;

    queue.enqueue(low).await.unwrap();
    queue.enqueue(high).await.unwrap();

    let first = queue.next().await.unwrap();
    assert_eq!(first.id, high_id);
    let second = queue.next().await.unwrap();
    assert_eq!(second.id, low_id);
}

#[sqlx::test]
async fn equal_priority_breaks_tie_by_earlier_created_at(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 10);

    let first = sample("echo", 50);
    let first_id = first.id;
    queue.enqueue(first).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let second = sample("echo", 50);
    let second_id = second.id;
    queue.enqueue(second).await.unwrap();

    let dequeued = queue.next().await.unwrap();
    assert_eq!(dequeued.id, first_id);
    let dequeued = queue.next().await.unwrap();
    assert_eq!(dequeued.id, second_id);
}

#[sqlx::test]
async fn enqueue_past_max_queue_size_is_rejected(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 2);

    queue.enqueue(sample("echo", 50)).await.unwrap();
    queue.enqueue(sample("echo", 50)).await.unwrap();

    let err = queue.enqueue(sample("echo", 50)).await.unwrap_err();
    assert!(matches!(err, gateway_core::Error::QueueFull(2)));
}

#[sqlx::test]
async fn cancel_queued_request_removes_it_from_dispatch(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage.clone(), 10);

    let r = sample("echo", 50);
    let id = r.id;
    queue.enqueue(r).await.unwrap();

    let cancelled = queue.cancel(id).await.unwrap();
    assert!(cancelled);

    let stored = storage.get_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Cancelled);
}

#[sqlx::test]
async fn cancel_processing_request_fires_its_token(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 10);

    let r = sample("echo", 50);
    let id = r.id;
    queue.enqueue(r).await.unwrap();
    let _ = queue.next().await.unwrap();

    let token = queue.cancellation_token(id).await.unwrap();
    assert!(!token.is_cancelled());

    let cancelled = queue.cancel(id).await.unwrap();
    assert!(cancelled);
    assert!(token.is_cancelled());
}

#[sqlx::test]
async fn cancel_unknown_id_returns_false(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 10);

    let cancelled = queue.cancel(RequestId::new()).await.unwrap();
    assert!(!cancelled);
}

#[sqlx::test]
async fn recover_resets_stuck_processing_rows_and_requeues_them(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));

    let r = sample("echo", 50);
    let id = r.id;
    storage.create_request(&r).await.unwrap();
    storage.update_request_status(id, RequestStatus::Processing, None).await.unwrap();

    let queue = RequestQueue::new(storage.clone(), 10);
    queue.recover().await.unwrap();

    let stored = storage.get_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Queued);

    let dequeued = queue.next().await.unwrap();
    assert_eq!(dequeued.id, id);
}

#[sqlx::test]
async fn recover_reloads_already_queued_rows(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));

    let r = sample("echo", 50);
    let id = r.id;
    storage.create_request(&r).await.unwrap();

    let queue = RequestQueue::new(storage, 10);
    queue.recover().await.unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.queue_depth, 1);

    let dequeued = queue.next().await.unwrap();
    assert_eq!(dequeued.id, id);
}

#[sqlx::test]
async fn mark_completed_frees_the_concurrency_slot(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let queue = RequestQueue::new(storage, 10);

    queue.enqueue(sample("echo", 50)).await.unwrap();
    let dequeued = queue.next().await.unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.processing_count, 1);

    queue.mark_completed(dequeued.id).await;

    let stats = queue.stats().await;
    assert_eq!(stats.processing_count, 0);
    assert!(queue.cancellation_token(dequeued.id).await.is_none());
}
