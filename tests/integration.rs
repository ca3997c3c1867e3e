use std::{ops::Deref, sync::Arc};

use chrono::{TimeDelta, Utc};
use parcelmq::{
    config::Config,
    error::Error,
    message::{headers, Message, MessageKind, StatusName, StoredMessage},
    monitoring::{truncate_to_hour, MessageQuery, MonitoringApi, Statistics},
    retry::RETRY_BATCH_SIZE,
    serializer::{JsonSerializer, Serializer},
    service::Service,
    storage::{DataStorage, DbTransaction},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

fn tmp_config(tmpdir: &TempDir) -> Config {
    Config {
        db_path: Some(
            tmpdir
                .path()
                .join("parcelmq.db")
                .to_string_lossy()
                .to_string(),
        ),
        failed_retry_count: 5,
        worker_id: Some(3),
        ..Config::default()
    }
}

async fn setup_with(config: impl FnOnce(Config) -> Config) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    TmpService {
        svc: Service::connect_with()
            .config(config(tmp_config(&path)))
            .call()
            .await
            .unwrap(),
        tmpdir: path,
    }
}

async fn setup() -> TmpService {
    setup_with(|config| config).await
}

fn order(n: u32) -> Message {
    Message::new(
        Default::default(),
        Some(serde_json::json!({ "order": n, "note": format!("order number {n}") })),
    )
    .with_header(headers::MESSAGE_NAME, "orders.created")
}

async fn publish(service: &Service, n: u32) -> StoredMessage {
    service
        .storage()
        .store_message("orders.created", order(n), DbTransaction::None)
        .await
        .unwrap()
}

async fn backdate(service: &Service, table: &str, by: TimeDelta) {
    sqlx::query(&format!(r#"UPDATE "{table}" SET added = $1"#))
        .bind(Utc::now() - by)
        .execute(service.db())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stored_message_reads_back() {
    let service = setup().await;

    let stored = publish(&service, 1).await;

    let record = service
        .monitoring()
        .get_published_message(stored.db_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.id, stored.db_id);
    assert_eq!(record.name, "orders.created");
    assert_eq!(record.version.as_deref(), Some("v1"));
    assert_eq!(record.retries, Some(0));
    assert_eq!(record.expires_at, None);
    assert_eq!(record.status_name, StatusName::Scheduled);

    let content = JsonSerializer
        .deserialize(record.content.as_deref().unwrap())
        .unwrap();
    assert_eq!(content, stored.origin);
    assert_eq!(content.id(), Some(stored.db_id.to_string().as_str()));

    assert_eq!(
        service
            .monitoring()
            .get_received_message(stored.db_id)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_received_message_reads_back() {
    let service = setup().await;

    let stored = service
        .storage()
        .store_received_message("orders.created", order(2))
        .await
        .unwrap();

    let record = service
        .monitoring()
        .get_received_message(stored.db_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.status_name, StatusName::Scheduled);
    assert_eq!(record.content.as_deref(), Some(stored.content.as_str()));
}

#[tokio::test]
async fn test_change_state_is_idempotent() {
    let service = setup().await;

    let mut stored = publish(&service, 1).await;
    stored.retries = 2;
    stored.expires_at = Some(Utc::now() + TimeDelta::days(1));

    service
        .storage()
        .change_publish_state(&stored, StatusName::Succeeded)
        .await
        .unwrap();
    let first = service
        .monitoring()
        .get_published_message(stored.db_id)
        .await
        .unwrap();

    service
        .storage()
        .change_publish_state(&stored, StatusName::Succeeded)
        .await
        .unwrap();
    let second = service
        .monitoring()
        .get_published_message(stored.db_id)
        .await
        .unwrap();

    assert_eq!(first, second);

    let record = second.unwrap();
    assert_eq!(record.retries, Some(2));
    assert_eq!(record.status_name, StatusName::Succeeded);
    assert_eq!(record.expires_at, stored.expires_at);
}

#[tokio::test]
async fn test_retry_scan_waits_for_backoff() {
    let service = setup().await;
    let cancel = CancellationToken::new();

    publish(&service, 1).await;

    assert!(service.retry_scanner().scan(&cancel).await.unwrap().is_empty());

    backdate(&service, service.storage().tables().published(), TimeDelta::minutes(5)).await;

    let batch = service.retry_scanner().scan(&cancel).await.unwrap();
    assert_eq!(batch.published.len(), 1);
    assert!(batch.received.is_empty());
}

#[tokio::test]
async fn test_retry_scan_is_capped() {
    let service = setup().await;

    for n in 0..RETRY_BATCH_SIZE + 5 {
        publish(&service, n).await;
    }
    backdate(&service, service.storage().tables().published(), TimeDelta::minutes(10)).await;

    let found = service
        .retry_scanner()
        .published(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.len(), RETRY_BATCH_SIZE as usize);
}

#[tokio::test]
async fn test_retry_scan_filters_version_status_and_retries() {
    let service = setup().await;
    let table = service.storage().tables().published().to_owned();

    let eligible = publish(&service, 1).await;

    let mut succeeded = publish(&service, 2).await;
    succeeded.retries = 1;
    service
        .storage()
        .change_publish_state(&succeeded, StatusName::Succeeded)
        .await
        .unwrap();

    let mut exhausted = publish(&service, 3).await;
    exhausted.retries = 5;
    service
        .storage()
        .change_publish_state(&exhausted, StatusName::Failed)
        .await
        .unwrap();

    let mut failed = publish(&service, 4).await;
    failed.retries = 4;
    service
        .storage()
        .change_publish_state(&failed, StatusName::Failed)
        .await
        .unwrap();

    let other_version = publish(&service, 5).await;
    sqlx::query(&format!(r#"UPDATE "{table}" SET version = 'v0' WHERE id = $1"#))
        .bind(other_version.db_id)
        .execute(service.db())
        .await
        .unwrap();

    backdate(&service, &table, TimeDelta::hours(1)).await;

    let mut ids: Vec<i64> = service
        .storage()
        .messages_of_need_retry(MessageKind::Published)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.db_id)
        .collect();
    ids.sort();

    let mut expected = vec![eligible.db_id, failed.db_id];
    expected.sort();

    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_retry_scan_honors_cancellation() {
    let service = setup().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = service.retry_scanner().scan(&cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_delete_expires_is_bounded() {
    let service = setup().await;
    let cancel = CancellationToken::new();
    let now = Utc::now();

    for n in 0..5 {
        let mut stored = publish(&service, n).await;
        stored.expires_at = Some(now - TimeDelta::minutes(1));
        service
            .storage()
            .change_publish_state(&stored, StatusName::Succeeded)
            .await
            .unwrap();
    }
    for n in 5..7 {
        let mut stored = publish(&service, n).await;
        stored.expires_at = Some(now + TimeDelta::days(1));
        service
            .storage()
            .change_publish_state(&stored, StatusName::Succeeded)
            .await
            .unwrap();
    }
    // No expiry at all
    publish(&service, 7).await;

    let storage = service.storage();
    assert_eq!(
        storage
            .delete_expires(MessageKind::Published, now, 3, &cancel)
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        storage
            .delete_expires(MessageKind::Published, now, 3, &cancel)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        storage
            .delete_expires(MessageKind::Published, now, 3, &cancel)
            .await
            .unwrap(),
        0
    );

    let remaining = service
        .monitoring()
        .messages(&MessageQuery::new(MessageKind::Published))
        .await
        .unwrap();
    assert_eq!(remaining.totals, 3);
    assert!(remaining
        .items
        .iter()
        .all(|r| r.expires_at.map_or(true, |e| e > now)));
}

#[tokio::test]
async fn test_reaper_drains_both_tables() {
    let service = setup_with(|config| Config {
        collector_batch_size: 2,
        ..config
    })
    .await;
    let past = Utc::now() - TimeDelta::minutes(1);

    for n in 0..3 {
        let mut stored = publish(&service, n).await;
        stored.expires_at = Some(past);
        service
            .storage()
            .change_publish_state(&stored, StatusName::Succeeded)
            .await
            .unwrap();
    }
    for n in 0..2 {
        let mut stored = service
            .storage()
            .store_received_message("orders.created", order(n))
            .await
            .unwrap();
        stored.expires_at = Some(past);
        service
            .storage()
            .change_receive_state(&stored, StatusName::Succeeded)
            .await
            .unwrap();
    }

    let reaper = service.expiry_reaper().unwrap();
    assert_eq!(reaper.batch_count(), 2);

    let removed = reaper.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(removed, 5);
    assert_eq!(
        service.monitoring().statistics().await.unwrap(),
        Statistics::default()
    );
}

#[tokio::test]
async fn test_hourly_counts_fill_24_buckets() {
    let service = setup().await;
    let end = Utc::now();
    let hours = parcelmq::monitoring::timeline_hours(end);

    let mut stored = publish(&service, 1).await;
    stored.retries = 1;
    service
        .storage()
        .change_publish_state(&stored, StatusName::Succeeded)
        .await
        .unwrap();

    let three_hours_ago = end - TimeDelta::hours(3);
    let table = service.storage().tables().published().to_owned();
    sqlx::query(&format!(r#"UPDATE "{table}" SET added = $1"#))
        .bind(three_hours_ago)
        .execute(service.db())
        .await
        .unwrap();

    let counts = service
        .monitoring()
        .hourly_counts(MessageKind::Published, StatusName::Succeeded, end)
        .await
        .unwrap();

    assert_eq!(counts.len(), 24);
    assert_eq!(counts.keys().copied().collect::<Vec<_>>(), hours);
    assert_eq!(counts[&truncate_to_hour(three_hours_ago)], 1);
    assert_eq!(counts[&hours[20]], 1);
    assert_eq!(counts.values().sum::<i64>(), 1);
    assert_eq!(*counts.keys().last().unwrap(), truncate_to_hour(end));

    let failed = service
        .monitoring()
        .hourly_counts(MessageKind::Published, StatusName::Failed, end)
        .await
        .unwrap();
    assert_eq!(failed.len(), 24);
    assert!(failed.values().all(|&count| count == 0));

    let received = service
        .monitoring()
        .hourly_succeeded_jobs(MessageKind::Received)
        .await
        .unwrap();
    assert_eq!(received.len(), 24);
}

struct BrokenSerializer;

impl Serializer for BrokenSerializer {
    fn serialize(&self, _message: &Message) -> Result<String, Error> {
        Err(serde_json::from_str::<serde_json::Value>("{").unwrap_err().into())
    }

    fn deserialize(&self, content: &str) -> Result<Message, Error> {
        JsonSerializer.deserialize(content)
    }
}

#[tokio::test]
async fn test_unserializable_content_writes_nothing() {
    let tmpdir = tempfile::tempdir().unwrap();
    let service = Service::connect_with()
        .config(tmp_config(&tmpdir))
        .serializer(Arc::new(BrokenSerializer))
        .call()
        .await
        .unwrap();

    let published = service
        .storage()
        .store_message("orders.created", order(1), DbTransaction::None)
        .await;
    assert!(matches!(published, Err(Error::Serialization { .. })));

    let received = service
        .storage()
        .store_received_message("orders.created", order(2))
        .await;
    assert!(matches!(received, Err(Error::Serialization { .. })));

    for kind in MessageKind::ALL {
        let result = service
            .monitoring()
            .messages(&MessageQuery::new(kind))
            .await
            .unwrap();
        assert_eq!(result.totals, 0);
    }
}

#[tokio::test]
async fn test_store_joins_caller_transaction() {
    let service = setup().await;

    let mut tx = service.db().begin().await.unwrap();
    let rolled_back = service
        .storage()
        .store_message("orders.created", order(1), DbTransaction::Active(&mut *tx))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(
        service
            .monitoring()
            .get_published_message(rolled_back.db_id)
            .await
            .unwrap(),
        None
    );

    let mut tx = service.db().begin().await.unwrap();
    let committed = service
        .storage()
        .store_message("orders.created", order(2), (&mut *tx).into())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(service
        .monitoring()
        .get_published_message(committed.db_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_messages_are_paged_newest_first() {
    let service = setup().await;

    for n in 0..25 {
        publish(&service, n).await;
    }

    let mut query = MessageQuery::new(MessageKind::Published);
    query.name = Some("orders.created".to_owned());
    query.page_size = 10;

    let first = service.monitoring().messages(&query).await.unwrap();
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.totals, 25);
    assert_eq!(first.page_index, 0);
    assert!(first.items.windows(2).all(|w| w[0].added >= w[1].added));

    query.current_page = 2;
    let last = service.monitoring().messages(&query).await.unwrap();
    assert_eq!(last.items.len(), 5);
    assert_eq!(last.totals, 25);

    query.current_page = 3;
    assert!(service
        .monitoring()
        .messages(&query)
        .await
        .unwrap()
        .items
        .is_empty());
}

#[tokio::test]
async fn test_messages_filter_by_status_name_and_content() {
    let service = setup().await;

    for n in 0..3 {
        publish(&service, n).await;
    }
    let mut done = publish(&service, 42).await;
    done.retries = 1;
    service
        .storage()
        .change_publish_state(&done, StatusName::Succeeded)
        .await
        .unwrap();

    let mut query = MessageQuery::new(MessageKind::Published);
    query.status_name = Some(StatusName::Succeeded);
    let result = service.monitoring().messages(&query).await.unwrap();
    assert_eq!(result.totals, 1);
    assert_eq!(result.items[0].id, done.db_id);

    let mut query = MessageQuery::new(MessageKind::Published);
    query.content = Some("order number 1".to_owned());
    let result = service.monitoring().messages(&query).await.unwrap();
    assert_eq!(result.totals, 1);

    let mut query = MessageQuery::new(MessageKind::Published);
    query.name = Some("invoices.sent".to_owned());
    assert_eq!(service.monitoring().messages(&query).await.unwrap().totals, 0);

    // Empty filters match everything
    let mut query = MessageQuery::new(MessageKind::Published);
    query.name = Some(String::new());
    query.content = Some(String::new());
    assert_eq!(service.monitoring().messages(&query).await.unwrap().totals, 4);
}

#[tokio::test]
async fn test_messages_reject_empty_pages() {
    let service = setup().await;

    let mut query = MessageQuery::new(MessageKind::Received);
    query.page_size = 0;

    match service.monitoring().messages(&query).await {
        Err(Error::InvalidParameter { .. }) => {}
        other => panic!("Expected InvalidParameter, got {other:?}"),
    }
}

#[tokio::test]
async fn test_statistics_and_counts() {
    let service = setup().await;

    for (n, status) in [
        (1, StatusName::Succeeded),
        (2, StatusName::Succeeded),
        (3, StatusName::Failed),
    ] {
        let mut stored = publish(&service, n).await;
        stored.retries = 1;
        service
            .storage()
            .change_publish_state(&stored, status)
            .await
            .unwrap();
    }

    let mut received = service
        .storage()
        .store_received_message("orders.created", order(4))
        .await
        .unwrap();
    received.retries = 1;
    service
        .storage()
        .change_receive_state(&received, StatusName::Succeeded)
        .await
        .unwrap();
    service
        .storage()
        .store_received_exception_message("orders.created", "{not json", "parse error")
        .await
        .unwrap();

    let monitoring = service.monitoring();

    assert_eq!(
        monitoring.statistics().await.unwrap(),
        Statistics {
            published_succeeded: 2,
            published_failed: 1,
            received_succeeded: 1,
            received_failed: 1,
        }
    );
    assert_eq!(monitoring.published_succeeded_count().await.unwrap(), 2);
    assert_eq!(monitoring.published_failed_count().await.unwrap(), 1);
    assert_eq!(monitoring.received_succeeded_count().await.unwrap(), 1);
    assert_eq!(monitoring.received_failed_count().await.unwrap(), 1);
    assert_eq!(
        monitoring
            .message_count(MessageKind::Received, StatusName::Scheduled)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_concurrent_initialization() {
    let service = setup().await;
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        service.initializer().initialize(&cancel),
        service.initializer().initialize(&cancel)
    );
    a.unwrap();
    b.unwrap();

    publish(&service, 1).await;
}

#[tokio::test]
async fn test_uninitialized_schema_fails() {
    let tmpdir = tempfile::tempdir().unwrap();
    let service = Service::connect_with()
        .config(tmp_config(&tmpdir))
        .initialize_schema(false)
        .call()
        .await
        .unwrap();

    let result = service
        .storage()
        .store_message("orders.created", order(1), DbTransaction::None)
        .await;
    assert!(matches!(result, Err(Error::Storage { .. })));

    service
        .initializer()
        .initialize(&CancellationToken::new())
        .await
        .unwrap();

    publish(&service, 1).await;
}

#[tokio::test]
async fn test_in_memory_service_shares_one_database() {
    let service = Service::connect().await.unwrap();

    let stored = publish(&service, 1).await;

    assert!(service.config().db_path().is_none());
    assert!(service
        .monitoring()
        .get_published_message(stored.db_id)
        .await
        .unwrap()
        .is_some());
}
