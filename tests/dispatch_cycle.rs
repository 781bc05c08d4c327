use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use content_hooks::content::{ContentEntry, MemoryDirectory};
use content_hooks::db::{self, Pool};
use content_hooks::delivery::{
    ConfiguredPolicy, DeliveryEvent, DeliveryObserver, NotificationRequest, Notifier, Transport,
    TransportResponse, ORIGIN_HEADER,
};
use content_hooks::dispatch::{CycleOutcome, CycleStats, Dispatcher};
use content_hooks::ledger::ChangeLedger;
use content_hooks::listener::{MutationContext, MutationListener};
use content_hooks::lock::{ManualClock, RunLock, SqliteRunLock, DISPATCH_LOCK};
use content_hooks::model::{ChangeAction, ChangeRecord, Content, Scope};
use content_hooks::registry::Registry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Answers per target URL; unknown targets get a 500. Every request is kept.
#[derive(Default)]
struct RecordingTransport {
    answers: Mutex<HashMap<String, TransportResponse>>,
    scripted: Mutex<VecDeque<Result<TransportResponse>>>,
    requests: Mutex<Vec<NotificationRequest>>,
}

impl RecordingTransport {
    async fn answer(&self, target: &str, status: u16, signature: &str) {
        self.answers.lock().await.insert(
            target.to_string(),
            TransportResponse {
                status,
                signature: Some(signature.to_string()),
            },
        );
    }

    async fn script(&self, responses: Vec<Result<TransportResponse>>) {
        self.scripted.lock().await.extend(responses);
    }

    async fn requests(&self) -> Vec<NotificationRequest> {
        self.requests.lock().await.clone()
    }

    async fn requests_to(&self, target: &str) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.url == target)
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: &NotificationRequest) -> Result<TransportResponse> {
        self.requests.lock().await.push(request.clone());
        if let Some(next) = self.scripted.lock().await.pop_front() {
            return next;
        }
        Ok(self
            .answers
            .lock()
            .await
            .get(&request.url)
            .cloned()
            .unwrap_or(TransportResponse {
                status: 500,
                signature: None,
            }))
    }
}

#[derive(Default)]
struct CountingObserver {
    delivered: std::sync::Mutex<Vec<DeliveryEvent>>,
    failed: std::sync::Mutex<Vec<DeliveryEvent>>,
}

impl CountingObserver {
    fn delivered(&self) -> Vec<DeliveryEvent> {
        self.delivered.lock().unwrap().clone()
    }

    fn failed(&self) -> Vec<DeliveryEvent> {
        self.failed.lock().unwrap().clone()
    }
}

impl DeliveryObserver for CountingObserver {
    fn delivered(&self, event: &DeliveryEvent) {
        self.delivered.lock().unwrap().push(event.clone());
    }

    fn failed(&self, event: &DeliveryEvent) {
        self.failed.lock().unwrap().push(event.clone());
    }
}

struct Harness {
    pool: Pool,
    ledger: ChangeLedger,
    registry: Registry,
    transport: Arc<RecordingTransport>,
    observer: Arc<CountingObserver>,
    dispatcher: Dispatcher,
}

async fn harness() -> Harness {
    let pool = setup_pool().await;
    let lock = Arc::new(SqliteRunLock::new(pool.clone(), Some(Duration::from_secs(600))));
    harness_with(pool, lock, Arc::new(RecordingTransport::default())).await
}

async fn harness_with(
    pool: Pool,
    lock: Arc<dyn RunLock>,
    transport: Arc<RecordingTransport>,
) -> Harness {
    let ledger = ChangeLedger::new(pool.clone());
    let registry = Registry::new(pool.clone());
    let observer = Arc::new(CountingObserver::default());
    let notifier = Notifier::new(
        transport.clone(),
        Arc::new(ConfiguredPolicy::default()),
        registry.clone(),
        "https://site.test",
        Duration::from_secs(7),
    )
    .with_observer(observer.clone());
    let dispatcher = Dispatcher::new(ledger.clone(), registry.clone(), lock, notifier);
    Harness {
        pool,
        ledger,
        registry,
        transport,
        observer,
        dispatcher,
    }
}

fn content(id: i64, content_type: &str) -> Content {
    Content {
        id,
        content_type: content_type.into(),
        status: "publish".into(),
        slug: format!("item-{}", id),
        guid: format!("https://site.test/?p={}", id),
        password: String::new(),
        author_id: 1,
        date: None,
        date_gmt: None,
        modified: None,
        modified_gmt: None,
    }
}

fn record(id: i64) -> ChangeRecord {
    ChangeRecord::new(
        content(id, "post"),
        Some(format!("https://site.test/item-{}", id)),
        None,
        None,
    )
}

async fn completed(dispatcher: &Dispatcher) -> CycleStats {
    match dispatcher.run_cycle().await.unwrap() {
        CycleOutcome::Completed(stats) => stats,
        other => panic!("cycle did not complete: {:?}", other),
    }
}

#[tokio::test]
async fn two_creates_reach_collection_subscriber() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    h.ledger.record(ChangeAction::Create, &record(1)).await.unwrap();
    h.ledger.record(ChangeAction::Create, &record(2)).await.unwrap();

    let stats = completed(&h.dispatcher).await;
    assert_eq!(stats.drained, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(h.observer.delivered().len(), 2);
    assert!(h.observer.failed().is_empty());
    assert_eq!(h.ledger.count(ChangeAction::Create).await.unwrap(), 0);

    let requests = h.transport.requests().await;
    assert_eq!(requests[0].body["action"], "create");
    assert_eq!(requests[0].body["item"]["id"], 1);
    assert_eq!(requests[1].body["item"]["id"], 2);
    assert!(requests[0]
        .headers
        .contains(&(ORIGIN_HEADER.to_string(), "https://site.test".to_string())));
}

#[tokio::test]
async fn repeated_changes_notify_once_per_cycle() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create", "update"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    for _ in 0..3 {
        h.ledger.record(ChangeAction::Update, &record(5)).await.unwrap();
    }
    h.ledger.record(ChangeAction::Create, &record(6)).await.unwrap();
    h.ledger.record(ChangeAction::Update, &record(6)).await.unwrap();

    let stats = completed(&h.dispatcher).await;
    assert_eq!(stats.deliveries, 2);
    let actions: Vec<(i64, String)> = h
        .transport
        .requests()
        .await
        .iter()
        .map(|r| {
            (
                r.body["item"]["id"].as_i64().unwrap(),
                r.body["action"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(actions, vec![(6, "create".to_string()), (5, "update".to_string())]);
}

#[tokio::test]
async fn invalid_signature_is_retried_then_subscription_removed() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["update"])
        .await
        .unwrap();
    h.transport
        .answer("https://a.test", 200, &format!("{}BAD", sub.signature))
        .await;

    h.ledger.record(ChangeAction::Update, &record(3)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(h.transport.requests_to("https://a.test").await, 2);
    assert_eq!(stats.failed, 1);
    let failed = h.observer.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subscription_id, sub.subscription.id);
    assert_eq!(failed[0].attempts, 2);
    assert!(h.registry.get(sub.subscription.id).await.unwrap().is_none());
    assert_eq!(h.ledger.count(ChangeAction::Update).await.unwrap(), 0);
}

#[tokio::test]
async fn network_error_then_valid_answer_succeeds() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;
    h.transport.script(vec![Err(anyhow!("connection refused"))]).await;

    h.ledger.record(ChangeAction::Create, &record(1)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(stats.succeeded, 1);
    assert_eq!(h.observer.delivered()[0].attempts, 2);
    assert!(h.registry.get(sub.subscription.id).await.unwrap().is_some());
}

#[tokio::test]
async fn mixed_subscribers_have_isolated_outcomes() {
    let h = harness().await;
    let good = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    let bad = h
        .registry
        .create(&Scope::collection("post"), "https://b.test", &["create"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &good.signature).await;
    h.transport.answer("https://b.test", 200, "wrong").await;

    h.ledger.record(ChangeAction::Create, &record(1)).await.unwrap();
    h.ledger.record(ChangeAction::Create, &record(2)).await.unwrap();
    completed(&h.dispatcher).await;

    let delivered = h.observer.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|e| e.target == "https://a.test"));

    let failed = h.observer.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target, "https://b.test");
    assert_eq!(failed[0].content_id, 1);
    // Removed after the first item, so the second item never reaches it.
    assert_eq!(h.transport.requests_to("https://b.test").await, 2);

    assert!(h.registry.get(bad.subscription.id).await.unwrap().is_none());
    assert!(h.registry.get(good.subscription.id).await.unwrap().is_some());
}

#[tokio::test]
async fn item_delete_notifies_then_cascades() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::item("post", 9), "https://a.test", &["delete"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    h.ledger.record(ChangeAction::Delete, &record(9)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(h.observer.delivered().len(), 1);
    assert_eq!(stats.removed, 1);
    assert!(h.registry.get(sub.subscription.id).await.unwrap().is_none());
    assert_eq!(h.ledger.count(ChangeAction::Delete).await.unwrap(), 0);
}

#[tokio::test]
async fn item_delete_without_delete_event_is_consumed_silently() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::item("post", 9), "https://a.test", &["update"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    h.ledger.record(ChangeAction::Delete, &record(9)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(stats.deliveries, 0);
    assert!(h.observer.delivered().is_empty());
    assert!(h.observer.failed().is_empty());
    assert_eq!(h.ledger.count(ChangeAction::Delete).await.unwrap(), 0);
    assert!(h.registry.get(sub.subscription.id).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_reaches_each_target_once() {
    let h = harness().await;
    let collection = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["delete"])
        .await
        .unwrap();
    let item = h
        .registry
        .create(&Scope::item("post", 4), "https://a.test", &["delete"])
        .await
        .unwrap();
    // The shared target answers with the collection subscription's signature.
    h.transport
        .answer("https://a.test", 200, &collection.signature)
        .await;

    h.ledger.record(ChangeAction::Delete, &record(4)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(h.transport.requests_to("https://a.test").await, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.removed, 1);
    assert!(h.registry.get(item.subscription.id).await.unwrap().is_none());
    assert!(h.registry.get(collection.subscription.id).await.unwrap().is_some());
}

#[tokio::test]
async fn held_lock_skips_cycle_without_touching_ledger() {
    let pool = setup_pool().await;
    let lock = Arc::new(SqliteRunLock::new(pool.clone(), Some(Duration::from_secs(600))));
    let h = harness_with(pool.clone(), lock, Arc::new(RecordingTransport::default())).await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;
    h.ledger.record(ChangeAction::Create, &record(1)).await.unwrap();

    let other_worker = SqliteRunLock::new(h.pool.clone(), Some(Duration::from_secs(600)));
    let lease = other_worker.try_acquire().await.unwrap().unwrap();

    assert_eq!(h.dispatcher.run_cycle().await.unwrap(), CycleOutcome::Skipped);
    assert!(h.transport.requests().await.is_empty());
    assert_eq!(h.ledger.count(ChangeAction::Create).await.unwrap(), 1);

    other_worker.release(&lease).await.unwrap();
    let stats = completed(&h.dispatcher).await;
    assert_eq!(stats.succeeded, 1);
    assert!(h.dispatcher.lock().current().await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_of_crashed_worker_is_taken_over() {
    let pool = setup_pool().await;
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()));
    let lease = Some(Duration::from_secs(60));
    let crashed = SqliteRunLock::with_clock(pool.clone(), DISPATCH_LOCK, lease, clock.clone());
    crashed.try_acquire().await.unwrap().unwrap();

    let lock = Arc::new(SqliteRunLock::with_clock(
        pool.clone(),
        DISPATCH_LOCK,
        lease,
        clock.clone(),
    ));
    let h = harness_with(pool, lock, Arc::new(RecordingTransport::default())).await;
    assert_eq!(h.dispatcher.run_cycle().await.unwrap(), CycleOutcome::Skipped);

    clock.advance(Duration::from_secs(61));
    assert!(matches!(
        h.dispatcher.run_cycle().await.unwrap(),
        CycleOutcome::Completed(_)
    ));
}

/// Records a fresh change the first time it is asked to send.
struct LateWriter {
    inner: RecordingTransport,
    ledger: ChangeLedger,
    wrote: Mutex<bool>,
}

#[async_trait]
impl Transport for LateWriter {
    async fn send(&self, request: &NotificationRequest) -> Result<TransportResponse> {
        let mut wrote = self.wrote.lock().await;
        if !*wrote {
            *wrote = true;
            self.ledger.record(ChangeAction::Update, &record(77)).await?;
        }
        self.inner.send(request).await
    }
}

#[tokio::test]
async fn changes_recorded_mid_cycle_wait_for_next_cycle() {
    let pool = setup_pool().await;
    let ledger = ChangeLedger::new(pool.clone());
    let registry = Registry::new(pool.clone());
    let sub = registry
        .create(&Scope::collection("post"), "https://a.test", &["create", "update"])
        .await
        .unwrap();
    let inner = RecordingTransport::default();
    inner.answer("https://a.test", 200, &sub.signature).await;
    let transport = Arc::new(LateWriter {
        inner,
        ledger: ledger.clone(),
        wrote: Mutex::new(false),
    });
    let notifier = Notifier::new(
        transport,
        Arc::new(ConfiguredPolicy::default()),
        registry.clone(),
        "https://site.test",
        Duration::from_secs(7),
    );
    let lock = Arc::new(SqliteRunLock::new(pool, None));
    let dispatcher = Dispatcher::new(ledger.clone(), registry, lock, notifier);

    ledger.record(ChangeAction::Create, &record(1)).await.unwrap();
    let stats = completed(&dispatcher).await;
    assert_eq!(stats.cleared, 1);

    let pending = ledger.get(77).await.unwrap().unwrap();
    assert_eq!(pending.action, ChangeAction::Update);
    let stats = completed(&dispatcher).await;
    assert_eq!(stats.succeeded, 1);
    assert!(ledger.get(77).await.unwrap().is_none());
}

#[tokio::test]
async fn listener_snapshot_survives_hard_delete() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["delete"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    let directory = Arc::new(MemoryDirectory::new());
    directory.put(ContentEntry {
        content: content(21, "post"),
        permalink: Some("https://site.test/item-21".into()),
        featured_image: None,
        author: None,
    });
    let listener = MutationListener::new(
        h.ledger.clone(),
        directory.clone(),
        ["post".to_string()].into_iter().collect(),
    );

    let ctx = MutationContext::editor();
    listener
        .status_transitioned(&ctx, "publish", "draft", &content(21, "post"))
        .await;
    listener.content_deleted(&ctx, 21).await;
    directory.remove(21);

    completed(&h.dispatcher).await;
    let requests = h.transport.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body["action"], "delete");
    assert_eq!(requests[0].body["item"]["link"], "https://site.test/item-21");
    assert_eq!(h.observer.delivered().len(), 1);
}

#[tokio::test]
async fn failed_collection_delete_leaves_item_subscription_notified() {
    let h = harness().await;
    let collection = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["delete"])
        .await
        .unwrap();
    let item = h
        .registry
        .create(&Scope::item("post", 4), "https://a.test", &["delete"])
        .await
        .unwrap();
    // Only the item subscription's signature is echoed back.
    h.transport.answer("https://a.test", 200, &item.signature).await;

    h.ledger.record(ChangeAction::Delete, &record(4)).await.unwrap();
    let stats = completed(&h.dispatcher).await;

    assert_eq!(h.transport.requests_to("https://a.test").await, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(h.observer.delivered()[0].subscription_id, item.subscription.id);
    assert_eq!(h.observer.failed()[0].subscription_id, collection.subscription.id);
    assert!(h.registry.get(item.subscription.id).await.unwrap().is_none());
    assert!(h.registry.get(collection.subscription.id).await.unwrap().is_none());
}

#[tokio::test]
async fn undecodable_row_does_not_block_the_cycle() {
    let h = harness().await;
    let sub = h
        .registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    h.transport.answer("https://a.test", 200, &sub.signature).await;

    let mut tx = h.pool.begin().await.unwrap();
    let corrupt = r#"{"legacy":true}"#;
    db::upsert_pending_change_tx(&mut tx, 500, ChangeAction::Create, "post", corrupt)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    h.ledger.record(ChangeAction::Create, &record(1)).await.unwrap();

    let stats = completed(&h.dispatcher).await;
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.cleared, 2);
    assert_eq!(h.transport.requests().await[0].body["item"]["id"], 1);
    assert_eq!(h.ledger.count(ChangeAction::Create).await.unwrap(), 0);

    let stats = completed(&h.dispatcher).await;
    assert_eq!(stats.drained, 0);
}

/// Moves the shared clock on every send and lets a second worker try to
/// take the run-lock while the delivery is in flight.
struct SlowTransport {
    inner: RecordingTransport,
    clock: Arc<ManualClock>,
    step: Duration,
    rival: SqliteRunLock<Arc<ManualClock>>,
    rival_won: Mutex<bool>,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(&self, request: &NotificationRequest) -> Result<TransportResponse> {
        self.clock.advance(self.step);
        if self.rival.try_acquire().await?.is_some() {
            *self.rival_won.lock().await = true;
        }
        self.inner.send(request).await
    }
}

async fn slow_setup(step: Duration) -> (Dispatcher, Arc<SlowTransport>, ChangeLedger, String) {
    let pool = setup_pool().await;
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()));
    let lease = Some(Duration::from_secs(60));
    let ledger = ChangeLedger::new(pool.clone());
    let registry = Registry::new(pool.clone());
    let sub = registry
        .create(&Scope::collection("post"), "https://a.test", &["create"])
        .await
        .unwrap();
    let transport = Arc::new(SlowTransport {
        inner: RecordingTransport::default(),
        clock: clock.clone(),
        step,
        rival: SqliteRunLock::with_clock(pool.clone(), DISPATCH_LOCK, lease, clock.clone()),
        rival_won: Mutex::new(false),
    });
    let notifier = Notifier::new(
        transport.clone(),
        Arc::new(ConfiguredPolicy::default()),
        registry.clone(),
        "https://site.test",
        Duration::from_secs(7),
    );
    let lock = Arc::new(SqliteRunLock::with_clock(pool, DISPATCH_LOCK, lease, clock));
    let dispatcher = Dispatcher::new(ledger.clone(), registry, lock, notifier);
    (dispatcher, transport, ledger, sub.signature)
}

#[tokio::test]
async fn lease_is_renewed_between_changes() {
    let (dispatcher, transport, ledger, signature) = slow_setup(Duration::from_secs(50)).await;
    transport.inner.answer("https://a.test", 200, &signature).await;
    for id in 1..=3 {
        ledger.record(ChangeAction::Create, &record(id)).await.unwrap();
    }

    let stats = completed(&dispatcher).await;
    assert_eq!(stats.succeeded, 3);
    assert!(!*transport.rival_won.lock().await);
}

#[tokio::test]
async fn cycle_stops_when_lease_is_taken_over() {
    let (dispatcher, transport, ledger, signature) = slow_setup(Duration::from_secs(61)).await;
    transport.inner.answer("https://a.test", 200, &signature).await;
    ledger.record(ChangeAction::Create, &record(1)).await.unwrap();
    ledger.record(ChangeAction::Create, &record(2)).await.unwrap();

    let outcome = dispatcher.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::LeaseLost(stats) if stats.succeeded == 1));
    assert!(*transport.rival_won.lock().await);
    assert_eq!(transport.inner.requests().await.len(), 1);
    // The new holder owns the lock and the ledger is untouched.
    assert_eq!(ledger.count(ChangeAction::Create).await.unwrap(), 2);
    let holder = dispatcher.lock().current().await.unwrap().unwrap();
    assert_eq!(holder.token, transport.rival.current().await.unwrap().unwrap().token);
}
