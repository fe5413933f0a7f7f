//! Integration tests for the change-feed subscription lifecycle.

use std::{sync::Arc, time::Duration};

use rillflow::{
    ComparisonOp, ConsistencyGuarantee, EventStore, FieldFilters, FilterSpecification, JsonCodec,
    RetryStrategy, SubscriptionEngine,
    log::{FeedOptions, inmemory::InMemoryLog},
    store::NonEmpty,
    test::{CollectingConsumer, FlakyConsumer, envelope},
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn fixture() -> (EventStore<InMemoryLog>, SubscriptionEngine<InMemoryLog>) {
    let log = InMemoryLog::new();
    let store = EventStore::new(log.clone(), JsonCodec, ConsistencyGuarantee::VersionTracked);
    let engine = SubscriptionEngine::new(
        log,
        JsonCodec,
        RetryStrategy::fixed(Duration::from_millis(20)),
    );
    (store, engine)
}

#[tokio::test]
async fn type_filter_admits_only_matching_events() {
    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let filter = FilterSpecification::fields(
        FieldFilters::new().event_type(ComparisonOp::Eq, "A"),
    );
    let mut handle = engine
        .stream("only-a", consumer.callback(), Some(filter), None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    // Three events of types A, A, B across two streams.
    store
        .append("1", None, NonEmpty::singleton(envelope("e1", "A", json!({}))))
        .await
        .unwrap();
    store
        .append("2", None, NonEmpty::singleton(envelope("e2", "A", json!({}))))
        .await
        .unwrap();
    store
        .append("1", None, NonEmpty::singleton(envelope("e3", "B", json!({}))))
        .await
        .unwrap();
    // A trailing A event proves nothing after e2 was dropped.
    store
        .append("2", None, NonEmpty::singleton(envelope("e4", "A", json!({}))))
        .await
        .unwrap();

    assert!(consumer.wait_for_count(3, WAIT).await);
    let types: Vec<String> = consumer
        .received()
        .iter()
        .map(|delivery| delivery.event.ty.clone())
        .collect();
    assert_eq!(types, vec!["A", "A", "A"]);

    engine.shutdown();
}

#[tokio::test]
async fn stream_id_filter_scopes_a_subscription_to_one_stream() {
    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let filter =
        FilterSpecification::fields(FieldFilters::new().stream_id(ComparisonOp::Eq, "watched"));
    let mut handle = engine
        .stream("one-stream", consumer.callback(), Some(filter), None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    store
        .append(
            "other",
            None,
            NonEmpty::singleton(envelope("e1", "A", json!({}))),
        )
        .await
        .unwrap();
    store
        .append(
            "watched",
            None,
            NonEmpty::singleton(envelope("e2", "A", json!({}))),
        )
        .await
        .unwrap();

    assert!(consumer.wait_for_count(1, WAIT).await);
    assert_eq!(consumer.received()[0].event.id, "e2");

    engine.shutdown();
}

#[tokio::test]
async fn raw_query_filter_behaves_like_the_fluent_form() {
    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let filter =
        FilterSpecification::query(r#"{"$match": {"fullDocument.type": {"$eq": "A"}}}"#);
    let mut handle = engine
        .stream("raw", consumer.callback(), Some(filter), None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    store
        .append("s", None, NonEmpty::singleton(envelope("e1", "B", json!({}))))
        .await
        .unwrap();
    store
        .append("s", None, NonEmpty::singleton(envelope("e2", "A", json!({}))))
        .await
        .unwrap();

    assert!(consumer.wait_for_count(1, WAIT).await);
    assert_eq!(consumer.received()[0].event.id, "e2");

    engine.shutdown();
}

#[tokio::test]
async fn events_arrive_in_feed_order_within_a_subscription() {
    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let mut handle = engine
        .stream("ordered", consumer.callback(), None, None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    let batch = NonEmpty::from_vec(vec![
        envelope("e1", "A", json!({})),
        envelope("e2", "A", json!({})),
        envelope("e3", "A", json!({})),
    ])
    .unwrap();
    store.append("s", None, batch).await.unwrap();

    assert!(consumer.wait_for_count(3, WAIT).await);
    let ids: Vec<String> = consumer
        .received()
        .iter()
        .map(|delivery| delivery.event.id.clone())
        .collect();
    assert_eq!(ids, vec!["e1", "e2", "e3"]);

    engine.shutdown();
}

#[tokio::test]
async fn failing_consumer_sees_the_same_event_again() {
    let (store, engine) = fixture();
    let consumer = FlakyConsumer::failing_first(1);

    let mut handle = engine
        .stream("flaky", consumer.callback(), None, None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    store
        .append("s", None, NonEmpty::singleton(envelope("e1", "A", json!({}))))
        .await
        .unwrap();

    // First invocation fails, the retry delivers the same event once more.
    assert!(consumer.collected().wait_for_count(1, WAIT).await);
    assert_eq!(consumer.attempts(), 2);
    assert_eq!(consumer.collected().received()[0].event.id, "e1");

    engine.shutdown();
}

#[tokio::test]
async fn cancelling_twice_and_cancelling_unknown_ids_is_harmless() {
    let (_store, engine) = fixture();

    let mut handle = engine.stream("sub", |_| Ok(()), None, None).unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    engine.cancel_subscription("sub");
    engine.cancel_subscription("sub");
    engine.cancel_subscription("was-never-there");
    assert!(!engine.is_registered("sub"));
    assert!(!engine.is_registered("was-never-there"));

    engine.shutdown();
}

#[tokio::test]
async fn cancelled_subscription_stops_receiving() {
    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let mut handle = engine
        .stream("sub", consumer.callback(), None, None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    store
        .append("s", None, NonEmpty::singleton(envelope("e1", "A", json!({}))))
        .await
        .unwrap();
    assert!(consumer.wait_for_count(1, WAIT).await);

    engine.cancel_subscription("sub");
    // Give the worker a moment to wind down, then append more.
    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .append("s", None, NonEmpty::singleton(envelope("e2", "A", json!({}))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(consumer.count(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn foreign_documents_are_skipped_without_killing_the_subscription() {
    use rillflow::log::AppendLog as _;

    let (store, engine) = fixture();
    let consumer = CollectingConsumer::new();

    let mut handle = engine
        .stream("tolerant", consumer.callback(), None, None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    // A document that is not an event envelope lands in the log.
    store
        .log()
        .insert_events(vec![json!({"rogue": true})])
        .await
        .unwrap();
    store
        .append("s", None, NonEmpty::singleton(envelope("e1", "A", json!({}))))
        .await
        .unwrap();

    assert!(consumer.wait_for_count(1, WAIT).await);
    assert_eq!(consumer.received()[0].event.id, "e1");
    assert!(engine.is_registered("tolerant"));

    engine.shutdown();
}

#[tokio::test]
async fn resume_token_continues_after_the_last_processed_event() {
    let (store, engine) = fixture();

    // First subscription processes one event, then is cancelled.
    let first = CollectingConsumer::new();
    let mut handle = engine
        .stream("resumable", first.callback(), None, None)
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    store
        .append("s", None, NonEmpty::singleton(envelope("e1", "A", json!({}))))
        .await
        .unwrap();
    assert!(first.wait_for_count(1, WAIT).await);
    let last_position = first.received()[0].position.clone();
    engine.cancel_subscription("resumable");

    // An event is appended while no subscription is live.
    store
        .append("s", None, NonEmpty::singleton(envelope("e2", "A", json!({}))))
        .await
        .unwrap();

    // A new subscription resumes strictly after the persisted token and
    // catches the missed event.
    let second = CollectingConsumer::new();
    let configure: rillflow::FeedConfigurer = Arc::new(move |options: FeedOptions| {
        options.resume_after(last_position.clone())
    });
    let mut handle = engine
        .stream("resumable", second.callback(), None, Some(configure))
        .unwrap();
    handle.wait_until_started(WAIT).await.unwrap();

    assert!(second.wait_for_count(1, WAIT).await);
    assert_eq!(second.received()[0].event.id, "e2");

    engine.shutdown();
}

#[tokio::test]
async fn shutdown_cancels_every_registered_subscription() {
    let (_store, engine) = fixture();

    let mut first = engine.stream("a", |_| Ok(()), None, None).unwrap();
    let mut second = engine.stream("b", |_| Ok(()), None, None).unwrap();
    first.wait_until_started(WAIT).await.unwrap();
    second.wait_until_started(WAIT).await.unwrap();

    engine.shutdown();

    assert!(!engine.is_registered("a"));
    assert!(!engine.is_registered("b"));
    assert!(engine.stream("c", |_| Ok(()), None, None).is_err());
}

#[tokio::test]
async fn subscriptions_run_concurrently_and_independently() {
    let (store, engine) = fixture();
    let audit = CollectingConsumer::new();
    let only_b = CollectingConsumer::new();

    let mut first = engine.stream("audit", audit.callback(), None, None).unwrap();
    let filter =
        FilterSpecification::fields(FieldFilters::new().event_type(ComparisonOp::Eq, "B"));
    let mut second = engine
        .stream("only-b", only_b.callback(), Some(filter), None)
        .unwrap();
    first.wait_until_started(WAIT).await.unwrap();
    second.wait_until_started(WAIT).await.unwrap();

    let batch = NonEmpty::from_vec(vec![
        envelope("e1", "A", json!({})),
        envelope("e2", "B", json!({})),
        envelope("e3", "A", json!({})),
    ])
    .unwrap();
    store.append("s", None, batch).await.unwrap();

    assert!(audit.wait_for_count(3, WAIT).await);
    assert!(only_b.wait_for_count(1, WAIT).await);
    assert_eq!(only_b.received()[0].event.id, "e2");

    engine.shutdown();
}
