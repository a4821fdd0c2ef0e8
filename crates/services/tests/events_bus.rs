//! Event bus delivery semantics: FIFO per subscriber, idempotent
//! unsubscribe, lossy marking with resync hints on overflow.

use autodev_services::services::events::EventBus;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn delivers_in_fifo_order_between_subscribe_and_unsubscribe() {
    let bus = EventBus::default();

    bus.publish("task.a", "before", json!(0));

    let mut sub = bus.subscribe(["task.a"]);
    for i in 1..=5 {
        bus.publish("task.a", "update", json!(i));
    }
    bus.unsubscribe(sub.id);
    bus.publish("task.a", "after", json!(6));

    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv()).await
    {
        seen.push(event.data);
    }
    assert_eq!(seen, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let bus = EventBus::default();
    let sub = bus.subscribe(["task.a", "task.b"]);
    bus.unsubscribe(sub.id);
    bus.unsubscribe(sub.id);
    bus.unsubscribe(uuid::Uuid::new_v4());
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = EventBus::default();
    let mut sub_a = bus.subscribe(["task.a"]);
    let mut sub_b = bus.subscribe(["task.b"]);

    bus.publish("task.a", "update", json!("a"));
    bus.publish("task.b", "update", json!("b"));

    assert_eq!(sub_a.recv().await.unwrap().data, json!("a"));
    assert_eq!(sub_b.recv().await.unwrap().data, json!("b"));
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(50), sub_a.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn overflow_marks_lossy_and_emits_resync_hint() {
    let bus = EventBus::new(4);
    let mut sub = bus.subscribe(["task.a"]);

    // fill the queue and then some; the publisher never blocks
    for i in 0..10 {
        bus.publish("task.a", "update", json!(i));
    }
    assert!(sub.is_lossy());

    // drain what made it through
    let mut drained = 0;
    while let Ok(Some(_)) =
        tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
    {
        drained += 1;
        if drained == 4 {
            break;
        }
    }
    assert_eq!(drained, 4);

    // next publish finds room: resync hint first, then the event
    bus.publish("task.a", "update", json!("fresh"));
    let first = sub.recv().await.unwrap();
    assert_eq!(first.event_type, "resync_hint");
    let second = sub.recv().await.unwrap();
    assert_eq!(second.data, json!("fresh"));
    assert!(!sub.is_lossy());
}

#[tokio::test]
async fn one_subscription_can_span_topics_incrementally() {
    let bus = EventBus::default();
    let mut sub = bus.subscribe(["task.a"]);
    bus.add_topic(&sub, "task.b");

    bus.publish("task.a", "update", json!(1));
    bus.publish("task.b", "update", json!(2));

    assert_eq!(sub.recv().await.unwrap().data, json!(1));
    assert_eq!(sub.recv().await.unwrap().data, json!(2));
}
