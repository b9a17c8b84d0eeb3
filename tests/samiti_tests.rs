use chitragupta::chitragupta::clock::{Clock, ManualClock};
use chitragupta::chitragupta::samiti::{ListenOptions, MessageDraft, Samiti, Severity};
use std::sync::Arc;

fn hub() -> (Samiti, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    (Samiti::new(clock.clone() as Arc<dyn Clock>), clock)
}

fn info(content: &str) -> MessageDraft {
    MessageDraft::new("agent-1", Severity::Info, "test", content)
}

#[test]
fn test_ring_overflow_keeps_last_k() {
    let (hub, _) = hub();
    hub.create_channel("#tiny", "", Some(3)).unwrap();
    for content in &["A", "B", "C", "D"] {
        hub.broadcast("#tiny", info(content)).unwrap();
    }
    let history: Vec<String> = hub
        .get_history("#tiny", None)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, vec!["B", "C", "D"]);
}

#[test]
fn test_ttl_pruning_counts_exactly() {
    let (hub, clock) = hub();
    hub.create_channel("#ttl", "", None).unwrap();
    hub.broadcast("#ttl", info("short").with_ttl_ms(500)).unwrap();
    hub.broadcast("#ttl", info("long").with_ttl_ms(5_000)).unwrap();
    hub.broadcast("#ttl", info("forever").with_ttl_ms(0)).unwrap();

    clock.advance(600);
    assert_eq!(hub.prune_expired().unwrap(), 1);

    let contents: Vec<String> = hub
        .get_history("#ttl", None)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["long", "forever"]);

    // A second prune finds nothing new.
    assert_eq!(hub.prune_expired().unwrap(), 0);
}

#[test]
fn test_lazy_pruning_on_listen() {
    let (hub, clock) = hub();
    hub.broadcast("#alerts", info("stale").with_ttl_ms(100)).unwrap();
    clock.advance(200);
    let listened = hub.listen("#alerts", ListenOptions::default()).unwrap();
    assert!(listened.is_empty());
    assert!(hub.get_history("#alerts", None).unwrap().is_empty());
}

#[test]
fn test_history_timestamps_non_decreasing() {
    let (hub, clock) = hub();
    for i in 0..10 {
        hub.broadcast("#alerts", info(&format!("m{}", i))).unwrap();
        clock.advance(7);
    }
    let history = hub.get_history("#alerts", None).unwrap();
    for pair in history.windows(2) {
        assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
    }
}

#[test]
fn test_message_ids_are_deterministic_fnv() {
    let (hub, _) = hub();
    let message = hub.broadcast("#alerts", info("hello")).unwrap();
    assert!(message.id.starts_with("sam-"));
    assert_eq!(message.id.len(), 12);
    assert_eq!(message.ttl_ms, 24 * 60 * 60 * 1000);
}

#[test]
fn test_listen_since_and_limit() {
    let (hub, clock) = hub();
    for i in 0..5 {
        hub.broadcast("#alerts", info(&format!("m{}", i))).unwrap();
        clock.advance(100);
    }
    // since excludes the first two (timestamps 1000 and 1100).
    let recent = hub
        .listen(
            "#alerts",
            ListenOptions {
                since_ms: Some(1_200),
                ..ListenOptions::default()
            },
        )
        .unwrap();
    assert_eq!(recent.len(), 3);
    // Most recent first.
    assert_eq!(recent[0].content, "m4");

    let limited = hub
        .listen(
            "#alerts",
            ListenOptions {
                limit: Some(2),
                ..ListenOptions::default()
            },
        )
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn test_channel_cap() {
    let (hub, _) = hub();
    // Five defaults exist; fill to the cap of 100.
    for i in 0..95 {
        hub.create_channel(&format!("#chan-{}", i), "", None).unwrap();
    }
    assert!(hub.create_channel("#one-more", "", None).is_err());
}

#[test]
fn test_subscriptions_listing() {
    let (hub, _) = hub();
    hub.subscribe("#alerts", "agent-7").unwrap();
    hub.subscribe("#style", "agent-7").unwrap();
    assert_eq!(
        hub.subscriptions_of("agent-7").unwrap(),
        vec!["#alerts".to_string(), "#style".to_string()]
    );
    assert!(hub.unsubscribe("#style", "agent-7").unwrap());
    assert_eq!(
        hub.subscriptions_of("agent-7").unwrap(),
        vec!["#alerts".to_string()]
    );
}
