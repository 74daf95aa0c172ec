// SPDX-License-Identifier: MIT

//! Event log: capped retention, ordering, and the live tail feed.

mod common;

use futures_util::StreamExt;
use tracklog::config::Config;
use tracklog::events::CancelToken;

use common::{test_engine, test_engine_with};

#[tokio::test]
async fn test_capped_log_wraps_around() {
    let mut config = Config::test_default();
    config.event_log_capacity = 3;
    let engine = test_engine_with(config);

    for i in 0..5 {
        engine
            .events
            .log(format!("event {i}"), serde_json::Value::Null)
            .await
            .unwrap();
    }

    let events = engine.events.read(0).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].msg, "event 4");
    assert_eq!(events[2].msg, "event 2");
}

#[tokio::test]
async fn test_read_limit() {
    let engine = test_engine();
    for i in 0..4 {
        engine
            .events
            .log(format!("event {i}"), serde_json::Value::Null)
            .await
            .unwrap();
    }

    let events = engine.events.read(2).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].msg, "event 3");
}

#[tokio::test]
async fn test_point_read_by_timestamp() {
    let engine = test_engine();
    let written = engine
        .events
        .log("lookup me", serde_json::json!({"k": 1}))
        .await
        .unwrap();

    let found = engine.events.get(written.ts).await.unwrap().unwrap();
    assert_eq!(found, written);
}

#[tokio::test]
async fn test_tail_resumes_from_timestamp() {
    let engine = test_engine();
    let first = engine
        .events
        .log("first", serde_json::Value::Null)
        .await
        .unwrap();
    engine
        .events
        .log("second", serde_json::Value::Null)
        .await
        .unwrap();

    let cancel = CancelToken::new();
    let mut tail = engine.events.tail(Some(first.ts), cancel.clone());

    assert_eq!(tail.next().await.unwrap(), "retry: 5000\n\n");
    let frame = tail.next().await.unwrap();
    assert!(frame.starts_with("id: "));
    assert!(frame.contains("second"));

    engine
        .events
        .log("third", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(tail.next().await.unwrap().contains("third"));

    cancel.cancel();
    assert!(tail.next().await.is_none());
}

#[tokio::test]
async fn test_two_tails_see_the_same_inserts() {
    let engine = test_engine();
    let cancel = CancelToken::new();
    let mut a = engine.events.tail(None, cancel.clone());
    let mut b = engine.events.tail(None, cancel.clone());

    assert_eq!(a.next().await.unwrap(), "retry: 5000\n\n");
    assert_eq!(b.next().await.unwrap(), "retry: 5000\n\n");

    engine
        .events
        .log("broadcast", serde_json::Value::Null)
        .await
        .unwrap();

    assert!(a.next().await.unwrap().contains("broadcast"));
    assert!(b.next().await.unwrap().contains("broadcast"));
    cancel.cancel();
}
