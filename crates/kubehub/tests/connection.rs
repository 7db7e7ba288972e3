#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tether_core::{EventType, Filter, WatchConfig, WatchError, WatchTarget};
use tether_kubehub::testing::{record, ScriptedSource};
use tether_kubehub::{watch, WatchItem};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn cfg() -> WatchConfig {
    WatchConfig {
        queue_capacity: 16,
        delivery_timeout: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        connect_attempts: 2,
        server_timeout_secs: 60,
    }
}

fn target() -> WatchTarget {
    WatchTarget::new("v1/ConfigMap", Some("default"))
}

async fn next(rx: &mut mpsc::Receiver<WatchItem>) -> Option<WatchItem> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("timed out waiting for item")
}

fn event_type(item: Option<WatchItem>) -> EventType {
    match item {
        Some(WatchItem::Event(ev)) => ev.event_type,
        other => panic!("expected event, got {other:?}"),
    }
}

fn opened(item: Option<WatchItem>) -> bool {
    match item {
        Some(WatchItem::Opened { resumed }) => resumed,
        other => panic!("expected session start, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closure_resumes_from_last_bookmark() {
    let source = Arc::new(ScriptedSource::new());
    let first = source.session();
    let _second = source.session();
    let mut rx = watch(source.clone(), target(), &Filter::new().label("app", "web"), cfg(), CancellationToken::new()).unwrap();

    assert!(!opened(next(&mut rx).await));
    first.added(&record("default", "a", 3, 1));
    first.bookmark(5);
    assert_eq!(event_type(next(&mut rx).await), EventType::Added);
    assert_eq!(event_type(next(&mut rx).await), EventType::Bookmark);
    first.close();
    assert!(opened(next(&mut rx).await), "second session must resume");

    let reqs = source.requests();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].resource_version, None);
    assert_eq!(reqs[1].resource_version.as_deref(), Some("5"));
    assert!(reqs.iter().all(|r| r.allow_bookmarks));
    assert_eq!(reqs[0].label_selector.as_deref(), Some("app=web"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_event_drops_bookmark_silently() {
    let source = Arc::new(ScriptedSource::new());
    let first = source.session();
    let second = source.session();
    let mut rx = watch(source.clone(), target(), &Filter::new(), cfg(), CancellationToken::new()).unwrap();

    assert!(!opened(next(&mut rx).await));
    first.added(&record("default", "a", 3, 1));
    first.error("too old resource version: 3 (410)");
    assert_eq!(event_type(next(&mut rx).await), EventType::Added);
    // ERROR is not relayed; the next item is the full-resync session.
    assert!(!opened(next(&mut rx).await));
    second.added(&record("default", "a", 8, 1));
    assert_eq!(event_type(next(&mut rx).await), EventType::Added);
    assert_eq!(source.requests()[1].resource_version, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_failure_resumes_incrementally() {
    let source = Arc::new(ScriptedSource::new());
    let first = source.session();
    let _second = source.session();
    let mut rx = watch(source.clone(), target(), &Filter::new(), cfg(), CancellationToken::new()).unwrap();

    assert!(!opened(next(&mut rx).await));
    first.modified(&record("default", "a", 11, 2));
    assert_eq!(event_type(next(&mut rx).await), EventType::Modified);
    first.fail("connection reset by peer");
    assert!(opened(next(&mut rx).await));
    assert_eq!(source.requests()[1].resource_version.as_deref(), Some("11"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecoverable_reconnect_emits_one_terminal_error() {
    let source = Arc::new(ScriptedSource::new());
    let first = source.session();
    source.fail_next("connection refused");
    source.fail_next("connection refused");
    let mut rx = watch(source.clone(), target(), &Filter::new(), cfg(), CancellationToken::new()).unwrap();

    assert!(!opened(next(&mut rx).await));
    first.close();
    match next(&mut rx).await {
        Some(WatchItem::Event(ev)) => {
            assert_eq!(ev.event_type, EventType::Error);
            assert!(ev.message.unwrap_or_default().contains("connection refused"));
        }
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert!(next(&mut rx).await.is_none(), "stream ends after the terminal error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_without_further_events() {
    let source = Arc::new(ScriptedSource::new());
    let session = source.session();
    let token = CancellationToken::new();
    let mut rx = watch(source.clone(), target(), &Filter::new(), cfg(), token.clone()).unwrap();
    assert!(!opened(next(&mut rx).await));

    token.cancel();
    assert!(next(&mut rx).await.is_none());
    session.added(&record("default", "late", 1, 1));
    for _ in 0..100 {
        if session.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream stream was not released after cancellation");
}

#[tokio::test]
async fn annotation_filters_are_rejected_at_the_wire() {
    let source = Arc::new(ScriptedSource::new());
    let filter = Filter::new().label("app", "web").annotation("owner", "sre");
    let res = watch(source.clone(), target(), &filter, cfg(), CancellationToken::new());
    assert!(matches!(res, Err(WatchError::UnsupportedFilter(_))));
    assert!(source.requests().is_empty());
}
