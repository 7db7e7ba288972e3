#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{ChangeEvent, EventType, Filter, ResourceRecord, WatchConfig, WatchError, WatchTarget};
use tether_kubehub::testing::{record, ScriptedSource};
use tether_notify::{HandlerStats, Multiplexer, Subscription};
use tokio_util::sync::CancellationToken;

fn cfg() -> WatchConfig {
    WatchConfig {
        queue_capacity: 8,
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

fn labelled(name: &str, rv: u64, labels: &[(&str, &str)]) -> ResourceRecord {
    let mut r = record("default", name, rv, 1);
    for (k, v) in labels {
        r.labels.insert(k.to_string(), v.to_string());
    }
    r
}

async fn next(sub: &mut Subscription) -> Option<ChangeEvent> {
    tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.expect("timed out waiting for event")
}

async fn expect(sub: &mut Subscription, t: EventType, name: &str) -> ChangeEvent {
    let ev = next(sub).await.expect("stream closed early");
    assert_eq!((ev.event_type, ev.object.name.as_str()), (t, name), "unexpected event {ev:?}");
    ev
}

async fn quiet(sub: &mut Subscription) {
    if let Ok(ev) = tokio::time::timeout(Duration::from_millis(150), sub.recv()).await {
        panic!("expected no event, got {ev:?}");
    }
}

async fn eventually(mux: &Multiplexer, want: Option<HandlerStats>) {
    for _ in 0..200 {
        if mux.stats(&target()) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stats never reached {want:?}; last {:?}", mux.stats(&target()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_reconnect_delivers_each_change_once() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut sub = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "a", 1, 1));
    s1.bookmark(2);
    expect(&mut sub, EventType::Added, "a").await;
    s1.close();

    s2.modified(&record("default", "a", 3, 2));
    s2.added(&record("default", "b", 4, 1));
    s2.bookmark(5);
    expect(&mut sub, EventType::Modified, "a").await;
    expect(&mut sub, EventType::Added, "b").await;
    quiet(&mut sub).await;
    eventually(&mux, Some(HandlerStats { generations: 1, subscribers: 1, resources: 2 })).await;
    assert_eq!(source.requests()[1].resource_version.as_deref(), Some("2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_resync_suppresses_replays_and_reports_vanished_resources() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut sub = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "edited", 1, 2));
    s1.added(&record("default", "plain", 2, 1));
    s1.added(&record("default", "doomed", 3, 1));
    expect(&mut sub, EventType::Added, "edited").await;
    expect(&mut sub, EventType::Added, "plain").await;
    expect(&mut sub, EventType::Added, "doomed").await;
    s1.error("too old resource version: 3 (4)");

    // Replay of current state: same versions for survivors, "doomed" missing.
    s2.added(&record("default", "edited", 1, 2));
    s2.added(&record("default", "plain", 2, 1));
    s2.added(&record("default", "new", 6, 1));
    s2.bookmark(7);
    expect(&mut sub, EventType::Added, "new").await;
    let gone = expect(&mut sub, EventType::Deleted, "doomed").await;
    assert_eq!(gone.resource_version, "7");
    quiet(&mut sub).await;
    assert_eq!(source.requests()[1].resource_version, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edited_object_replayed_at_new_version_arrives_as_modified() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut sub = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "cm", 1, 2));
    expect(&mut sub, EventType::Added, "cm").await;
    s1.error("gone");
    s2.added(&record("default", "cm", 9, 3));
    expect(&mut sub, EventType::Modified, "cm").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_filters_select_events() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut exact = mux.subscribe(target(), Filter::new().label("a", "1")).unwrap();
    let mut any = mux.subscribe(target(), Filter::new().label("a", "*")).unwrap();
    let mut other = mux.subscribe(target(), Filter::new().label("a", "2")).unwrap();

    s1.added(&labelled("x", 1, &[("a", "1")]));
    s1.added(&labelled("y", 2, &[("a", "2")]));
    s1.added(&labelled("z", 3, &[("b", "1")]));

    expect(&mut exact, EventType::Added, "x").await;
    expect(&mut any, EventType::Added, "x").await;
    expect(&mut any, EventType::Added, "y").await;
    expect(&mut other, EventType::Added, "y").await;
    quiet(&mut exact).await;
    quiet(&mut any).await;
    quiet(&mut other).await;
    assert_eq!(source.requests().len(), 1, "one upstream for all subscribers");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn annotation_filters_apply_locally() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut sub = mux.subscribe(target(), Filter::new().annotation("owner", "sre")).unwrap();

    let mut mine = record("default", "mine", 1, 1);
    mine.annotations.insert("owner".into(), "sre".into());
    s1.added(&record("default", "theirs", 2, 1));
    s1.added(&mine);
    expect(&mut sub, EventType::Added, "mine").await;
    quiet(&mut sub).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_subscriber_is_evicted_without_stalling_others() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let mux = Multiplexer::new(source.clone(), WatchConfig { queue_capacity: 2, ..cfg() });
    let mut slow = mux.subscribe(target(), Filter::new()).unwrap();
    let mut fast = mux.subscribe(target(), Filter::new()).unwrap();

    let reader = tokio::spawn(async move {
        let mut names = Vec::new();
        while names.len() < 6 {
            match next(&mut fast).await {
                Some(ev) => names.push(ev.object.name.clone()),
                None => break,
            }
        }
        names
    });
    for i in 0..6u64 {
        s1.added(&record("default", &format!("cm{i}"), i + 1, 1));
    }
    let names = reader.await.unwrap();
    assert_eq!(names, (0..6).map(|i| format!("cm{i}")).collect::<Vec<_>>());

    // The slow queue holds what fit before the timeout, then closes.
    let mut buffered = 0;
    while let Some(ev) = next(&mut slow).await {
        assert_eq!(ev.event_type, EventType::Added);
        buffered += 1;
    }
    assert_eq!(buffered, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bookmarks_reach_opted_in_subscribers_and_drain_ancestors() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut wants = mux.subscribe(target(), Filter::new().bookmarks(true)).unwrap();
    let mut plain = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "a", 1, 1));
    s1.bookmark(2);
    expect(&mut wants, EventType::Added, "a").await;
    let bm = next(&mut wants).await.unwrap();
    assert_eq!((bm.event_type, bm.resource_version.as_str()), (EventType::Bookmark, "2"));
    expect(&mut plain, EventType::Added, "a").await;
    quiet(&mut plain).await;

    s1.close();
    eventually(&mux, Some(HandlerStats { generations: 2, subscribers: 2, resources: 0 })).await;
    s2.bookmark(3);
    eventually(&mux, Some(HandlerStats { generations: 1, subscribers: 2, resources: 1 })).await;
    let bm = next(&mut wants).await.unwrap();
    assert_eq!(bm.event_type, EventType::Bookmark);
    quiet(&mut plain).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_subscriber_is_primed_with_current_state() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut early = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&labelled("a", 1, &[("tier", "web")]));
    s1.added(&labelled("b", 2, &[("tier", "db")]));
    s1.deleted(&labelled("b", 3, &[("tier", "db")]));
    s1.added(&labelled("c", 4, &[("tier", "web")]));
    for _ in 0..4 {
        next(&mut early).await.unwrap();
    }

    let mut late = mux.subscribe(target(), Filter::new().label("tier", "web")).unwrap();
    let mut primed = BTreeSet::new();
    for _ in 0..2 {
        let ev = next(&mut late).await.unwrap();
        assert_eq!(ev.event_type, EventType::Added);
        primed.insert(ev.object.name.clone());
    }
    assert_eq!(primed, BTreeSet::from(["a".to_string(), "c".to_string()]));
    quiet(&mut late).await;

    s1.modified(&labelled("a", 5, &[("tier", "web")]));
    expect(&mut late, EventType::Modified, "a").await;
    expect(&mut early, EventType::Modified, "a").await;
}

async fn reconnecting(mux: &Multiplexer) {
    for _ in 0..200 {
        if mux.stats(&target()).is_some_and(|s| s.generations == 2) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("second session never opened; last {:?}", mux.stats(&target()));
}

async fn primed_names(sub: &mut Subscription, n: usize) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for _ in 0..n {
        let ev = next(sub).await.unwrap();
        assert_eq!(ev.event_type, EventType::Added);
        names.insert(ev.object.name.clone());
    }
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_joining_during_full_resync_sees_each_change_once() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut early = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "a", 1, 1));
    s1.added(&record("default", "b", 2, 1));
    expect(&mut early, EventType::Added, "a").await;
    expect(&mut early, EventType::Added, "b").await;
    s1.error("too old resource version: 2 (3)");
    reconnecting(&mux).await;

    let mut late = mux.subscribe(target(), Filter::new()).unwrap();
    assert_eq!(primed_names(&mut late, 2).await, BTreeSet::from(["a".to_string(), "b".to_string()]));

    s2.added(&record("default", "a", 1, 1));
    s2.added(&record("default", "c", 5, 1));
    s2.bookmark(6);
    for sub in [&mut early, &mut late] {
        expect(sub, EventType::Added, "c").await;
        let gone = expect(sub, EventType::Deleted, "b").await;
        assert_eq!(gone.resource_version, "6");
        quiet(sub).await;
    }
    eventually(&mux, Some(HandlerStats { generations: 1, subscribers: 2, resources: 2 })).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_joining_during_resume_sees_each_change_once() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut early = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "a", 1, 1));
    s1.bookmark(2);
    expect(&mut early, EventType::Added, "a").await;
    s1.close();
    reconnecting(&mux).await;

    s2.modified(&record("default", "a", 3, 2));
    expect(&mut early, EventType::Modified, "a").await;
    let mut late = mux.subscribe(target(), Filter::new()).unwrap();
    let primed = expect(&mut late, EventType::Added, "a").await;
    assert_eq!(primed.resource_version, "3");

    s2.modified(&record("default", "a", 3, 2));
    s2.added(&record("default", "b", 4, 1));
    s2.bookmark(5);
    for sub in [&mut early, &mut late] {
        expect(sub, EventType::Added, "b").await;
        quiet(sub).await;
    }
    eventually(&mux, Some(HandlerStats { generations: 1, subscribers: 2, resources: 2 })).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecoverable_upstream_closes_every_stream_with_an_error() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    source.fail_next("connection refused");
    source.fail_next("connection refused");
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut a = mux.subscribe(target(), Filter::new().label("app", "x")).unwrap();
    let mut b = mux.subscribe(target(), Filter::new()).unwrap();

    s1.added(&record("default", "cm", 1, 1));
    expect(&mut b, EventType::Added, "cm").await;
    s1.close();

    for sub in [&mut a, &mut b] {
        let ev = next(sub).await.unwrap();
        assert_eq!(ev.event_type, EventType::Error);
        assert!(next(sub).await.is_none());
    }
    eventually(&mux, None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_unsubscribe_stops_the_upstream() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut first = mux.subscribe(target(), Filter::new()).unwrap();
    let mut second = mux.subscribe(target(), Filter::new()).unwrap();
    s1.added(&record("default", "cm", 1, 1));
    expect(&mut first, EventType::Added, "cm").await;
    expect(&mut second, EventType::Added, "cm").await;

    let handle = first.handle();
    handle.unsubscribe();
    handle.unsubscribe();
    assert!(next(&mut first).await.is_none());
    assert_eq!(mux.stats(&target()).map(|s| s.subscribers), Some(1));

    drop(second);
    assert_eq!(mux.stats(&target()), None);
    assert!(mux.targets().is_empty());
    for _ in 0..100 {
        if s1.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream still open after the last subscriber left");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_parent_token_unsubscribes() {
    let source = Arc::new(ScriptedSource::new());
    let _s1 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let parent = CancellationToken::new();
    let mut sub = mux.subscribe_with(target(), Filter::new(), Some(&parent)).unwrap();
    assert_eq!(mux.stats(&target()).map(|s| s.subscribers), Some(1));

    parent.cancel();
    assert!(next(&mut sub).await.is_none());
    eventually(&mux, None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubscribing_after_shutdown_starts_a_fresh_upstream() {
    let source = Arc::new(ScriptedSource::new());
    let s1 = source.session();
    let s2 = source.session();
    let mux = Multiplexer::new(source.clone(), cfg());
    let mut first = mux.subscribe(target(), Filter::new()).unwrap();
    s1.added(&record("default", "old", 1, 1));
    expect(&mut first, EventType::Added, "old").await;
    drop(first);
    assert_eq!(mux.stats(&target()), None);

    let mut sub = mux.subscribe(target(), Filter::new()).unwrap();
    s2.added(&record("default", "cm", 1, 1));
    expect(&mut sub, EventType::Added, "cm").await;
}

#[tokio::test]
async fn empty_target_is_rejected() {
    let mux = Multiplexer::new(Arc::new(ScriptedSource::new()), cfg());
    let res = mux.subscribe(WatchTarget::new("", None), Filter::new());
    assert!(matches!(res, Err(WatchError::InvalidTarget(_))));
}
