//! Live stack reconstruction from records written by a fake target

mod common;

use calltrail::analysis::CallGraph;
use calltrail::domain::MethodId;
use calltrail::profiling::{StackWatcher, WatchEvent, WatchFilter};
use common::{wait_until, FakeTarget};
use std::time::Duration;

const A: u64 = 10;
const B: u64 = 11;
const C: u64 = 12;
const TIMEOUT: Duration = Duration::from_secs(5);

fn fake_with_names() -> FakeTarget {
    let fake = FakeTarget::start();
    fake.name(A, "App.Flow.A");
    fake.name(B, "App.Flow.B");
    fake.name(C, "App.Flow.C");
    fake
}

#[test]
fn test_nested_calls_unwind_in_order() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();

    fake.enter(A);
    fake.enter(B);
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 2));
    assert_eq!(watcher.stack_depth(), 2);
    assert_eq!(watcher.pending_len(), 0);

    fake.enter(C);
    fake.leave();
    fake.leave();
    fake.leave();
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 6));
    assert_eq!(watcher.stack_depth(), 0);

    let graph = CallGraph::new();
    assert_eq!(watcher.batch_update(&graph), 3);
    assert_eq!(graph.len(), 3);
    assert!(graph.link(MethodId(A), MethodId(B)).is_some());
    assert!(graph.link(MethodId(B), MethodId(C)).is_some());
    assert!(graph.link(MethodId(A), MethodId(C)).is_none());

    // C entered at 30, left at 40; A entered at 10, left at 60
    assert_eq!(graph.node(MethodId(C)).unwrap().elapsed(), 10);
    assert_eq!(graph.node(MethodId(A)).unwrap().elapsed(), 50);
}

#[test]
fn test_recursion_through_other_method() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();

    for id in [A, B, C, B] {
        fake.enter(id);
    }
    for _ in 0..4 {
        fake.leave();
    }
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 8));

    let graph = CallGraph::new();
    assert_eq!(watcher.batch_update(&graph), 4);
    assert!(graph.link(MethodId(A), MethodId(B)).is_some());
    assert!(graph.link(MethodId(B), MethodId(C)).is_some());
    assert!(graph.link(MethodId(C), MethodId(B)).is_some());
    assert!(graph.link(MethodId(B), MethodId(B)).is_none());
    assert_eq!(graph.link_count(), 3);
    assert_eq!(graph.node(MethodId(B)).unwrap().calls(), 2);
}

#[test]
fn test_unmatched_leave_is_ignored() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();

    fake.leave();
    fake.enter(A);
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 2));
    assert_eq!(watcher.stack_depth(), 1);
    assert_eq!(watcher.pending_len(), 0);
}

#[test]
fn test_watch_events() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();
    let events = watcher.watch_events();
    watcher.set_watching(Some(WatchFilter::Named("B".to_string())));

    fake.enter(A);
    fake.enter(B);
    fake.enter(C);
    fake.leave();
    fake.leave();
    fake.leave();
    session.get_counts().unwrap();

    let WatchEvent::ShowStack(frames) = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected the watched stack first");
    };
    let names: Vec<&str> = frames.iter().map(|f| f.method.name()).collect();
    assert_eq!(names, vec!["B", "A"]);

    let WatchEvent::Enter { caller, callee } = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected enter");
    };
    assert_eq!(caller.unwrap().method.id(), MethodId(B));
    assert_eq!(callee.method.id(), MethodId(C));

    let WatchEvent::Exit { exiting, back_to } = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected exit");
    };
    let exiting = exiting.unwrap();
    assert_eq!(exiting.method.id(), MethodId(C));
    assert_eq!(exiting.elapsed, 10);
    assert_eq!(back_to.unwrap().method.id(), MethodId(B));

    // Leaving B ends the watch; leaving A is not reported.
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 6));
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

    let graph = CallGraph::new();
    graph.apply(&WatchEvent::ShowStack(frames));
    assert!(graph.link(MethodId(A), MethodId(B)).is_some());
}

#[test]
fn test_records_are_recycled() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();
    let graph = CallGraph::new();

    for id in [A, B, C] {
        fake.enter(id);
    }
    for _ in 0..3 {
        fake.leave();
    }
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 6));
    assert_eq!(watcher.batch_update(&graph), 3);
    assert_eq!(watcher.allocations(), 3);
    assert_eq!(watcher.free_len(), 3);

    for id in [A, B, C] {
        fake.enter(id);
    }
    for _ in 0..3 {
        fake.leave();
    }
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 12));
    assert_eq!(watcher.batch_update(&graph), 3);
    assert_eq!(watcher.allocations(), 3);
    assert_eq!(graph.node(MethodId(A)).unwrap().calls(), 2);
}

#[test]
fn test_rewind_replays_from_start() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let watcher = StackWatcher::start(&session).unwrap();
    let graph = CallGraph::new();

    fake.enter(A);
    fake.leave();
    session.get_counts().unwrap();
    assert!(wait_until(TIMEOUT, || watcher.calls_read() == 2));
    assert_eq!(watcher.batch_update(&graph), 1);

    watcher.rewind();
    assert!(wait_until(TIMEOUT, || {
        watcher.batch_update(&graph);
        graph.node(MethodId(A)).unwrap().calls() == 2
    }));
    assert_eq!(watcher.calls_read(), 2);
}

#[test]
fn test_detach_stops_watcher() {
    let fake = fake_with_names();
    let session = fake.attached_session();
    let mut watcher = StackWatcher::start(&session).unwrap();
    assert!(watcher.is_running());

    session.detach().unwrap();
    assert!(wait_until(TIMEOUT, || !watcher.is_running()));
    watcher.stop();
    watcher.stop();
}
