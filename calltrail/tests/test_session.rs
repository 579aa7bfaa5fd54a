//! Session attach/detach and command round trips against a fake target

mod common;

use calltrail::domain::{codes, MethodId, Pid, SessionError};
use calltrail::session::{Session, SessionConfig, SessionState, StatusEvent, TargetProcess};
use calltrail_common::{STATUS_CONCURRENT_GC_NOT_PROFILABLE, STATUS_PROFILER_ALREADY_ACTIVE};
use common::{wait_until, FakeTarget};
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_attach_then_detach_twice() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();
    assert!(session.is_attached());
    assert!(fake.has_buffer());
    assert!(session.attached_info().contains("fake-target"));

    session.detach().unwrap();
    assert_eq!(session.state(), SessionState::Detached);
    assert!(!fake.has_buffer());

    let trips = session.round_trips();
    session.detach().unwrap();
    assert_eq!(session.round_trips(), trips);

    let detaches = fake.commands().iter().filter(|c| *c == "Detach").count();
    assert_eq!(detaches, 1);
}

#[test]
fn test_shared_region_removed_after_detach() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();
    let data_files = || {
        std::fs::read_dir(fake.dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("calltrail-data-"))
            .count()
    };
    assert_eq!(data_files(), 1);
    session.detach().unwrap();
    assert_eq!(data_files(), 0);
}

#[test]
fn test_second_attach_is_busy() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();
    let err = session.attach(Some(fake.target())).unwrap_err();
    assert!(matches!(err, SessionError::Busy(_)));
    assert_eq!(err.code(), codes::BUSY);
    assert!(session.is_attached());
}

#[test]
fn test_reattach_after_detach() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();
    session.detach().unwrap();
    session.attach(Some(fake.target())).unwrap();
    assert!(session.is_attached());
    session.detach().unwrap();
}

#[test]
fn test_concurrent_gc_refusal() {
    let fake = FakeTarget::with_refusal(Some(STATUS_CONCURRENT_GC_NOT_PROFILABLE));
    let session = Session::new(fake.config());
    let err = session.attach(Some(fake.target())).unwrap_err();
    assert!(matches!(err, SessionError::ConcurrentGcNotSupported));
    assert_eq!(err.code(), STATUS_CONCURRENT_GC_NOT_PROFILABLE);
    assert_eq!(session.state(), SessionState::Detached);
    assert!(session.can_attach());
}

#[test]
fn test_other_refusal_fails_announcement() {
    let fake = FakeTarget::with_refusal(Some(STATUS_PROFILER_ALREADY_ACTIVE));
    let session = Session::new(fake.config());
    let err = session.attach(Some(fake.target())).unwrap_err();
    assert!(matches!(err, SessionError::ChannelAnnounceFailed(_)));
    assert_eq!(err.code(), codes::FILE_NOT_FOUND);
    assert_eq!(session.state(), SessionState::Detached);
}

#[test]
fn test_resolve_method_name_costs_one_round_trip() {
    let fake = FakeTarget::start();
    fake.name(10, "App.Worker.Step");
    let session = fake.attached_session();

    let before = session.round_trips();
    let first = session.resolve_method_name(MethodId(10)).unwrap();
    let second = session.resolve_method_name(MethodId(10)).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.name(), "Step");
    assert_eq!(first.type_name(), Some("Worker"));
    assert_eq!(session.round_trips(), before + 1);
    assert_eq!(fake.name_requests(), 1);
}

#[test]
fn test_unknown_method_name() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();
    assert!(session.resolve_method_name(MethodId(99)).is_none());
    assert!(session.cached_method(MethodId(99)).is_none());
}

#[test]
fn test_concurrent_lookups_share_one_round_trip() {
    let fake = FakeTarget::start();
    fake.name(10, "App.Worker.Step");
    fake.delay_names(Duration::from_millis(100));
    let session = fake.attached_session();

    let barrier = Barrier::new(8);
    let identities: Vec<_> = thread::scope(|s| {
        let lookups: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    session.resolve_method_name(MethodId(10)).unwrap()
                })
            })
            .collect();
        lookups.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(fake.name_requests(), 1);
    assert!(identities.iter().all(|identity| Arc::ptr_eq(identity, &identities[0])));
}

#[test]
fn test_late_reply_drops_connection() {
    let fake = FakeTarget::start();
    fake.name(10, "App.Slow.Name");
    fake.delay_names(Duration::from_millis(200));
    let config = SessionConfig { reply_timeout: Some(Duration::from_millis(50)), ..fake.config() };
    let session = Session::new(config);
    let rx = session.subscribe();
    session.attach(Some(fake.target())).unwrap();

    assert!(session.resolve_method_name(MethodId(10)).is_none());
    assert!(session.cached_method(MethodId(10)).is_none());
    assert!(!session.is_attached());
    assert!(matches!(session.get_counts(), Err(SessionError::NotAttached)));
    assert!(rx.try_iter().any(|e| e == StatusEvent::Attached(false)));

    // Once the stale reply has gone nowhere, a new connection pairs up again.
    thread::sleep(Duration::from_millis(300));
    fake.delay_names(Duration::ZERO);
    session.attach(Some(fake.target())).unwrap();
    assert_eq!(session.resolve_method_name(MethodId(10)).unwrap().name(), "Name");
    assert!(session.get_counts().is_ok());
    session.detach().unwrap();
}

#[test]
fn test_target_exit_detaches() {
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid(i32::try_from(child.id()).unwrap());
    let fake = FakeTarget::for_target(TargetProcess::from_parts(pid, "sleep", true));
    let session = fake.attached_session();
    assert!(session.is_attached());

    child.kill().unwrap();
    child.wait().unwrap();

    assert!(wait_until(Duration::from_secs(3), || !session.is_attached()));
    assert!(matches!(session.get_counts(), Err(SessionError::NotAttached)));
    assert!(session.status().contains("Process has exited."));
    assert!(session.detach().is_ok());
}

#[test]
fn test_get_counts_and_read() {
    let fake = FakeTarget::start();
    fake.name(10, "App.Main.Run");
    let session = fake.attached_session();

    fake.enter(10);
    fake.leave();
    let counts = session.get_counts().unwrap();
    assert_eq!((counts.functions, counts.calls, counts.generation), (1, 2, 0));

    assert_eq!(session.read_method().unwrap(), (10, 10));
    assert_eq!(session.read_method().unwrap(), (1, 20));
    assert_eq!(session.read_method().unwrap(), (0, 0));
}

#[test]
fn test_generation_change_wraps_cursor() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();

    fake.enter(10);
    session.get_counts().unwrap();
    assert_eq!(session.read_method().unwrap().0, 10);

    fake.wrap();
    fake.enter(11);
    let counts = session.get_counts().unwrap();
    assert_eq!(counts.generation, 1);
    assert_eq!(session.read_method().unwrap(), (0, 0));

    session.get_counts().unwrap();
    assert_eq!(session.read_method().unwrap().0, 11);
}

#[test]
fn test_clear_rewinds() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();

    fake.enter(10);
    session.get_counts().unwrap();
    session.clear().unwrap();
    assert!(fake.commands().iter().any(|c| c == "X:"));
    assert_eq!(session.read_method().unwrap(), (0, 0));

    fake.enter(12);
    session.get_counts().unwrap();
    assert_eq!(session.read_method().unwrap().0, 12);
}

#[test]
fn test_rewind_replays_records() {
    let fake = FakeTarget::start();
    let session = fake.attached_session();

    fake.enter(10);
    session.get_counts().unwrap();
    assert_eq!(session.read_method().unwrap().0, 10);
    session.rewind();
    assert_eq!(session.read_method().unwrap().0, 10);
}

#[test]
fn test_status_events() {
    let fake = FakeTarget::start();
    let session = Session::new(fake.config());
    let rx = session.subscribe();

    session.attach(Some(fake.target())).unwrap();
    session.detach().unwrap();

    let events: Vec<StatusEvent> = rx.try_iter().collect();
    let attached: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Attached(a) => Some(*a),
            _ => None,
        })
        .collect();
    assert_eq!(attached, vec![true, false]);
    assert!(events.contains(&StatusEvent::WaitingForProfiler(true)));
    assert!(events.contains(&StatusEvent::WaitingForProfiler(false)));
    assert!(session.status().contains("Finished Detach"));
    assert!(!session.is_waiting_for_profiler());
}
