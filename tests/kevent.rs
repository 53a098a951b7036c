//! Integration coverage for the scenarios in SPEC_FULL.md §9.

#![cfg(unix)]

use std::io::Write;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use portakq::{flags, kevent, FilterKind, KEvent, Kqueue};

fn add_change(ident: u64, filter: FilterKind, extra_flags: u16) -> KEvent {
    KEvent::new(ident, filter as i16, flags::ADD | extra_flags, 0, 0)
}

fn delete_change(ident: u64, filter: FilterKind) -> KEvent {
    KEvent::new(ident, filter as i16, flags::DELETE, 0, 0)
}

/// Builds a connected loopback TCP pair via `socket2`, closer to the kind of
/// fd this facade's `READ`/`WRITE` filters are meant to watch than a bare
/// pipe.
fn tcp_pair() -> (Socket, std::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    let client = Socket::new(Domain::IPV4, Type::STREAM, None).expect("client socket");
    client.connect(&addr.into()).expect("connect loopback");

    let (server, _) = listener.accept().expect("accept loopback connection");
    (client, server)
}

#[test]
fn add_wait_and_receive() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, mut write_end) = tcp_pair();
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, 0)];
    let mut events = [KEvent::zeroed()];
    assert_eq!(kq.kevent(&added, &mut events, None).unwrap(), 0);

    write_end.write_all(b"x").unwrap();

    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait for readability");
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, ident);
    assert_eq!(events[0].filter, FilterKind::Read as i16);
    assert!(events[0].data >= 1);
}

#[test]
fn oneshot_fires_once_then_vanishes() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, mut write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, flags::ONESHOT)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    write_end.write_all(b"x").unwrap();
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);

    // Second wait: the knote should already be gone, so nothing fires.
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(n, 0);

    // A DELETE on the same (filter, ident) now reports not-found.
    let deleted = [delete_change(ident, FilterKind::Read)];
    let mut events = [KEvent::zeroed(); 1];
    let n = kq.kevent(&deleted, &mut events, None).unwrap();
    assert_eq!(n, 1);
    assert_ne!(events[0].flags & flags::ERROR, 0);
}

#[test]
fn dispatch_disables_until_re_enabled() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, mut write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, flags::DISPATCH)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    write_end.write_all(b"x").unwrap();
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);

    // More data arrives, but the knote is disabled until re-armed.
    write_end.write_all(b"y").unwrap();
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(n, 0);

    let enable = [KEvent::new(ident, FilterKind::Read as i16, flags::ENABLE, 0, 0)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&enable, &mut events, None).unwrap();

    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn receipt_reports_success_and_failure_entries() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, _write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let changes = [
        add_change(ident, FilterKind::Read, flags::RECEIPT),
        KEvent::new(999, FilterKind::Aio as i16, flags::ADD, 0, 0),
    ];
    let mut events = [KEvent::zeroed(), KEvent::zeroed()];
    let n = kq.kevent(&changes, &mut events, None).unwrap();
    assert_eq!(n, 2);

    assert_ne!(events[0].flags & flags::ERROR, 0);
    assert_eq!(events[0].data, 0);

    assert_ne!(events[1].flags & flags::ERROR, 0);
    assert_ne!(events[1].data, 0);
}

#[test]
fn dispatch_and_oneshot_together_is_rejected() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, _write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let changes = [add_change(ident, FilterKind::Read, flags::DISPATCH | flags::ONESHOT)];
    let mut events = [KEvent::zeroed()];
    let n = kq.kevent(&changes, &mut events, None).unwrap();
    assert_eq!(n, 1);
    assert_ne!(events[0].flags & flags::ERROR, 0);

    // No knote was installed: a DELETE reports not-found.
    let deleted = [delete_change(ident, FilterKind::Read)];
    let mut events = [KEvent::zeroed()];
    let n = kq.kevent(&deleted, &mut events, None).unwrap();
    assert_eq!(n, 1);
    assert_ne!(events[0].flags & flags::ERROR, 0);
}

#[test]
fn concurrent_delete_during_a_blocked_wait() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, _write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, 0)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    let mut results = easy_parallel::Parallel::new()
        .add(|| {
            let mut events = [KEvent::zeroed()];
            kq.kevent(&[], &mut events, Some(Duration::from_millis(500)))
        })
        .add(|| {
            std::thread::sleep(Duration::from_millis(50));
            let deleted = [delete_change(ident, FilterKind::Read)];
            let mut events = [KEvent::zeroed()];
            kq.kevent(&deleted, &mut events, None)
        })
        .run()
        .into_iter();
    let wait_result = results.next().unwrap();
    let delete_result = results.next().unwrap();

    assert_eq!(wait_result.unwrap(), 0);
    assert_eq!(delete_result.unwrap(), 0);
}

#[test]
fn user_filter_trigger_delivers_fflags() {
    let kq = Kqueue::create().expect("create queue");
    let ident = fastrand::u64(1..=u64::MAX);

    let added = [KEvent::new(ident, FilterKind::User as i16, flags::ADD | flags::DISABLE, 0, 0)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    let enable = [KEvent::new(ident, FilterKind::User as i16, flags::ENABLE, 0, 0)];
    kq.kevent(&enable, &mut events, None).unwrap();

    let trigger = [KEvent::new(
        ident,
        FilterKind::User as i16,
        0,
        portakq::user::NOTE_TRIGGER | portakq::user::NOTE_FFOR | 0x1,
        0,
    )];
    kq.kevent(&trigger, &mut events, None).unwrap();

    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, ident);
    assert_eq!(events[0].fflags & 0x1, 0x1);
}

#[test]
fn signal_filter_delivers_raised_signal() {
    let kq = Kqueue::create().expect("create queue");
    let ident = libc::SIGUSR2 as u64;

    let added = [add_change(ident, FilterKind::Signal, 0)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    // Give signal-hook's background thread time to register the signal
    // before we raise it.
    std::thread::sleep(Duration::from_millis(50));
    unsafe {
        libc::raise(libc::SIGUSR2);
    }

    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, ident);
    assert!(events[0].data >= 1);
}

#[test]
fn level_triggered_read_fires_until_consumed() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, mut write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, 0)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    write_end.write_all(b"x").unwrap();

    // Without CLEAR, the same unread byte keeps the knote ready across
    // repeated waits.
    for _ in 0..2 {
        let mut events = [KEvent::zeroed()];
        let n = kq
            .kevent(&[], &mut events, Some(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(n, 1);
        assert!(events[0].data >= 1);
    }
}

#[test]
fn clear_suppresses_repeat_delivery_until_new_data() {
    let kq = Kqueue::create().expect("create queue");
    let (read_end, mut write_end) = UnixStream::pair().expect("socket pair");
    let ident = read_end.as_raw_fd() as u64;

    let added = [add_change(ident, FilterKind::Read, flags::CLEAR)];
    let mut events = [KEvent::zeroed()];
    kq.kevent(&added, &mut events, None).unwrap();

    write_end.write_all(b"x").unwrap();

    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);

    // The byte is still unread, but CLEAR means the knote goes quiet again
    // until more data arrives.
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(n, 0);

    write_end.write_all(b"y").unwrap();
    let mut events = [KEvent::zeroed()];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn close_during_blocked_wait_is_a_fatal_error() {
    let kq = Kqueue::create().expect("create queue");
    let descriptor = kq.descriptor();

    let (mut wait_results, ()) = easy_parallel::Parallel::new()
        .add(move || {
            let mut events = [KEvent::zeroed()];
            kevent(descriptor, &[], &mut events, Some(Duration::from_secs(5)))
        })
        .finish(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(kq);
        });
    let wait_result = wait_results.remove(0);

    assert!(wait_result.is_err());
}
