//! Back-end for Unix targets without `epoll`: `poll(2)` for `READ`/`WRITE`,
//! the same shared software filters as the Linux back-end for `TIMER`/
//! `USER`/`SIGNAL`. `VNODE`, `PROC`, and `AIO` are not implemented — see
//! SPEC_FULL.md §4.5.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;

use crate::backend::software::{duration_to_millis, SignalFilter, TimerFilter, UserFilter};
use crate::backend::{Activation, Backend};
use crate::error::Error;
use crate::event::{flags, FilterKind, KEvent};
use crate::filter::{FilterOps, FilterTable};
use crate::knote::Knote;

fn fionread(fd: RawFd) -> io::Result<i64> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let n = rustix::io::ioctl_fionread(borrowed)?;
    Ok(n as i64)
}

pub(crate) fn new() -> io::Result<(Arc<dyn Backend>, FilterTable)> {
    let (notify_reader, notify_writer) = UnixStream::pair()?;
    notify_reader.set_nonblocking(true)?;
    notify_writer.set_nonblocking(true)?;
    let writer = Arc::new(Mutex::new(notify_writer));

    let timer = Arc::new(TimerFilter::new(writer.clone()));
    let user = Arc::new(UserFilter::new());
    let signal = Arc::new(SignalFilter::new(writer.clone())?);
    let read = Arc::new(PollFilter { kind: FilterKind::Read, registered: Mutex::new(HashMap::new()) });
    let write = Arc::new(PollFilter { kind: FilterKind::Write, registered: Mutex::new(HashMap::new()) });

    let mut filters = FilterTable::all_not_implemented();
    filters.install(read.clone());
    filters.install(write.clone());
    filters.install(timer.clone());
    filters.install(user.clone());
    filters.install(signal.clone());

    let backend = Arc::new(PollBackend {
        notify_reader: Mutex::new(notify_reader),
        notify_writer: writer,
        read,
        write,
        timer,
        user,
        signal,
    });

    Ok((backend, filters))
}

/// Tracks which idents the engine currently wants polled for `READ` or
/// `WRITE`, independent of whatever `epoll`-style readiness table a richer
/// back-end would use.
struct PollFilter {
    kind: FilterKind,
    registered: Mutex<HashMap<u64, bool>>,
}

/// Per-knote `CLEAR` bookkeeping, same shape as the `epoll` back-end's.
struct ReadWriteState {
    last_reported: i64,
}

impl FilterOps for PollFilter {
    fn kind(&self) -> FilterKind {
        self.kind
    }

    fn create(&self, kn: &mut Knote, initially_enabled: bool) -> Result<(), Error> {
        kn.state = Box::new(ReadWriteState { last_reported: 0 });
        self.registered
            .lock()
            .expect("poll registry lock poisoned")
            .insert(kn.kev.ident, initially_enabled);
        Ok(())
    }

    fn modify(&self, _kn: &mut Knote, _change: &KEvent) -> Result<(), Error> {
        Ok(())
    }

    fn enable(&self, kn: &mut Knote) -> Result<(), Error> {
        self.registered
            .lock()
            .expect("poll registry lock poisoned")
            .insert(kn.kev.ident, true);
        Ok(())
    }

    fn disable(&self, kn: &mut Knote) -> Result<(), Error> {
        self.registered
            .lock()
            .expect("poll registry lock poisoned")
            .insert(kn.kev.ident, false);
        Ok(())
    }

    fn delete(&self, kn: &mut Knote) {
        self.registered.lock().expect("poll registry lock poisoned").remove(&kn.kev.ident);
    }

    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error> {
        let avail = fionread(kn.kev.ident as RawFd).unwrap_or(0);
        if kn.kev.flags & flags::CLEAR != 0 {
            let last = kn.state.downcast_ref::<ReadWriteState>().map_or(0, |s| s.last_reported);
            if let Some(state) = kn.state.downcast_mut::<ReadWriteState>() {
                state.last_reported = avail;
            }
            if avail <= last {
                return Ok(false);
            }
        }
        out.data = avail;
        Ok(true)
    }
}

struct PollBackend {
    notify_reader: Mutex<UnixStream>,
    notify_writer: Arc<Mutex<UnixStream>>,
    read: Arc<PollFilter>,
    write: Arc<PollFilter>,
    timer: Arc<TimerFilter>,
    user: Arc<UserFilter>,
    signal: Arc<SignalFilter>,
}

impl Backend for PollBackend {
    fn wait(&self, _max: usize, timeout: Option<Duration>) -> io::Result<Vec<Activation>> {
        let reads: Vec<u64> = self
            .read
            .registered
            .lock()
            .expect("poll registry lock poisoned")
            .iter()
            .filter(|(_, &enabled)| enabled)
            .map(|(&ident, _)| ident)
            .collect();
        let writes: Vec<u64> = self
            .write
            .registered
            .lock()
            .expect("poll registry lock poisoned")
            .iter()
            .filter(|(_, &enabled)| enabled)
            .map(|(&ident, _)| ident)
            .collect();

        let notify_fd = self.notify_reader.lock().expect("notify lock poisoned").as_raw_fd();
        let mut fds = Vec::with_capacity(reads.len() + writes.len() + 1);
        fds.push(PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(notify_fd) },
            PollFlags::IN,
        ));
        for &ident in &reads {
            fds.push(PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(ident as RawFd) },
                PollFlags::IN,
            ));
        }
        for &ident in &writes {
            fds.push(PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(ident as RawFd) },
                PollFlags::OUT,
            ));
        }

        let timeout_ms = duration_to_millis(timeout);
        match poll(&mut fds, timeout_ms) {
            Ok(_) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut out = Vec::new();
        if fds[0].revents().contains(PollFlags::IN) {
            let mut buf = [0u8; 64];
            while self
                .notify_reader
                .lock()
                .expect("notify lock poisoned")
                .read(&mut buf)
                .is_ok()
            {}

            for ident in self.timer.drain_ready() {
                out.push(Activation { filter: FilterKind::Timer, ident });
            }
            for ident in self.user.drain_ready() {
                out.push(Activation { filter: FilterKind::User, ident });
            }
            for ident in self.signal.drain_ready() {
                out.push(Activation { filter: FilterKind::Signal, ident });
            }
        }
        for (i, &ident) in reads.iter().enumerate() {
            if !fds[1 + i].revents().is_empty() {
                out.push(Activation { filter: FilterKind::Read, ident });
            }
        }
        let write_base = 1 + reads.len();
        for (i, &ident) in writes.iter().enumerate() {
            if !fds[write_base + i].revents().is_empty() {
                out.push(Activation { filter: FilterKind::Write, ident });
            }
        }

        Ok(out)
    }

    fn interrupt(&self) -> io::Result<()> {
        let _ = self.notify_writer.lock().expect("notify lock poisoned").write(&[1]);
        Ok(())
    }
}
