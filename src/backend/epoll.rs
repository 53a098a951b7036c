//! Linux back-end: `epoll` for `READ`/`WRITE`, the shared software filters
//! for `TIMER`/`USER`/`SIGNAL`, and `inotify` for `VNODE`. `PROC` and `AIO`
//! are not implemented on this back-end — see SPEC_FULL.md §4.5.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::event::epoll;
use rustix::fs::inotify;
use rustix::io::Errno;

use crate::backend::software::{duration_to_millis, SignalFilter, TimerFilter, UserFilter};
use crate::backend::{Activation, Backend};
use crate::error::Error;
use crate::event::{flags, vnode, FilterKind, KEvent};
use crate::filter::{FilterOps, FilterTable};
use crate::knote::Knote;

const TAG_SHIFT: u32 = 56;
const TAG_MASK: u64 = (1u64 << TAG_SHIFT) - 1;
const TAG_READ: u64 = 0;
const TAG_WRITE: u64 = 1;
const TAG_SOFTWARE: u64 = 2;
const TAG_VNODE: u64 = 3;

fn pack(tag: u64, ident: u64) -> u64 {
    (tag << TAG_SHIFT) | (ident & TAG_MASK)
}

fn unpack(word: u64) -> (u64, u64) {
    (word >> TAG_SHIFT, word & TAG_MASK)
}

fn to_fault(_e: impl std::fmt::Debug) -> Error {
    Error::Fault
}

fn fionread(fd: RawFd) -> io::Result<i64> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let n = rustix::io::ioctl_fionread(borrowed)?;
    Ok(n as i64)
}

pub(crate) fn new() -> io::Result<(Arc<dyn Backend>, FilterTable)> {
    let epfd = Arc::new(epoll::create(epoll::CreateFlags::CLOEXEC)?);

    let (notify_reader, notify_writer) = UnixStream::pair()?;
    notify_reader.set_nonblocking(true)?;
    notify_writer.set_nonblocking(true)?;
    unsafe {
        epoll::add(
            epfd.as_fd(),
            BorrowedFd::borrow_raw(notify_reader.as_raw_fd()),
            epoll::EventData::new_u64(pack(TAG_SOFTWARE, 0)),
            epoll::EventFlags::IN,
        )?;
    }
    let writer = Arc::new(Mutex::new(notify_writer));

    let timer = Arc::new(TimerFilter::new(writer.clone()));
    let user = Arc::new(UserFilter::new());
    let signal = Arc::new(SignalFilter::new(writer.clone())?);
    let vnode = Arc::new(VnodeFilter::new(epfd.clone())?);
    let read = Arc::new(ReadWriteFilter {
        epfd: epfd.clone(),
        kind: FilterKind::Read,
        tag: TAG_READ,
    });
    let write = Arc::new(ReadWriteFilter {
        epfd: epfd.clone(),
        kind: FilterKind::Write,
        tag: TAG_WRITE,
    });

    let mut filters = FilterTable::all_not_implemented();
    filters.install(read);
    filters.install(write);
    filters.install(timer.clone());
    filters.install(user.clone());
    filters.install(signal.clone());
    filters.install(vnode.clone());

    let backend = Arc::new(EpollBackend {
        epfd,
        notify_reader: Mutex::new(notify_reader),
        notify_writer: writer,
        timer,
        user,
        signal,
        vnode,
    });

    Ok((backend, filters))
}

struct EpollBackend {
    epfd: Arc<OwnedFd>,
    notify_reader: Mutex<UnixStream>,
    notify_writer: Arc<Mutex<UnixStream>>,
    timer: Arc<TimerFilter>,
    user: Arc<UserFilter>,
    signal: Arc<SignalFilter>,
    vnode: Arc<VnodeFilter>,
}

impl Backend for EpollBackend {
    fn wait(&self, max: usize, timeout: Option<Duration>) -> io::Result<Vec<Activation>> {
        let mut list = epoll::EventVec::with_capacity(max.max(1));
        let timeout_ms = duration_to_millis(timeout);
        match epoll::wait(self.epfd.as_fd(), &mut list, timeout_ms) {
            Ok(()) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut out = Vec::new();
        let mut software_woke = false;
        let mut vnode_woke = false;
        for event in &list {
            let (tag, ident) = unpack(event.data.u64());
            match tag {
                TAG_READ => out.push(Activation {
                    filter: FilterKind::Read,
                    ident,
                }),
                TAG_WRITE => out.push(Activation {
                    filter: FilterKind::Write,
                    ident,
                }),
                TAG_SOFTWARE => software_woke = true,
                TAG_VNODE => vnode_woke = true,
                _ => {}
            }
        }

        if software_woke {
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

        if vnode_woke {
            for ident in self.vnode.drain_ready() {
                out.push(Activation { filter: FilterKind::Vnode, ident });
            }
        }

        Ok(out)
    }

    fn interrupt(&self) -> io::Result<()> {
        let _ = self
            .notify_writer
            .lock()
            .expect("notify lock poisoned")
            .write(&[1]);
        Ok(())
    }
}

/// `READ`/`WRITE`: one direct `epoll` registration per knote.
struct ReadWriteFilter {
    epfd: Arc<OwnedFd>,
    kind: FilterKind,
    tag: u64,
}

/// Per-knote `CLEAR` bookkeeping: the byte count last reported, so a
/// `CLEAR`-registered knote goes quiet again until more data arrives
/// instead of re-firing on the same still-pending bytes.
struct ReadWriteState {
    last_reported: i64,
}

impl ReadWriteFilter {
    fn interest(&self) -> epoll::EventFlags {
        match self.kind {
            FilterKind::Read => epoll::EventFlags::IN,
            _ => epoll::EventFlags::OUT,
        }
    }

    fn borrow(ident: u64) -> BorrowedFd<'static> {
        unsafe { BorrowedFd::borrow_raw(ident as RawFd) }
    }
}

impl FilterOps for ReadWriteFilter {
    fn kind(&self) -> FilterKind {
        self.kind
    }

    fn create(&self, kn: &mut Knote, initially_enabled: bool) -> Result<(), Error> {
        kn.state = Box::new(ReadWriteState { last_reported: 0 });
        if initially_enabled {
            let data = epoll::EventData::new_u64(pack(self.tag, kn.kev.ident));
            unsafe {
                epoll::add(
                    self.epfd.as_fd(),
                    Self::borrow(kn.kev.ident),
                    data,
                    self.interest(),
                )
                .map_err(to_fault)?;
            }
        }
        Ok(())
    }

    fn modify(&self, _kn: &mut Knote, _change: &KEvent) -> Result<(), Error> {
        Ok(())
    }

    fn enable(&self, kn: &mut Knote) -> Result<(), Error> {
        let data = epoll::EventData::new_u64(pack(self.tag, kn.kev.ident));
        unsafe {
            match epoll::add(self.epfd.as_fd(), Self::borrow(kn.kev.ident), data, self.interest())
            {
                Ok(()) | Err(Errno::EXIST) => Ok(()),
                Err(e) => Err(to_fault(e)),
            }
        }
    }

    fn disable(&self, kn: &mut Knote) -> Result<(), Error> {
        match epoll::delete(self.epfd.as_fd(), Self::borrow(kn.kev.ident)) {
            Ok(()) | Err(Errno::NOENT) => Ok(()),
            Err(e) => Err(to_fault(e)),
        }
    }

    fn delete(&self, kn: &mut Knote) {
        let _ = self.disable(kn);
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

/// `VNODE`: one shared `inotify` instance, watching `/proc/self/fd/<ident>`
/// so an already-open fd (the BSD `kqueue` ABI's vnode identity) can be
/// mapped onto a path-based `inotify` watch.
struct VnodeFilter {
    inotify_fd: Arc<OwnedFd>,
    wd_to_ident: Mutex<HashMap<i32, u64>>,
    ready: Arc<Mutex<HashMap<u64, u32>>>,
}

struct VnodeState {
    wd: i32,
}

fn inotify_flags_for(fflags: u32) -> inotify::WatchFlags {
    let mut f = inotify::WatchFlags::empty();
    if fflags & vnode::NOTE_DELETE != 0 {
        f |= inotify::WatchFlags::DELETE_SELF;
    }
    if fflags & (vnode::NOTE_WRITE | vnode::NOTE_EXTEND) != 0 {
        f |= inotify::WatchFlags::MODIFY;
    }
    if fflags & (vnode::NOTE_ATTRIB | vnode::NOTE_LINK) != 0 {
        f |= inotify::WatchFlags::ATTRIB;
    }
    if fflags & vnode::NOTE_RENAME != 0 {
        f |= inotify::WatchFlags::MOVE_SELF;
    }
    f
}

impl VnodeFilter {
    fn new(epfd: Arc<OwnedFd>) -> io::Result<VnodeFilter> {
        let inotify_fd = Arc::new(inotify::init(
            inotify::CreateFlags::NONBLOCK | inotify::CreateFlags::CLOEXEC,
        )?);
        unsafe {
            epoll::add(
                epfd.as_fd(),
                inotify_fd.as_fd(),
                epoll::EventData::new_u64(pack(TAG_VNODE, 0)),
                epoll::EventFlags::IN,
            )?;
        }
        Ok(VnodeFilter {
            inotify_fd,
            wd_to_ident: Mutex::new(HashMap::new()),
            ready: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl FilterOps for VnodeFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Vnode
    }

    fn create(&self, kn: &mut Knote, _initially_enabled: bool) -> Result<(), Error> {
        let path = format!("/proc/self/fd/{}", kn.kev.ident);
        let wd = inotify::add_watch(&*self.inotify_fd, path.as_str(), inotify_flags_for(kn.kev.fflags))
            .map_err(to_fault)?;
        self.wd_to_ident.lock().expect("vnode lock poisoned").insert(wd, kn.kev.ident);
        kn.state = Box::new(VnodeState { wd });
        Ok(())
    }

    fn modify(&self, kn: &mut Knote, change: &KEvent) -> Result<(), Error> {
        self.delete(kn);
        let path = format!("/proc/self/fd/{}", kn.kev.ident);
        let wd = inotify::add_watch(&*self.inotify_fd, path.as_str(), inotify_flags_for(change.fflags))
            .map_err(to_fault)?;
        self.wd_to_ident.lock().expect("vnode lock poisoned").insert(wd, kn.kev.ident);
        kn.state = Box::new(VnodeState { wd });
        Ok(())
    }

    fn enable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn disable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self, kn: &mut Knote) {
        if let Some(state) = kn.state.downcast_ref::<VnodeState>() {
            let _ = inotify::remove_watch(&*self.inotify_fd, state.wd);
            self.wd_to_ident.lock().expect("vnode lock poisoned").remove(&state.wd);
        }
        self.ready.lock().expect("vnode lock poisoned").remove(&kn.kev.ident);
    }

    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error> {
        let clear = kn.kev.flags & flags::CLEAR != 0;
        let mut ready = self.ready.lock().expect("vnode lock poisoned");
        let fflags = if clear {
            ready.remove(&kn.kev.ident)
        } else {
            ready.get(&kn.kev.ident).copied()
        };
        drop(ready);
        match fflags {
            Some(fflags) => {
                out.fflags = fflags;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn drain_ready(&self) -> Vec<u64> {
        let mut buf = [std::mem::MaybeUninit::uninit(); 4096];
        let wd_map = self.wd_to_ident.lock().expect("vnode lock poisoned");
        let mut touched = HashSet::new();
        let mut reader = inotify::Reader::new(&*self.inotify_fd, &mut buf);
        loop {
            match reader.next() {
                Ok(ev) => {
                    let mut ready = self.ready.lock().expect("vnode lock poisoned");
                    if let Some(&ident) = wd_map.get(&ev.wd()) {
                        *ready.entry(ident).or_insert(0) |= ev.events().bits();
                        touched.insert(ident);
                    }
                }
                Err(Errno::AGAIN) => break,
                Err(_) => break,
            }
        }
        touched.into_iter().collect()
    }
}
