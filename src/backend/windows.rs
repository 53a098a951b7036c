//! Windows back-end: only `USER` and `TIMER` are implemented, mirroring the
//! upstream C sources this crate grew out of — their own Windows platform
//! file left every other filter as an explicit not-implemented stub (see
//! SPEC_FULL.md §4.5 and the Open Question on the timeout conversion).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_FAILED, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject, INFINITE};

use crate::backend::{Activation, Backend};
use crate::error::Error;
use crate::event::{flags, user, FilterKind, KEvent};
use crate::filter::{FilterOps, FilterTable};
use crate::knote::Knote;

/// Wraps a manual-reset `HANDLE` so it closes on drop; `HANDLE` itself
/// carries no ownership semantics in `windows-sys`.
struct EventHandle(HANDLE);

unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

impl EventHandle {
    fn create() -> io::Result<EventHandle> {
        let handle = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(EventHandle(handle))
    }

    fn set(&self) {
        unsafe {
            SetEvent(self.0);
        }
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// The conversion the original Windows back-end got wrong: it divided
/// `tv_sec` instead of multiplying it by 1000, and checked `tv_sec > 0`
/// twice instead of testing `tv_nsec` for the fractional term. This one
/// does `sec*1000 + nsec/1_000_000`, saturating into `u32`.
fn duration_to_millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(d) => {
            let ms = d
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(d.subsec_millis()));
            ms.try_into().unwrap_or(u32::MAX)
        }
    }
}

pub(crate) fn new() -> io::Result<(Arc<dyn Backend>, FilterTable)> {
    let wake = Arc::new(EventHandle::create()?);

    let timer = Arc::new(TimerFilter {
        wake: wake.clone(),
        fired: Arc::new(Mutex::new(HashMap::new())),
    });
    let user = Arc::new(UserFilter {
        ready: Mutex::new(HashMap::new()),
    });

    let mut filters = FilterTable::all_not_implemented();
    filters.install(timer.clone());
    filters.install(user.clone());

    let backend = Arc::new(WindowsBackend {
        wake,
        timer,
        user,
    });
    Ok((backend, filters))
}

struct WindowsBackend {
    wake: Arc<EventHandle>,
    timer: Arc<TimerFilter>,
    user: Arc<UserFilter>,
}

impl Backend for WindowsBackend {
    fn wait(&self, _max: usize, timeout: Option<Duration>) -> io::Result<Vec<Activation>> {
        let timeout_ms = duration_to_millis(timeout);
        let rv = unsafe { WaitForSingleObject(self.wake.0, timeout_ms) };
        if rv == WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }
        if rv == WAIT_TIMEOUT {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for ident in self.timer.drain_ready() {
            out.push(Activation { filter: FilterKind::Timer, ident });
        }
        for ident in self.user.drain_ready() {
            out.push(Activation { filter: FilterKind::User, ident });
        }
        Ok(out)
    }

    fn interrupt(&self) -> io::Result<()> {
        self.wake.set();
        Ok(())
    }
}

/// `TIMER`: one housekeeping thread per armed knote, signalling the shared
/// wait handle instead of writing to a self-pipe.
struct TimerFilter {
    wake: Arc<EventHandle>,
    fired: Arc<Mutex<HashMap<u64, u64>>>,
}

struct TimerState {
    cancelled: Arc<AtomicBool>,
}

impl TimerFilter {
    fn arm(&self, ident: u64, interval_ms: u64, cancelled: Arc<AtomicBool>) {
        let fired = self.fired.clone();
        let wake = self.wake.clone();
        thread::spawn(move || loop {
            thread::sleep(Duration::from_millis(interval_ms.max(1)));
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            *fired.lock().expect("timer lock poisoned").entry(ident).or_insert(0) += 1;
            wake.set();
        });
    }
}

impl FilterOps for TimerFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Timer
    }

    fn create(&self, kn: &mut Knote, _initially_enabled: bool) -> Result<(), Error> {
        let interval_ms = kn.kev.data.max(0) as u64;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.arm(kn.kev.ident, interval_ms, cancelled.clone());
        kn.state = Box::new(TimerState { cancelled });
        Ok(())
    }

    fn modify(&self, kn: &mut Knote, change: &KEvent) -> Result<(), Error> {
        self.delete(kn);
        let interval_ms = change.data.max(0) as u64;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.arm(kn.kev.ident, interval_ms, cancelled.clone());
        kn.state = Box::new(TimerState { cancelled });
        Ok(())
    }

    fn enable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn disable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self, kn: &mut Knote) {
        if let Some(state) = kn.state.downcast_ref::<TimerState>() {
            state.cancelled.store(true, Ordering::Release);
        }
        self.fired.lock().expect("timer lock poisoned").remove(&kn.kev.ident);
    }

    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error> {
        let clear = kn.kev.flags & flags::CLEAR != 0;
        let mut fired = self.fired.lock().expect("timer lock poisoned");
        let count = if clear {
            fired.remove(&kn.kev.ident)
        } else {
            fired.get(&kn.kev.ident).copied()
        }
        .unwrap_or(0);
        drop(fired);
        if count == 0 {
            return Ok(false);
        }
        out.data = count as i64;
        Ok(true)
    }

    fn drain_ready(&self) -> Vec<u64> {
        self.fired.lock().expect("timer lock poisoned").keys().copied().collect()
    }
}

/// `USER`: purely software, triggered by a `TRIGGER`-flagged `modify`.
struct UserFilter {
    ready: Mutex<HashMap<u64, u32>>,
}

impl FilterOps for UserFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::User
    }

    fn create(&self, kn: &mut Knote, _initially_enabled: bool) -> Result<(), Error> {
        kn.kev.fflags &= user::NOTE_FFLAGSMASK;
        Ok(())
    }

    fn modify(&self, kn: &mut Knote, change: &KEvent) -> Result<(), Error> {
        user::apply_user_fflags(&mut kn.kev.fflags, change.fflags);
        if change.fflags & user::NOTE_TRIGGER != 0 {
            self.ready
                .lock()
                .expect("user lock poisoned")
                .insert(kn.kev.ident, kn.kev.fflags & user::NOTE_FFLAGSMASK);
        }
        Ok(())
    }

    fn enable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn disable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self, kn: &mut Knote) {
        self.ready.lock().expect("user lock poisoned").remove(&kn.kev.ident);
    }

    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error> {
        let clear = kn.kev.flags & flags::CLEAR != 0;
        let mut ready = self.ready.lock().expect("user lock poisoned");
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
        self.ready.lock().expect("user lock poisoned").keys().copied().collect()
    }
}
