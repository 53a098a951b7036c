//! The three filter-kinds every Unix back-end implements the same way:
//! purely in user space, waking a blocked wait through a shared self-pipe
//! rather than a dedicated OS readiness primitive.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::event::{flags, user, FilterKind, KEvent};
use crate::filter::FilterOps;
use crate::knote::Knote;

/// `ms = sec*1000 + nsec/1_000_000`, saturating — the conversion the
/// original Windows back-end got wrong (see SPEC_FULL.md §9's Open
/// Question). Shared by every back-end in this crate.
pub(crate) fn duration_to_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(d.subsec_millis()));
            ms.try_into().unwrap_or(i32::MAX)
        }
    }
}

fn to_fault(_e: impl std::fmt::Debug) -> Error {
    Error::Fault
}

/// `TIMER`: one housekeeping thread per armed knote.
pub(crate) struct TimerFilter {
    writer: Arc<Mutex<UnixStream>>,
    fired: Arc<Mutex<HashMap<u64, u64>>>,
}

struct TimerState {
    cancelled: Arc<AtomicBool>,
}

impl TimerFilter {
    pub(crate) fn new(writer: Arc<Mutex<UnixStream>>) -> TimerFilter {
        TimerFilter {
            writer,
            fired: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn arm(&self, ident: u64, interval_ms: u64, cancelled: Arc<AtomicBool>) {
        let fired = self.fired.clone();
        let writer = self.writer.clone();
        thread::spawn(move || loop {
            thread::sleep(Duration::from_millis(interval_ms.max(1)));
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            *fired.lock().expect("timer lock poisoned").entry(ident).or_insert(0) += 1;
            let _ = writer.lock().expect("notify lock poisoned").write(&[1]);
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
pub(crate) struct UserFilter {
    ready: Mutex<HashMap<u64, u32>>,
}

impl UserFilter {
    pub(crate) fn new() -> UserFilter {
        UserFilter {
            ready: Mutex::new(HashMap::new()),
        }
    }
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

/// `SIGNAL`: delivered signals are forwarded into the shared self-pipe by a
/// `signal-hook` background thread.
pub(crate) struct SignalFilter {
    handle: signal_hook::iterator::Handle,
    ready: Arc<Mutex<HashMap<u64, u64>>>,
}

impl SignalFilter {
    pub(crate) fn new(writer: Arc<Mutex<UnixStream>>) -> std::io::Result<SignalFilter> {
        let mut signals = signal_hook::iterator::Signals::new(Vec::<i32>::new())?;
        let handle = signals.handle();
        let ready = Arc::new(Mutex::new(HashMap::new()));
        let ready_thread = ready.clone();
        thread::spawn(move || {
            for sig in signals.forever() {
                *ready_thread
                    .lock()
                    .expect("signal lock poisoned")
                    .entry(sig as u64)
                    .or_insert(0) += 1;
                let _ = writer.lock().expect("notify lock poisoned").write(&[1]);
            }
        });
        Ok(SignalFilter { handle, ready })
    }
}

impl FilterOps for SignalFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Signal
    }

    fn create(&self, kn: &mut Knote, _initially_enabled: bool) -> Result<(), Error> {
        self.handle.add_signal(kn.kev.ident as i32).map_err(to_fault)
    }

    fn modify(&self, _kn: &mut Knote, _change: &KEvent) -> Result<(), Error> {
        Ok(())
    }

    fn enable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn disable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self, kn: &mut Knote) {
        // signal-hook has no per-signal deregistration short of closing the
        // whole handle; a deleted knote's counts are simply dropped by the
        // dispatch engine's index lookup from now on.
        self.ready.lock().expect("signal lock poisoned").remove(&kn.kev.ident);
    }

    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error> {
        let clear = kn.kev.flags & flags::CLEAR != 0;
        let mut ready = self.ready.lock().expect("signal lock poisoned");
        let count = if clear {
            ready.remove(&kn.kev.ident)
        } else {
            ready.get(&kn.kev.ident).copied()
        }
        .unwrap_or(0);
        drop(ready);
        if count == 0 {
            return Ok(false);
        }
        out.data = count as i64;
        Ok(true)
    }

    fn drain_ready(&self) -> Vec<u64> {
        self.ready.lock().expect("signal lock poisoned").keys().copied().collect()
    }
}
