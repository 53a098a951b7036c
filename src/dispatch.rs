//! The `kevent` dispatch engine (§4.1): change-list copyin, wait, copyout.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use crate::error::{self, Error};
use crate::event::{flags, FilterKind, KEvent};
use crate::filter::FilterTable;
use crate::knote::Knote;
use crate::queue::{Inner, KqueueInner};

/// Upper bound on how many event-list entries a single call will populate,
/// regardless of the buffer the caller supplied.
pub(crate) const MAX_KEVENT: usize = 512;

pub(crate) fn kevent_on(
    kq: &Arc<KqueueInner>,
    changes: &[KEvent],
    events: &mut [KEvent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let cap = events.len().min(MAX_KEVENT);
    let events = &mut events[..cap];
    let mut filled = 0usize;

    if !changes.is_empty() {
        let mut guard = kq.state.lock().expect("kqueue lock poisoned");
        for change in changes {
            match apply_one(&mut guard, change) {
                Ok(()) => {
                    if change.flags & flags::RECEIPT != 0 {
                        if filled == cap {
                            // The change itself succeeded; there's simply no
                            // room left to report it. Don't invent a failure
                            // code for a change that didn't fail.
                            return Err(error::overflow_error(Error::Overflow));
                        }
                        events[filled] = synthetic(change, 0);
                        filled += 1;
                    }
                }
                Err(e) => {
                    if filled == cap {
                        return Err(error::overflow_error(e));
                    }
                    events[filled] = synthetic(change, e.raw_code());
                    filled += 1;
                }
            }
        }
    }

    if filled < cap {
        match kq.backend.wait(cap - filled, timeout) {
            Ok(activations) => {
                // A blocked wait only ever wakes with no activations either
                // because it timed out or because the queue is being closed
                // on another thread (`Kqueue::drop` interrupts the back-end
                // after setting this flag). Distinguish the two: a timeout
                // reports an empty result, a close is a fatal error (§5).
                if kq.closed.load(Ordering::Acquire) {
                    return Err(Error::Closed.into());
                }
                let mut guard = kq.state.lock().expect("kqueue lock poisoned");
                for act in activations {
                    if filled == cap {
                        break;
                    }
                    if let Some(ev) = copyout_one(&mut guard, act.filter, act.ident) {
                        events[filled] = ev;
                        filled += 1;
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

fn synthetic(change: &KEvent, data: i64) -> KEvent {
    KEvent {
        flags: change.flags | flags::ERROR,
        data,
        ..*change
    }
}

/// Applies one change-list entry (§4.1.1). `Ok(())` covers every success
/// path in the case table; the caller decides whether a `RECEIPT` needs a
/// synthetic entry on top of that.
fn apply_one(state: &mut MutexGuard<'_, Inner>, c: &KEvent) -> Result<(), Error> {
    if c.flags & flags::DISPATCH != 0 && c.flags & flags::ONESHOT != 0 {
        return Err(Error::InvalidArgument);
    }

    let kind = FilterKind::try_from(c.filter)?;
    let slot = state.filters.slot_mut(kind);
    let exists = slot.knotes.contains_key(&c.ident);

    if !exists {
        if c.flags & flags::ADD == 0 {
            return Err(Error::NotFound);
        }

        let mut kn = Knote::new(*c, Box::new(()));
        kn.kev.flags &= !flags::ENABLE;
        kn.kev.flags |= flags::ADD;
        let initially_enabled = c.flags & flags::DISABLE == 0;

        slot.ops.create(&mut kn, initially_enabled)?;
        kn.enabled = initially_enabled;
        slot.knotes.insert(c.ident, kn);

        if c.flags & flags::DISABLE != 0 {
            let kn = slot.knotes.get_mut(&c.ident).expect("just inserted");
            slot.ops.disable(kn)?;
            kn.enabled = false;
        }

        return Ok(());
    }

    let kn = slot.knotes.get_mut(&c.ident).expect("checked contains_key");

    if c.flags & flags::DELETE != 0 {
        slot.ops.delete(kn);
        kn.deleted = true;
        slot.knotes.remove(&c.ident);
        return Ok(());
    }

    if c.flags & flags::DISABLE != 0 {
        slot.ops.disable(kn)?;
        kn.enabled = false;
        kn.kev.flags |= flags::DISABLE;
        return Ok(());
    }

    if c.flags & flags::ENABLE != 0 {
        slot.ops.enable(kn)?;
        kn.enabled = true;
        kn.kev.flags &= !flags::DISABLE;
        return Ok(());
    }

    if c.flags & flags::ADD != 0 || c.flags == 0 || c.flags & flags::RECEIPT != 0 {
        slot.ops.modify(kn, c)?;
        kn.kev.udata = c.udata;
        if c.flags & flags::DISPATCH != 0 {
            kn.kev.flags |= flags::DISPATCH;
        } else {
            kn.kev.flags &= !flags::DISPATCH;
        }
        return Ok(());
    }

    Ok(())
}

/// Turns one ready `(filter, ident)` pair into an event, applying the
/// generic `ONESHOT`/`DISPATCH` dispositions. Returns `None` to suppress a
/// stale activation — the knote may have been disabled or deleted by
/// another thread between the back-end's wait and this copyout (§5).
fn copyout_one(state: &mut MutexGuard<'_, Inner>, kind: FilterKind, ident: u64) -> Option<KEvent> {
    let slot = state.filters.slot_mut(kind);
    let kn = slot.knotes.get_mut(&ident)?;
    if !kn.enabled || kn.deleted {
        return None;
    }

    let mut ev = KEvent::zeroed();
    match slot.ops.copyout(kn, &mut ev) {
        Ok(true) => {}
        Ok(false) | Err(_) => return None,
    }
    ev.ident = kn.kev.ident;
    ev.filter = kind as i16;
    ev.udata = kn.kev.udata;

    let oneshot = kn.kev.flags & flags::ONESHOT != 0;
    let dispatch = kn.kev.flags & flags::DISPATCH != 0;

    if oneshot {
        slot.ops.delete(kn);
        slot.knotes.remove(&ident);
    } else if dispatch {
        let _ = slot.ops.disable(kn);
        kn.enabled = false;
        kn.kev.flags |= flags::DISABLE;
    }

    Some(ev)
}

/// Tears down every knote on a queue being destroyed (§5, "Resource
/// ownership").
pub(crate) fn teardown(filters: &mut FilterTable) {
    filters.delete_all();
}
