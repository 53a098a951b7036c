//! The kqueue itself: filter table, coarse mutex, back-end handle (§3,
//! "Kqueue").

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{self, Backend};
use crate::dispatch;
use crate::event::KEvent;
use crate::filter::FilterTable;
use crate::handle;

pub(crate) struct Inner {
    pub filters: FilterTable,
}

/// The shared, reference-counted queue state. A `Kqueue` handle and the
/// process-wide handle table both hold an `Arc` to this; it is torn down
/// only once every such reference is gone, which is what lets a thread
/// blocked in a wait safely outlive a concurrent `Kqueue::close` on
/// another thread (§5).
pub(crate) struct KqueueInner {
    pub descriptor: u64,
    pub state: Mutex<Inner>,
    pub backend: Arc<dyn Backend>,
    /// Set by `Kqueue::drop` before it interrupts the back-end, so a thread
    /// woken out of a blocked `wait` by that interrupt can tell a genuine
    /// close apart from an ordinary timeout (§5).
    pub closed: AtomicBool,
}

impl Drop for KqueueInner {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("kqueue lock poisoned");
        dispatch::teardown(&mut state.filters);
    }
}

/// An event queue: a set of filters, a coarse mutex, and a back-end
/// handle.
///
/// Dropping a `Kqueue` closes it, exactly like `std::fs::File`: the
/// descriptor is deregistered immediately, and the underlying resources
/// are released once every in-flight [`kevent`](crate::kevent) call on
/// another thread has returned.
pub struct Kqueue(Arc<KqueueInner>);

impl Kqueue {
    /// Allocates a queue and registers it in the process-wide handle table
    /// under a fresh descriptor.
    pub fn create() -> io::Result<Kqueue> {
        let (backend, filters) = backend::create()?;
        let descriptor = handle::reserve();
        let inner = Arc::new(KqueueInner {
            descriptor,
            state: Mutex::new(Inner { filters }),
            backend,
            closed: AtomicBool::new(false),
        });
        handle::insert(descriptor, inner.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(descriptor, "kqueue created");

        Ok(Kqueue(inner))
    }

    /// The opaque descriptor other threads can pass to the free-standing
    /// [`crate::kevent`] function.
    pub fn descriptor(&self) -> u64 {
        self.0.descriptor
    }

    /// The dispatch operation of §4.1, for callers already holding a
    /// `Kqueue` handle.
    pub fn kevent(
        &self,
        changes: &[KEvent],
        events: &mut [KEvent],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        dispatch::kevent_on(&self.0, changes, events, timeout)
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        handle::remove(self.0.descriptor);
        let _ = self.0.backend.interrupt();
    }
}
