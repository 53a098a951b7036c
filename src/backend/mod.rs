//! The back-end trait (§4.5) and platform selection.
//!
//! The dispatch engine only ever sees `Arc<dyn Backend>`; everything
//! platform-specific — `epoll`, wait objects, a self-pipe — lives behind
//! this boundary, exactly as the upstream back-ends this crate grew out of
//! are treated as external collaborators by the engine.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::event::FilterKind;
use crate::filter::FilterTable;

#[cfg(unix)]
pub(crate) mod software;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub(crate) use epoll::new;
    } else if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::new;
    } else if #[cfg(unix)] {
        mod posix_fallback;
        pub(crate) use posix_fallback::new;
    } else {
        compile_error!("portakq has no back-end for this target");
    }
}

/// One `(filter, ident)` pair the back-end observed becoming ready.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Activation {
    pub filter: FilterKind,
    pub ident: u64,
}

/// The per-platform wait/copyout back-end (§4.5).
///
/// `wait` is the only blocking point in the whole engine (§5) and must not
/// be called while the queue lock is held.
pub(crate) trait Backend: Send + Sync {
    /// Blocks for up to `timeout` (`None` = indefinite) waiting for any
    /// registered interest to become ready, returning at most `max`
    /// activations. An empty `Ok` means the wait timed out.
    fn wait(&self, max: usize, timeout: Option<Duration>) -> io::Result<Vec<Activation>>;

    /// Wakes a thread currently blocked in [`Backend::wait`] with no
    /// activations. The only caller is `Kqueue::drop`, which sets
    /// `KqueueInner::closed` first — the dispatch engine checks that flag
    /// as soon as `wait` returns so the woken thread reports the queue's
    /// closing as a fatal error instead of an ordinary timeout (§5).
    fn interrupt(&self) -> io::Result<()>;
}

/// Constructs the platform back-end plus the filter table it populates.
pub(crate) fn create() -> io::Result<(Arc<dyn Backend>, FilterTable)> {
    new()
}
