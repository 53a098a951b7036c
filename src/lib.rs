//! A portable facade over the BSD `kqueue`/`kevent` event-notification
//! model: one call registers interest and reaps activations, across
//! Linux (`epoll`), other Unix targets (`poll`), and Windows (wait
//! objects).
//!
//! ```no_run
//! use portakq::{Kqueue, KEvent, FilterKind, flags};
//!
//! let kq = Kqueue::create()?;
//! let changes = [KEvent::new(0, FilterKind::Timer as i16, flags::ADD, 0, 0)];
//! let mut events = [KEvent::zeroed()];
//! let n = kq.kevent(&changes, &mut events, None)?;
//! # Ok::<(), std::io::Error>(())
//! ```

mod backend;
mod dispatch;
mod error;
mod event;
mod filter;
mod handle;
mod knote;
mod queue;

pub use error::Error;
pub use event::{dump, flags, proc_, readwrite, user, vnode, FilterKind, KEvent};
pub use queue::Kqueue;

use std::io;
use std::time::Duration;

/// The dispatch operation of §4.1, resolved from a descriptor obtained from
/// [`Kqueue::descriptor`] rather than a live handle — the form other
/// threads use once a queue has been shared by its numeric identity alone.
///
/// Returns `Err` with [`std::io::ErrorKind::NotFound`] if no queue is
/// currently registered under `descriptor`.
pub fn kevent(
    descriptor: u64,
    changes: &[KEvent],
    events: &mut [KEvent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let kq = handle::resolve(descriptor).ok_or(Error::NotFound)?;
    dispatch::kevent_on(&kq, changes, events, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_descriptor_is_not_found() {
        let mut events = [KEvent::zeroed()];
        let err = kevent(u64::MAX, &[], &mut events, Some(Duration::from_millis(1))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn create_and_drop_roundtrip() {
        let kq = Kqueue::create().expect("create queue");
        assert!(kq.descriptor() > 0);
    }
}
