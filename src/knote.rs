//! A single registration: identity, parameters, filter-private state.

use std::any::Any;

use crate::event::KEvent;

/// One `(filter, ident)` registration.
///
/// The knote index (`HashMap<u64, Knote>` inside [`crate::filter::FilterSlot`])
/// holds the sole strong reference; a `&mut Knote` obtained while the queue
/// lock is held is the only handle any hook ever sees.
pub(crate) struct Knote {
    /// The canonical registration parameters, kept in sync with the
    /// change-list entries the client has submitted.
    pub kev: KEvent,
    /// Mirrors whether the back-end currently has live interest installed;
    /// stored as a plain boolean rather than inferred from `kev.flags` bit
    /// coincidences (see design notes on the `ADD`/`ENABLE` interaction).
    pub enabled: bool,
    /// Set the instant a delete is committed, before the knote leaves the
    /// index, so a copyout that raced the delete can recognize staleness.
    pub deleted: bool,
    /// Filter-private state (an open fd, a timer handle, a watch
    /// descriptor, …), downcast by the owning filter's hooks.
    pub state: Box<dyn Any + Send + Sync>,
}

impl Knote {
    pub(crate) fn new(kev: KEvent, state: Box<dyn Any + Send + Sync>) -> Knote {
        Knote {
            kev,
            enabled: false,
            deleted: false,
            state,
        }
    }
}
