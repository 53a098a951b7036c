//! The filter contract (§4.2) and the per-queue filter table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::event::{FilterKind, KEvent};
use crate::knote::Knote;

/// The six-hook capability set a filter-kind implements on a given
/// back-end, plus the copyout hook that turns a ready knote into an event.
///
/// `copyout` is responsible only for the filter-specific parts of a
/// firing — computing `data`/`fflags` and resetting any edge-triggered
/// (`CLEAR`) state it privately tracks. The generic `ONESHOT`/`DISPATCH`
/// dispositions are applied once, centrally, by the dispatch engine after
/// `copyout` returns (see `dispatch::copyout_one`), so every filter gets
/// that bookkeeping for free instead of re-implementing it.
pub(crate) trait FilterOps: Send + Sync {
    fn kind(&self) -> FilterKind;

    /// Installs back-end interest for a freshly allocated knote.
    /// `initially_enabled` reflects whether the caller's change also
    /// carried `DISABLE`, so a filter can avoid ever exposing an enabled
    /// interest that might fire before a same-call disable lands.
    fn create(&self, kn: &mut Knote, initially_enabled: bool) -> Result<(), Error>;

    /// Updates parameters on an existing, registered knote.
    fn modify(&self, kn: &mut Knote, change: &KEvent) -> Result<(), Error>;

    fn enable(&self, kn: &mut Knote) -> Result<(), Error>;

    fn disable(&self, kn: &mut Knote) -> Result<(), Error>;

    /// Detaches back-end interest. Best-effort: errors are logged, never
    /// propagated as a fatal failure.
    fn delete(&self, kn: &mut Knote);

    /// Computes the data/fflags for a single firing. Implementations must
    /// consult `kn.kev.flags & flags::CLEAR`: without it, readiness stays
    /// level-triggered (the same condition keeps firing on every wait it's
    /// observed in); with it, the filter resets its private pending state
    /// so the knote goes quiet again until something new happens. Returns
    /// `false` to suppress a stale or spurious activation (e.g. a knote
    /// whose readiness was observed from another thread's perspective
    /// after it was already disabled).
    fn copyout(&self, kn: &mut Knote, out: &mut KEvent) -> Result<bool, Error>;

    /// Drains idents that became ready through a shared, multiplexed
    /// readiness channel (a self-pipe, an inotify fd). Filters backed by a
    /// direct per-knote fd never need this; the default is empty.
    fn drain_ready(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// A sentinel used for filter-kinds this back-end does not implement.
/// Every operation reports invalid-argument, per §4.2: "registering
/// against such a filter is reported as invalid-argument".
pub(crate) struct NotImplementedFilter(pub FilterKind);

impl FilterOps for NotImplementedFilter {
    fn kind(&self) -> FilterKind {
        self.0
    }

    fn create(&self, _kn: &mut Knote, _initially_enabled: bool) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn modify(&self, _kn: &mut Knote, _change: &KEvent) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn enable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn disable(&self, _kn: &mut Knote) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn delete(&self, _kn: &mut Knote) {}

    fn copyout(&self, _kn: &mut Knote, _out: &mut KEvent) -> Result<bool, Error> {
        Ok(false)
    }
}

/// One filter-kind's operations plus its knote index.
pub(crate) struct FilterSlot {
    pub ops: Arc<dyn FilterOps>,
    pub knotes: HashMap<u64, Knote>,
}

impl FilterSlot {
    fn not_implemented(kind: FilterKind) -> FilterSlot {
        FilterSlot {
            ops: Arc::new(NotImplementedFilter(kind)),
            knotes: HashMap::new(),
        }
    }
}

/// The fixed-size, filter-kind-indexed table living inside each queue.
pub(crate) struct FilterTable {
    slots: [FilterSlot; 8],
}

impl FilterTable {
    /// Builds a table where every slot is the not-implemented sentinel.
    /// Back-ends call [`FilterTable::install`] for every kind they
    /// actually support.
    pub(crate) fn all_not_implemented() -> FilterTable {
        FilterTable {
            slots: FilterKind::ALL.map(FilterSlot::not_implemented),
        }
    }

    pub(crate) fn install(&mut self, ops: Arc<dyn FilterOps>) {
        let slot = ops.kind().slot();
        self.slots[slot] = FilterSlot {
            ops,
            knotes: HashMap::new(),
        };
    }

    pub(crate) fn slot_mut(&mut self, kind: FilterKind) -> &mut FilterSlot {
        &mut self.slots[kind.slot()]
    }

    pub(crate) fn slot(&self, kind: FilterKind) -> &FilterSlot {
        &self.slots[kind.slot()]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FilterSlot> {
        self.slots.iter()
    }

    /// Tears down every knote on every filter, in preparation for queue
    /// destruction. Best-effort, matching `delete`'s own contract.
    pub(crate) fn delete_all(&mut self) {
        for slot in &mut self.slots {
            for (_, mut kn) in slot.knotes.drain() {
                slot.ops.delete(&mut kn);
            }
        }
    }
}
