//! Process-wide mapping from an opaque queue descriptor to its queue
//! (§4.4).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::queue::KqueueInner;

type Table = RwLock<HashMap<u64, Arc<KqueueInner>>>;

static TABLE: OnceLock<Table> = OnceLock::new();
static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn table() -> &'static Table {
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Reserves a fresh descriptor for a queue under construction.
pub(crate) fn reserve() -> u64 {
    NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Registers `kq` under the descriptor it was built with.
pub(crate) fn insert(descriptor: u64, kq: Arc<KqueueInner>) {
    table()
        .write()
        .expect("handle table lock poisoned")
        .insert(descriptor, kq);
}

/// Resolves a descriptor to its queue. A concurrent close racing this call
/// is safe: once the entry is gone, resolution simply reports not-found
/// rather than dereferencing a freed queue.
pub(crate) fn resolve(descriptor: u64) -> Option<Arc<KqueueInner>> {
    table()
        .read()
        .expect("handle table lock poisoned")
        .get(&descriptor)
        .cloned()
}

/// Deregisters a descriptor. The underlying queue may still be kept alive
/// by another thread's clone of the `Arc` (e.g. mid-wait); it is torn down
/// only once that last reference drops.
pub(crate) fn remove(descriptor: u64) {
    table()
        .write()
        .expect("handle table lock poisoned")
        .remove(&descriptor);
}
