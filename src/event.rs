//! The wire-level event descriptor and its flag/filter constants.

use std::fmt::Write as _;

use crate::error::Error;

/// One event descriptor: a change on input, an activation on output.
///
/// The layout is published and stable within this crate's own ABI, but it
/// does not claim byte-for-byte compatibility with any particular BSD's
/// native `struct kevent` — field widths differ across kqueue variants.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KEvent {
    pub ident: u64,
    pub filter: i16,
    pub flags: u16,
    pub fflags: u32,
    pub data: i64,
    pub udata: u64,
}

impl KEvent {
    /// Builds a change-list entry. `data` and the delivery-side flags
    /// (`EOF`/`ERROR`) are meaningless on input and left zeroed.
    pub fn new(ident: u64, filter: i16, flags: u16, fflags: u32, udata: u64) -> KEvent {
        KEvent {
            ident,
            filter,
            flags,
            fflags,
            data: 0,
            udata,
        }
    }

    /// A blank event-list slot, suitable for pre-filling a buffer passed to
    /// [`crate::kevent`] or [`crate::Kqueue::kevent`].
    pub const fn zeroed() -> KEvent {
        KEvent {
            ident: 0,
            filter: 0,
            flags: 0,
            fflags: 0,
            data: 0,
            udata: 0,
        }
    }
}

/// `flags` action/disposition bits, numerically aligned with the historical
/// BSD `kevent` constants to ease porting call sites.
pub mod flags {
    pub const ADD: u16 = 0x0001;
    pub const DELETE: u16 = 0x0002;
    pub const ENABLE: u16 = 0x0004;
    pub const DISABLE: u16 = 0x0008;
    pub const ONESHOT: u16 = 0x0010;
    pub const CLEAR: u16 = 0x0020;
    pub const RECEIPT: u16 = 0x0040;
    pub const DISPATCH: u16 = 0x0080;
    pub const ERROR: u16 = 0x4000;
    pub const EOF: u16 = 0x8000;

    pub(crate) const NAMES: &[(u16, &str)] = &[
        (ADD, "ADD"),
        (DELETE, "DELETE"),
        (ENABLE, "ENABLE"),
        (DISABLE, "DISABLE"),
        (ONESHOT, "ONESHOT"),
        (CLEAR, "CLEAR"),
        (RECEIPT, "RECEIPT"),
        (DISPATCH, "DISPATCH"),
        (ERROR, "ERROR"),
        (EOF, "EOF"),
    ];
}

/// `fflags` bits for [`FilterKind::Vnode`].
pub mod vnode {
    pub const NOTE_DELETE: u32 = 0x0001;
    pub const NOTE_WRITE: u32 = 0x0002;
    pub const NOTE_EXTEND: u32 = 0x0004;
    pub const NOTE_ATTRIB: u32 = 0x0008;
    pub const NOTE_LINK: u32 = 0x0010;
    pub const NOTE_RENAME: u32 = 0x0020;

    pub(crate) const NAMES: &[(u32, &str)] = &[
        (NOTE_DELETE, "NOTE_DELETE"),
        (NOTE_WRITE, "NOTE_WRITE"),
        (NOTE_EXTEND, "NOTE_EXTEND"),
        (NOTE_ATTRIB, "NOTE_ATTRIB"),
        (NOTE_LINK, "NOTE_LINK"),
        (NOTE_RENAME, "NOTE_RENAME"),
    ];
}

/// `fflags` bits for [`FilterKind::User`].
pub mod user {
    pub const NOTE_FFNOP: u32 = 0x0000_0000;
    pub const NOTE_FFAND: u32 = 0x4000_0000;
    pub const NOTE_FFOR: u32 = 0x8000_0000;
    pub const NOTE_FFCOPY: u32 = 0xc000_0000;
    pub const NOTE_FFCTRLMASK: u32 = 0xc000_0000;
    pub const NOTE_FFLAGSMASK: u32 = 0x00ff_ffff;
    pub const NOTE_TRIGGER: u32 = 0x0100_0000;

    /// Decomposed for [`super::dump`]; the two-bit control field
    /// (`FFAND`/`FFOR`/`FFCOPY`) isn't a standalone flag, so only the one
    /// independent bit is listed here.
    pub(crate) const NAMES: &[(u32, &str)] = &[(NOTE_TRIGGER, "NOTE_TRIGGER")];

    /// Applies a `modify` change's control bits (`FFNOP`/`FFAND`/`FFOR`/
    /// `FFCOPY`) to a knote's stored `fflags`, per the historical
    /// `EVFILT_USER` semantics. Shared by every back-end that implements
    /// `USER`.
    pub(crate) fn apply_user_fflags(stored: &mut u32, change: u32) {
        let bits = change & NOTE_FFLAGSMASK;
        match change & NOTE_FFCTRLMASK {
            NOTE_FFAND => *stored &= bits,
            NOTE_FFOR => *stored |= bits,
            NOTE_FFCOPY => *stored = bits,
            _ => {}
        }
    }
}

/// `fflags` bits for [`FilterKind::Proc`].
pub mod proc_ {
    pub const NOTE_EXIT: u32 = 0x8000_0000;
    pub const NOTE_FORK: u32 = 0x4000_0000;
    pub const NOTE_EXEC: u32 = 0x2000_0000;

    pub(crate) const NAMES: &[(u32, &str)] = &[
        (NOTE_EXIT, "NOTE_EXIT"),
        (NOTE_FORK, "NOTE_FORK"),
        (NOTE_EXEC, "NOTE_EXEC"),
    ];
}

/// `fflags` bits shared by [`FilterKind::Read`] and [`FilterKind::Write`].
pub mod readwrite {
    pub const NOTE_LOWAT: u32 = 0x0001;

    pub(crate) const NAMES: &[(u32, &str)] = &[(NOTE_LOWAT, "NOTE_LOWAT")];
}

/// The filter-kind namespace. Values match the historical BSD `EVFILT_*`
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Read = -1,
    Write = -2,
    Aio = -3,
    Vnode = -4,
    Proc = -5,
    Signal = -6,
    Timer = -7,
    User = -10,
}

impl FilterKind {
    /// All filter-kinds this crate's public enumeration knows about, in the
    /// fixed order used to index the filter table.
    pub(crate) const ALL: [FilterKind; 8] = [
        FilterKind::Read,
        FilterKind::Write,
        FilterKind::Aio,
        FilterKind::Vnode,
        FilterKind::Proc,
        FilterKind::Signal,
        FilterKind::Timer,
        FilterKind::User,
    ];

    /// The bijection from a filter-kind to its slot in the fixed-size
    /// filter table (§4, "Filter table").
    pub(crate) fn slot(self) -> usize {
        match self {
            FilterKind::Read => 0,
            FilterKind::Write => 1,
            FilterKind::Aio => 2,
            FilterKind::Vnode => 3,
            FilterKind::Proc => 4,
            FilterKind::Signal => 5,
            FilterKind::Timer => 6,
            FilterKind::User => 7,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FilterKind::Read => "EVFILT_READ",
            FilterKind::Write => "EVFILT_WRITE",
            FilterKind::Aio => "EVFILT_AIO",
            FilterKind::Vnode => "EVFILT_VNODE",
            FilterKind::Proc => "EVFILT_PROC",
            FilterKind::Signal => "EVFILT_SIGNAL",
            FilterKind::Timer => "EVFILT_TIMER",
            FilterKind::User => "EVFILT_USER",
        }
    }
}

impl TryFrom<i16> for FilterKind {
    type Error = Error;

    fn try_from(value: i16) -> Result<FilterKind, Error> {
        FilterKind::ALL
            .into_iter()
            .find(|k| *k as i16 == value)
            .ok_or(Error::InvalidArgument)
    }
}

/// Renders an event in the stable diagnostic form used by the test suite:
/// `{ ident=I, filter=F (name), flags=0xH (NAME NAME …), fflags=0xH (…), data=D, udata=P }`.
pub fn dump(kev: &KEvent) -> String {
    let filter_name = FilterKind::try_from(kev.filter)
        .map(|k| k.name())
        .unwrap_or("?");

    let mut flag_names = String::new();
    for (bit, name) in flags::NAMES {
        if kev.flags & bit != 0 {
            if !flag_names.is_empty() {
                flag_names.push(' ');
            }
            flag_names.push_str(name);
        }
    }

    let mut fflag_names = String::new();
    let names: &[(u32, &str)] = match FilterKind::try_from(kev.filter) {
        Ok(FilterKind::Vnode) => vnode::NAMES,
        Ok(FilterKind::User) => user::NAMES,
        Ok(FilterKind::Proc) => proc_::NAMES,
        Ok(FilterKind::Read) | Ok(FilterKind::Write) => readwrite::NAMES,
        _ => &[],
    };
    for (bit, name) in names {
        if kev.fflags & bit != 0 {
            if !fflag_names.is_empty() {
                fflag_names.push(' ');
            }
            fflag_names.push_str(name);
        }
    }

    let mut out = String::new();
    let _ = write!(
        out,
        "{{ ident={}, filter={} ({}), flags=0x{:x} ({}), fflags=0x{:x} ({}), data={}, udata={} }}",
        kev.ident,
        kev.filter,
        filter_name,
        kev.flags,
        flag_names,
        kev.fflags,
        fflag_names,
        kev.data,
        kev.udata,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_format_is_stable() {
        let kev = KEvent::new(7, FilterKind::Read as i16, flags::ADD | flags::ONESHOT, 0, 42);
        let s = dump(&kev);
        assert_eq!(
            s,
            "{ ident=7, filter=-1 (EVFILT_READ), flags=0x11 (ADD ONESHOT), fflags=0x0 (), data=0, udata=42 }"
        );
    }

    #[test]
    fn dump_decomposes_user_fflags_too() {
        let kev = KEvent::new(3, FilterKind::User as i16, flags::ADD, user::NOTE_TRIGGER, 0);
        let s = dump(&kev);
        assert!(s.contains("fflags=0x1000000 (NOTE_TRIGGER)"));
    }

    #[test]
    fn filter_kind_round_trips() {
        for k in FilterKind::ALL {
            assert_eq!(FilterKind::try_from(k as i16), Ok(k));
        }
        assert_eq!(FilterKind::try_from(123), Err(Error::InvalidArgument));
    }
}
