//! Event identifiers.
//!
//! An [`Event`] is an id plus three independent delivery properties:
//!
//! - queueable: may sit in a machine's pending ring ([`EventFlags::NO_QUEUE`] clears it)
//! - interrupt-safe: may be posted from interrupt context ([`EventFlags::NO_ISR`] clears it)
//! - propagating: delegated to the parent state when unhandled ([`EventFlags::LOCAL`] clears it)
//!
//! "Instant" events carry both `NO_QUEUE` and `NO_ISR`. Collaborators that
//! exchange literal event numbers can convert with [`Event::from_legacy`] and
//! [`Event::legacy_value`], which use the numeric-range encoding:
//!
//! | range             | kind          |
//! |-------------------|---------------|
//! | `0x0000..0x2000`  | ordinary      |
//! | `0x2000..0x4000`  | instant       |
//! | `0x4000..0x6000`  | local         |
//! | `0x6000..0x8000`  | local instant |

use crate::error::{SmError, SmResult};
use core::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventFlags(u8);

impl EventFlags {
    pub const EMPTY: EventFlags = EventFlags(0);
    /// Must be dispatched synchronously; never enters a pending ring.
    pub const NO_QUEUE: EventFlags = EventFlags(1 << 0);
    /// Must not be posted from interrupt context.
    pub const NO_ISR: EventFlags = EventFlags(1 << 1);
    /// Never delegated to an ancestor state.
    pub const LOCAL: EventFlags = EventFlags(1 << 2);
    pub const INSTANT: EventFlags = EventFlags(Self::NO_QUEUE.0 | Self::NO_ISR.0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 | other.0)
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        self.union(rhs)
    }
}

const LEGACY_SPAN: u32 = 0x2000;
const LEGACY_INSTANT: u32 = 0x2000;
const LEGACY_LOCAL: u32 = 0x4000;
const LEGACY_LOCAL_INSTANT: u32 = 0x6000;
const LEGACY_END: u32 = 0x8000;

const FLAG_SHIFT: u32 = 16;

/// An event id with its delivery flags, packed into one word so it can be
/// stored in an atomic ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event::new(0, EventFlags::EMPTY);
    pub const DUMMY: Event = Event::new(1, EventFlags::EMPTY);
    /// Delivered to the initial state by `Kernel::init`.
    pub const INIT: Event = Event::new(2, EventFlags::EMPTY);
    pub const FINI: Event = Event::new(3, EventFlags::EMPTY);
    /// Delivered to a state when a transition makes it current.
    pub const ENTER: Event = Event::new(0, EventFlags::INSTANT.union(EventFlags::LOCAL));
    /// Delivered to the current state when a transition leaves it.
    pub const EXIT: Event = Event::new(1, EventFlags::INSTANT.union(EventFlags::LOCAL));

    pub const USER_BASE: u16 = 0x10;
    pub const USER_LOCAL_INSTANT_BASE: u16 = 2;
    /// Ids below this keep a numeric-range encoding.
    pub const ID_SPAN: u16 = LEGACY_SPAN as u16;

    pub const fn new(id: u16, flags: EventFlags) -> Event {
        Event(id as u32 | (flags.bits() as u32) << FLAG_SHIFT)
    }

    /// Ordinary application event number `n`.
    ///
    /// # Panics
    /// If `n >= ID_SPAN - USER_BASE`. In a `const` item this is a compile
    /// error.
    pub const fn user(n: u16) -> Event {
        assert!(n < Self::ID_SPAN - Self::USER_BASE, "user event number out of range");
        Event::new(Self::USER_BASE + n, EventFlags::EMPTY)
    }

    /// # Panics
    /// If `n >= ID_SPAN`.
    pub const fn user_instant(n: u16) -> Event {
        assert!(n < Self::ID_SPAN, "instant event number out of range");
        Event::new(n, EventFlags::INSTANT)
    }

    /// # Panics
    /// If `n >= ID_SPAN`.
    pub const fn user_local(n: u16) -> Event {
        assert!(n < Self::ID_SPAN, "local event number out of range");
        Event::new(n, EventFlags::LOCAL)
    }

    /// # Panics
    /// If `n >= ID_SPAN - USER_LOCAL_INSTANT_BASE`.
    pub const fn user_local_instant(n: u16) -> Event {
        assert!(
            n < Self::ID_SPAN - Self::USER_LOCAL_INSTANT_BASE,
            "local instant event number out of range"
        );
        Event::new(
            Self::USER_LOCAL_INSTANT_BASE + n,
            EventFlags::INSTANT.union(EventFlags::LOCAL),
        )
    }

    pub const fn id(self) -> u16 {
        self.0 as u16
    }

    pub const fn flags(self) -> EventFlags {
        EventFlags((self.0 >> FLAG_SHIFT) as u8)
    }

    pub const fn is_queueable(self) -> bool {
        !self.flags().contains(EventFlags::NO_QUEUE)
    }

    pub const fn is_interrupt_safe(self) -> bool {
        self.is_queueable() && !self.flags().contains(EventFlags::NO_ISR)
    }

    pub const fn propagates(self) -> bool {
        !self.flags().contains(EventFlags::LOCAL)
    }

    pub const fn is_instant(self) -> bool {
        !self.is_queueable()
    }

    pub(crate) const fn to_bits(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u32) -> Event {
        Event(bits)
    }

    /// Decodes a number from the numeric-range scheme.
    pub fn from_legacy(value: u32) -> SmResult<Event> {
        let (base, flags) = match value {
            v if v < LEGACY_INSTANT => (0, EventFlags::EMPTY),
            v if v < LEGACY_LOCAL => (LEGACY_INSTANT, EventFlags::INSTANT),
            v if v < LEGACY_LOCAL_INSTANT => (LEGACY_LOCAL, EventFlags::LOCAL),
            v if v < LEGACY_END => (
                LEGACY_LOCAL_INSTANT,
                EventFlags::INSTANT | EventFlags::LOCAL,
            ),
            _ => return Err(SmError::InvalidParameter),
        };
        Ok(Event::new((value - base) as u16, flags))
    }

    /// Encodes this event in the numeric-range scheme. `None` when the id
    /// does not fit a range or the flags mix `NO_QUEUE` and `NO_ISR`
    /// independently, which that scheme cannot express.
    pub fn legacy_value(self) -> Option<u32> {
        let id = self.id() as u32;
        if id >= LEGACY_SPAN {
            return None;
        }
        let flags = self.flags();
        let instant = flags.contains(EventFlags::INSTANT);
        if !instant && (flags.contains(EventFlags::NO_QUEUE) || flags.contains(EventFlags::NO_ISR)) {
            return None;
        }
        let base = match (instant, flags.contains(EventFlags::LOCAL)) {
            (false, false) => 0,
            (true, false) => LEGACY_INSTANT,
            (false, true) => LEGACY_LOCAL,
            (true, true) => LEGACY_LOCAL_INSTANT,
        };
        Some(base + id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_event_properties() {
        assert!(Event::INIT.is_queueable());
        assert!(Event::INIT.is_interrupt_safe());
        assert!(Event::INIT.propagates());

        for evt in [Event::ENTER, Event::EXIT] {
            assert!(evt.is_instant());
            assert!(!evt.is_interrupt_safe());
            assert!(!evt.propagates());
        }
        assert_ne!(Event::ENTER, Event::NONE);
    }

    #[test]
    fn test_flags_are_independent() {
        let task_only = Event::new(0x20, EventFlags::NO_ISR);
        assert!(task_only.is_queueable());
        assert!(!task_only.is_interrupt_safe());
        assert!(task_only.propagates());

        let local = Event::user_local(4);
        assert!(local.is_interrupt_safe());
        assert!(!local.propagates());
    }

    #[test]
    fn test_legacy_values_match_numeric_ranges() {
        assert_eq!(Event::ENTER.legacy_value(), Some(0x6000));
        assert_eq!(Event::EXIT.legacy_value(), Some(0x6001));
        assert_eq!(Event::user(0).legacy_value(), Some(0x10));
        assert_eq!(Event::user_instant(0).legacy_value(), Some(0x2000));
        assert_eq!(Event::user_local(0).legacy_value(), Some(0x4000));
        assert_eq!(Event::user_local_instant(0).legacy_value(), Some(0x6002));
    }

    #[test]
    fn test_from_legacy_restores_flags() {
        let evt = Event::from_legacy(0x4001).unwrap();
        assert_eq!(evt, Event::user_local(1));
        assert!(!evt.propagates());

        let evt = Event::from_legacy(0x2005).unwrap();
        assert!(evt.is_instant());

        assert_eq!(Event::from_legacy(0x8000), Err(SmError::InvalidParameter));
    }

    #[test]
    fn test_user_ranges_stay_encodable() {
        let last = Event::ID_SPAN - Event::USER_BASE - 1;
        assert_eq!(Event::user(last).legacy_value(), Some(0x1fff));
        assert_eq!(Event::user_instant(Event::ID_SPAN - 1).legacy_value(), Some(0x3fff));
        assert_eq!(
            Event::user_local_instant(Event::ID_SPAN - Event::USER_LOCAL_INSTANT_BASE - 1)
                .legacy_value(),
            Some(0x7fff)
        );
    }

    #[test]
    #[should_panic(expected = "user event number out of range")]
    fn test_user_number_past_the_range_panics() {
        let n = core::hint::black_box(Event::ID_SPAN - Event::USER_BASE);
        let _ = Event::user(n);
    }

    #[test]
    fn test_mixed_flags_have_no_legacy_value() {
        assert_eq!(Event::new(3, EventFlags::NO_ISR).legacy_value(), None);
        assert_eq!(Event::new(0x2000, EventFlags::EMPTY).legacy_value(), None);
    }
}
