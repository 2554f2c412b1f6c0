//! Tick-driven software timers.
//!
//! [`TimerService::tick`] is meant to be called from a periodic interrupt.
//! Expired timers post their event through the mailbox's interrupt-safe path
//! and reload, so a timer keeps firing until it is unregistered. Timers are
//! claimed and released with atomics only; no lock is shared with the tick.

use crate::config::MAX_TIMERS;
use crate::error::{SmError, SmResult};
use crate::event::Event;
use crate::machine::SmId;
use crate::mailbox::Mailbox;
use portable_atomic::{AtomicU32, AtomicU8, Ordering};

const FREE: u32 = 0;
const CLAIMED: u32 = 1;
const ARMED: u32 = 2;

const PHASE_MASK: u32 = 0xff;
const GENERATION_SHIFT: u32 = 8;

// generation in the upper bits, phase in the low byte
const fn word(generation: u16, phase: u32) -> u32 {
    (generation as u32) << GENERATION_SHIFT | phase
}

/// Handle to a registered timer. It turns stale once the timer is
/// unregistered, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId {
    index: u8,
    generation: u16,
}

struct TimerSlot {
    state: AtomicU32,
    interval: AtomicU32,
    remaining: AtomicU32,
    target_index: AtomicU8,
    target_generation: AtomicU32,
    event: AtomicU32,
}

impl TimerSlot {
    const fn new() -> Self {
        TimerSlot {
            state: AtomicU32::new(FREE),
            interval: AtomicU32::new(0),
            remaining: AtomicU32::new(0),
            target_index: AtomicU8::new(0),
            target_generation: AtomicU32::new(0),
            event: AtomicU32::new(0),
        }
    }

    fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) & PHASE_MASK == ARMED
    }

    fn target(&self) -> SmId {
        SmId::new(
            self.target_index.load(Ordering::Relaxed),
            self.target_generation.load(Ordering::Relaxed) as u16,
        )
    }
}

pub struct TimerService<'m> {
    mailbox: &'m Mailbox,
    slots: [TimerSlot; MAX_TIMERS],
    ticks: AtomicU32,
}

impl<'m> TimerService<'m> {
    pub const fn new(mailbox: &'m Mailbox) -> Self {
        TimerService {
            mailbox,
            slots: [const { TimerSlot::new() }; MAX_TIMERS],
            ticks: AtomicU32::new(0),
        }
    }

    /// Arms a periodic timer that posts `evt` to `target` every `interval`
    /// ticks. The event must be interrupt-safe.
    pub fn register(&self, interval: u32, target: SmId, evt: Event) -> SmResult<TimerId> {
        if interval == 0 || !evt.is_interrupt_safe() {
            return Err(SmError::InvalidParameter);
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let current = slot.state.load(Ordering::Acquire);
            if current & PHASE_MASK != FREE {
                continue;
            }
            let generation = match ((current >> GENERATION_SHIFT) as u16).wrapping_add(1) {
                0 => 1,
                g => g,
            };
            if slot
                .state
                .compare_exchange(
                    current,
                    word(generation, CLAIMED),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                slot.interval.store(interval, Ordering::Relaxed);
                slot.remaining.store(interval, Ordering::Relaxed);
                slot.target_index.store(target.index() as u8, Ordering::Relaxed);
                slot.target_generation
                    .store(target.generation() as u32, Ordering::Relaxed);
                slot.event.store(evt.to_bits(), Ordering::Relaxed);
                slot.state.store(word(generation, ARMED), Ordering::Release);

                debug!("timer {} armed: {} ticks", index, interval);
                return Ok(TimerId {
                    index: index as u8,
                    generation,
                });
            }
        }
        Err(SmError::NoFreeSlot)
    }

    /// Fails with [`SmError::StaleHandle`] if the timer was already
    /// unregistered.
    pub fn unregister(&self, id: TimerId) -> SmResult<()> {
        let slot = self
            .slots
            .get(id.index as usize)
            .ok_or(SmError::InvalidParameter)?;
        slot.state
            .compare_exchange(
                word(id.generation, ARMED),
                word(id.generation, FREE),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| SmError::StaleHandle)
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.slots.get(id.index as usize).map_or(false, |slot| {
            slot.state.load(Ordering::Acquire) == word(id.generation, ARMED)
        })
    }

    /// Ticks seen since construction.
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advances every armed timer by one tick. Interrupt-safe.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        for slot in &self.slots {
            if !slot.is_armed() {
                continue;
            }
            let left = slot.remaining.fetch_sub(1, Ordering::AcqRel);
            if left > 1 {
                continue;
            }

            slot.remaining
                .store(slot.interval.load(Ordering::Relaxed), Ordering::Release);
            let evt = Event::from_bits(slot.event.load(Ordering::Relaxed));
            // a full queue is already counted by the mailbox
            let _ = self.mailbox.post_pending(slot.target(), evt);
        }
    }
}
