//! Pending-event mailbox.
//!
//! The mailbox is the only part of the kernel that interrupt handlers touch.
//! Each machine slot owns a bounded multi-producer ring; producers (interrupt
//! handlers and task code) only perform atomic operations, and the single
//! consumer is the kernel's poll loop. The mailbox is usually a `static` so
//! interrupt handlers can reach it without any other kernel state.

use crate::config::{EVENT_QUEUE_DEPTH, MAX_MACHINES};
use crate::error::{SmError, SmResult};
use crate::event::Event;
use crate::machine::SmId;
use crate::stats::{Stats, StatsSnapshot};
use portable_atomic::{AtomicU32, AtomicUsize, Ordering};

const MASK: usize = EVENT_QUEUE_DEPTH - 1;

struct RingCell {
    sequence: AtomicUsize,
    value: AtomicU32,
}

// Bounded MPMC ring with per-cell sequence numbers. A cell whose sequence
// equals the enqueue position is free; one equal to position + 1 holds data.
struct EventRing {
    cells: [RingCell; EVENT_QUEUE_DEPTH],
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl EventRing {
    const fn new() -> Self {
        let mut cells = [const {
            RingCell {
                sequence: AtomicUsize::new(0),
                value: AtomicU32::new(0),
            }
        }; EVENT_QUEUE_DEPTH];

        let mut i = 0;
        while i < EVENT_QUEUE_DEPTH {
            cells[i] = RingCell {
                sequence: AtomicUsize::new(i),
                value: AtomicU32::new(0),
            };
            i += 1;
        }

        EventRing {
            cells,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn push(&self, bits: u32) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & MASK];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(bits, Ordering::Relaxed);
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<u32> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & MASK];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let bits = cell.value.load(Ordering::Relaxed);
                        cell.sequence
                            .store(pos.wrapping_add(EVENT_QUEUE_DEPTH), Ordering::Release);
                        return Some(bits);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(EVENT_QUEUE_DEPTH)
    }
}

pub struct Mailbox {
    rings: [EventRing; MAX_MACHINES],
    // packed SmId of the machine bound to each slot, 0 when free
    owners: [AtomicU32; MAX_MACHINES],
    pending: AtomicUsize,
    stats: Stats,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub const fn new() -> Self {
        Mailbox {
            rings: [const { EventRing::new() }; MAX_MACHINES],
            owners: [const { AtomicU32::new(0) }; MAX_MACHINES],
            pending: AtomicUsize::new(0),
            stats: Stats::new(),
        }
    }

    /// Queues `evt` for `target` from interrupt context.
    ///
    /// Never dispatches and never blocks. Rejects events that are not
    /// interrupt-safe and handles whose slot has been released.
    pub fn post_pending(&self, target: SmId, evt: Event) -> SmResult<()> {
        if !evt.is_interrupt_safe() {
            return Err(SmError::NotInterruptSafe);
        }
        self.enqueue(target, evt, true)
    }

    /// Whether any machine has queued work. Main loops check this with
    /// interrupts masked before going to sleep.
    pub fn any_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn enqueue(&self, target: SmId, evt: Event, from_interrupt: bool) -> SmResult<()> {
        if !evt.is_queueable() {
            return Err(SmError::NotQueueable);
        }
        let index = target.index();
        if index >= MAX_MACHINES || self.owners[index].load(Ordering::Acquire) != target.to_bits() {
            return Err(SmError::StaleHandle);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if !self.rings[index].push(evt.to_bits()) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.stats.record_dropped_full();
            return Err(SmError::QueueFull);
        }
        self.stats.record_posted(from_interrupt);
        Ok(())
    }

    pub(crate) fn take(&self, index: usize) -> Option<Event> {
        let bits = self.rings[index].pop()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(Event::from_bits(bits))
    }

    pub(crate) fn queued(&self, index: usize) -> usize {
        self.rings[index].len()
    }

    pub(crate) fn bind(&self, id: SmId) {
        self.owners[id.index()].store(id.to_bits(), Ordering::Release);
    }

    /// Drops what is queued for a machine that is not running. Events posted
    /// concurrently may survive.
    pub(crate) fn discard(&self, index: usize) -> usize {
        let mut dropped = 0;
        for _ in 0..self.queued(index) {
            if self.take(index).is_none() {
                break;
            }
            self.stats.record_dropped_inactive();
            dropped += 1;
        }
        dropped
    }

    /// Stops accepting events for the slot and discards what is queued.
    pub(crate) fn retire(&self, index: usize) {
        self.owners[index].store(0, Ordering::Release);
        while self.take(index).is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(mailbox: &Mailbox, index: u8) -> SmId {
        let id = SmId::new(index, 1);
        mailbox.bind(id);
        id
    }

    #[test]
    fn test_ring_is_fifo() {
        let mailbox = Mailbox::new();
        let id = bound(&mailbox, 0);

        for n in 0..5 {
            mailbox.post_pending(id, Event::user(n)).unwrap();
        }
        assert_eq!(mailbox.queued(0), 5);

        for n in 0..5 {
            assert_eq!(mailbox.take(0), Some(Event::user(n)));
        }
        assert_eq!(mailbox.take(0), None);
        assert!(!mailbox.any_pending());
    }

    #[test]
    fn test_full_ring_rejects_and_recovers() {
        let mailbox = Mailbox::new();
        let id = bound(&mailbox, 3);

        for n in 0..EVENT_QUEUE_DEPTH as u16 {
            mailbox.post_pending(id, Event::user(n)).unwrap();
        }
        assert_eq!(mailbox.post_pending(id, Event::user(99)), Err(SmError::QueueFull));
        assert_eq!(mailbox.stats().dropped_full, 1);

        assert_eq!(mailbox.take(3), Some(Event::user(0)));
        mailbox.post_pending(id, Event::user(99)).unwrap();

        // wraps around the ring many times without losing order
        for round in 0..(EVENT_QUEUE_DEPTH * 4) as u16 {
            let _ = mailbox.take(3);
            mailbox.post_pending(id, Event::user(100 + round)).unwrap();
        }
        assert_eq!(mailbox.queued(3), EVENT_QUEUE_DEPTH);
    }

    #[test]
    fn test_discard_counts_dropped_events() {
        let mailbox = Mailbox::new();
        let id = bound(&mailbox, 2);

        for n in 0..3 {
            mailbox.post_pending(id, Event::user(n)).unwrap();
        }
        assert_eq!(mailbox.discard(2), 3);
        assert!(!mailbox.any_pending());
        assert_eq!(mailbox.stats().dropped_inactive, 3);

        // the slot stays bound
        mailbox.post_pending(id, Event::user(7)).unwrap();
        assert_eq!(mailbox.take(2), Some(Event::user(7)));
    }

    #[test]
    fn test_rejects_instant_and_task_only_events() {
        let mailbox = Mailbox::new();
        let id = bound(&mailbox, 1);

        assert_eq!(
            mailbox.post_pending(id, Event::user_instant(0)),
            Err(SmError::NotInterruptSafe)
        );
        assert_eq!(
            mailbox.post_pending(id, Event::ENTER),
            Err(SmError::NotInterruptSafe)
        );
        assert!(!mailbox.any_pending());
    }

    #[test]
    fn test_stale_handles_are_rejected() {
        let mailbox = Mailbox::new();
        let id = bound(&mailbox, 2);
        mailbox.post_pending(id, Event::DUMMY).unwrap();

        mailbox.retire(2);
        assert!(!mailbox.any_pending());
        assert_eq!(mailbox.post_pending(id, Event::DUMMY), Err(SmError::StaleHandle));

        let newer = SmId::new(2, 2);
        mailbox.bind(newer);
        assert_eq!(mailbox.post_pending(id, Event::DUMMY), Err(SmError::StaleHandle));
        assert!(mailbox.post_pending(newer, Event::DUMMY).is_ok());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        use std::sync::Arc;
        use std::thread;
        use std::vec::Vec;

        let mailbox = Arc::new(Mailbox::new());
        let id = bound(&mailbox, 4);
        let mut received = Vec::new();

        let producers: Vec<_> = (0..2u16)
            .map(|p| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    let mut sent = 0u16;
                    while sent < 100 {
                        if mailbox.post_pending(id, Event::user(p * 1000 + sent)).is_ok() {
                            sent += 1;
                        }
                    }
                })
            })
            .collect();

        while received.len() < 200 {
            if let Some(evt) = mailbox.take(4) {
                received.push(evt.id() - Event::USER_BASE);
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }

        for p in 0..2u16 {
            let own: Vec<_> = received.iter().filter(|&&n| n / 1000 == p).collect();
            assert_eq!(own.len(), 100);
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
