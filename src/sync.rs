//! Counting sync objects: semaphores and critical sections.
//!
//! Waiting is cooperative. A machine that cannot acquire is recorded in a
//! FIFO wait set and told to yield; when the count is increased the oldest
//! waiter is granted the unit directly and woken with the object's wake
//! event. The grant is consumed by the waiter's next `decrease`, so a third
//! machine can never overtake a woken waiter.

use crate::config::MAX_SYNC_WAITERS;
use crate::error::{SmError, SmResult};
use crate::event::Event;
use crate::machine::SmId;

/// Arena handle for a sync object owned by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncId(pub(crate) u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Acquire {
    Acquired,
    /// Queued; yield and retry on the wake event.
    WouldBlock,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    sm: SmId,
    granted: bool,
}

#[derive(Debug)]
pub struct SyncObject {
    counter: u32,
    max: u32,
    wake: Event,
    // FIFO, oldest first, no holes
    waiters: [Option<Waiter>; MAX_SYNC_WAITERS],
    len: usize,
}

impl SyncObject {
    pub fn new(current: u32, max: u32, wake: Event) -> SmResult<Self> {
        if current > max || max == 0 || !wake.is_queueable() {
            return Err(SmError::InvalidParameter);
        }
        Ok(SyncObject {
            counter: current,
            max,
            wake,
            waiters: [None; MAX_SYNC_WAITERS],
            len: 0,
        })
    }

    /// One unit, initially free.
    pub fn critical(wake: Event) -> SmResult<Self> {
        Self::new(1, 1, wake)
    }

    pub fn semaphore(count: u32, wake: Event) -> SmResult<Self> {
        Self::new(count, u32::MAX, wake)
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn wake_event(&self) -> Event {
        self.wake
    }

    pub fn waiting(&self) -> usize {
        self.waiters[..self.len]
            .iter()
            .flatten()
            .filter(|w| !w.granted)
            .count()
    }

    pub fn is_waiting(&self, sm: SmId) -> bool {
        self.position(sm).is_some()
    }

    /// Releases one unit. Returns the waiter that was granted it and must be
    /// woken, if any. At most one waiter is granted per call.
    pub fn increase(&mut self) -> Option<SmId> {
        if let Some(waiter) = self.waiters[..self.len]
            .iter_mut()
            .flatten()
            .find(|w| !w.granted)
        {
            waiter.granted = true;
            return Some(waiter.sm);
        }
        if self.counter < self.max {
            self.counter += 1;
        }
        None
    }

    /// Tries to take one unit on behalf of `sm`.
    pub fn decrease(&mut self, sm: SmId) -> SmResult<Acquire> {
        if let Some(pos) = self.position(sm) {
            if self.waiters[pos].map_or(false, |w| w.granted) {
                self.remove(pos);
                return Ok(Acquire::Acquired);
            }
            return Ok(Acquire::WouldBlock);
        }

        if self.counter > 0 && self.waiting() == 0 {
            self.counter -= 1;
            return Ok(Acquire::Acquired);
        }

        if self.len == MAX_SYNC_WAITERS {
            return Err(SmError::WaitSetFull);
        }
        self.waiters[self.len] = Some(Waiter { sm, granted: false });
        self.len += 1;
        Ok(Acquire::WouldBlock)
    }

    /// Withdraws `sm` from the wait set. A grant it had not consumed yet is
    /// handed to the next waiter, which is returned so it can be woken.
    pub fn cancel(&mut self, sm: SmId) -> Option<SmId> {
        let pos = self.position(sm)?;
        let granted = self.waiters[pos].map_or(false, |w| w.granted);
        self.remove(pos);
        if granted {
            self.increase()
        } else {
            None
        }
    }

    fn position(&self, sm: SmId) -> Option<usize> {
        self.waiters[..self.len]
            .iter()
            .position(|w| w.map_or(false, |w| w.sm == sm))
    }

    fn remove(&mut self, pos: usize) {
        self.waiters.copy_within(pos + 1..self.len, pos);
        self.len -= 1;
        self.waiters[self.len] = None;
    }
}
