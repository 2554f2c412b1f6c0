//! Machine handles and the dispatch seam between the kernel and user-owned
//! machine objects.

use crate::config::MAX_STATE_DEPTH;
use crate::error::SmError;
use crate::event::Event;
use crate::kernel::Context;
use crate::pt::PtStatus;
use crate::state::{State, StateKey, Transition};
use core::any::Any;

/// Generation-checked handle to a kernel slot. A handle outlives the slot it
/// named only as a stale value: every use after `release` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SmId {
    index: u8,
    generation: u16,
}

impl SmId {
    pub(crate) const fn new(index: u8, generation: u16) -> Self {
        SmId { index, generation }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u16 {
        self.generation
    }

    // never zero: generations start at 1
    pub(crate) fn to_bits(self) -> u32 {
        (self.generation as u32) << 8 | self.index as u32
    }
}

/// Result of delivering one event to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Handled,
    Transitioned,
    /// No state in the hierarchy took the event.
    Unhandled,
    /// A protothread ran to completion or failed.
    Finished(PtStatus),
    Fault(SmError),
}

/// Object-safe view of a machine that the kernel drives.
///
/// Implemented by [`Machine`] for plain hierarchical state machines and by
/// [`crate::pt::Pt`] for protothreads.
pub trait Dispatch {
    /// Resets to the initial position and delivers [`Event::INIT`].
    fn start(&mut self, cx: &mut Context<'_, '_>) -> Outcome;

    fn dispatch(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> Outcome;

    /// Whether the state named by `key` is current or an ancestor of the
    /// current state.
    fn in_state(&self, key: StateKey) -> bool;

    fn state_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct Machine<D: 'static> {
    initial: &'static State<D>,
    current: &'static State<D>,
    data: D,
}

impl<D> Machine<D> {
    pub const fn new(initial: &'static State<D>, data: D) -> Self {
        Machine {
            initial,
            current: initial,
            data,
        }
    }

    pub fn current(&self) -> &'static State<D> {
        self.current
    }

    pub fn is_in(&self, state: &'static State<D>) -> bool {
        self.current.is_within(state.key())
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    fn deliver(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> Outcome {
        let mut state = self.current;

        for _ in 0..MAX_STATE_DEPTH {
            match state.handle(cx, &mut self.data, evt) {
                Transition::Handled => return Outcome::Handled,
                Transition::To(next) => {
                    self.transition(cx, next);
                    return Outcome::Transitioned;
                }
                Transition::Unhandled => {
                    if !evt.propagates() {
                        return Outcome::Unhandled;
                    }
                    match state.parent() {
                        Some(parent) => state = parent,
                        None => return Outcome::Unhandled,
                    }
                }
            }
        }

        warn!("event {} exceeded the state depth limit", evt);
        Outcome::Fault(SmError::StateDepthExceeded)
    }

    // ENTER/EXIT replies are ignored; a state cannot veto or redirect them.
    fn transition(&mut self, cx: &mut Context<'_, '_>, next: &'static State<D>) {
        trace!("transition {} -> {}", self.current.name(), next.name());
        let _ = self.current.handle(cx, &mut self.data, Event::EXIT);
        self.current = next;
        let _ = next.handle(cx, &mut self.data, Event::ENTER);
    }
}

impl<D: 'static> Dispatch for Machine<D> {
    fn start(&mut self, cx: &mut Context<'_, '_>) -> Outcome {
        self.current = self.initial;
        self.deliver(cx, Event::INIT)
    }

    fn dispatch(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> Outcome {
        self.deliver(cx, evt)
    }

    fn in_state(&self, key: StateKey) -> bool {
        self.current.is_within(key)
    }

    fn state_name(&self) -> &'static str {
        self.current.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
