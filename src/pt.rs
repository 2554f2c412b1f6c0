//! Protothreads.
//!
//! A protothread is a machine whose behaviour is written as one sequential
//! routine. The routine is re-entered from the top on every event and uses its
//! resume point to jump back to where it stopped:
//!
//! ```ignore
//! #[derive(Clone, Copy, Default)]
//! enum Step { #[default] Start, Ready }
//!
//! fn blink(pt: &mut Pt<Led, Step>, cx: &mut Context<'_, '_>, evt: Event) -> PtStatus {
//!     loop {
//!         match pt.resume_point() {
//!             Step::Start => return pt.wait_for(Step::Ready, TICK),
//!             Step::Ready => {
//!                 pt.data.toggle();
//!                 return pt.wait_for(Step::Ready, TICK);
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! A protothread can run another to completion by keeping it in its data,
//! [`Pt::restart`]ing it and forwarding events to it with [`Pt::call`] from a
//! dedicated resume point.

use crate::error::SmError;
use crate::event::Event;
use crate::kernel::Context;
use crate::machine::{Dispatch, Outcome};
use crate::state::StateKey;
use core::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PtStatus {
    Complete,
    /// Yielded; resume on a later event.
    Pending,
    Failed(SmError),
}

pub type ThreadFn<D, R = u16> = fn(&mut Pt<D, R>, &mut Context<'_, '_>, Event) -> PtStatus;

pub struct Pt<D: 'static, R: Copy + Default + 'static = u16> {
    entry: ThreadFn<D, R>,
    pub data: D,
    resume: R,
    awaiting: Option<Event>,
    finished: Option<PtStatus>,
}

impl<D, R: Copy + Default> Pt<D, R> {
    pub fn new(entry: ThreadFn<D, R>, data: D) -> Self {
        Pt {
            entry,
            data,
            resume: R::default(),
            awaiting: None,
            finished: None,
        }
    }

    pub fn resume_point(&self) -> R {
        self.resume
    }

    pub fn goto(&mut self, point: R) {
        self.resume = point;
    }

    /// Records where to resume and which event to resume on. Return the
    /// result from the routine.
    pub fn wait_for(&mut self, point: R, evt: Event) -> PtStatus {
        self.resume = point;
        self.awaiting = Some(evt);
        PtStatus::Pending
    }

    /// Records where to resume on whatever event arrives next.
    pub fn yield_at(&mut self, point: R) -> PtStatus {
        self.resume = point;
        self.awaiting = None;
        PtStatus::Pending
    }

    pub fn awaiting(&self) -> Option<Event> {
        self.awaiting
    }

    pub fn status(&self) -> Option<PtStatus> {
        self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Rewinds to the beginning of the routine.
    pub fn restart(&mut self) {
        self.resume = R::default();
        self.awaiting = None;
        self.finished = None;
    }

    /// Enters the routine with `evt`.
    ///
    /// While the routine waits for a specific event every other event is
    /// swallowed. Once finished the final status is returned without running
    /// the routine again.
    pub fn run(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> PtStatus {
        if let Some(status) = self.finished {
            return status;
        }
        if let Some(awaited) = self.awaiting {
            if evt != awaited {
                return PtStatus::Pending;
            }
            self.awaiting = None;
        }

        let status = (self.entry)(self, cx, evt);
        if status != PtStatus::Pending {
            self.finished = Some(status);
        }
        status
    }

    /// Drives this protothread as a nested call of the caller's routine.
    ///
    /// Returns `None` once it has completed, so the caller can carry on.
    /// Otherwise returns the status the caller should return itself:
    /// [`PtStatus::Pending`] while the callee waits, or its failure.
    pub fn call(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> Option<PtStatus> {
        match self.run(cx, evt) {
            PtStatus::Complete => None,
            status => Some(status),
        }
    }
}

fn outcome(status: PtStatus) -> Outcome {
    match status {
        PtStatus::Pending => Outcome::Handled,
        done => Outcome::Finished(done),
    }
}

impl<D: 'static, R: Copy + Default + 'static> Dispatch for Pt<D, R> {
    fn start(&mut self, cx: &mut Context<'_, '_>) -> Outcome {
        self.restart();
        outcome(self.run(cx, Event::INIT))
    }

    fn dispatch(&mut self, cx: &mut Context<'_, '_>, evt: Event) -> Outcome {
        outcome(self.run(cx, evt))
    }

    fn in_state(&self, _key: StateKey) -> bool {
        false
    }

    fn state_name(&self) -> &'static str {
        match self.finished {
            Some(_) => "finished",
            None => "running",
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
