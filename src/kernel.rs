//! The state-machine kernel.
//!
//! The kernel owns no machine memory. Machines are registered as mutable
//! borrows of user-owned objects and addressed afterwards through
//! generation-checked [`SmId`] handles. Events reach a machine either
//! synchronously (instant events) or through its ring in the [`Mailbox`],
//! which [`Kernel::poll`] drains from the main loop.
//!
//! While a machine is being dispatched its object is taken out of its slot.
//! Structural requests that concern a machine on the dispatch stack (removal,
//! re-entry) therefore see it as busy and are deferred or rejected instead of
//! aliasing it.

use crate::config::{MAX_MACHINES, MAX_SYNC_OBJECTS};
use crate::error::{SmError, SmResult};
use crate::event::Event;
use crate::machine::{Dispatch, Outcome, SmId};
use crate::mailbox::Mailbox;
use crate::state::{State, StateKey};
use crate::stats::StatsSnapshot;
use crate::sync::{Acquire, SyncId, SyncObject};

/// When ordinary events posted from task code are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DispatchPolicy {
    /// Queue and wait for the next `poll`.
    #[default]
    Queued,
    /// Drain the target's queue right away when no dispatch is in progress.
    Immediate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KernelConfig {
    pub dispatch: DispatchPolicy,
}

/// Where a sub-machine hangs in the machine tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parent {
    /// Visited by every `poll`.
    Top,
    /// Runs only while `machine` is in `state` (or one of its sub-states).
    State { machine: SmId, state: StateKey },
}

impl Parent {
    pub fn state<D>(machine: SmId, state: &'static State<D>) -> Parent {
        Parent::State {
            machine,
            state: state.key(),
        }
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Top,
    Machine(SmId),
}

impl Scope {
    fn holds(self, parent: Option<Parent>) -> bool {
        match (self, parent) {
            (Scope::Top, Some(Parent::Top)) => true,
            (Scope::Machine(id), Some(Parent::State { machine, .. })) => machine == id,
            _ => false,
        }
    }
}

#[derive(Clone, Copy)]
enum Delivery {
    Start,
    Event(Event),
}

struct Slot<'a> {
    // None while free or while on the dispatch stack
    machine: Option<&'a mut (dyn Dispatch + 'a)>,
    id: Option<SmId>,
    generation: u16,
    active: bool,
    evt_count: u32,
    parent: Option<Parent>,
    // attach order among siblings
    seq: u32,
    // parent machine currently inside the parent state
    engaged: bool,
    detach_requested: bool,
}

impl<'a> Slot<'a> {
    fn empty(generation: u16) -> Self {
        Slot {
            machine: None,
            id: None,
            generation,
            active: false,
            evt_count: 0,
            parent: None,
            seq: 0,
            engaged: false,
            detach_requested: false,
        }
    }

    fn is_busy(&self) -> bool {
        self.id.is_some() && self.machine.is_none()
    }

    // attached under a state its parent is not in
    fn is_dormant(&self) -> bool {
        matches!(self.parent, Some(Parent::State { .. })) && !self.engaged
    }
}

/// Registry, dispatcher and scheduler of machines.
///
/// # Example
///
/// ```ignore
/// static MAILBOX: Mailbox = Mailbox::new();
///
/// let mut blinker = Machine::new(&OFF, Led::default());
/// let mut kernel = Kernel::new(&MAILBOX);
/// let led = kernel.register(&mut blinker)?;
/// kernel.init(led, true)?;
/// loop {
///     if !kernel.poll() {
///         wait_for_interrupt();
///     }
/// }
/// ```
pub struct Kernel<'a> {
    mailbox: &'a Mailbox,
    config: KernelConfig,
    slots: [Slot<'a>; MAX_MACHINES],
    syncs: [Option<SyncObject>; MAX_SYNC_OBJECTS],
    next_seq: u32,
    depth: usize,
}

impl<'a> Kernel<'a> {
    pub fn new(mailbox: &'a Mailbox) -> Self {
        Self::with_config(mailbox, KernelConfig::default())
    }

    pub fn with_config(mailbox: &'a Mailbox, config: KernelConfig) -> Self {
        Kernel {
            mailbox,
            config,
            slots: core::array::from_fn(|_| Slot::empty(0)),
            syncs: [const { None }; MAX_SYNC_OBJECTS],
            next_seq: 0,
            depth: 0,
        }
    }

    pub fn mailbox(&self) -> &'a Mailbox {
        self.mailbox
    }

    pub fn config(&self) -> KernelConfig {
        self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.mailbox.stats()
    }

    /// Takes a machine into a free slot. The machine stays inactive and
    /// unattached until [`Kernel::init`].
    pub fn register(&mut self, machine: &'a mut (dyn Dispatch + 'a)) -> SmResult<SmId> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.id.is_none())
            .ok_or(SmError::NoFreeSlot)?;

        let generation = match self.slots[index].generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        let id = SmId::new(index as u8, generation);

        let slot = &mut self.slots[index];
        *slot = Slot::empty(generation);
        slot.machine = Some(machine);
        slot.id = Some(id);
        self.mailbox.bind(id);

        debug!("registered {}", id);
        Ok(id)
    }

    /// Frees the slot and hands the machine back. Queued events are
    /// discarded, sync waits withdrawn, and sub-machines attached under the
    /// machine's states are detached and deactivated. The handle turns stale.
    pub fn release(&mut self, id: SmId) -> SmResult<&'a mut (dyn Dispatch + 'a)> {
        let index = self.slot_index(id)?;
        let machine = self.slots[index].machine.take().ok_or(SmError::Busy)?;

        self.cancel_waits(id);
        self.mailbox.retire(index);
        for slot in self.slots.iter_mut() {
            if Scope::Machine(id).holds(slot.parent) {
                slot.parent = None;
                slot.engaged = false;
                slot.active = false;
            }
        }
        let generation = self.slots[index].generation;
        self.slots[index] = Slot::empty(generation);

        debug!("released {}", id);
        Ok(machine)
    }

    /// Activates the machine and delivers [`Event::INIT`] to its initial
    /// state. Sub-machines attached under states on the resulting active
    /// chain are initialized in turn.
    ///
    /// With `autopoll` an unattached machine is attached to [`Parent::Top`]
    /// so that [`Kernel::poll`] visits it in attach order together with its
    /// sub-machines. Without it the machine's pending events are still
    /// drained, after the tree.
    pub fn init(&mut self, id: SmId, autopoll: bool) -> SmResult<()> {
        let index = self.slot_index(id)?;
        if self.slots[index].is_busy() {
            return Err(SmError::Busy);
        }
        if autopoll && self.slots[index].parent.is_none() {
            self.add_subsm(Parent::Top, id)?;
        }

        for slot in self.slots.iter_mut() {
            if Scope::Machine(id).holds(slot.parent) {
                slot.engaged = false;
                slot.active = false;
            }
        }

        debug!("init {}", id);
        self.slots[index].active = true;
        self.run_slot(index, Delivery::Start)?;
        Ok(())
    }

    pub fn set_active(&mut self, id: SmId, active: bool) -> SmResult<()> {
        let index = self.slot_index(id)?;
        self.slots[index].active = active;
        Ok(())
    }

    pub fn is_active(&self, id: SmId) -> bool {
        self.slot_index(id)
            .map_or(false, |index| self.slots[index].active)
    }

    /// Number of events delivered to the machine, synthesized ones included.
    pub fn evt_count(&self, id: SmId) -> SmResult<u32> {
        Ok(self.slots[self.slot_index(id)?].evt_count)
    }

    pub fn parent_of(&self, id: SmId) -> SmResult<Option<Parent>> {
        Ok(self.slots[self.slot_index(id)?].parent)
    }

    pub fn state_name(&self, id: SmId) -> SmResult<&'static str> {
        let index = self.slot_index(id)?;
        let machine = self.slots[index].machine.as_deref().ok_or(SmError::Busy)?;
        Ok(machine.state_name())
    }

    /// Whether the machine is in the state named by `key` or a sub-state.
    pub fn in_state(&self, id: SmId, key: StateKey) -> SmResult<bool> {
        let index = self.slot_index(id)?;
        let machine = self.slots[index].machine.as_deref().ok_or(SmError::Busy)?;
        Ok(machine.in_state(key))
    }

    /// Typed view of a registered machine, e.g. `kernel.machine::<Machine<Led>>(id)`.
    pub fn machine<T: 'static>(&self, id: SmId) -> SmResult<&T> {
        let index = self.slot_index(id)?;
        let machine = self.slots[index].machine.as_deref().ok_or(SmError::Busy)?;
        machine
            .as_any()
            .downcast_ref::<T>()
            .ok_or(SmError::InvalidParameter)
    }

    pub fn machine_mut<T: 'static>(&mut self, id: SmId) -> SmResult<&mut T> {
        let index = self.slot_index(id)?;
        let machine = self.slots[index]
            .machine
            .as_deref_mut()
            .ok_or(SmError::Busy)?;
        machine
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(SmError::InvalidParameter)
    }

    /// Posts from task context.
    ///
    /// Instant events are dispatched before this returns and fail with
    /// [`SmError::Busy`] if the target is already on the dispatch stack.
    /// Ordinary events are queued; under [`DispatchPolicy::Immediate`] the
    /// target's queue is drained at once unless a dispatch is in progress.
    pub fn post_event(&mut self, target: SmId, evt: Event) -> SmResult<()> {
        let index = self.slot_index(target)?;

        if !evt.is_queueable() {
            if !self.slots[index].active {
                return Err(SmError::Inactive);
            }
            self.run_slot(index, Delivery::Event(evt))?;
            return Ok(());
        }

        self.mailbox.enqueue(target, evt, false)?;
        if self.config.dispatch == DispatchPolicy::Immediate && self.depth == 0 {
            self.drain(index);
        }
        Ok(())
    }

    /// Interrupt-safe post; see [`Mailbox::post_pending`].
    pub fn post_event_pending(&self, target: SmId, evt: Event) -> SmResult<()> {
        self.mailbox.post_pending(target, evt)
    }

    /// Dispatches queued events for every machine with pending work.
    ///
    /// Top-level machines are visited in attach order, each followed by the
    /// sub-machines of the states it is in. Machines outside that tree
    /// (initialized without `autopoll`, or detached) are drained afterwards
    /// in slot order. Sub-machines whose parent state is not current only
    /// have their queues discarded.
    ///
    /// A machine only sees the events that were queued when its turn began;
    /// whatever its handlers post lands in the next pass. Returns whether
    /// events are still pending.
    pub fn poll(&mut self) -> bool {
        let mut seen = [false; MAX_MACHINES];
        self.visit(Scope::Top, &mut seen);

        for index in 0..MAX_MACHINES {
            let slot = &self.slots[index];
            if seen[index] || slot.id.is_none() || self.mailbox.queued(index) == 0 {
                continue;
            }
            if slot.is_dormant() {
                self.mailbox.discard(index);
            } else {
                self.drain(index);
            }
        }
        self.mailbox.any_pending()
    }

    /// Drains the queue of one machine regardless of its attachment.
    /// Returns the number of events dispatched.
    pub fn dispatch_pending(&mut self, id: SmId) -> SmResult<usize> {
        let index = self.slot_index(id)?;
        if self.slots[index].is_busy() {
            return Err(SmError::Busy);
        }
        Ok(self.drain(index))
    }

    /// Attaches `child` under `parent`.
    ///
    /// A child attached under a state of a machine that is currently in that
    /// state is initialized immediately; otherwise it starts when the parent
    /// enters the state.
    pub fn add_subsm(&mut self, parent: Parent, child: SmId) -> SmResult<()> {
        let index = self.slot_index(child)?;
        if self.slots[index].parent.is_some() {
            return Err(SmError::AlreadyAttached);
        }

        let owner = match parent {
            Parent::Top => None,
            Parent::State { machine, .. } => {
                let owner = self.slot_index(machine)?;
                if self.is_ancestor_or_self(child, machine) {
                    return Err(SmError::InvalidParameter);
                }
                Some(owner)
            }
        };

        let slot = &mut self.slots[index];
        slot.parent = Some(parent);
        slot.seq = self.next_seq;
        slot.engaged = false;
        slot.detach_requested = false;
        self.next_seq = self.next_seq.wrapping_add(1);
        trace!("attached {}", child);

        if let Some(owner) = owner {
            if self.slots[owner].active {
                self.refresh_children(owner);
            }
        }
        Ok(())
    }

    /// Detaches `child` from `parent`. If the child is on the dispatch stack
    /// the removal takes effect when its dispatch returns.
    pub fn remove_subsm(&mut self, parent: Parent, child: SmId) -> SmResult<()> {
        let index = self.slot_index(child)?;
        if self.slots[index].parent != Some(parent) {
            return Err(SmError::NotAttached);
        }

        if self.slots[index].is_busy() {
            trace!("detach of {} deferred", child);
            self.slots[index].detach_requested = true;
        } else {
            self.detach(index);
        }
        Ok(())
    }

    pub fn sync_init(&mut self, current: u32, max: u32, wake: Event) -> SmResult<SyncId> {
        let object = SyncObject::new(current, max, wake)?;
        let index = self
            .syncs
            .iter()
            .position(Option::is_none)
            .ok_or(SmError::NoFreeSlot)?;
        self.syncs[index] = Some(object);
        Ok(SyncId(index as u8))
    }

    /// A free single-unit sync object.
    pub fn critical_init(&mut self, wake: Event) -> SmResult<SyncId> {
        self.sync_init(1, 1, wake)
    }

    pub fn semaphore_init(&mut self, count: u32, wake: Event) -> SmResult<SyncId> {
        self.sync_init(count, u32::MAX, wake)
    }

    /// Fails with [`SmError::Busy`] while machines wait on the object.
    pub fn sync_release(&mut self, sync: SyncId) -> SmResult<()> {
        if self.sync_ref(sync)?.waiting() > 0 {
            return Err(SmError::Busy);
        }
        self.syncs[sync.0 as usize] = None;
        Ok(())
    }

    pub fn sync_object(&self, sync: SyncId) -> SmResult<&SyncObject> {
        self.sync_ref(sync)
    }

    pub fn sync_increase(&mut self, sync: SyncId) -> SmResult<()> {
        let granted = self.sync_mut(sync)?.increase();
        self.wake(sync, granted);
        Ok(())
    }

    pub fn sync_decrease(&mut self, sync: SyncId, sm: SmId) -> SmResult<Acquire> {
        self.slot_index(sm)?;
        self.sync_mut(sync)?.decrease(sm)
    }

    pub fn sync_cancel(&mut self, sync: SyncId, sm: SmId) -> SmResult<()> {
        let granted = self.sync_mut(sync)?.cancel(sm);
        self.wake(sync, granted);
        Ok(())
    }

    fn slot_index(&self, id: SmId) -> SmResult<usize> {
        let index = id.index();
        match self.slots.get(index) {
            Some(slot) if slot.id == Some(id) => Ok(index),
            _ => Err(SmError::StaleHandle),
        }
    }

    fn sync_ref(&self, sync: SyncId) -> SmResult<&SyncObject> {
        self.syncs
            .get(sync.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SmError::InvalidParameter)
    }

    fn sync_mut(&mut self, sync: SyncId) -> SmResult<&mut SyncObject> {
        self.syncs
            .get_mut(sync.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(SmError::InvalidParameter)
    }

    // Posts the wake event to a granted waiter. A waiter that cannot be
    // reached gives its grant up to the next one.
    fn wake(&mut self, sync: SyncId, mut granted: Option<SmId>) {
        while let Some(sm) = granted {
            let Ok(object) = self.sync_ref(sync) else {
                return;
            };
            let evt = object.wake_event();
            match self.post_event(sm, evt) {
                Ok(()) => return,
                Err(err) => {
                    warn!("wake of {} failed: {}", sm, err);
                    granted = self.sync_mut(sync).ok().and_then(|object| object.cancel(sm));
                }
            }
        }
    }

    fn cancel_waits(&mut self, sm: SmId) {
        for index in 0..MAX_SYNC_OBJECTS {
            if let Some(object) = self.syncs[index].as_mut() {
                let granted = object.cancel(sm);
                self.wake(SyncId(index as u8), granted);
            }
        }
    }

    fn is_ancestor_or_self(&self, candidate: SmId, mut of: SmId) -> bool {
        for _ in 0..=MAX_MACHINES {
            if of == candidate {
                return true;
            }
            match self.slot_index(of).map(|index| self.slots[index].parent) {
                Ok(Some(Parent::State { machine, .. })) => of = machine,
                _ => return false,
            }
        }
        true
    }

    fn detach(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.parent = None;
        slot.engaged = false;
        slot.detach_requested = false;
        if let Some(id) = slot.id {
            trace!("detached {}", id);
        }
    }

    // Attached children of `scope`, oldest attachment first.
    fn children(&self, scope: Scope, out: &mut [u8; MAX_MACHINES]) -> usize {
        let mut count = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.id.is_some() && scope.holds(slot.parent) {
                out[count] = index as u8;
                count += 1;
            }
        }
        out[..count].sort_unstable_by_key(|&index| self.slots[index as usize].seq);
        count
    }

    fn visit(&mut self, scope: Scope, seen: &mut [bool; MAX_MACHINES]) {
        let mut order = [0u8; MAX_MACHINES];
        let count = self.children(scope, &mut order);

        for &index in &order[..count] {
            let index = index as usize;
            let slot = &self.slots[index];
            // an earlier sibling may have detached or released this one
            let Some(id) = slot.id else { continue };
            if seen[index] || !scope.holds(slot.parent) {
                continue;
            }
            if matches!(scope, Scope::Machine(_)) && !slot.engaged {
                continue;
            }

            seen[index] = true;
            self.drain(index);

            if self.slots[index].id == Some(id) && self.slots[index].active {
                self.visit(Scope::Machine(id), seen);
            }
        }
    }

    fn drain(&mut self, index: usize) -> usize {
        let Some(id) = self.slots[index].id else {
            return 0;
        };
        let mut handled = 0;

        for _ in 0..self.mailbox.queued(index) {
            if self.slots[index].id != Some(id) {
                break;
            }
            let Some(evt) = self.mailbox.take(index) else {
                break;
            };
            if !self.slots[index].active {
                trace!("{} inactive, dropped {}", id, evt);
                self.mailbox.counters().record_dropped_inactive();
                continue;
            }
            match self.run_slot(index, Delivery::Event(evt)) {
                Ok(_) => handled += 1,
                Err(err) => warn!("{} could not take {}: {}", id, evt, err),
            }
        }
        handled
    }

    fn run_slot(&mut self, index: usize, delivery: Delivery) -> SmResult<Outcome> {
        let id = self.slots[index].id.ok_or(SmError::StaleHandle)?;
        let machine = self.slots[index].machine.take().ok_or(SmError::Busy)?;

        self.depth += 1;
        let outcome = {
            let mut cx = Context {
                kernel: &mut *self,
                this: id,
            };
            match delivery {
                Delivery::Start => machine.start(&mut cx),
                Delivery::Event(evt) => machine.dispatch(&mut cx, evt),
            }
        };
        self.depth -= 1;

        // a machine on the dispatch stack cannot be released
        let slot = &mut self.slots[index];
        slot.machine = Some(machine);
        slot.evt_count = slot.evt_count.wrapping_add(1);
        self.mailbox.counters().record_dispatched();

        match outcome {
            Outcome::Handled | Outcome::Transitioned => {}
            Outcome::Unhandled => self.mailbox.counters().record_unhandled(),
            Outcome::Finished(status) => {
                debug!("{} finished: {}", id, status);
                self.slots[index].active = false;
                self.cancel_waits(id);
            }
            Outcome::Fault(err) => warn!("{} faulted: {}", id, err),
        }

        if self.slots[index].detach_requested {
            self.detach(index);
        }
        self.refresh_children(index);
        Ok(outcome)
    }

    // Starts children whose parent state was entered and deactivates those
    // whose parent state was left.
    fn refresh_children(&mut self, index: usize) {
        let Some(owner) = self.slots[index].id else {
            return;
        };
        let mut order = [0u8; MAX_MACHINES];
        let count = self.children(Scope::Machine(owner), &mut order);

        for &child in &order[..count] {
            let child = child as usize;
            let Some(Parent::State { machine, state }) = self.slots[child].parent else {
                continue;
            };
            if machine != owner {
                continue;
            }
            let owner_running = self.slots[index].active;
            let inside = match self.slots[index].machine.as_deref() {
                Some(parent) => owner_running && parent.in_state(state),
                None => continue,
            };

            let engaged = self.slots[child].engaged;
            if inside == engaged {
                continue;
            }

            // the queue does not survive a stop or a restart
            self.mailbox.discard(child);
            let slot = &mut self.slots[child];
            slot.engaged = inside;
            slot.active = inside;
            if inside {
                if let Err(err) = self.run_slot(child, Delivery::Start) {
                    warn!("sub-machine start failed: {}", err);
                }
            }
        }
    }
}

/// What a handler may do to the kernel while its machine is being
/// dispatched.
pub struct Context<'k, 'a> {
    kernel: &'k mut Kernel<'a>,
    this: SmId,
}

impl<'k, 'a> Context<'k, 'a> {
    /// The machine being dispatched.
    pub fn this(&self) -> SmId {
        self.this
    }

    pub fn mailbox(&self) -> &'a Mailbox {
        self.kernel.mailbox
    }

    /// Ordinary events are always queued here, even under
    /// [`DispatchPolicy::Immediate`]. Instant events run the target now.
    pub fn post(&mut self, target: SmId, evt: Event) -> SmResult<()> {
        self.kernel.post_event(target, evt)
    }

    pub fn post_self(&mut self, evt: Event) -> SmResult<()> {
        self.kernel.post_event(self.this, evt)
    }

    pub fn post_pending(&self, target: SmId, evt: Event) -> SmResult<()> {
        self.kernel.mailbox.post_pending(target, evt)
    }

    pub fn init(&mut self, id: SmId, autopoll: bool) -> SmResult<()> {
        self.kernel.init(id, autopoll)
    }

    pub fn set_active(&mut self, id: SmId, active: bool) -> SmResult<()> {
        self.kernel.set_active(id, active)
    }

    pub fn is_active(&self, id: SmId) -> bool {
        self.kernel.is_active(id)
    }

    pub fn evt_count(&self, id: SmId) -> SmResult<u32> {
        self.kernel.evt_count(id)
    }

    pub fn add_subsm(&mut self, parent: Parent, child: SmId) -> SmResult<()> {
        self.kernel.add_subsm(parent, child)
    }

    pub fn remove_subsm(&mut self, parent: Parent, child: SmId) -> SmResult<()> {
        self.kernel.remove_subsm(parent, child)
    }

    pub fn sync_increase(&mut self, sync: SyncId) -> SmResult<()> {
        self.kernel.sync_increase(sync)
    }

    /// Takes one unit for this machine or joins the wait set.
    pub fn sync_decrease(&mut self, sync: SyncId) -> SmResult<Acquire> {
        self.kernel.sync_decrease(sync, self.this)
    }

    pub fn sync_cancel(&mut self, sync: SyncId) -> SmResult<()> {
        self.kernel.sync_cancel(sync, self.this)
    }

    pub fn critical_enter(&mut self, sync: SyncId) -> SmResult<Acquire> {
        self.sync_decrease(sync)
    }

    pub fn critical_leave(&mut self, sync: SyncId) -> SmResult<()> {
        self.sync_increase(sync)
    }
}
