//! Hierarchical states.
//!
//! States are declared as `static` items so their address can serve as their
//! identity:
//!
//! ```ignore
//! static ONLINE: State<Link> = State::new("online", online);
//! static SENDING: State<Link> = State::with_parent("sending", sending, &ONLINE);
//! ```

use crate::config::MAX_STATE_DEPTH;
use crate::event::Event;
use crate::kernel::Context;
use core::fmt;

/// Signature shared by every state handler of machines carrying data `D`.
pub type Handler<D> = fn(&mut Context<'_, '_>, &mut D, Event) -> Transition<D>;

/// What a state handler asks the engine to do after an event.
pub enum Transition<D: 'static> {
    /// Consumed; stay in the current state.
    Handled,
    /// Consumed; leave the current state for the given one.
    To(&'static State<D>),
    /// Not handled here; offer the event to the parent state.
    Unhandled,
}

impl<D> Clone for Transition<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Transition<D> {}

impl<D> fmt::Debug for Transition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Handled => f.write_str("Handled"),
            Transition::To(state) => write!(f, "To({})", state.name()),
            Transition::Unhandled => f.write_str("Unhandled"),
        }
    }
}

/// Address-based identity of a `static` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateKey(usize);

pub struct State<D: 'static> {
    name: &'static str,
    handler: Handler<D>,
    parent: Option<&'static State<D>>,
}

impl<D> State<D> {
    /// A top state (no parent).
    pub const fn new(name: &'static str, handler: Handler<D>) -> Self {
        State {
            name,
            handler,
            parent: None,
        }
    }

    pub const fn with_parent(
        name: &'static str,
        handler: Handler<D>,
        parent: &'static State<D>,
    ) -> Self {
        State {
            name,
            handler,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static State<D>> {
        self.parent
    }

    pub fn key(&self) -> StateKey {
        StateKey(self as *const State<D> as usize)
    }

    pub fn handle(&self, cx: &mut Context<'_, '_>, data: &mut D, evt: Event) -> Transition<D> {
        (self.handler)(cx, data, evt)
    }

    /// Whether `key` names this state or one of its ancestors.
    pub fn is_within(&self, key: StateKey) -> bool {
        let mut state = Some(self);
        for _ in 0..MAX_STATE_DEPTH {
            match state {
                Some(s) if s.key() == key => return true,
                Some(s) => state = s.parent.map(|p| p as &State<D>),
                None => return false,
            }
        }
        false
    }

    /// Number of ancestors above this state.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut state = self.parent;
        while let Some(s) = state {
            depth += 1;
            if depth >= MAX_STATE_DEPTH {
                break;
            }
            state = s.parent;
        }
        depth
    }
}

impl<D> fmt::Debug for State<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("parent", &self.parent.map(|p| p.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    fn ignore(_: &mut Context<'_, '_>, _: &mut Nothing, _: Event) -> Transition<Nothing> {
        Transition::Unhandled
    }

    static ROOT: State<Nothing> = State::new("root", ignore);
    static MIDDLE: State<Nothing> = State::with_parent("middle", ignore, &ROOT);
    static LEAF: State<Nothing> = State::with_parent("leaf", ignore, &MIDDLE);
    static OTHER: State<Nothing> = State::new("other", ignore);

    #[test]
    fn test_static_states_have_distinct_keys() {
        assert_eq!(ROOT.key(), ROOT.key());
        assert_ne!(ROOT.key(), MIDDLE.key());
        assert_ne!(LEAF.key(), OTHER.key());
    }

    #[test]
    fn test_is_within_walks_ancestors() {
        assert!(LEAF.is_within(LEAF.key()));
        assert!(LEAF.is_within(MIDDLE.key()));
        assert!(LEAF.is_within(ROOT.key()));
        assert!(!LEAF.is_within(OTHER.key()));
        assert!(!ROOT.is_within(LEAF.key()));
    }

    #[test]
    fn test_depth() {
        assert_eq!(ROOT.depth(), 0);
        assert_eq!(LEAF.depth(), 2);
        assert_eq!(LEAF.parent().map(|p| p.name()), Some("middle"));
    }
}
