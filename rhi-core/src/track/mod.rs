/*! Resource State Tracking
 *
 * Every tracked resource owns the state of each of its subresources, as it
 * will be once all submitted work has executed. That state only changes
 * through the transition path:
 *
 * - While recording, each command list keeps its own view of the states of
 *   the resources it touches in a [`CommandListTracker`]. The first use of a
 *   resource in a list does not know the before state, since lists may be
 *   recorded in parallel and executed in any order. That transition is
 *   recorded as a [`PendingTransition`] instead of a barrier.
 * - Later uses in the same list compare against the list's view and emit a
 *   barrier only when [`is_transition_needed`] says so.
 * - When the list is executed, its pending transitions are resolved against
 *   the resource's state into barriers recorded in a separate list placed
 *   just before it, and the list's final states become the resource's state.
 *
 * States of all subresources are collapsed into one value whenever they
 * agree, so the common whole-resource case is a single comparison.
!*/

mod list;

use std::fmt;

use hal::{ResourceStates, Subresource};
use smallvec::SmallVec;

use crate::fatal;

pub use list::{CommandListTracker, PendingTransition};

/// Returns the state to transition to, or `None` if `before` already
/// satisfies `after`.
///
/// - `COMMON` is the empty set, so it is only satisfied by `COMMON` itself.
/// - A state that contains all bits of `after` satisfies it.
/// - `DEPTH_WRITE` satisfies `DEPTH_READ`.
/// - Moving between read-only states keeps the read bits already set.
pub fn transition_target(before: ResourceStates, after: ResourceStates) -> Option<ResourceStates> {
    if after == ResourceStates::COMMON {
        return (before != ResourceStates::COMMON).then_some(after);
    }
    if before == ResourceStates::DEPTH_WRITE && after == ResourceStates::DEPTH_READ {
        return None;
    }
    if before.contains(after) {
        return None;
    }
    if before.is_read_only() && after.is_read_only() {
        return Some(after | before);
    }
    Some(after)
}

pub fn is_transition_needed(before: ResourceStates, after: ResourceStates) -> bool {
    transition_target(before, after).is_some()
}

/// State of a subresource as seen by a command list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackedState {
    /// To be determined when the list is executed.
    Unknown,
    Known(ResourceStates),
}

/// The states of all subresources of one resource, collapsed to a single
/// value while they all agree.
#[derive(Clone, PartialEq, Eq)]
pub struct SubresourceStates<S> {
    count: u32,
    whole: Option<S>,
    split: SmallVec<[S; 4]>,
}

impl<S: Copy + PartialEq> SubresourceStates<S> {
    pub fn new(count: u32, state: S) -> Self {
        Self {
            count: count.max(1),
            whole: Some(state),
            split: SmallVec::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// The state shared by every subresource, if there is one.
    pub fn uniform(&self) -> Option<S> {
        self.whole
    }

    pub fn get(&self, index: u32) -> S {
        if index >= self.count {
            fatal!("Subresource {index} out of range of {} subresources", self.count);
        }
        match self.whole {
            Some(state) => state,
            None => self.split[index as usize],
        }
    }

    pub fn set(&mut self, subresource: Subresource, state: S) {
        match subresource {
            Subresource::All => {
                self.whole = Some(state);
                self.split.clear();
            }
            Subresource::Index(index) => {
                if index >= self.count {
                    fatal!("Subresource {index} out of range of {} subresources", self.count);
                }
                if let Some(whole) = self.whole {
                    if whole == state {
                        return;
                    }
                    self.split = SmallVec::from_elem(whole, self.count as usize);
                    self.whole = None;
                }
                self.split[index as usize] = state;
                self.collapse();
            }
        }
    }

    fn collapse(&mut self) {
        let first = self.split[0];
        if self.split.iter().all(|&state| state == first) {
            self.whole = Some(first);
            self.split.clear();
        }
    }

    /// Every subresource index with its state.
    pub fn iter(&self) -> impl Iterator<Item = (u32, S)> + '_ {
        (0..self.count).map(move |index| (index, self.get(index)))
    }
}

impl<S: fmt::Debug> fmt::Debug for SubresourceStates<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.whole {
            Some(ref state) => write!(f, "All({state:?})"),
            None => f.debug_list().entries(self.split.iter()).finish(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PSR: ResourceStates = ResourceStates::PIXEL_SHADER_RESOURCE;
    const NPSR: ResourceStates = ResourceStates::NON_PIXEL_SHADER_RESOURCE;

    #[test]
    fn superset_needs_no_transition() {
        assert!(!is_transition_needed(ResourceStates::GENERIC_READ, PSR));
        assert!(!is_transition_needed(PSR | NPSR, NPSR));
        assert!(!is_transition_needed(
            ResourceStates::RENDER_TARGET,
            ResourceStates::RENDER_TARGET
        ));
        assert!(is_transition_needed(PSR, ResourceStates::RENDER_TARGET));
    }

    #[test]
    fn depth_write_satisfies_depth_read() {
        assert!(!is_transition_needed(
            ResourceStates::DEPTH_WRITE,
            ResourceStates::DEPTH_READ
        ));
        assert!(is_transition_needed(
            ResourceStates::DEPTH_READ,
            ResourceStates::DEPTH_WRITE
        ));
    }

    #[test]
    fn common_is_only_satisfied_by_common() {
        assert!(!is_transition_needed(ResourceStates::COMMON, ResourceStates::COMMON));
        assert_eq!(
            transition_target(ResourceStates::COPY_DEST, ResourceStates::COMMON),
            Some(ResourceStates::COMMON)
        );
        assert_eq!(
            transition_target(ResourceStates::COMMON, ResourceStates::COPY_DEST),
            Some(ResourceStates::COPY_DEST)
        );
    }

    #[test]
    fn read_to_read_keeps_read_bits() {
        assert_eq!(transition_target(PSR, NPSR), Some(PSR | NPSR));
        assert_eq!(
            transition_target(ResourceStates::COPY_SOURCE, ResourceStates::INDEX_BUFFER),
            Some(ResourceStates::COPY_SOURCE | ResourceStates::INDEX_BUFFER)
        );
        assert_eq!(
            transition_target(ResourceStates::COPY_DEST, PSR),
            Some(PSR)
        );
    }

    #[test]
    fn subresource_states_collapse() {
        let mut states = SubresourceStates::new(3, ResourceStates::COMMON);
        states.set(Subresource::Index(1), PSR);
        assert_eq!(states.uniform(), None);
        assert_eq!(states.get(0), ResourceStates::COMMON);
        assert_eq!(states.get(1), PSR);

        states.set(Subresource::Index(0), PSR);
        assert_eq!(states.uniform(), None);
        states.set(Subresource::Index(2), PSR);
        assert_eq!(states.uniform(), Some(PSR));

        states.set(Subresource::Index(2), PSR);
        assert_eq!(states.uniform(), Some(PSR));
        assert_eq!(
            states.iter().collect::<Vec<_>>(),
            [(0, PSR), (1, PSR), (2, PSR)]
        );
    }

    #[test]
    #[should_panic]
    fn out_of_range_subresource_is_fatal() {
        let mut states = SubresourceStates::new(2, TrackedState::Unknown);
        states.set(Subresource::Index(2), TrackedState::Known(PSR));
    }
}
