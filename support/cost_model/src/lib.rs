//! Cost model for the three line-remap strategies (`NONE`, `PART`, `FULL`).
//!
//! Given the current state of every page in a line, [`choose`] picks the
//! cheapest strategy that is still feasible: `NONE` mutates pages in
//! place, `PART` allocates a new mapping and copies only the pages that
//! are not already virtual-private (the rest ride along via CoW), `FULL`
//! allocates a new mapping and copies every page.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

bitflags! {
    /// State of one page, as tracked by the line/page engine (C5).
    ///
    /// `COMMITTED` is the low bit shared by every state that has physical
    /// backing; `VIRTUAL_PRIVATE` is an orthogonal modifier that can be
    /// combined with `COPIED` or `DECOMMITTED`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct PageState: u8 {
        const NOT_COMMITTED    = 0;
        const COMMITTED        = 1 << 0;
        const MAPPED_SHARED    = (1 << 1) | Self::COMMITTED.bits();
        const MAPPED_PRIVATE   = (1 << 2) | Self::COMMITTED.bits();
        const COPIED           = (1 << 3) | Self::COMMITTED.bits();
        const VIRTUAL_PRIVATE  = 1 << 4;
        const DECOMMITTED      = 1 << 5;
    }
}

impl PageState {
    /// A page is committed iff its state carries the `COMMITTED` bit.
    pub fn is_committed(self) -> bool {
        self.contains(Self::COMMITTED)
    }

    /// `COPIED` without `VIRTUAL_PRIVATE` means the page's content is only
    /// reachable through this line's own private copy; nothing else may
    /// service a read of it, so any remap must materialize a full private
    /// copy up front (§4.9: "forces at least REMAP_FULL").
    fn forces_full(self) -> bool {
        self.contains(Self::COPIED) && !self.contains(Self::VIRTUAL_PRIVATE)
    }

    /// Pages tagged `VIRTUAL_PRIVATE` are already shared-but-private; a
    /// `PART` remap can let them ride along on the new mapping without a
    /// byte copy.
    fn free_under_part(self) -> bool {
        self.contains(Self::VIRTUAL_PRIVATE)
    }
}

/// One of the three ways a line's mapping can be transformed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RemapStrategy {
    /// Keep the current mapping; mutate pages in place.
    None,
    /// Allocate a new mapping; copy only pages that are not virtual-private.
    Part,
    /// Allocate a new mapping; copy every page.
    Full,
}

/// `(bytes copied, pages freshly allocated)` for a candidate strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Cost {
    pub bytes: usize,
    pub page_allocations: usize,
}

impl Cost {
    pub fn total(&self, page_allocate_cost: usize) -> usize {
        self.bytes + self.page_allocations * page_allocate_cost
    }
}

/// The line contains the allocator's own live state, so no strategy that
/// tears down and rebuilds its mapping may be chosen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SelfContainedConflict;

fn tally(states: &[PageState], strategy: RemapStrategy, page_size: usize) -> Cost {
    match strategy {
        RemapStrategy::None => Cost::default(),
        RemapStrategy::Part => states.iter().fold(Cost::default(), |mut acc, &state| {
            if !state.free_under_part() {
                acc.bytes += page_size;
                acc.page_allocations += 1;
            }
            acc
        }),
        RemapStrategy::Full => Cost {
            bytes: states.len() * page_size,
            page_allocations: states.len(),
        },
    }
}

fn forced_minimum(states: &[PageState]) -> RemapStrategy {
    if states.iter().any(|s| s.forces_full()) {
        RemapStrategy::Full
    } else {
        RemapStrategy::None
    }
}

/// Pick the cheapest feasible strategy for a line whose pages currently
/// have `states`.
///
/// `self_contained` disqualifies `PART` and `FULL` (the allocator cannot
/// remap the memory it is executing in); if the states also force at
/// least `FULL`, no strategy is feasible and `Err` is returned.
pub fn choose(
    states: &[PageState],
    self_contained: bool,
    page_size: usize,
    page_allocate_cost: usize,
) -> Result<(RemapStrategy, Cost), SelfContainedConflict> {
    let minimum = forced_minimum(states);

    if self_contained {
        return if minimum == RemapStrategy::None {
            Ok((RemapStrategy::None, Cost::default()))
        } else {
            Err(SelfContainedConflict)
        };
    }

    let candidates: &[RemapStrategy] = match minimum {
        RemapStrategy::None => &[RemapStrategy::None, RemapStrategy::Part, RemapStrategy::Full],
        RemapStrategy::Part => &[RemapStrategy::Part, RemapStrategy::Full],
        RemapStrategy::Full => &[RemapStrategy::Full],
    };

    let best = candidates
        .iter()
        .map(|&strategy| (strategy, tally(states, strategy, page_size)))
        .min_by_key(|(strategy, cost)| (cost.total(page_allocate_cost), *strategy))
        .expect("candidates is never empty");

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;
    const PAGE_ALLOCATE_COST: usize = 4096;

    #[test]
    fn all_not_committed_prefers_none() {
        let states = [PageState::NOT_COMMITTED; 4];
        let (strategy, cost) = choose(&states, false, PAGE_SIZE, PAGE_ALLOCATE_COST).unwrap();
        assert_eq!(strategy, RemapStrategy::None);
        assert_eq!(cost, Cost::default());
    }

    #[test]
    fn copied_without_virtual_private_forces_full() {
        let states = [
            PageState::MAPPED_PRIVATE,
            PageState::COPIED,
            PageState::NOT_COMMITTED,
        ];
        let (strategy, cost) = choose(&states, false, PAGE_SIZE, PAGE_ALLOCATE_COST).unwrap();
        assert_eq!(strategy, RemapStrategy::Full);
        assert_eq!(cost.page_allocations, states.len());
        assert_eq!(cost.bytes, states.len() * PAGE_SIZE);
    }

    #[test]
    fn virtual_private_pages_are_free_under_part() {
        let states = [
            PageState::COPIED | PageState::VIRTUAL_PRIVATE,
            PageState::DECOMMITTED | PageState::VIRTUAL_PRIVATE,
            PageState::MAPPED_SHARED,
        ];
        let part_cost = tally(&states, RemapStrategy::Part, PAGE_SIZE);
        // Only the non-virtual-private MAPPED_SHARED page must be copied.
        assert_eq!(part_cost.page_allocations, 1);
        assert_eq!(part_cost.bytes, PAGE_SIZE);

        let (strategy, cost) = choose(&states, false, PAGE_SIZE, PAGE_ALLOCATE_COST).unwrap();
        assert_eq!(strategy, RemapStrategy::Part);
        assert_eq!(cost, part_cost);
    }

    #[test]
    fn self_contained_line_is_stuck_with_none() {
        let states = [PageState::MAPPED_SHARED, PageState::NOT_COMMITTED];
        let (strategy, cost) = choose(&states, true, PAGE_SIZE, PAGE_ALLOCATE_COST).unwrap();
        assert_eq!(strategy, RemapStrategy::None);
        assert_eq!(cost, Cost::default());
    }

    #[test]
    fn self_contained_line_with_forced_full_is_infeasible() {
        let states = [PageState::COPIED];
        assert_eq!(
            choose(&states, true, PAGE_SIZE, PAGE_ALLOCATE_COST),
            Err(SelfContainedConflict)
        );
    }

    #[test]
    fn full_is_never_cheaper_than_part_when_part_is_feasible() {
        let states = [
            PageState::MAPPED_PRIVATE,
            PageState::COPIED | PageState::VIRTUAL_PRIVATE,
        ];
        let part = tally(&states, RemapStrategy::Part, PAGE_SIZE);
        let full = tally(&states, RemapStrategy::Full, PAGE_SIZE);
        assert!(part.total(PAGE_ALLOCATE_COST) <= full.total(PAGE_ALLOCATE_COST));
    }
}
