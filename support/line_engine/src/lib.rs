//! Commit and copy-on-write engine for lines of OS pages.
//!
//! A [`Line`] is the unit the heap shell hands out: a run of pages that
//! share one [`vm_os::Mapping`] and therefore one OS-level protection and
//! backing-object identity. Each page within a line has its own
//! [`PageState`](cost_model::PageState); [`Line::commit`]/[`Line::decommit`]
//! move individual pages between states, and [`Line::copy_from`] walks the
//! cost model (`cost_model::choose`) to pick the cheapest way to duplicate
//! one line's contents into another.

use std::sync::Mutex;

use cost_model::{PageState, RemapStrategy};
use log::{debug, trace};
use snafu::Snafu;
use vm_os::{Mapping, Protection, VirtualMemory, VmOsError};

/// Errors a line operation can fail with.
#[derive(Debug, Snafu)]
pub enum LineError {
    #[snafu(display("page index {index} is out of range for a {page_count}-page line"))]
    PageOutOfRange { index: usize, page_count: usize },
    #[snafu(display("line and OS virtual memory operation failed: {source}"))]
    Os { source: VmOsError },
    #[snafu(display("line contains the allocator's own live state; remap is not possible"))]
    SelfContained,
}

impl From<VmOsError> for LineError {
    fn from(source: VmOsError) -> Self {
        LineError::Os { source }
    }
}

/// A run of pages sharing one mapping handle.
///
/// All mutable state (the per-page state array, and the OS calls that
/// change it) is behind one `Mutex`, per the concurrency model's
/// requirement that "implementations must introduce a per-mapping mutex":
/// two threads racing to commit overlapping ranges of the same line must
/// serialize, since both would otherwise observe and write stale
/// `page_states` entries.
pub struct Line {
    mapping: Mapping,
    page_size: usize,
    states: Mutex<Vec<PageState>>,
    self_contained: bool,
}

impl Line {
    /// Reserve a fresh line of `page_count` pages, all `NOT_COMMITTED`.
    pub fn new(
        vm: &dyn VirtualMemory,
        page_count: usize,
        self_contained: bool,
    ) -> Result<Self, LineError> {
        let page_size = vm.page_size();
        let mapping = vm.reserve(page_count * page_size)?;
        Ok(Self {
            mapping,
            page_size,
            states: Mutex::new(vec![PageState::NOT_COMMITTED; page_count]),
            self_contained,
        })
    }

    pub fn page_count(&self) -> usize {
        self.states.lock().expect("line mutex poisoned").len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn state_of(&self, page: usize) -> Result<PageState, LineError> {
        let states = self.states.lock().expect("line mutex poisoned");
        states
            .get(page)
            .copied()
            .ok_or(LineError::PageOutOfRange {
                index: page,
                page_count: states.len(),
            })
    }

    /// Raw pointer to the start of `page` within this line's mapping.
    /// Bytes are only meaningful for pages this line currently reports
    /// committed — the caller owns that check, the same way a real
    /// consumer of the allocator would.
    pub fn page_ptr(&self, page: usize) -> Result<*mut u8, LineError> {
        let states = self.states.lock().expect("line mutex poisoned");
        self.bounds_check(&states, page, 1)?;
        Ok(self.mapping.addr.as_ptr().wrapping_add(page * self.page_size))
    }

    /// Demand-page `[first, first + count)`: give every not-yet-committed
    /// page in the range physical backing owned directly by this line
    /// (`MAPPED_SHARED` — this is the line's own source-of-truth copy,
    /// not an alias of anyone else's).
    pub fn commit(
        &self,
        vm: &dyn VirtualMemory,
        first: usize,
        count: usize,
    ) -> Result<(), LineError> {
        let mut states = self.states.lock().expect("line mutex poisoned");
        self.bounds_check(&states, first, count)?;

        for page in first..first + count {
            if states[page].is_committed() {
                continue;
            }
            let offset = page * self.page_size;
            vm.commit(&self.mapping, offset, self.page_size, Protection::ReadWrite, None)?;
            states[page] = PageState::MAPPED_SHARED;
            trace!("committed page {page}");
        }
        Ok(())
    }

    /// Release physical backing for `[first, first + count)`.
    pub fn decommit(
        &self,
        vm: &dyn VirtualMemory,
        first: usize,
        count: usize,
    ) -> Result<(), LineError> {
        let mut states = self.states.lock().expect("line mutex poisoned");
        self.bounds_check(&states, first, count)?;

        for page in first..first + count {
            if !states[page].is_committed() {
                continue;
            }
            let offset = page * self.page_size;
            vm.decommit(&self.mapping, offset, self.page_size)?;
            let virtual_private = states[page].contains(PageState::VIRTUAL_PRIVATE);
            states[page] = PageState::DECOMMITTED
                | if virtual_private {
                    PageState::VIRTUAL_PRIVATE
                } else {
                    PageState::empty()
                };
            trace!("decommitted page {page}");
        }
        Ok(())
    }

    /// Duplicate `self`'s pages into `dst`, choosing the cheapest feasible
    /// remap strategy via the cost model.
    ///
    /// Same-line copies short-circuit immediately (identity has nothing to
    /// duplicate), matching the original's `dst == src` fast path.
    pub fn copy_from(
        &self,
        vm: &dyn VirtualMemory,
        dst: &Line,
        page_allocate_cost: usize,
    ) -> Result<RemapStrategy, LineError> {
        if std::ptr::eq(self, dst) {
            return Ok(RemapStrategy::None);
        }

        // Lock in address order to avoid the classic two-line deadlock
        // when another thread is simultaneously copying the other
        // direction between the same pair of lines.
        let self_first = (self as *const Line as usize) <= (dst as *const Line as usize);
        let (src_states, mut dst_states) = if self_first {
            let src = self.states.lock().expect("line mutex poisoned");
            let dst = dst.states.lock().expect("line mutex poisoned");
            (src, dst)
        } else {
            let dst_guard = dst.states.lock().expect("line mutex poisoned");
            let src_guard = self.states.lock().expect("line mutex poisoned");
            (src_guard, dst_guard)
        };

        if src_states.len() != dst_states.len() {
            return Err(LineError::PageOutOfRange {
                index: dst_states.len(),
                page_count: src_states.len(),
            });
        }

        let (strategy, _cost) = cost_model::choose(
            &src_states,
            self.self_contained || dst.self_contained,
            self.page_size,
            page_allocate_cost,
        )
        .map_err(|_| LineError::SelfContained)?;

        if strategy == RemapStrategy::None {
            debug!("copy is a no-op remap ({strategy:?})");
            return Ok(strategy);
        }

        for page in 0..src_states.len() {
            let src_state = src_states[page];
            if !src_state.is_committed() && strategy != RemapStrategy::Full {
                continue;
            }
            let offset = page * self.page_size;

            if src_state.contains(PageState::VIRTUAL_PRIVATE) {
                // Already shared-but-private: alias the same backing
                // object instead of copying bytes.
                vm.commit(
                    &dst.mapping,
                    offset,
                    self.page_size,
                    Protection::ReadWrite,
                    Some((&self.mapping, offset)),
                )?;
                dst_states[page] = src_state;
            } else if src_state.is_committed() {
                // A genuinely shared or already-private page: break the
                // sharing lineage with a real byte copy, so the new page's
                // backing is independent of the original's.
                vm.commit(&dst.mapping, offset, self.page_size, Protection::ReadWrite, None)?;
                // SAFETY: both ranges were just committed read-write by
                // this line engine and are exactly `page_size` long.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.mapping.addr.as_ptr().add(offset),
                        dst.mapping.addr.as_ptr().add(offset),
                        self.page_size,
                    );
                }
                dst_states[page] = PageState::COPIED;
            } else {
                dst_states[page] = PageState::NOT_COMMITTED;
            }
        }

        debug!(
            "copy complete: {strategy:?} across {} pages",
            src_states.len()
        );
        Ok(strategy)
    }

    fn bounds_check(&self, states: &[PageState], first: usize, count: usize) -> Result<(), LineError> {
        let end = first.checked_add(count).unwrap_or(usize::MAX);
        if end > states.len() {
            return Err(LineError::PageOutOfRange {
                index: end,
                page_count: states.len(),
            });
        }
        Ok(())
    }

    pub fn unmap(self, vm: &dyn VirtualMemory) -> Result<(), LineError> {
        vm.unmap(self.mapping)?;
        Ok(())
    }
}
