//! The `Memory` façade (C7): the single entry point callers use to
//! allocate, commit, decommit, copy, and query regions of the heap, by
//! address rather than by an opaque handle — matching §6's operation
//! table, where `p`/`dst`/`src` are addresses (unit offsets from the
//! base of the heap) the caller already holds.
//!
//! Internally it routes size-based requests to the [`heap::Heap`] shell
//! (C4, a set of buddy-allocator [`HeapDirectory`](heap_directory::HeapDirectory)
//! partitions) and backs every live allocation with a
//! [`line_engine::Line`] for the actual OS-level demand paging and
//! copy-on-write.
//!
//! This is deliberately *not* the thin one-line static forwarder some
//! codebases name "Memory" — this is the routing engine itself; nothing
//! sits in front of it.

pub mod heap;
mod profile_select;

use std::collections::HashMap;
use std::sync::RwLock;

use bitflags::bitflags;
use heap_directory::HeapDirectoryError;
use line_engine::{Line, LineError};
use log::info;
use snafu::Snafu;
use vm_os::{UnixVirtualMemory, VirtualMemory};

pub use heap::{Heap, HeapBlock};
pub use heap_directory::UNIT_SIZE;

bitflags! {
    /// Request flags accepted by [`Memory::allocate`] and
    /// [`Memory::copy`] (§6). Not every variant accepts every flag; see
    /// each method's doc comment for the subset it validates.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct AllocationFlags: u32 {
        /// Reserve address space only; leave it not committed.
        const RESERVED   = 1 << 0;
        /// Zero-fill freshly committed pages (our backing is always
        /// zero-filled on commit, so this is a no-op acknowledged for
        /// interface compatibility rather than extra work).
        const ZERO_INIT  = 1 << 1;
        /// Fail rather than place the allocation anywhere but the exact
        /// requested address.
        const EXACTLY    = 1 << 2;
        /// Map the range read-only.
        const READ_ONLY  = 1 << 3;
        /// (`copy` only) allocate a fresh destination instead of reusing
        /// an existing one.
        const ALLOCATE   = 1 << 4;
        /// (`copy` only) decommit the source range once the copy is done.
        const DECOMMIT   = 1 << 5;
        /// (`copy` only) release the source range once the copy is done.
        const RELEASE    = 1 << 6;
    }
}

const ALLOCATE_ACCEPTED: AllocationFlags = AllocationFlags::RESERVED
    .union(AllocationFlags::ZERO_INIT)
    .union(AllocationFlags::EXACTLY)
    .union(AllocationFlags::READ_ONLY)
    .union(AllocationFlags::ALLOCATE);

const COPY_ACCEPTED: AllocationFlags = AllocationFlags::DECOMMIT
    .union(AllocationFlags::RELEASE)
    .union(AllocationFlags::ALLOCATE)
    .union(AllocationFlags::EXACTLY)
    .union(AllocationFlags::ZERO_INIT)
    .union(AllocationFlags::READ_ONLY);

/// Errors the `Memory` façade can return (§7): a fixed, small set of
/// kinds rather than one variant per subsystem, so callers can match on
/// them without knowing whether a failure originated in the directory,
/// the line engine, or the OS.
#[derive(Debug, Snafu)]
pub enum MemoryError {
    #[snafu(display("invalid parameter: {reason}"))]
    BadParam { reason: &'static str },
    #[snafu(display("invalid or conflicting flag combination"))]
    InvFlag,
    #[snafu(display("no free block of the requested size is available"))]
    NoMemory,
    #[snafu(display("address does not refer to a live allocation"))]
    FreeMem,
    #[snafu(display("range is not currently committed"))]
    MemNotCommitted,
    #[snafu(display("internal invariant violation: {reason}"))]
    Internal { reason: String },
}

impl From<HeapDirectoryError> for MemoryError {
    fn from(source: HeapDirectoryError) -> Self {
        match source {
            HeapDirectoryError::OutOfMemory => MemoryError::NoMemory,
            HeapDirectoryError::SizeOutOfRange | HeapDirectoryError::OffsetOutOfRange => {
                MemoryError::BadParam {
                    reason: "size or offset outside the heap's address range",
                }
            }
            HeapDirectoryError::NotAllocated => MemoryError::FreeMem,
            HeapDirectoryError::BadBackingStorage => MemoryError::Internal {
                reason: "directory backing storage size mismatch".into(),
            },
        }
    }
}

impl From<LineError> for MemoryError {
    fn from(source: LineError) -> Self {
        match source {
            LineError::PageOutOfRange { .. } => MemoryError::BadParam {
                reason: "page range outside the allocation",
            },
            LineError::SelfContained => MemoryError::InvFlag,
            LineError::Os { source } => MemoryError::Internal {
                reason: source.to_string(),
            },
        }
    }
}

/// What [`Memory::query`] can be asked for (§6's `QueryParam` list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryParam {
    /// Granularity `allocate`'s `cb`/`p` are rounded to, in bytes.
    AllocationUnit,
    /// Granularity at which two allocations may share physical pages,
    /// in bytes (the OS page size).
    SharingUnit,
    /// Granularity `commit`/`decommit` operate at, in bytes.
    CommitUnit,
    /// Hint for the most efficient commit granularity; equal to
    /// `CommitUnit` in this implementation.
    OptimalCommitUnit,
    /// Granularity protection changes apply at, in bytes.
    ProtectionUnit,
    /// Start of the address space this `Memory` manages, in bytes.
    AllocationSpaceBegin,
    /// End of the address space this `Memory` manages, in bytes.
    AllocationSpaceEnd,
    /// The flags the allocation at `p` was created with.
    Flags,
}

/// Where an allocation's units live in the heap shell: a single
/// size-based block (`Heap::allocate`), or an arbitrary range covered by
/// the greedy multi-block walk (`Heap::allocate_range`). The latter
/// carries just the range it covers rather than the individual blocks —
/// `Heap::release_range` recomputes the same canonical decomposition,
/// so there is nothing else release needs to remember.
enum Placement {
    Block(HeapBlock),
    Range { unit_offset: usize, units: usize },
}

struct Allocation {
    placement: Placement,
    line: Line,
    flags: AllocationFlags,
}

/// The memory façade: owns the heap shell and every live allocation's
/// backing line, addressed by unit offset from the base of the heap.
pub struct Memory {
    heap: Heap,
    vm: Box<dyn VirtualMemory>,
    page_allocate_cost: usize,
    allocations: RwLock<HashMap<usize, Allocation>>,
}

impl Memory {
    /// Build a façade over `partition_count` heap directory partitions,
    /// backed by the hosted OS's virtual memory.
    pub fn new(partition_count: usize) -> Result<Self, MemoryError> {
        let vm = UnixVirtualMemory::new();
        let page_allocate_cost = vm.page_size();
        Ok(Self {
            heap: Heap::new(partition_count)?,
            vm: Box::new(vm),
            page_allocate_cost,
            allocations: RwLock::new(HashMap::new()),
        })
    }

    pub fn capacity_units(&self) -> usize {
        self.heap.capacity_units()
    }

    /// `allocate(p, cb, flags)` (§6): if `p` is `None`, place the
    /// allocation anywhere large enough (C2 allocate-by-size); otherwise
    /// cover the exact `[p, p + cb)` range (C3 allocate-by-range), which
    /// may span a mix of block sizes if `p`/`cb` are not aligned to one
    /// power-of-two block. Unless `RESERVED` is set, the whole range is
    /// committed immediately; committed pages are always zero-filled, so
    /// `ZERO_INIT` needs no extra work here.
    pub fn allocate(&self, p: Option<usize>, cb: usize, flags: AllocationFlags) -> Result<usize, MemoryError> {
        if !ALLOCATE_ACCEPTED.contains(flags) {
            return Err(MemoryError::InvFlag);
        }
        let units = cb.div_ceil(UNIT_SIZE);

        let (unit_offset, placement) = match p {
            Some(addr) => {
                self.heap.allocate_range(addr, units)?;
                (addr, Placement::Range { unit_offset: addr, units })
            }
            None => {
                let block = self.heap.allocate(units)?;
                (block.unit_offset(&self.heap), Placement::Block(block))
            }
        };

        let line = self.new_line(units)?;
        if !flags.contains(AllocationFlags::RESERVED) {
            line.commit(self.vm.as_ref(), 0, line.page_count())?;
        }

        self.allocations.write().expect("allocation table poisoned").insert(
            unit_offset,
            Allocation { placement, line, flags },
        );
        info!("allocated {units} units at offset {unit_offset}");
        Ok(unit_offset)
    }

    /// Release the allocation at `p` back to the heap shell, unmapping
    /// its backing reservation.
    pub fn release(&self, p: usize) -> Result<(), MemoryError> {
        let allocation = self
            .allocations
            .write()
            .expect("allocation table poisoned")
            .remove(&p)
            .ok_or(MemoryError::FreeMem)?;
        match allocation.placement {
            Placement::Block(block) => self.heap.release(block),
            Placement::Range { unit_offset, units } => self.heap.release_range(unit_offset, units)?,
        }
        allocation.line.unmap(self.vm.as_ref())?;
        Ok(())
    }

    /// Demand-page `[p, p + cb)`.
    pub fn commit(&self, p: usize, cb: usize) -> Result<(), MemoryError> {
        self.with_allocation(p, |allocation| {
            let (first, count) = self.page_range(&allocation.line, p, cb)?;
            Ok(allocation.line.commit(self.vm.as_ref(), first, count)?)
        })
    }

    /// Release physical backing for `[p, p + cb)`, keeping the address
    /// range reserved.
    pub fn decommit(&self, p: usize, cb: usize) -> Result<(), MemoryError> {
        self.with_allocation(p, |allocation| {
            let (first, count) = self.page_range(&allocation.line, p, cb)?;
            Ok(allocation.line.decommit(self.vm.as_ref(), first, count)?)
        })
    }

    /// `copy(dst, src, size, flags)` (§6). Source readability is
    /// validated before the flag combination, which is validated before
    /// the destination — matching the original's check ordering. `src ==
    /// dst` short-circuits: it is a no-op unless `ALLOCATE` was also
    /// requested, which is nonsensical (allocate a fresh destination
    /// that is also the source) and rejected as `BadParam`.
    pub fn copy(
        &self,
        dst: Option<usize>,
        src: usize,
        size: usize,
        flags: AllocationFlags,
    ) -> Result<usize, MemoryError> {
        let src_bytes = self.page_count_of(src)? * self.vm.page_size();
        if !self.is_readable(src, src_bytes)? {
            return Err(MemoryError::MemNotCommitted);
        }
        if !COPY_ACCEPTED.contains(flags) || flags.contains(AllocationFlags::DECOMMIT | AllocationFlags::RELEASE) {
            return Err(MemoryError::InvFlag);
        }
        if dst == Some(src) {
            return if flags.contains(AllocationFlags::ALLOCATE) {
                Err(MemoryError::BadParam {
                    reason: "src == dst with ALLOCATE requested",
                })
            } else {
                Ok(src)
            };
        }

        let dst_addr = match dst {
            Some(addr) if !flags.contains(AllocationFlags::ALLOCATE) => addr,
            _ => {
                let src_units = self.page_count_of(src)? * self.vm.page_size() / UNIT_SIZE;
                self.allocate(None, src_units.max(1) * UNIT_SIZE, AllocationFlags::empty())?
            }
        };

        let strategy = {
            let allocations = self.allocations.read().expect("allocation table poisoned");
            let src_line = &allocations.get(&src).ok_or(MemoryError::FreeMem)?.line;
            let dst_line = &allocations.get(&dst_addr).ok_or(MemoryError::FreeMem)?.line;
            let strategy = src_line.copy_from(self.vm.as_ref(), dst_line, self.page_allocate_cost)?;
            strategy
        };
        info!("copy {src} -> {dst_addr}: {strategy:?}");

        if flags.contains(AllocationFlags::DECOMMIT) {
            self.decommit(src, size)?;
        } else if flags.contains(AllocationFlags::RELEASE) {
            self.release(src)?;
        }

        Ok(dst_addr)
    }

    /// Whether every page in `[p, p + cb)` is committed and therefore
    /// readable — a whole-range check: one not-committed page makes the
    /// whole query `false`.
    pub fn is_readable(&self, p: usize, cb: usize) -> Result<bool, MemoryError> {
        self.every_page(p, cb, |state| state.is_committed())
    }

    /// Whether every page in `[p, p + cb)` is privately owned by this
    /// allocation (not a direct shared mapping another allocation could
    /// still be mutating through).
    pub fn is_private(&self, p: usize, cb: usize) -> Result<bool, MemoryError> {
        self.every_page(p, cb, |state| !state.contains(cost_model::PageState::MAPPED_SHARED))
    }

    pub fn query(&self, p: usize, param: QueryParam) -> Result<usize, MemoryError> {
        let page_size = self.vm.page_size();
        Ok(match param {
            QueryParam::AllocationUnit => UNIT_SIZE,
            QueryParam::SharingUnit | QueryParam::CommitUnit | QueryParam::OptimalCommitUnit | QueryParam::ProtectionUnit => page_size,
            QueryParam::AllocationSpaceBegin => 0,
            QueryParam::AllocationSpaceEnd => self.heap.capacity_units(),
            QueryParam::Flags => {
                let allocations = self.allocations.read().expect("allocation table poisoned");
                allocations.get(&p).ok_or(MemoryError::FreeMem)?.flags.bits() as usize
            }
        })
    }

    /// Raw pointer to the start of the allocation at `p`. `Memory`'s own
    /// operations never need to touch bytes directly — every real caller
    /// does, through the address `allocate`/`copy` hand back, so this is
    /// the façade's one escape hatch onto the backing memory itself.
    pub fn as_mut_ptr(&self, p: usize) -> Result<*mut u8, MemoryError> {
        self.with_allocation(p, |allocation| Ok(allocation.line.page_ptr(0)?))
    }

    fn new_line(&self, units: usize) -> Result<Line, MemoryError> {
        let page_size = self.vm.page_size();
        let bytes = units * UNIT_SIZE;
        let page_count = bytes.div_ceil(page_size).max(1);
        Ok(Line::new(self.vm.as_ref(), page_count, false)?)
    }

    fn with_allocation<T>(
        &self,
        p: usize,
        f: impl FnOnce(&Allocation) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let allocations = self.allocations.read().expect("allocation table poisoned");
        let allocation = allocations.get(&p).ok_or(MemoryError::FreeMem)?;
        f(allocation)
    }

    fn page_count_of(&self, p: usize) -> Result<usize, MemoryError> {
        self.with_allocation(p, |allocation| Ok(allocation.line.page_count()))
    }

    fn page_range(&self, line: &Line, p: usize, cb: usize) -> Result<(usize, usize), MemoryError> {
        let page_size = self.vm.page_size();
        // `p` is the allocation's own base address in this simplified
        // model (one line per allocation), so the range always starts at
        // page 0; a multi-line allocation would offset this by `p`'s
        // distance from the line's own base.
        let _ = p;
        let count = cb.div_ceil(page_size).min(line.page_count());
        Ok((0, count))
    }

    fn every_page(&self, p: usize, cb: usize, predicate: impl Fn(cost_model::PageState) -> bool) -> Result<bool, MemoryError> {
        self.with_allocation(p, |allocation| {
            let (first, count) = self.page_range(&allocation.line, p, cb)?;
            for page in first..first + count {
                if !predicate(allocation.line.state_of(page)?) {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_commit_is_readable_release_round_trip() {
        let memory = Memory::new(1).unwrap();
        let addr = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::RESERVED).unwrap();
        assert!(!memory.is_readable(addr, UNIT_SIZE).unwrap());

        memory.commit(addr, UNIT_SIZE).unwrap();
        assert!(memory.is_readable(addr, UNIT_SIZE).unwrap());

        memory.release(addr).unwrap();
        assert!(matches!(memory.query(addr, QueryParam::Flags), Err(MemoryError::FreeMem)));
    }

    #[test]
    fn allocate_without_reserved_commits_immediately() {
        let memory = Memory::new(1).unwrap();
        let addr = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        assert!(memory.is_readable(addr, UNIT_SIZE).unwrap());
    }

    #[test]
    fn copy_duplicates_committed_pages_into_a_fresh_allocation() {
        let memory = Memory::new(1).unwrap();
        let src = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();

        // SAFETY: src was just committed by `allocate`.
        unsafe {
            memory.as_mut_ptr(src).unwrap().write(0xab);
        }

        let dst = memory.copy(None, src, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        assert_ne!(dst, src);
        assert!(memory.is_readable(dst, UNIT_SIZE).unwrap());

        // SAFETY: dst was just committed by `copy`.
        unsafe {
            assert_eq!(memory.as_mut_ptr(dst).unwrap().read(), 0xab);

            // Copy-on-write isolation: mutating dst must not reach back
            // into src's own backing, and vice versa.
            memory.as_mut_ptr(dst).unwrap().write(0xcd);
            assert_eq!(memory.as_mut_ptr(src).unwrap().read(), 0xab);
        }
    }

    #[test]
    fn copy_src_equals_dst_is_a_no_op() {
        let memory = Memory::new(1).unwrap();
        let src = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        assert_eq!(memory.copy(Some(src), src, UNIT_SIZE, AllocationFlags::empty()).unwrap(), src);
    }

    #[test]
    fn copy_src_equals_dst_with_allocate_is_bad_param() {
        let memory = Memory::new(1).unwrap();
        let src = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        assert!(matches!(
            memory.copy(Some(src), src, UNIT_SIZE, AllocationFlags::ALLOCATE),
            Err(MemoryError::BadParam { .. })
        ));
    }

    #[test]
    fn copy_rejects_decommit_and_release_together() {
        let memory = Memory::new(1).unwrap();
        let src = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        let dst = memory.allocate(None, 16 * UNIT_SIZE, AllocationFlags::empty()).unwrap();
        assert!(matches!(
            memory.copy(Some(dst), src, UNIT_SIZE, AllocationFlags::DECOMMIT | AllocationFlags::RELEASE),
            Err(MemoryError::InvFlag)
        ));
    }

    #[test]
    fn query_reports_fixed_unit_sizes_and_address_space() {
        let memory = Memory::new(2).unwrap();
        assert_eq!(memory.query(0, QueryParam::AllocationUnit).unwrap(), UNIT_SIZE);
        assert_eq!(memory.query(0, QueryParam::AllocationSpaceBegin).unwrap(), 0);
        assert_eq!(
            memory.query(0, QueryParam::AllocationSpaceEnd).unwrap(),
            memory.capacity_units()
        );
    }
}
