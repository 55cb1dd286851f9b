//! Narrow interface onto the hosted OS's virtual memory facilities:
//! reserve an address range, commit/decommit physical backing, change
//! protection, and map copy-on-write. The line/page engine (`line_engine`)
//! is the only consumer; everything OS-specific lives behind
//! [`VirtualMemory`] so the engine's commit/copy state machine stays
//! platform-agnostic.

use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use snafu::{ResultExt, Snafu};

/// Protection requested for a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    NoAccess,
}

/// Errors surfaced by a [`VirtualMemory`] implementation. Each variant
/// carries the OS error so callers can log it without this crate having
/// to know every backend's error type.
#[derive(Debug, Snafu)]
pub enum VmOsError {
    #[snafu(display("failed to create backing object for {len} bytes: {source}"))]
    CreateBacking { len: usize, source: nix::Error },
    #[snafu(display("failed to reserve {len} bytes of address space: {source}"))]
    Reserve { len: usize, source: nix::Error },
    #[snafu(display("failed to commit {len} bytes at {addr:#x}: {source}"))]
    Commit {
        addr: usize,
        len: usize,
        source: nix::Error,
    },
    #[snafu(display("failed to decommit {len} bytes at {addr:#x}: {source}"))]
    Decommit {
        addr: usize,
        len: usize,
        source: nix::Error,
    },
    #[snafu(display("failed to change protection on {len} bytes at {addr:#x}: {source}"))]
    Protect {
        addr: usize,
        len: usize,
        source: nix::Error,
    },
    #[snafu(display("failed to unmap {len} bytes at {addr:#x}: {source}"))]
    Unmap {
        addr: usize,
        len: usize,
        source: nix::Error,
    },
}

/// One page-granular range of address space the allocator owns, backed
/// by an anonymous shared-memory object. Keeping the backing object
/// around (rather than mapping `MAP_ANONYMOUS` directly) is what makes
/// `commit`'s `source` parameter possible: a second, independent mapping
/// of the same file at a different address gives the line engine a real
/// copy-on-write alias of another line's pages.
#[derive(Debug)]
pub struct Mapping {
    pub addr: NonNull<u8>,
    pub len: usize,
    backing: OwnedFd,
}

// SAFETY: `Mapping` owns its address range and backing descriptor
// exclusively; the allocator above it is responsible for not aliasing
// offsets across threads without its own synchronization.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Hosted OS virtual memory operations the line/page engine needs.
///
/// Implementations must be internally synchronized: two threads may call
/// `commit`/`decommit`/`protect` on disjoint ranges of the same
/// reservation concurrently.
pub trait VirtualMemory: Send + Sync {
    /// Native page size, in bytes.
    fn page_size(&self) -> usize;

    /// Reserve `len` bytes of address space with no physical backing.
    /// `len` must be a multiple of [`Self::page_size`].
    fn reserve(&self, len: usize) -> Result<Mapping, VmOsError>;

    /// Give `[offset, offset + len)` within `mapping` physical backing.
    /// With `source`, the range is mapped copy-on-write from another
    /// mapping's backing object at `source_offset` (used by the line
    /// engine's `PART`/`FULL` remap strategies to seed a new mapping from
    /// the old one without an up-front byte copy); without it, the range
    /// is zero-filled.
    fn commit(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        protection: Protection,
        source: Option<(&Mapping, usize)>,
    ) -> Result<(), VmOsError>;

    /// Release physical backing for `[offset, offset + len)` within
    /// `mapping`, keeping the address range reserved.
    fn decommit(&self, mapping: &Mapping, offset: usize, len: usize) -> Result<(), VmOsError>;

    /// Change protection on `[offset, offset + len)` within `mapping`.
    fn protect(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> Result<(), VmOsError>;

    /// Release the entire reservation back to the OS.
    fn unmap(&self, mapping: Mapping) -> Result<(), VmOsError>;
}

/// [`VirtualMemory`] backed by POSIX `mmap`/`mprotect`/`munmap` over an
/// anonymous, memfd-backed shared object.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixVirtualMemory;

impl UnixVirtualMemory {
    pub fn new() -> Self {
        Self
    }

    fn os_page_size() -> usize {
        // `sysconf(_SC_PAGESIZE)` never fails on a POSIX system; fall back
        // to the common 4 KiB page size if the call is somehow refused.
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(4096)
    }
}

impl VirtualMemory for UnixVirtualMemory {
    fn page_size(&self) -> usize {
        Self::os_page_size()
    }

    fn reserve(&self, len: usize) -> Result<Mapping, VmOsError> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};

        let backing = nix::sys::memfd::memfd_create(
            c"nirvana-heap-region",
            nix::sys::memfd::MFdFlags::empty(),
        )
        .context(CreateBackingSnafu { len })?;
        nix::unistd::ftruncate(&backing, len as i64).context(CreateBackingSnafu { len })?;

        let size = core::num::NonZeroUsize::new(len).expect("reserve length must be nonzero");
        // SAFETY: mapping a freshly created, appropriately sized memfd at
        // an OS-chosen address.
        let addr = unsafe { mmap(None, size, ProtFlags::PROT_NONE, MapFlags::MAP_SHARED, &backing, 0) }
            .context(ReserveSnafu { len })?;

        Ok(Mapping {
            addr: addr.cast(),
            len,
            backing,
        })
    }

    fn commit(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        protection: Protection,
        source: Option<(&Mapping, usize)>,
    ) -> Result<(), VmOsError> {
        use nix::sys::mman::{mmap, MapFlags};

        let target = mapping.addr.as_ptr().wrapping_add(offset);
        let size = core::num::NonZeroUsize::new(len).expect("commit length must be nonzero");
        let (fd, file_offset): (&OwnedFd, i64) = match source {
            Some((src, src_offset)) => (&src.backing, src_offset as i64),
            None => (&mapping.backing, offset as i64),
        };

        // SAFETY: `target` lies within `mapping`'s own reservation, and
        // `MAP_FIXED` only ever overwrites address space this allocator
        // already owns. `MAP_PRIVATE` gives copy-on-write semantics when
        // `fd` belongs to another mapping.
        unsafe {
            mmap(
                NonNull::new(target.cast()),
                size,
                to_prot_flags(protection),
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                fd.as_fd(),
                file_offset,
            )
        }
        .map(|_| ())
        .context(CommitSnafu {
            addr: target as usize,
            len,
        })
    }

    fn decommit(&self, mapping: &Mapping, offset: usize, len: usize) -> Result<(), VmOsError> {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};

        let target = mapping.addr.as_ptr().wrapping_add(offset);
        let size = core::num::NonZeroUsize::new(len).expect("decommit length must be nonzero");
        // Re-establish a PROT_NONE anonymous mapping over the range: this
        // both drops physical backing and resets protection, matching
        // `DECOMMITTED`'s page-state meaning.
        // SAFETY: `target..target+len` is within `mapping`'s own range.
        unsafe {
            mmap_anonymous(
                NonNull::new(target.cast()),
                size,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            )
        }
        .map(|_| ())
        .context(DecommitSnafu {
            addr: target as usize,
            len,
        })
    }

    fn protect(
        &self,
        mapping: &Mapping,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> Result<(), VmOsError> {
        let target = mapping.addr.as_ptr().wrapping_add(offset);
        // SAFETY: `target..target+len` is within `mapping`'s own range.
        unsafe {
            nix::sys::mman::mprotect(
                NonNull::new(target.cast()).expect("protect target is non-null"),
                len,
                to_prot_flags(protection),
            )
        }
        .context(ProtectSnafu {
            addr: target as usize,
            len,
        })
    }

    fn unmap(&self, mapping: Mapping) -> Result<(), VmOsError> {
        let addr = mapping.addr.as_ptr() as usize;
        let len = mapping.len;
        // SAFETY: releasing exactly the reservation this `Mapping` names;
        // `mapping` is consumed, so nothing can use it afterward.
        unsafe { nix::sys::mman::munmap(mapping.addr.cast(), mapping.len) }
            .context(UnmapSnafu { addr, len })
    }
}

fn to_prot_flags(protection: Protection) -> nix::sys::mman::ProtFlags {
    use nix::sys::mman::ProtFlags;
    match protection {
        Protection::NoAccess => ProtFlags::PROT_NONE,
        Protection::ReadOnly => ProtFlags::PROT_READ,
        Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_decommit_unmap_round_trip() {
        let os = UnixVirtualMemory::new();
        let page = os.page_size();
        let mapping = os.reserve(page * 4).expect("reserve");

        os.commit(&mapping, 0, page, Protection::ReadWrite, None)
            .expect("commit");

        // SAFETY: just committed read-write.
        unsafe {
            mapping.addr.as_ptr().write(0x42);
            assert_eq!(mapping.addr.as_ptr().read(), 0x42);
        }

        os.decommit(&mapping, 0, page).expect("decommit");
        os.unmap(mapping).expect("unmap");
    }

    #[test]
    fn protect_read_only_then_read_write() {
        let os = UnixVirtualMemory::new();
        let page = os.page_size();
        let mapping = os.reserve(page).expect("reserve");
        os.commit(&mapping, 0, page, Protection::ReadWrite, None)
            .expect("commit");
        os.protect(&mapping, 0, page, Protection::ReadOnly)
            .expect("protect read-only");
        os.protect(&mapping, 0, page, Protection::ReadWrite)
            .expect("protect read-write");
        os.unmap(mapping).expect("unmap");
    }

    #[test]
    fn commit_with_source_shares_backing_copy_on_write() {
        let os = UnixVirtualMemory::new();
        let page = os.page_size();
        let src = os.reserve(page).expect("reserve src");
        let dst = os.reserve(page).expect("reserve dst");

        os.commit(&src, 0, page, Protection::ReadWrite, None)
            .expect("commit src");
        // SAFETY: src just committed read-write.
        unsafe {
            src.addr.as_ptr().write(7);
        }

        os.commit(&dst, 0, page, Protection::ReadWrite, Some((&src, 0)))
            .expect("commit dst from src");
        // SAFETY: dst just committed read-write, aliasing src's backing.
        unsafe {
            assert_eq!(dst.addr.as_ptr().read(), 7);
            dst.addr.as_ptr().write(9);
            // MAP_PRIVATE: dst's write must not be visible through src.
            assert_eq!(src.addr.as_ptr().read(), 7);
        }

        os.unmap(src).expect("unmap src");
        os.unmap(dst).expect("unmap dst");
    }
}
