//! Picks the active [`DirectoryProfile`](heap_directory::DirectoryProfile)
//! at compile time from this crate's `dir16k`/`dir32k`/`dir64k` features,
//! so a build targeting a memory-constrained host can shrink the
//! per-partition metadata footprint without touching any call site.

#[cfg(all(feature = "dir16k", not(feature = "dir32k"), not(feature = "dir64k")))]
pub type ActiveProfile = heap_directory::Dir16k;

#[cfg(all(feature = "dir32k", not(feature = "dir16k"), not(feature = "dir64k")))]
pub type ActiveProfile = heap_directory::Dir32k;

#[cfg(all(feature = "dir64k", not(feature = "dir16k"), not(feature = "dir32k")))]
pub type ActiveProfile = heap_directory::Dir64k;

#[cfg(not(any(feature = "dir16k", feature = "dir32k", feature = "dir64k")))]
compile_error!("exactly one of the `dir16k`, `dir32k`, `dir64k` features must be enabled");

#[cfg(any(
    all(feature = "dir16k", feature = "dir32k"),
    all(feature = "dir16k", feature = "dir64k"),
    all(feature = "dir32k", feature = "dir64k"),
))]
compile_error!("only one of the `dir16k`, `dir32k`, `dir64k` features may be enabled at a time");
