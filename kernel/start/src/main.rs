#![no_std]
#![no_main]

// The `Memory` façade (`nirvana_memory`) is hosted: its line/page engine
// talks to the OS's real `mmap`/`mprotect` via `vm_os`, which this
// freestanding entry point has none of yet. Bringing it up here is out
// of scope until a hosted-paging backend exists for this target; the
// façade's construction and every operation in §6 are instead exercised
// directly by `nirvana_memory`'s own test suite.

#[no_mangle]
pub extern "C" fn kernel_start() -> ! {
    loop {}
}

#[panic_handler]
fn panic_handler(_pi: &core::panic::PanicInfo<'_>) -> ! {
    loop {}
}
