//! The sequence run between runtimes: tear down whatever the previous
//! runtime left behind, relocate the freshly staged payload, and hand over
//! control.
//!
//! Control capture works through the payload's own startup path: its
//! `__libc_start_main` slot is rebound to [`start_main_trampoline`], so the
//! first thing the payload's startup code calls lands back here, where the
//! marshalled argc/argv are injected.

use crate::error::Error;
use crate::reloc::{self, PayloadImage, SymbolResolver};
use crate::reset::{ResetHost, RuntimeReset};
use core::ffi::{c_char, c_int};
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

/// Signature of the payload's `main` as handed to the startup hook.
pub type PayloadMain = unsafe extern "C" fn(c_int, *const *const c_char) -> c_int;

static PAYLOAD_ARGC: AtomicI32 = AtomicI32::new(0);
static PAYLOAD_ARGV: AtomicPtr<*const c_char> = AtomicPtr::new(core::ptr::null_mut());

/// Stashes the argument block the host glue marshalled across the trust
/// boundary; the trampoline passes it to the payload's `main`.
///
/// `argv` must stay valid until the payload exits.
pub fn set_payload_args(argc: c_int, argv: *const *const c_char) {
    PAYLOAD_ARGC.store(argc, Ordering::Release);
    PAYLOAD_ARGV.store(argv as *mut *const c_char, Ordering::Release);
}

/// The function written over the payload's `__libc_start_main` binding.
///
/// The real startup hook takes more arguments; only the `main` pointer in
/// the first one is consumed, the rest stay in their registers untouched.
unsafe extern "C" fn start_main_trampoline(payload_main: PayloadMain) -> c_int {
    let argc = PAYLOAD_ARGC.load(Ordering::Acquire);
    let argv = PAYLOAD_ARGV.load(Ordering::Acquire);

    // SAFETY: `payload_main` is the payload's own `main`; the argument
    // block was provided through `set_payload_args` and outlives it.
    unsafe { payload_main(argc, argv as *const *const c_char) }
}

/// Address of the trampoline, as written into the payload image.
pub fn trampoline_address() -> u64 {
    let trampoline: unsafe extern "C" fn(PayloadMain) -> c_int = start_main_trampoline;
    trampoline as usize as u64
}

/// Entry address of a fully relocated payload.
#[derive(Debug)]
pub struct EntryPoint(u64);

impl EntryPoint {
    pub fn address(&self) -> u64 {
        self.0
    }

    /// Transfers control to the payload. Never returns.
    ///
    /// # Safety
    ///
    /// The image this entry point came out of must still be mapped with its
    /// text executable, and no tracked state of the previous runtime may
    /// remain.
    pub unsafe fn enter(self) -> ! {
        log::debug!("handing control to the payload at 0x{:x}", self.0);

        // SAFETY: `self.0` is the relocated image's entry point, per above.
        unsafe {
            let entry: unsafe extern "C" fn() -> ! = core::mem::transmute(self.0 as usize);
            entry()
        }
    }
}

/// Runs the full handover sequence: stop the previous runtime's threads,
/// release its memory, then relocate the staged payload.
///
/// The ordering is load-bearing: threads are gone before their mappings
/// are. Any error means the payload must not run; nothing is retried.
pub fn prepare(
    reset: &RuntimeReset,
    host: &impl ResetHost,
    image: &mut PayloadImage,
    rela: &[u8],
    resolver: &dyn SymbolResolver,
) -> Result<EntryPoint, Error> {
    reset
        .kill_threads(host)
        .map_err(|error| error.context("runtime reset failed"))?;
    reset
        .unmap_memory(host)
        .map_err(|error| error.context("runtime reset failed"))?;

    let entry = reloc::apply_relocations(image, rela, resolver, trampoline_address())?;
    Ok(EntryPoint(entry))
}

#[cfg(test)]
#[allow(clippy::undocumented_unsafe_blocks)]
mod tests {
    use super::*;

    #[test]
    fn test_trampoline_forwards_the_payload_args() {
        static SEEN_ARGC: AtomicI32 = AtomicI32::new(-1);

        unsafe extern "C" fn fake_main(argc: c_int, _argv: *const *const c_char) -> c_int {
            SEEN_ARGC.store(argc, Ordering::SeqCst);
            7
        }

        let argv = [b"payload\0".as_ptr() as *const c_char, core::ptr::null()];
        set_payload_args(1, argv.as_ptr());

        let status = unsafe { start_main_trampoline(fake_main) };
        assert_eq!(status, 7);
        assert_eq!(SEEN_ARGC.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trampoline_address_is_real() {
        assert_ne!(trampoline_address(), 0);
    }
}
