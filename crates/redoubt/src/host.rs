//! The Linux seam: process-wide symbol lookup for jump-slot binding and the
//! kernel-backed [`ResetHost`] the teardown path drives.

extern crate redoubt_linux_raw as linux_raw;

use crate::error::Error;
use crate::reloc::SymbolResolver;
use crate::reset::ResetHost;
use linux_raw::c_void;
use std::ffi::CString;

/// Symbol lookup over everything already linked into the running process.
pub struct DlsymResolver;

impl SymbolResolver for DlsymResolver {
    fn resolve(&self, name: &str) -> Option<u64> {
        let name = CString::new(name).ok()?;

        // SAFETY: `dlsym` only reads the name; RTLD_DEFAULT searches the
        // global namespace without taking ownership of anything.
        let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if address.is_null() {
            None
        } else {
            Some(address as usize as u64)
        }
    }
}

/// [`ResetHost`] backed by raw kernel calls plus a caller-registered wake
/// descriptor shared with the runtime's poller.
pub struct LinuxHost {
    wake_fd: Option<linux_raw::Fd>,
}

impl LinuxHost {
    pub fn new() -> Self {
        LinuxHost { wake_fd: None }
    }

    /// Registers the eventfd-style descriptor teardown writes to in order
    /// to release threads parked in a readiness wait.
    pub fn set_wake_fd(&mut self, fd: linux_raw::Fd) {
        self.wake_fd = Some(fd);
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetHost for LinuxHost {
    fn wake_pollers(&self) -> Result<(), Error> {
        let Some(fd) = self.wake_fd.as_ref() else {
            return Err(Error::from_static_str("no wake descriptor was registered"));
        };

        linux_raw::sys_write(fd.borrow(), &1_u64.to_ne_bytes())?;
        Ok(())
    }

    unsafe fn map_fixed(&self, address: u64, length: usize) -> Result<(), Error> {
        // SAFETY: the caller upholds the trait contract; the range is free
        // arena space.
        unsafe {
            linux_raw::sys_mmap(
                address as *mut c_void,
                length,
                linux_raw::PROT_READ | linux_raw::PROT_WRITE,
                linux_raw::MAP_PRIVATE | linux_raw::MAP_ANONYMOUS | linux_raw::MAP_FIXED,
                None,
                0,
            )?;
        }

        Ok(())
    }

    unsafe fn unmap(&self, address: u64, length: usize) -> Result<(), Error> {
        // SAFETY: the caller upholds the trait contract; no thread touches
        // the range anymore.
        unsafe { linux_raw::sys_munmap(address as *mut c_void, length)? };
        Ok(())
    }
}

/// Writes the error to stderr and aborts the process. The last stop when
/// the bootstrap cannot continue.
pub fn fatal(error: &Error) -> ! {
    use core::fmt::Write;

    let mut stderr = linux_raw::FdRef::from_raw_unchecked(linux_raw::STDERR_FILENO);
    let _ = writeln!(stderr, "fatal error: {}", error);

    let _ = linux_raw::sys_exit_group(102);
    linux_raw::abort();
}
