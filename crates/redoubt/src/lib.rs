#![forbid(unused_must_use)]
#![forbid(clippy::missing_safety_doc)]
#![deny(clippy::undocumented_unsafe_blocks)]

mod error;

mod bootstrap;
mod cpuid;
mod reloc;
mod reset;
mod utils;

pub mod bitset;
pub mod elf;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod host;

pub use crate::bootstrap::{prepare, set_payload_args, trampoline_address, EntryPoint, PayloadMain};
pub use crate::cpuid::{
    handle_cpuid_trap, CpuidHost, CpuidResult, Disposition, ExceptionKind, TrapContext, CPUID_OPCODE,
    XSAVE_AREA_MIN_SIZE,
};
pub use crate::error::Error;
pub use crate::reloc::{apply_relocations, PayloadImage, SymbolResolver, START_MAIN_SYMBOL};
pub use crate::reset::{spawn_tracked, ResetHost, ResetToken, RuntimeReset, TrackedThread};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use crate::host::{fatal, DlsymResolver, LinuxHost};
