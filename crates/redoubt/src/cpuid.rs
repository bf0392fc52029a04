//! Emulation of the `cpuid` instruction, which traps inside the isolated
//! context and has to be serviced by the untrusted host.
//!
//! The host's answer cannot be taken at face value for one query: the
//! extended save-area sizes of leaf `0xd`. A host reporting a smaller area
//! than the hardware actually needs would cause a buffer overflow at
//! context-switch time, so those sizes are clamped up to a fixed floor.

use crate::error::Error;

/// The two-byte encoding of `cpuid`.
pub const CPUID_OPCODE: [u8; 2] = [0x0f, 0xa2];

/// Lower bound applied to the XSAVE area sizes reported by the host.
///
/// 4096 bytes is comfortably above what current hardware asks for.
pub const XSAVE_AREA_MIN_SIZE: u32 = 4096;

const CPUID_LEAF_XSTATE: u64 = 0xd;

/// Exception class reported by the platform's trap plumbing.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExceptionKind {
    IllegalInstruction,
    AccessViolation,
    PageFault,
    Misalignment,
    Unknown,
}

/// What the exception dispatcher should do next.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Disposition {
    /// Not ours; give the next registered handler a chance.
    ContinueSearch,
    /// Handled; resume the faulting thread.
    ContinueExecution,
}

/// Integer register file of the faulting thread, as captured by the
/// exception plumbing.
///
/// Field order follows the kernel's `sigcontext`.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct TrapContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// The four output registers of a `cpuid` query.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// One-shot `cpuid` round trip to the untrusted host.
pub trait CpuidHost {
    /// Must be safe to call concurrently from multiple faulting threads.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Result<CpuidResult, Error>;
}

/// Services a trapped `cpuid` instruction.
///
/// Anything that is not an illegal-instruction fault on the `cpuid` opcode
/// is left for other handlers, as is a failed host round trip; results are
/// never fabricated.
///
/// # Safety
///
/// `context.rip` must be zero or point at the faulting instruction inside
/// live memory.
pub unsafe fn handle_cpuid_trap(
    kind: ExceptionKind,
    context: &mut TrapContext,
    host: &impl CpuidHost,
) -> Disposition {
    if kind != ExceptionKind::IllegalInstruction || context.rip == 0 {
        return Disposition::ContinueSearch;
    }

    // SAFETY: the caller guarantees `rip` points at the faulting instruction.
    let opcode = unsafe { core::ptr::read_unaligned(context.rip as *const [u8; 2]) };
    if opcode != CPUID_OPCODE {
        return Disposition::ContinueSearch;
    }

    let leaf = context.rax as u32;
    let subleaf = context.rcx as u32;
    let is_xstate_size_query = context.rax == CPUID_LEAF_XSTATE && context.rcx == 0;

    let mut result = match host.cpuid(leaf, subleaf) {
        Ok(result) => result,
        Err(error) => {
            log::warn!("cpuid round trip for leaf 0x{:x} failed: {}", leaf, error);
            return Disposition::ContinueSearch;
        }
    };

    if is_xstate_size_query {
        if result.ebx < XSAVE_AREA_MIN_SIZE {
            result.ebx = XSAVE_AREA_MIN_SIZE;
        }
        if result.ecx < XSAVE_AREA_MIN_SIZE {
            result.ecx = XSAVE_AREA_MIN_SIZE;
        }
    }

    context.rax = u64::from(result.eax);
    context.rbx = u64::from(result.ebx);
    context.rcx = u64::from(result.ecx);
    context.rdx = u64::from(result.edx);
    context.rip += CPUID_OPCODE.len() as u64;

    Disposition::ContinueExecution
}
