//! The subset of the ELF64 on-disk layout needed to splice a pre-linked,
//! position-independent payload into a running process image.
//!
//! This is a fixed external format; only the fields the resolver actually
//! reads are named here.
//!
//! Source: System V ABI, AMD64 supplement; linux/include/uapi/linux/elf.h

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

// Field offsets into Elf64_Ehdr.
pub const EHDR_E_ENTRY: usize = 0x18;
pub const EHDR_E_PHOFF: usize = 0x20;
pub const EHDR_E_PHNUM: usize = 0x38;

// Elf64_Phdr.
pub const PHDR_SIZE: usize = 0x38;
pub const PHDR_P_TYPE: usize = 0x00;
pub const PHDR_P_VADDR: usize = 0x10;

pub const PT_DYNAMIC: u32 = 2;

// Elf64_Dyn: a `(d_tag, d_val | d_ptr)` pair.
pub const DYN_SIZE: usize = 16;

pub const DT_NULL: i64 = 0;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_JMPREL: i64 = 23;

// Elf64_Sym; only `st_name` is consumed.
pub const SYM_SIZE: usize = 24;
pub const SYM_ST_NAME: usize = 0x00;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;

/// A single `Elf64_Rela` relocation record.
#[derive(Copy, Clone, Debug)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

pub const RELA_SIZE: usize = 24;

impl Rela {
    /// Deserializes one record; `bytes` must be exactly [`RELA_SIZE`] long.
    pub fn deserialize(bytes: &[u8]) -> Option<Rela> {
        if bytes.len() != RELA_SIZE {
            return None;
        }

        let field = |at: usize| -> [u8; 8] {
            let mut out = [0; 8];
            out.copy_from_slice(&bytes[at..at + 8]);
            out
        };

        Some(Rela {
            offset: u64::from_le_bytes(field(0)),
            info: u64::from_le_bytes(field(8)),
            addend: i64::from_le_bytes(field(16)),
        })
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        self.info as u32
    }

    #[inline]
    pub fn symbol_index(&self) -> u32 {
        (self.info >> 32) as u32
    }
}

/// Composes `r_info` from a relocation type and a symbol index.
#[inline]
pub const fn r_info(kind: u32, symbol_index: u32) -> u64 {
    ((symbol_index as u64) << 32) | kind as u64
}

/// Iterates over the whole records in a serialized relocation table;
/// a trailing partial record is ignored.
pub fn records(table: &[u8]) -> impl Iterator<Item = Rela> + '_ {
    table.chunks_exact(RELA_SIZE).flat_map(Rela::deserialize)
}

#[test]
fn test_rela_roundtrip() {
    let mut bytes = [0_u8; RELA_SIZE];
    bytes[0..8].copy_from_slice(&0x1234_u64.to_le_bytes());
    bytes[8..16].copy_from_slice(&r_info(R_X86_64_JUMP_SLOT, 7).to_le_bytes());
    bytes[16..24].copy_from_slice(&(-16_i64).to_le_bytes());

    let rela = Rela::deserialize(&bytes).unwrap();
    assert_eq!(rela.offset, 0x1234);
    assert_eq!(rela.kind(), R_X86_64_JUMP_SLOT);
    assert_eq!(rela.symbol_index(), 7);
    assert_eq!(rela.addend, -16);

    assert!(Rela::deserialize(&bytes[1..]).is_none());
}
