//! Applies the minimal set of dynamic relocations needed to make a staged,
//! pre-linked payload image executable in place.
//!
//! There is no dynamic linker inside the isolated context, so this is a
//! purpose-built resolver for exactly two classes of records: self-relative
//! fixups and late-bound external symbols. Anything more exotic in the
//! payload is a packaging defect and fails loudly.

use crate::elf;
use crate::error::{bail, Error};

/// The reserved startup hook. The payload's startup code calls this to run
/// `main`; rebinding it to a local trampoline is how the bootstrap captures
/// control before the payload's own initialization.
pub const START_MAIN_SYMBOL: &str = "__libc_start_main";

/// Process-wide symbol lookup, name to address.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// A staged payload image: a byte range plus the address it is loaded at.
///
/// Every access goes through bounds-checked offset arithmetic on the slice;
/// each patch is a plain `(base, offset, value)` write.
pub struct PayloadImage<'a> {
    bytes: &'a mut [u8],
    base: u64,
}

impl<'a> PayloadImage<'a> {
    pub fn new(bytes: &'a mut [u8], base: u64) -> Self {
        PayloadImage { bytes, base }
    }

    /// Wraps the image staged at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to `length` bytes of mapped memory holding the
    /// staged image, exclusively owned by the caller for the lifetime of
    /// the returned value.
    pub unsafe fn from_raw(base: *mut u8, length: usize) -> Self {
        PayloadImage {
            bytes: core::slice::from_raw_parts_mut(base, length),
            base: base as u64,
        }
    }

    /// The address the image is loaded at.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn slice(&self, offset: u64, length: usize) -> Result<&[u8], Error> {
        let slice = usize::try_from(offset).ok().and_then(|offset| {
            let end = offset.checked_add(length)?;
            self.bytes.get(offset..end)
        });

        match slice {
            Some(slice) => Ok(slice),
            None => Err(Error::from_display(format_args!(
                "out-of-bounds payload access: {} byte(s) at offset 0x{:x}",
                length, offset
            ))),
        }
    }

    fn read_u16(&self, offset: u64) -> Result<u16, Error> {
        let v = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([v[0], v[1]]))
    }

    fn read_u32(&self, offset: u64) -> Result<u32, Error> {
        let v = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
    }

    fn read_u64(&self, offset: u64) -> Result<u64, Error> {
        let v = self.slice(offset, 8)?;
        Ok(u64::from_le_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]))
    }

    fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), Error> {
        let slice = usize::try_from(offset).ok().and_then(|offset| {
            let end = offset.checked_add(8)?;
            self.bytes.get_mut(offset..end)
        });

        match slice {
            Some(slice) => {
                slice.copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            None => Err(Error::from_display(format_args!(
                "out-of-bounds relocation target at offset 0x{:x}",
                offset
            ))),
        }
    }

    fn str_at(&self, offset: u64) -> Result<&str, Error> {
        let tail = match usize::try_from(offset).ok().and_then(|offset| self.bytes.get(offset..)) {
            Some(tail) => tail,
            None => bail!("string table offset 0x{:x} is out of bounds", offset),
        };

        let length = tail
            .iter()
            .position(|&byte| byte == 0)
            .ok_or_else(|| Error::from_static_str("unterminated string in the payload's string table"))?;

        core::str::from_utf8(&tail[..length]).map_err(|_| Error::from_static_str("symbol name is not valid UTF-8"))
    }
}

fn symbol_name<'a>(
    image: &'a PayloadImage,
    strtab: Option<u64>,
    symtab: Option<u64>,
    index: u32,
) -> Result<&'a str, Error> {
    let strtab = strtab.ok_or_else(|| Error::from_static_str("payload has symbol relocations but no string table"))?;
    let symtab = symtab.ok_or_else(|| Error::from_static_str("payload has symbol relocations but no symbol table"))?;

    let st_name = image.read_u32(symtab + u64::from(index) * elf::SYM_SIZE as u64 + elf::SYM_ST_NAME as u64)?;
    image.str_at(strtab + u64::from(st_name))
}

/// Applies every relocation the payload needs and returns its entry address.
///
/// `rela` is the payload's primary relocation table, staged outside the
/// image by the packager. The jump-slot table is discovered through the
/// image's own dynamic segment. `start_main` is the address written over
/// the reserved [`START_MAIN_SYMBOL`] binding.
///
/// Any failure leaves the image partially patched; the caller must treat
/// that as fatal and never transfer control to it.
pub fn apply_relocations(
    image: &mut PayloadImage,
    rela: &[u8],
    resolver: &dyn SymbolResolver,
    start_main: u64,
) -> Result<u64, Error> {
    if image.slice(0, 4)? != elf::ELF_MAGIC.as_slice() {
        bail!("payload image is not an ELF executable");
    }

    let entry = image.read_u64(elf::EHDR_E_ENTRY as u64)?;
    let phoff = image.read_u64(elf::EHDR_E_PHOFF as u64)?;
    let phnum = image.read_u16(elf::EHDR_E_PHNUM as u64)?;

    // Locate the single dynamic segment.
    let mut dynamic = None;
    for index in 0..u64::from(phnum) {
        let phdr = phoff + index * elf::PHDR_SIZE as u64;
        if image.read_u32(phdr + elf::PHDR_P_TYPE as u64)? != elf::PT_DYNAMIC {
            continue;
        }

        let vaddr = image.read_u64(phdr + elf::PHDR_P_VADDR as u64)?;
        if vaddr == 0 {
            bail!("the payload's dynamic segment has no address");
        }

        dynamic = Some(vaddr);
        break;
    }

    let Some(mut offset) = dynamic else {
        bail!("the payload has no dynamic segment; it cannot be relocated");
    };

    let mut strtab = None;
    let mut symtab = None;
    let mut jmprel = None;
    let mut jmprel_size = 0_u64;
    loop {
        let tag = image.read_u64(offset)? as i64;
        if tag == elf::DT_NULL {
            break;
        }

        let value = image.read_u64(offset + 8)?;
        match tag {
            elf::DT_STRTAB => strtab = Some(value),
            elf::DT_SYMTAB => symtab = Some(value),
            elf::DT_JMPREL => jmprel = Some(value),
            elf::DT_PLTRELSZ => jmprel_size = value,
            _ => {}
        }

        offset += elf::DYN_SIZE as u64;
    }

    log::debug!("applying {} payload relocation(s)...", rela.len() / elf::RELA_SIZE);
    for record in elf::records(rela) {
        match record.kind() {
            elf::R_X86_64_NONE => {}
            elf::R_X86_64_RELATIVE => {
                let value = image.base().wrapping_add(record.addend as u64);
                log::trace!("  relative: 0x{:x} -> [base + 0x{:x}]", value, record.offset);
                image.write_u64(record.offset, value)?;
            }
            elf::R_X86_64_GLOB_DAT => {
                let is_start_main =
                    symbol_name(image, strtab, symtab, record.symbol_index())? == START_MAIN_SYMBOL;
                if is_start_main {
                    log::trace!("  capturing the startup hook: [base + 0x{:x}]", record.offset);
                    image.write_u64(record.offset, start_main)?;
                }
                // Any other symbol in this table is left unbound; nothing
                // outside the reserved startup hook is resolved from here.
            }
            kind => bail!("unsupported relocation type {} in the payload's relocation table", kind),
        }
    }

    let mut unresolved = Vec::new();
    if let Some(jmprel) = jmprel {
        let record_count = jmprel_size / elf::RELA_SIZE as u64;
        log::debug!("binding {} jump slot(s)...", record_count);
        for index in 0..record_count {
            let at = jmprel + index * elf::RELA_SIZE as u64;
            let record = elf::Rela {
                offset: image.read_u64(at)?,
                info: image.read_u64(at + 8)?,
                addend: image.read_u64(at + 16)? as i64,
            };

            match record.kind() {
                elf::R_X86_64_JUMP_SLOT => {
                    let resolved = {
                        let name = symbol_name(image, strtab, symtab, record.symbol_index())?;
                        resolver.resolve(name).ok_or_else(|| name.to_owned())
                    };

                    match resolved {
                        Ok(address) => {
                            log::trace!("  jump slot: 0x{:x} -> [base + 0x{:x}]", address, record.offset);
                            image.write_u64(record.offset, address)?;
                        }
                        Err(name) => {
                            // Keep going; report every missing symbol in one pass.
                            log::debug!("symbol not found: {}", name);
                            unresolved.push(name);
                        }
                    }
                }
                kind => bail!("unsupported relocation type {} in the payload's jump slot table", kind),
            }
        }
    }

    if !unresolved.is_empty() {
        bail!(
            "failed to resolve {} symbol(s) needed by the payload: {}",
            unresolved.len(),
            unresolved.join(", ")
        );
    }

    Ok(image.base().wrapping_add(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{
        Rela, DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_STRTAB, DT_SYMTAB, EHDR_E_ENTRY, EHDR_E_PHNUM, EHDR_E_PHOFF,
        ELF_MAGIC, PHDR_P_TYPE, PHDR_P_VADDR, PT_DYNAMIC, RELA_SIZE, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
        R_X86_64_NONE, R_X86_64_RELATIVE, SYM_SIZE,
    };
    use std::collections::HashMap;

    const PHDR_AT: u64 = 0x40;
    const DYNAMIC_AT: u64 = 0x80;
    const STRTAB_AT: u64 = 0x100;
    const SYMTAB_AT: u64 = 0x180;
    const JMPREL_AT: u64 = 0x200;
    const DATA_AT: u64 = 0x280;
    const IMAGE_LEN: usize = 0x300;
    const ENTRY: u64 = 0x1234;
    const BASE: u64 = 0x5500_0000;

    // Offsets into STRTAB: 1 = start main hook, 19 = "open",
    // 24 = "missing_a", 34 = "missing_b".
    const STRTAB: &[u8] = b"\0__libc_start_main\0open\0missing_a\0missing_b\0";
    const SYM_START_MAIN: u32 = 1;
    const SYM_OPEN: u32 = 2;
    const SYM_MISSING_A: u32 = 3;
    const SYM_MISSING_B: u32 = 4;

    struct TestResolver(HashMap<&'static str, u64>);

    impl SymbolResolver for TestResolver {
        fn resolve(&self, name: &str) -> Option<u64> {
            self.0.get(name).copied()
        }
    }

    fn no_symbols() -> TestResolver {
        TestResolver(HashMap::new())
    }

    fn put_u16(image: &mut [u8], at: u64, value: u16) {
        image[at as usize..at as usize + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], at: u64, value: u32) {
        image[at as usize..at as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(image: &mut [u8], at: u64, value: u64) {
        image[at as usize..at as usize + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_rela(image: &mut [u8], at: u64, record: &Rela) {
        put_u64(image, at, record.offset);
        put_u64(image, at + 8, record.info);
        put_u64(image, at + 16, record.addend as u64);
    }

    fn serialize_rela(records: &[Rela]) -> Vec<u8> {
        let mut table = vec![0_u8; records.len() * RELA_SIZE];
        for (index, record) in records.iter().enumerate() {
            put_rela(&mut table, (index * RELA_SIZE) as u64, record);
        }
        table
    }

    fn build_image_with_dynamic(dynamic: &[(i64, u64)], jump_slots: &[Rela]) -> Vec<u8> {
        let mut image = vec![0_u8; IMAGE_LEN];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        put_u64(&mut image, EHDR_E_ENTRY as u64, ENTRY);
        put_u64(&mut image, EHDR_E_PHOFF as u64, PHDR_AT);
        put_u16(&mut image, EHDR_E_PHNUM as u64, 1);

        put_u32(&mut image, PHDR_AT + PHDR_P_TYPE as u64, PT_DYNAMIC);
        put_u64(&mut image, PHDR_AT + PHDR_P_VADDR as u64, DYNAMIC_AT);

        let mut at = DYNAMIC_AT;
        for &(tag, value) in dynamic {
            put_u64(&mut image, at, tag as u64);
            put_u64(&mut image, at + 8, value);
            at += 16;
        }

        image[STRTAB_AT as usize..STRTAB_AT as usize + STRTAB.len()].copy_from_slice(STRTAB);

        for (index, name_offset) in [(SYM_START_MAIN, 1_u32), (SYM_OPEN, 19), (SYM_MISSING_A, 24), (SYM_MISSING_B, 34)] {
            put_u32(&mut image, SYMTAB_AT + u64::from(index) * SYM_SIZE as u64, name_offset);
        }

        at = JMPREL_AT;
        for record in jump_slots {
            put_rela(&mut image, at, record);
            at += RELA_SIZE as u64;
        }

        image
    }

    fn build_image(jump_slots: &[Rela]) -> Vec<u8> {
        build_image_with_dynamic(
            &[
                (DT_STRTAB, STRTAB_AT),
                (DT_SYMTAB, SYMTAB_AT),
                (DT_JMPREL, JMPREL_AT),
                (DT_PLTRELSZ, (jump_slots.len() * RELA_SIZE) as u64),
                (DT_NULL, 0),
            ],
            jump_slots,
        )
    }

    #[test]
    fn test_relative_relocation_writes_base_plus_addend() {
        let _ = env_logger::try_init();

        let mut image = build_image(&[]);
        let pristine = image.clone();
        let rela = serialize_rela(&[Rela {
            offset: DATA_AT + 0x10,
            info: elf::r_info(R_X86_64_RELATIVE, 0),
            addend: 0x20,
        }]);

        let mut payload = PayloadImage::new(&mut image, BASE);
        let entry = apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap();
        assert_eq!(entry, BASE + ENTRY);

        let target = (DATA_AT + 0x10) as usize;
        assert_eq!(image[target..target + 8], (BASE + 0x20).to_le_bytes());

        // Nothing else was touched.
        for (n, (patched, original)) in image.iter().zip(pristine.iter()).enumerate() {
            if n < target || n >= target + 8 {
                assert_eq!(patched, original, "byte 0x{n:x}");
            }
        }
    }

    #[test]
    fn test_none_relocation_is_skipped() {
        let mut image = build_image(&[]);
        let pristine = image.clone();
        let rela = serialize_rela(&[Rela {
            offset: DATA_AT,
            info: elf::r_info(R_X86_64_NONE, 0),
            addend: 0,
        }]);

        let mut payload = PayloadImage::new(&mut image, BASE);
        apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap();
        assert_eq!(image, pristine);
    }

    #[test]
    fn test_glob_dat_rebinds_only_the_startup_hook() {
        let mut image = build_image(&[]);
        let rela = serialize_rela(&[
            Rela {
                offset: DATA_AT,
                info: elf::r_info(R_X86_64_GLOB_DAT, SYM_START_MAIN),
                addend: 0,
            },
            Rela {
                offset: DATA_AT + 8,
                info: elf::r_info(R_X86_64_GLOB_DAT, SYM_OPEN),
                addend: 0,
            },
        ]);

        let start_main = 0xdead_beef_u64;
        let mut payload = PayloadImage::new(&mut image, BASE);
        apply_relocations(&mut payload, &rela, &no_symbols(), start_main).unwrap();

        let target = DATA_AT as usize;
        assert_eq!(image[target..target + 8], start_main.to_le_bytes());
        assert_eq!(image[target + 8..target + 16], [0; 8]);
    }

    #[test]
    fn test_jump_slot_binds_resolved_symbols() {
        let mut image = build_image(&[Rela {
            offset: DATA_AT + 0x20,
            info: elf::r_info(R_X86_64_JUMP_SLOT, SYM_OPEN),
            addend: 0,
        }]);

        let resolver = TestResolver(HashMap::from([("open", 0x1111_2222_u64)]));
        let mut payload = PayloadImage::new(&mut image, BASE);
        apply_relocations(&mut payload, &[], &resolver, 0).unwrap();

        let target = (DATA_AT + 0x20) as usize;
        assert_eq!(image[target..target + 8], 0x1111_2222_u64.to_le_bytes());
    }

    #[test]
    fn test_every_unresolved_symbol_is_reported() {
        let mut image = build_image(&[
            Rela {
                offset: DATA_AT,
                info: elf::r_info(R_X86_64_JUMP_SLOT, SYM_MISSING_A),
                addend: 0,
            },
            Rela {
                offset: DATA_AT + 8,
                info: elf::r_info(R_X86_64_JUMP_SLOT, SYM_OPEN),
                addend: 0,
            },
            Rela {
                offset: DATA_AT + 16,
                info: elf::r_info(R_X86_64_JUMP_SLOT, SYM_MISSING_B),
                addend: 0,
            },
        ]);

        let resolver = TestResolver(HashMap::from([("open", 0x1111_2222_u64)]));
        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &[], &resolver, 0).unwrap_err().to_string();
        assert!(error.contains("missing_a"), "{error}");
        assert!(error.contains("missing_b"), "{error}");
        assert!(error.contains("2 symbol(s)"), "{error}");
    }

    #[test]
    fn test_unsupported_relocation_type_is_fatal() {
        const R_X86_64_64: u32 = 1;

        let mut image = build_image(&[]);
        let rela = serialize_rela(&[Rela {
            offset: DATA_AT,
            info: elf::r_info(R_X86_64_64, 0),
            addend: 0,
        }]);

        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("unsupported relocation type 1"), "{error}");

        let mut image = build_image(&[Rela {
            offset: DATA_AT,
            info: elf::r_info(R_X86_64_64, 0),
            addend: 0,
        }]);
        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &[], &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("unsupported relocation type 1"), "{error}");
    }

    #[test]
    fn test_image_without_dynamic_segment_is_rejected() {
        let mut image = build_image(&[]);
        const PT_LOAD: u32 = 1;
        put_u32(&mut image, PHDR_AT + PHDR_P_TYPE as u64, PT_LOAD);

        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &[], &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("no dynamic segment"), "{error}");
    }

    #[test]
    fn test_dynamic_segment_with_zero_address_is_rejected() {
        let mut image = build_image(&[]);
        put_u64(&mut image, PHDR_AT + PHDR_P_VADDR as u64, 0);

        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &[], &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("no address"), "{error}");
    }

    #[test]
    fn test_missing_tables_are_tolerated_when_unused() {
        let mut image = build_image_with_dynamic(&[(DT_NULL, 0)], &[]);
        let rela = serialize_rela(&[Rela {
            offset: DATA_AT,
            info: elf::r_info(R_X86_64_RELATIVE, 0),
            addend: 0x40,
        }]);

        let mut payload = PayloadImage::new(&mut image, BASE);
        apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap();

        // But a symbol relocation without the tables is an error.
        let mut image = build_image_with_dynamic(&[(DT_NULL, 0)], &[]);
        let rela = serialize_rela(&[Rela {
            offset: DATA_AT,
            info: elf::r_info(R_X86_64_GLOB_DAT, SYM_START_MAIN),
            addend: 0,
        }]);
        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("no string table"), "{error}");
    }

    #[test]
    fn test_relocation_target_out_of_bounds_is_rejected() {
        let mut image = build_image(&[]);
        let rela = serialize_rela(&[Rela {
            offset: IMAGE_LEN as u64 - 4,
            info: elf::r_info(R_X86_64_RELATIVE, 0),
            addend: 0,
        }]);

        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &rela, &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("out-of-bounds"), "{error}");
    }

    #[test]
    fn test_not_an_elf_image_is_rejected() {
        let mut image = vec![0_u8; IMAGE_LEN];
        let mut payload = PayloadImage::new(&mut image, BASE);
        let error = apply_relocations(&mut payload, &[], &no_symbols(), 0).unwrap_err().to_string();
        assert!(error.contains("not an ELF"), "{error}");
    }
}
