//! Minimal ELF32 loader: just enough to pull `PT_LOAD` segments and the entry
//! point out of a statically linked RV32 executable (spec.md §6 "ELF input
//! contract"). No dynamic linking, no relocations, no section headers.

use thiserror::Error;

const EI_MAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
/// `EM_RISCV`, the ELF machine type for RISC-V.
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

#[derive(Debug, Error)]
pub enum ElfLoadError {
    #[error("not an ELF file (bad magic)")]
    BadMagic,
    #[error("not a 32-bit ELF (ELFCLASS64 or unknown class)")]
    WrongClass,
    #[error("not a little-endian ELF")]
    WrongEndianness,
    #[error("not a RISC-V ELF (e_machine = {0}, expected {EM_RISCV})")]
    WrongMachine(u16),
    #[error("ELF file has no PT_LOAD segment")]
    NoLoadSegment,
    #[error("ELF file is truncated or malformed: {0}")]
    Truncated(&'static str),
}

/// One `PT_LOAD` program header plus a slice into the file's segment bytes.
pub struct Segment<'a> {
    pub vaddr: u32,
    pub memsz: u32,
    pub filesz: u32,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub data: &'a [u8],
}

pub struct ElfImage<'a> {
    pub entry: u32,
    pub segments: Vec<Segment<'a>>,
}

fn u16_at(bytes: &[u8], off: usize) -> Result<u16, ElfLoadError> {
    let slice = bytes
        .get(off..off + 2)
        .ok_or(ElfLoadError::Truncated("u16 field out of range"))?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn u32_at(bytes: &[u8], off: usize) -> Result<u32, ElfLoadError> {
    let slice = bytes
        .get(off..off + 4)
        .ok_or(ElfLoadError::Truncated("u32 field out of range"))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Parse a 32-bit RISC-V ELF executable out of `bytes`, validating the
/// header fields spec.md's ELF contract requires and nothing else.
pub fn parse(bytes: &[u8]) -> Result<ElfImage<'_>, ElfLoadError> {
    if bytes.len() < 52 || bytes[0..4] != EI_MAG {
        return Err(ElfLoadError::BadMagic);
    }
    if bytes[4] != ELFCLASS32 {
        return Err(ElfLoadError::WrongClass);
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(ElfLoadError::WrongEndianness);
    }

    let e_type = u16_at(bytes, 16)?;
    let e_machine = u16_at(bytes, 18)?;
    if e_machine != EM_RISCV {
        return Err(ElfLoadError::WrongMachine(e_machine));
    }
    let _ = e_type; // ET_EXEC is expected but not required to fail loudly here
    let e_entry = u32_at(bytes, 24)?;
    let e_phoff = u32_at(bytes, 28)? as usize;
    let e_phentsize = u16_at(bytes, 42)? as usize;
    let e_phnum = u16_at(bytes, 44)? as usize;

    let mut segments = Vec::new();
    for i in 0..e_phnum {
        let base = e_phoff + i * e_phentsize;
        let p_type = u32_at(bytes, base)?;
        if p_type != PT_LOAD {
            continue;
        }
        let p_offset = u32_at(bytes, base + 4)? as usize;
        let p_vaddr = u32_at(bytes, base + 8)?;
        let p_filesz = u32_at(bytes, base + 16)?;
        let p_memsz = u32_at(bytes, base + 20)?;
        let p_flags = u32_at(bytes, base + 24)?;

        let data = bytes
            .get(p_offset..p_offset + p_filesz as usize)
            .ok_or(ElfLoadError::Truncated("PT_LOAD file range out of bounds"))?;

        segments.push(Segment {
            vaddr: p_vaddr,
            memsz: p_memsz,
            filesz: p_filesz,
            readable: p_flags & PF_R != 0,
            writable: p_flags & PF_W != 0,
            executable: p_flags & PF_X != 0,
            data,
        });
    }

    if segments.is_empty() {
        return Err(ElfLoadError::NoLoadSegment);
    }

    Ok(ElfImage { entry: e_entry, segments })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal well-formed ELF32 header + one PT_LOAD program header
    /// + a code blob, enough for [`parse`] to accept it.
    fn build_elf(machine: u16, segment_bytes: &[u8]) -> Vec<u8> {
        let mut elf = vec![0u8; 52];
        elf[0..4].copy_from_slice(&EI_MAG);
        elf[4] = ELFCLASS32;
        elf[5] = ELFDATA2LSB;
        elf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        elf[18..20].copy_from_slice(&machine.to_le_bytes());
        elf[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // e_entry
        elf[28..32].copy_from_slice(&(52u32).to_le_bytes()); // e_phoff
        elf[42..44].copy_from_slice(&(32u16).to_le_bytes()); // e_phentsize
        elf[44..46].copy_from_slice(&(1u16).to_le_bytes()); // e_phnum

        let ph_off = 84usize; // 52 header + 32 byte phentry
        let seg_off = ph_off;
        elf.resize(ph_off + 32, 0);
        elf[52..56].copy_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        elf[56..60].copy_from_slice(&(seg_off as u32).to_le_bytes()); // p_offset
        elf[60..64].copy_from_slice(&0x1000u32.to_le_bytes()); // p_vaddr
        elf[68..72].copy_from_slice(&(segment_bytes.len() as u32).to_le_bytes()); // p_filesz
        elf[72..76].copy_from_slice(&(segment_bytes.len() as u32).to_le_bytes()); // p_memsz
        elf[76..80].copy_from_slice(&(PF_R | PF_X).to_le_bytes()); // p_flags

        elf.extend_from_slice(segment_bytes);
        elf
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 64];
        assert!(matches!(parse(&bytes), Err(ElfLoadError::BadMagic)));
    }

    #[test]
    fn rejects_wrong_machine() {
        let elf = build_elf(0x3e, &[0x13, 0x00, 0x00, 0x00]); // EM_X86_64
        assert!(matches!(parse(&elf), Err(ElfLoadError::WrongMachine(0x3e))));
    }

    #[test]
    fn accepts_minimal_riscv_elf() {
        let elf = build_elf(EM_RISCV, &[0x13, 0x00, 0x00, 0x00]);
        let image = parse(&elf).expect("valid ELF");
        assert_eq!(image.entry, 0x1000);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].vaddr, 0x1000);
        assert!(image.segments[0].executable);
    }
}
