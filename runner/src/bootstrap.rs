//! Lay out a loaded ELF image plus argv in guest memory and compute the
//! initial `pc`/`sp` (spec.md §4.5 "Bootstrap / environment").

use rv32_core::memory::{Memory, PAGE_SIZE, PROT_NONE, PROT_R, PROT_RW};

use crate::elf::ElfImage;

/// Size of the guest stack region.
const STACK_SIZE: u32 = 4 * 1024 * 1024;

/// Guest address argv strings are stored at (spec.md §4.5 "Argv strings are
/// stored contiguously starting at guest address 0x100").
const ARGV_STRINGS_BASE: u32 = 0x100;

/// Longest argv string stored, not counting the NUL terminator.
const MAX_ARG_LEN: usize = 31;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

fn segment_prot(readable: bool, writable: bool, executable: bool) -> u8 {
    let mut prot = PROT_NONE;
    if readable {
        prot |= PROT_R;
    }
    if writable {
        prot |= rv32_core::memory::PROT_W;
    }
    if executable {
        prot |= rv32_core::memory::PROT_X;
    }
    prot
}

/// Copy `image`'s segments into `mem`, lay out the stack with `argv`
/// prepared, and return `(pc, sp)` for the interpreter's initial state.
pub fn bootstrap(mem: &mut Memory, image: &ElfImage<'_>, argv: &[String]) -> (u32, u32) {
    // 1-2. Copy each PT_LOAD segment and track the highest mapped address.
    let mut image_end: u32 = 0;
    for seg in &image.segments {
        mem.set_region(seg.vaddr, seg.data);
        // memsz can exceed filesz (.bss); the extra bytes stay zeroed, which
        // `Memory::new` already guarantees.
        mem.protect_region(
            seg.vaddr,
            seg.memsz,
            segment_prot(seg.readable, seg.writable, seg.executable),
        );
        image_end = image_end.max(seg.vaddr + seg.memsz);
    }
    let image_end = align_up(image_end, PAGE_SIZE);

    // 3. One guard page, then the stack region.
    let stack_end = image_end + PAGE_SIZE;
    let stack_begin = stack_end + STACK_SIZE;
    mem.protect_region(stack_end, STACK_SIZE, PROT_RW);

    // 5. Write the startup layout to the stack before the next guard page.
    let sp = write_argv(mem, stack_begin, argv);

    // 5-6. Another guard page, then the heap.
    let brk_start = stack_begin + PAGE_SIZE;
    mem.set_stack_begin(stack_begin);
    let ram_end = mem.ram_end();
    mem.protect_region(brk_start, ram_end - brk_start, PROT_RW);
    mem.set_brk(brk_start);

    // The argv-strings scratch page at the bottom of the address space is
    // readable so the guest's _start can dereference the argv pointers it
    // was handed.
    mem.protect_region(0, PAGE_SIZE, PROT_R);

    (image.entry, sp)
}

/// Write argv strings at [`ARGV_STRINGS_BASE`] and the `argc`/`argv[]`/NULL
/// layout just below `stack_begin`, returning the resulting `sp`.
fn write_argv(mem: &mut Memory, stack_begin: u32, argv: &[String]) -> u32 {
    let mut string_cursor = ARGV_STRINGS_BASE;
    let mut pointers = Vec::with_capacity(argv.len());
    for arg in argv {
        let truncated: &str = if arg.len() > MAX_ARG_LEN {
            &arg[..MAX_ARG_LEN]
        } else {
            arg
        };
        let mut bytes = truncated.as_bytes().to_vec();
        bytes.push(0);
        mem.set_region(string_cursor, &bytes);
        pointers.push(string_cursor);
        string_cursor += bytes.len() as u32;
    }

    // argc (4 bytes) + one pointer per arg + a NULL terminator.
    let layout_len = 4 + 4 * (pointers.len() as u32 + 1);
    let sp = align_down(stack_begin - layout_len, 16);

    mem.set_region(sp, &(argv.len() as u32).to_le_bytes());
    let mut cursor = sp + 4;
    for ptr in pointers {
        mem.set_region(cursor, &ptr.to_le_bytes());
        cursor += 4;
    }
    mem.set_region(cursor, &0u32.to_le_bytes());

    sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Segment;

    fn image_with_one_segment(code: &[u8]) -> ElfImage<'_> {
        ElfImage {
            entry: 0x1000,
            segments: vec![Segment {
                vaddr: 0x1000,
                memsz: code.len() as u32,
                filesz: code.len() as u32,
                readable: true,
                writable: false,
                executable: true,
                data: code,
            }],
        }
    }

    #[test]
    fn bootstrap_sets_entry_and_aligned_sp() {
        let mut mem = Memory::new(16 * 1024 * 1024);
        let code = [0x13, 0x00, 0x00, 0x00];
        let image = image_with_one_segment(&code);
        let (pc, sp) = bootstrap(&mut mem, &image, &["prog".to_string()]);
        assert_eq!(pc, 0x1000);
        assert_eq!(sp % 16, 0);
        assert!(sp < mem.ram_end());
    }

    #[test]
    fn argv_layout_is_readable_back() {
        let mut mem = Memory::new(16 * 1024 * 1024);
        let code = [0x13, 0x00, 0x00, 0x00];
        let image = image_with_one_segment(&code);
        let (_, sp) = bootstrap(&mut mem, &image, &["a".to_string(), "bb".to_string()]);
        let argc: u32 = mem.read(sp).unwrap();
        assert_eq!(argc, 2);
        let argv0_ptr: u32 = mem.read(sp + 4).unwrap();
        assert_eq!(argv0_ptr, ARGV_STRINGS_BASE);
        let terminator: u32 = mem.read(sp + 4 + 4 * 2).unwrap();
        assert_eq!(terminator, 0);
    }

    #[test]
    fn brk_starts_after_the_stack_guard_page() {
        let mut mem = Memory::new(16 * 1024 * 1024);
        let code = [0x13, 0x00, 0x00, 0x00];
        let image = image_with_one_segment(&code);
        bootstrap(&mut mem, &image, &[]);
        assert!(mem.brk() > mem.stack_begin());
        assert_eq!(mem.brk(), mem.stack_begin() + PAGE_SIZE);
    }
}
