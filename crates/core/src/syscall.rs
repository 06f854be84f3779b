//! Translation of guest `ecall` into host POSIX/newlib operations.
//!
//! Dispatch is a flat match on the syscall number rather than virtual
//! dispatch. Struct translation constants below follow the numeric syscall
//! numbers newlib's riscv `libgloss` port assigns.

use std::ffi::CStr;

use log::trace;

use crate::av::AvBackend;
use crate::memory::Memory;

pub mod number {
    pub const OPENAT: u32 = 56;
    pub const CLOSE: u32 = 57;
    pub const LSEEK: u32 = 62;
    pub const READ: u32 = 63;
    pub const WRITE: u32 = 64;
    pub const FSTAT: u32 = 80;
    pub const EXIT: u32 = 93;
    pub const BRK: u32 = 214;
    pub const GETTIMEOFDAY: u32 = 169;
    pub const OPEN: u32 = 1024;
    pub const STAT: u32 = 1038;

    pub const AV_INIT: u32 = 2048;
    pub const AV_UPDATE: u32 = 2049;
    pub const AV_SET_PALETTE: u32 = 2050;
    pub const AV_DELAY: u32 = 2051;
    pub const AV_POLL_EVENT: u32 = 2052;
    pub const AV_GET_TICKS: u32 = 2053;
    pub const AV_SHUTDOWN: u32 = 2054;
    pub const AV_SET_FRAMEBUFFER: u32 = 2055;
}

/// Result of dispatching one syscall: either a value to write into `a0`, or a
/// request to end the run (`SYS_exit`).
pub enum Outcome {
    Result(u32),
    Exit(u8),
}

fn errno_result() -> Outcome {
    Outcome::Result((-std::io::Error::last_os_error().raw_os_error().unwrap_or(1)) as u32)
}

const EFAULT: u32 = (-(libc::EFAULT as i64)) as u32;
const ENOMEM: u32 = (-(libc::ENOMEM as i64)) as u32;

/// Dispatch one syscall. `args` holds `a0..a5`; `number` is `a7`. No syscall
/// implemented here needs more than `args[0..3]`, but the full register range
/// is threaded through so a future addition needing `a4`/`a5` doesn't have to
/// change this signature.
pub fn dispatch(
    number: u32,
    args: [u32; 6],
    mem: &mut Memory,
    av: &mut impl AvBackend,
) -> Outcome {
    match number {
        number::FSTAT => sys_fstat(args[0], args[1], mem),
        number::STAT => sys_stat(args[0], args[1], mem),
        number::BRK => sys_brk(args[0], mem),
        number::OPEN => sys_open(args[0], args[1], args[2], mem),
        number::OPENAT => sys_openat(args[0], args[1], args[2], args[3], mem),
        number::READ => sys_read(args[0], args[1], args[2], mem),
        number::WRITE => sys_write(args[0], args[1], args[2], mem),
        number::LSEEK => sys_lseek(args[0], args[1], args[2]),
        number::CLOSE => sys_close(args[0]),
        number::EXIT => Outcome::Exit(args[0] as u8),
        number::GETTIMEOFDAY => sys_gettimeofday(args[0], mem),

        number::AV_INIT => Outcome::Result(av.init(args[0], args[1]) as u32),
        number::AV_UPDATE => Outcome::Result(av.update() as u32),
        number::AV_SET_PALETTE => sys_av_set_palette(args[0], args[1], mem, av),
        number::AV_DELAY => {
            av.delay(args[0]);
            Outcome::Result(0)
        }
        number::AV_POLL_EVENT => sys_av_poll_event(args[0], mem, av),
        number::AV_GET_TICKS => Outcome::Result(av.get_ticks()),
        number::AV_SHUTDOWN => {
            av.shutdown();
            Outcome::Result(0)
        }
        number::AV_SET_FRAMEBUFFER => {
            av.set_framebuffer(args[0]);
            Outcome::Result(0)
        }

        other => {
            trace!("unrecognized syscall number {other}, returning -ENOSYS");
            Outcome::Result((-(libc::ENOSYS as i64)) as u32)
        }
    }
}

fn guest_path<'a>(mem: &'a Memory, addr: u32) -> Option<&'a CStr> {
    let bytes = mem.guest_cstr(addr)?;
    CStr::from_bytes_with_nul(bytes).ok()
}

/// Translate newlib open flags. The access-mode group (`O_RDONLY`/`O_WRONLY`/`O_RDWR`) is a 2-bit *value*,
/// not a bitmask; every other flag is an independent bit.
fn translate_open_flags(guest_flags: u32) -> i32 {
    let mut host = match guest_flags & 0x3 {
        1 => libc::O_WRONLY,
        2 => libc::O_RDWR,
        _ => libc::O_RDONLY,
    };
    let bits: [(u32, i32); 7] = [
        (0x008, libc::O_APPEND),
        (0x200, libc::O_CREAT),
        (0x400, libc::O_TRUNC),
        (0x800, libc::O_EXCL),
        (0x2000, libc::O_SYNC),
        (0x4000, libc::O_NONBLOCK),
        (0x8000, libc::O_NOCTTY),
    ];
    for (guest_bit, host_flag) in bits {
        if guest_flags & guest_bit != 0 {
            host |= host_flag;
        }
    }
    host
}

fn sys_open(path: u32, flags: u32, mode: u32, mem: &Memory) -> Outcome {
    let Some(path) = guest_path(mem, path) else {
        return Outcome::Result(EFAULT);
    };
    let fd = unsafe { libc::open(path.as_ptr(), translate_open_flags(flags), mode) };
    if fd < 0 {
        errno_result()
    } else {
        Outcome::Result(fd as u32)
    }
}

fn sys_openat(dirfd: u32, path: u32, flags: u32, mode: u32, mem: &Memory) -> Outcome {
    let Some(path) = guest_path(mem, path) else {
        return Outcome::Result(EFAULT);
    };
    let fd = unsafe {
        libc::openat(dirfd as i32, path.as_ptr(), translate_open_flags(flags), mode)
    };
    if fd < 0 {
        errno_result()
    } else {
        Outcome::Result(fd as u32)
    }
}

fn sys_read(fd: u32, buf: u32, count: u32, mem: &mut Memory) -> Outcome {
    let Some(slice) = mem.guest_slice_mut(buf, count) else {
        return Outcome::Result(EFAULT);
    };
    let n = unsafe { libc::read(fd as i32, slice.as_mut_ptr() as *mut libc::c_void, slice.len()) };
    if n < 0 {
        errno_result()
    } else {
        Outcome::Result(n as u32)
    }
}

fn sys_write(fd: u32, buf: u32, count: u32, mem: &Memory) -> Outcome {
    let Some(slice) = mem.guest_slice(buf, count) else {
        return Outcome::Result(EFAULT);
    };
    let n = unsafe { libc::write(fd as i32, slice.as_ptr() as *const libc::c_void, slice.len()) };
    if n < 0 {
        errno_result()
    } else {
        Outcome::Result(n as u32)
    }
}

fn sys_lseek(fd: u32, offset: u32, whence: u32) -> Outcome {
    let off = unsafe { libc::lseek(fd as i32, offset as i32 as libc::off_t, whence as i32) };
    if off < 0 {
        errno_result()
    } else {
        Outcome::Result(off as u32)
    }
}

fn sys_close(fd: u32) -> Outcome {
    if fd <= 2 {
        return Outcome::Result(0);
    }
    let rc = unsafe { libc::close(fd as i32) };
    if rc < 0 {
        errno_result()
    } else {
        Outcome::Result(0)
    }
}

fn sys_brk(addr: u32, mem: &mut Memory) -> Outcome {
    if addr == 0 {
        return Outcome::Result(mem.brk());
    }
    if mem.set_brk(addr) {
        Outcome::Result(addr)
    } else {
        Outcome::Result(ENOMEM)
    }
}

/// Byte length of the translated newlib `stat` struct.
const NEWLIB_STAT_SIZE: u32 = 104;

fn encode_newlib_stat(st: &libc::stat) -> [u8; NEWLIB_STAT_SIZE as usize] {
    let mut out = [0u8; NEWLIB_STAT_SIZE as usize];
    let mut w = 0usize;
    let mut push = |bytes: &[u8]| {
        out[w..w + bytes.len()].copy_from_slice(bytes);
        w += bytes.len();
    };
    push(&(st.st_dev as u64).to_le_bytes());
    push(&(st.st_ino as u64).to_le_bytes());
    push(&(st.st_mode as u32).to_le_bytes());
    push(&(st.st_nlink as u32).to_le_bytes());
    push(&(st.st_uid as u32).to_le_bytes());
    push(&(st.st_gid as u32).to_le_bytes());
    push(&(st.st_rdev as u64).to_le_bytes());
    push(&0u64.to_le_bytes()); // __pad1
    push(&(st.st_size as i64).to_le_bytes());
    push(&(st.st_blksize as i32).to_le_bytes());
    push(&0i32.to_le_bytes()); // __pad2
    push(&(st.st_blocks as i64).to_le_bytes());
    push(&(atime_sec(st) as u32).to_le_bytes());
    push(&(atime_nsec(st) as u32).to_le_bytes());
    push(&(mtime_sec(st) as u32).to_le_bytes());
    push(&(mtime_nsec(st) as u32).to_le_bytes());
    push(&(ctime_sec(st) as u32).to_le_bytes());
    push(&(ctime_nsec(st) as u32).to_le_bytes());
    push(&0i32.to_le_bytes());
    push(&0i32.to_le_bytes());
    debug_assert_eq!(w, NEWLIB_STAT_SIZE as usize);
    out
}

// Linux exposes `st_atime`/`st_mtime`/`st_ctime` plus the `_nsec` companion
// fields directly on `libc::stat`; no BSD `st_atimespec`-style split is
// needed on the hosts this crate targets.
fn atime_sec(st: &libc::stat) -> i64 {
    st.st_atime
}
fn atime_nsec(st: &libc::stat) -> i64 {
    st.st_atime_nsec
}
fn mtime_sec(st: &libc::stat) -> i64 {
    st.st_mtime
}
fn mtime_nsec(st: &libc::stat) -> i64 {
    st.st_mtime_nsec
}
fn ctime_sec(st: &libc::stat) -> i64 {
    st.st_ctime
}
fn ctime_nsec(st: &libc::stat) -> i64 {
    st.st_ctime_nsec
}

fn sys_fstat(fd: u32, statbuf: u32, mem: &mut Memory) -> Outcome {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd as i32, &mut st) };
    if rc < 0 {
        return errno_result();
    }
    let encoded = encode_newlib_stat(&st);
    match mem.guest_slice_mut(statbuf, NEWLIB_STAT_SIZE) {
        Some(slice) => {
            slice.copy_from_slice(&encoded);
            Outcome::Result(0)
        }
        None => Outcome::Result(EFAULT),
    }
}

fn sys_stat(path: u32, statbuf: u32, mem: &mut Memory) -> Outcome {
    let Some(path) = guest_path(mem, path) else {
        return Outcome::Result(EFAULT);
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(path.as_ptr(), &mut st) };
    if rc < 0 {
        return errno_result();
    }
    let encoded = encode_newlib_stat(&st);
    match mem.guest_slice_mut(statbuf, NEWLIB_STAT_SIZE) {
        Some(slice) => {
            slice.copy_from_slice(&encoded);
            Outcome::Result(0)
        }
        None => Outcome::Result(EFAULT),
    }
}

fn sys_gettimeofday(tv: u32, mem: &mut Memory) -> Outcome {
    let mut host_tv: libc::timeval = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::gettimeofday(&mut host_tv, std::ptr::null_mut()) };
    if rc < 0 {
        return errno_result();
    }
    let mut encoded = [0u8; 8];
    encoded[0..4].copy_from_slice(&(host_tv.tv_sec as u32).to_le_bytes());
    encoded[4..8].copy_from_slice(&(host_tv.tv_usec as u32).to_le_bytes());
    match mem.guest_slice_mut(tv, 8) {
        Some(slice) => {
            slice.copy_from_slice(&encoded);
            Outcome::Result(0)
        }
        None => Outcome::Result(EFAULT),
    }
}

fn sys_av_set_palette(ptr: u32, n: u32, mem: &Memory, av: &mut impl AvBackend) -> Outcome {
    let Some(bytes) = mem.guest_slice(ptr, n * 4) else {
        return Outcome::Result(EFAULT);
    };
    let entries: Vec<[u8; 4]> = bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]).collect();
    Outcome::Result(av.set_palette(&entries) as u32)
}

fn sys_av_poll_event(event_ptr: u32, mem: &mut Memory, av: &mut impl AvBackend) -> Outcome {
    use crate::av::{event_code, AvEvent};

    let Some(event) = av.poll_event() else {
        return Outcome::Result(0);
    };

    let mut bytes = Vec::with_capacity(24);
    let push_u32 = |v: u32, bytes: &mut Vec<u8>| bytes.extend_from_slice(&v.to_le_bytes());
    let push_i32 = |v: i32, bytes: &mut Vec<u8>| bytes.extend_from_slice(&v.to_le_bytes());

    match event {
        AvEvent::KeyDown { timestamp, scan_code, vk_code } => {
            push_u32(event_code::KEYDOWN, &mut bytes);
            push_u32(timestamp, &mut bytes);
            push_u32(scan_code, &mut bytes);
            push_u32(vk_code, &mut bytes);
        }
        AvEvent::KeyUp { timestamp, scan_code, vk_code } => {
            push_u32(event_code::KEYUP, &mut bytes);
            push_u32(timestamp, &mut bytes);
            push_u32(scan_code, &mut bytes);
            push_u32(vk_code, &mut bytes);
        }
        AvEvent::MouseDown { timestamp, clicks, state, button, x, y } => {
            push_u32(event_code::MOUSEDOWN, &mut bytes);
            push_u32(timestamp, &mut bytes);
            push_i32(clicks, &mut bytes);
            push_i32(state, &mut bytes);
            push_i32(button, &mut bytes);
            push_i32(x, &mut bytes);
            push_i32(y, &mut bytes);
        }
        AvEvent::MouseUp { timestamp, clicks, state, button, x, y } => {
            push_u32(event_code::MOUSEUP, &mut bytes);
            push_u32(timestamp, &mut bytes);
            push_i32(clicks, &mut bytes);
            push_i32(state, &mut bytes);
            push_i32(button, &mut bytes);
            push_i32(x, &mut bytes);
            push_i32(y, &mut bytes);
        }
        AvEvent::MouseMove { timestamp, state, x, y, xrel, yrel } => {
            push_u32(event_code::MOUSEMOVE, &mut bytes);
            push_u32(timestamp, &mut bytes);
            push_i32(state, &mut bytes);
            push_i32(x, &mut bytes);
            push_i32(y, &mut bytes);
            push_i32(xrel, &mut bytes);
            push_i32(yrel, &mut bytes);
        }
        AvEvent::Quit { timestamp } => {
            push_u32(event_code::QUIT, &mut bytes);
            push_u32(timestamp, &mut bytes);
        }
    }

    match mem.guest_slice_mut(event_ptr, bytes.len() as u32) {
        Some(slice) => {
            slice.copy_from_slice(&bytes);
            Outcome::Result(1)
        }
        None => Outcome::Result(EFAULT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::HeadlessAvBackend;
    use crate::memory::{Memory, PAGE_SIZE, PROT_RW};

    fn mem_with_rw(size: u32) -> Memory {
        let mut mem = Memory::new(size);
        mem.protect_region(0, size, PROT_RW);
        mem
    }

    #[test]
    fn open_flag_translation_access_mode_is_a_value_not_a_mask() {
        assert_eq!(translate_open_flags(0) & 0x3, libc::O_RDONLY);
        assert_eq!(translate_open_flags(1), libc::O_WRONLY);
        assert_eq!(translate_open_flags(2), libc::O_RDWR);
    }

    #[test]
    fn open_flag_translation_or_bits() {
        let host = translate_open_flags(1 | 0x200 | 0x400);
        assert_eq!(host & libc::O_WRONLY, libc::O_WRONLY);
        assert_eq!(host & libc::O_CREAT, libc::O_CREAT);
        assert_eq!(host & libc::O_TRUNC, libc::O_TRUNC);
    }

    #[test]
    fn close_refuses_std_fds() {
        match sys_close(0) {
            Outcome::Result(v) => assert_eq!(v, 0),
            Outcome::Exit(_) => panic!("close must not exit"),
        }
    }

    #[test]
    fn brk_query_returns_current_value_without_mutating() {
        let mut mem = mem_with_rw(PAGE_SIZE * 4);
        mem.set_stack_begin(0);
        mem.set_brk(PAGE_SIZE);
        match sys_brk(0, &mut mem) {
            Outcome::Result(v) => assert_eq!(v, PAGE_SIZE),
            Outcome::Exit(_) => panic!(),
        }
    }

    #[test]
    fn brk_growth_past_ram_end_is_enomem() {
        let mut mem = mem_with_rw(PAGE_SIZE * 4);
        mem.set_stack_begin(0);
        let ram_end = mem.ram_end();
        match sys_brk(ram_end + 1, &mut mem) {
            Outcome::Result(v) => assert_eq!(v, ENOMEM),
            Outcome::Exit(_) => panic!(),
        }
    }

    #[test]
    fn write_with_out_of_bounds_buffer_is_efault() {
        let mem = mem_with_rw(PAGE_SIZE);
        let ram_end = mem.ram_end();
        match sys_write(1, ram_end - 2, 16, &mem) {
            Outcome::Result(v) => assert_eq!(v, EFAULT),
            Outcome::Exit(_) => panic!(),
        }
    }

    #[test]
    fn exit_syscall_stops_the_run() {
        let mut mem = mem_with_rw(PAGE_SIZE);
        let mut av = HeadlessAvBackend::default();
        match dispatch(number::EXIT, [7, 0, 0, 0, 0, 0], &mut mem, &mut av) {
            Outcome::Exit(status) => assert_eq!(status, 7),
            Outcome::Result(_) => panic!("SYS_exit must end the run"),
        }
    }

    #[test]
    fn av_get_ticks_round_trips_through_dispatch() {
        let mut mem = mem_with_rw(PAGE_SIZE);
        let mut av = HeadlessAvBackend::default();
        match dispatch(number::AV_GET_TICKS, [0; 6], &mut mem, &mut av) {
            Outcome::Result(v) => assert!(v > 0),
            Outcome::Exit(_) => panic!(),
        }
    }
}
