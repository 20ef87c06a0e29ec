//! Installation of the loader interceptions on arm64 Apple platforms.

use super::patch::{fcntl_action, BypassPatch, FcntlAction, InterceptionTable, SignatureSet, Symbol, THUNK_LEN};
use super::scan::{command_area_len, text_vm_size, SCAN_START, SCAN_WINDOW};
use crate::{Error, Result};
use goblin::mach::header::SIZEOF_HEADER_64;
use libc::{c_int, c_void, off_t, size_t};
use tracing::debug;

const TASK_DYLD_INFO: u32 = 17;
const TASK_DYLD_INFO_COUNT: u32 = 5;
const KERN_SUCCESS: c_int = 0;

const VM_PROT_READ: c_int = 0x1;
const VM_PROT_WRITE: c_int = 0x2;
const VM_PROT_EXECUTE: c_int = 0x4;
const VM_PROT_COPY: c_int = 0x10;

/// Offset of `dyldImageLoadAddress` in `dyld_all_image_infos`.
const DYLD_IMAGE_LOAD_ADDRESS_OFFSET: usize = 32;

#[repr(C)]
#[derive(Default)]
struct TaskDyldInfo {
    all_image_info_addr: u64,
    all_image_info_size: u64,
    all_image_info_format: i32,
}

extern "C" {
    static mach_task_self_: u32;

    fn task_info(task: u32, flavor: u32, info: *mut TaskDyldInfo, count: *mut u32) -> c_int;
    fn vm_protect(task: u32, address: usize, size: usize, set_maximum: c_int, protection: c_int) -> c_int;
    fn sys_icache_invalidate(start: *mut c_void, len: size_t);
}

/// Find the loader, plan the patches and write them.
pub(super) fn install(signatures: &SignatureSet) -> Result<Vec<BypassPatch>> {
    let table = InterceptionTable::new(
        signatures,
        &[
            (Symbol::Mmap, hook_mmap as usize as u64),
            (Symbol::Fcntl, hook_fcntl as usize as u64),
        ],
    )?;

    let base = loader_base()?;
    let text_size = mapped_text_size(base)?;
    let len = text_size.min(SCAN_START + SCAN_WINDOW + THUNK_LEN);
    // SAFETY: the loader's __TEXT segment is mapped readable for at least
    // `text_size` bytes from its header.
    let image = unsafe { std::slice::from_raw_parts(base, len) };

    let patches = table.plan(image, base as u64)?;
    for patch in &patches {
        write_patch(patch)?;
        debug!(symbol = %patch.symbol, address = patch.target_address, "patched loader stub");
    }
    Ok(patches)
}

fn loader_base() -> Result<*const u8> {
    let mut info = TaskDyldInfo::default();
    let mut count = TASK_DYLD_INFO_COUNT;
    // SAFETY: `info` is a task_dyld_info of `count` natural_t words.
    let kr = unsafe { task_info(mach_task_self_, TASK_DYLD_INFO, &mut info, &mut count) };
    if kr != KERN_SUCCESS || info.all_image_info_addr == 0 {
        return Err(Error::SignatureScanMiss(format!("task_info(TASK_DYLD_INFO) failed: {}", kr)));
    }

    let field = (info.all_image_info_addr as usize + DYLD_IMAGE_LOAD_ADDRESS_OFFSET) as *const usize;
    // SAFETY: dyld_all_image_infos is mapped for the life of the process.
    let base = unsafe { field.read_unaligned() } as *const u8;
    if base.is_null() {
        return Err(Error::SignatureScanMiss("loader load address unknown".into()));
    }
    Ok(base)
}

/// `vmsize` of the `__TEXT` segment of the image mapped at `base`.
fn mapped_text_size(base: *const u8) -> Result<usize> {
    // SAFETY: `base` points at a mapped Mach-O header.
    let header = unsafe { std::slice::from_raw_parts(base, SIZEOF_HEADER_64) };
    let len = command_area_len(header)?;
    // SAFETY: the load commands follow the header inside the first page.
    let commands = unsafe { std::slice::from_raw_parts(base, len) };
    text_vm_size(commands)
}

fn write_patch(patch: &BypassPatch) -> Result<()> {
    let address = patch.target_address as usize;
    let len = patch.replacement.len();
    // SAFETY: the target lies in the loader's __TEXT segment; the page is
    // made writable (copy-on-write) for the duration of the copy.
    unsafe {
        let kr = vm_protect(mach_task_self_, address, len, 0, VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY);
        if kr != KERN_SUCCESS {
            return Err(Error::SignatureScanMiss(format!("vm_protect(rw) failed for {}: {}", patch.symbol, kr)));
        }
        std::ptr::copy_nonoverlapping(patch.replacement.as_ptr(), address as *mut u8, len);
        let kr = vm_protect(mach_task_self_, address, len, 0, VM_PROT_READ | VM_PROT_EXECUTE);
        if kr != KERN_SUCCESS {
            return Err(Error::SignatureScanMiss(format!("vm_protect(rx) failed for {}: {}", patch.symbol, kr)));
        }
        sys_icache_invalidate(address as *mut c_void, len);
    }
    Ok(())
}

/// Replacement for the loader's `mmap`: when an executable file mapping is
/// refused, map anonymous memory, read the file into it and apply the
/// requested protection.
unsafe extern "C" fn hook_mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let mapped = libc::mmap(addr, len, prot, flags, fd, offset);
    if mapped != libc::MAP_FAILED || fd < 0 || prot & libc::PROT_EXEC == 0 {
        return mapped;
    }

    let anon_flags = (flags & !libc::MAP_SHARED) | libc::MAP_PRIVATE | libc::MAP_ANON;
    let anon = libc::mmap(addr, len, libc::PROT_READ | libc::PROT_WRITE, anon_flags, -1, 0);
    if anon == libc::MAP_FAILED {
        return anon;
    }
    let mut filled = 0usize;
    while filled < len {
        let n = libc::pread(
            fd,
            (anon as *mut u8).add(filled) as *mut c_void,
            len - filled,
            offset + filled as off_t,
        );
        if n <= 0 {
            break;
        }
        filled += n as usize;
    }
    if libc::mprotect(anon, len, prot) != 0 {
        libc::munmap(anon, len);
        return libc::MAP_FAILED;
    }
    anon
}

/// Replacement for the loader's `fcntl`.
unsafe extern "C" fn hook_fcntl(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    match fcntl_action(cmd) {
        FcntlAction::ReportFullCoverage => {
            // fsignatures_t.fs_file_start
            if !arg.is_null() {
                (arg as *mut off_t).write(0xFFFF_FFFF);
            }
            0
        }
        FcntlAction::ReportSuccess => 0,
        FcntlAction::PassThrough => libc::fcntl(fd, cmd, arg),
    }
}
