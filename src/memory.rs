use super::PatchError;
use super::Result;
use log::trace;
use std::ptr::{read_volatile, write_volatile};

#[cfg(target_os = "windows")]
use {
    std::mem::size_of,
    winapi::{
        shared::basetsd::SIZE_T,
        um::{
            memoryapi::VirtualQuery,
            processthreadsapi::{FlushInstructionCache, GetCurrentProcess},
            winnt::{
                MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
                PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
                PVOID,
            },
        },
    },
};

#[cfg(target_os = "windows")]
fn query_protection(address: usize) -> Option<u32> {
    unsafe {
        let mut memory_info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
        let bytes = VirtualQuery(
            address as PVOID,
            &mut memory_info,
            size_of::<MEMORY_BASIC_INFORMATION>() as SIZE_T,
        );
        if bytes == 0 || memory_info.State != MEM_COMMIT {
            return None;
        }
        if memory_info.Protect & PAGE_GUARD != 0 {
            return None;
        }
        Some(memory_info.Protect)
    }
}

/// can_read_range checks that the pages holding the first and last byte of
/// `[address, address + len)` are committed and readable.
///
/// Example
/// ```rust
///    let data = [0x90u8; 4];
///    assert!(sigpatch::memory::can_read_range(data.as_ptr() as usize, data.len()));
/// ```
#[cfg(target_os = "windows")]
pub fn can_read_range(address: usize, len: usize) -> bool {
    const READABLE: u32 = PAGE_READONLY
        | PAGE_READWRITE
        | PAGE_WRITECOPY
        | PAGE_EXECUTE_READ
        | PAGE_EXECUTE_READWRITE
        | PAGE_EXECUTE_WRITECOPY;
    range_ends(address, len)
        .iter()
        .all(|&addr| matches!(query_protection(addr), Some(p) if p & READABLE != 0))
}

#[cfg(not(target_os = "windows"))]
pub fn can_read_range(address: usize, _len: usize) -> bool {
    // No page query on unix, a null pointer is the only thing rejected up front
    address != 0
}

/// can_write_range checks that the pages holding the first and last byte of
/// `[address, address + len)` are committed and writable.
#[cfg(target_os = "windows")]
pub fn can_write_range(address: usize, len: usize) -> bool {
    const WRITABLE: u32 =
        PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;
    range_ends(address, len)
        .iter()
        .all(|&addr| matches!(query_protection(addr), Some(p) if p & WRITABLE != 0))
}

#[cfg(not(target_os = "windows"))]
pub fn can_write_range(address: usize, _len: usize) -> bool {
    address != 0
}

#[cfg(target_os = "windows")]
fn range_ends(address: usize, len: usize) -> [usize; 2] {
    [address, address + len.saturating_sub(1)]
}

/// read_bytes copies `len` bytes starting at `address`, in ascending order.
///
/// # Safety
/// `address` must point to `len` bytes mapped in the current process.
///
/// Example
/// ```rust
/// let data = [0x55u8, 0x48, 0x89, 0xE5];
/// let bytes = unsafe { sigpatch::memory::read_bytes(data.as_ptr() as usize, 2).unwrap() };
/// assert_eq!(bytes, vec![0x55, 0x48]);
/// ```
pub unsafe fn read_bytes(address: usize, len: usize) -> Result<Vec<u8>> {
    trace!("Checking if {} bytes at {:#x} are readable", len, address);
    if !can_read_range(address, len) {
        trace!("Address is not readable");
        return Err(PatchError::ReadPtrError(address));
    }
    let ptr = address as *const u8;
    Ok((0..len).map(|i| read_volatile(ptr.add(i))).collect())
}

/// write_bytes overwrites `bytes.len()` bytes starting at `address`, in
/// ascending offset order. The whole range is checked before the first
/// byte is written, so a failure leaves memory untouched.
///
/// # Safety
/// `address` must point to `bytes.len()` bytes mapped in the current process,
/// and nothing else may be reading or executing that range concurrently.
pub unsafe fn write_bytes(address: usize, bytes: &[u8]) -> Result<()> {
    trace!("Checking if {} bytes at {:#x} are writable", bytes.len(), address);
    if !can_write_range(address, bytes.len()) {
        trace!("Address is not writable");
        return Err(PatchError::WritePtrError(address));
    }
    let ptr = address as *mut u8;
    for (i, byte) in bytes.iter().enumerate() {
        write_volatile(ptr.add(i), *byte);
    }
    Ok(())
}

/// Makes freshly written code visible to the instruction fetcher.
#[cfg(target_os = "windows")]
pub fn flush_instruction_cache(address: usize, len: usize) {
    trace!("Flushing instruction cache for {} bytes at {:#x}", len, address);
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), address as PVOID, len as SIZE_T);
    }
}

/// x86 keeps the instruction cache coherent with data writes.
#[cfg(not(target_os = "windows"))]
pub fn flush_instruction_cache(_address: usize, _len: usize) {}
