use super::PatchError;
use super::Result;
use log::trace;

use std::sync::OnceLock;

#[cfg(unix)]
use {
    nix::sys::mman::{mprotect, ProtFlags},
    nix::unistd::{sysconf, SysconfVar},
    std::ffi::c_void,
    std::ptr::NonNull,
};

#[cfg(windows)]
use winapi::{
    shared::{basetsd::SIZE_T, minwindef::DWORD},
    um::{
        errhandlingapi::GetLastError,
        memoryapi::VirtualProtect,
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PVOID},
    },
};

/// Page size assumed when the system does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

#[cfg(unix)]
fn system_page_size() -> Option<usize> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Some(size as usize),
        _ => None,
    }
}

#[cfg(windows)]
fn system_page_size() -> Option<usize> {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    match info.dwPageSize as usize {
        0 => None,
        size => Some(size),
    }
}

/// Page size of the running system, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        let size = system_page_size()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        trace!("Page size is {:#x}", size);
        size
    })
}

/// Rounds `address` down to the start of its page.
pub fn page_align(address: usize) -> usize {
    address & !(page_size() - 1)
}

/// Returns the page-aligned start and the length that still covers
/// `[address, address + len)` from there.
pub fn page_span(address: usize, len: usize) -> (usize, usize) {
    let start = page_align(address);
    (start, len + (address - start))
}

/// Protection that was in effect before [`ProtectionController::set_writable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorProtection {
    /// Previous flags could not be determined
    Unknown,
    /// Raw platform flags, from `VirtualProtect` or the process mappings
    Flags(u32),
}

/// Capability to flip page protection around a byte range.
///
/// # Safety
///
/// Both methods change protection for whole pages, which can affect memory
/// outside the requested range. Callers must only pass ranges they own.
pub trait ProtectionController {
    /// Makes `[address, address + len)` writable and executable.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn set_writable(&self, address: usize, len: usize) -> Result<PriorProtection>;

    /// Puts back the protection captured by a previous `set_writable`.
    ///
    /// # Safety
    /// Nothing may write to the range once it is no longer writable.
    unsafe fn restore(&self, address: usize, len: usize, prior: PriorProtection) -> Result<()>;
}

fn check_range(address: usize, len: usize) -> Result<()> {
    if address == 0 {
        return Err(PatchError::NullAddress);
    }
    if len == 0 {
        return Err(PatchError::EmptyRange);
    }
    Ok(())
}

/// Protection primitive of the running platform.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeProtection;

impl NativeProtection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
impl NativeProtection {
    unsafe fn protect(&self, address: usize, len: usize, flags: ProtFlags) -> Result<()> {
        let (start, span) = page_span(address, len);
        trace!(
            "mprotect({:#x}, {:#x}, {:?}) for {} bytes at {:#x}",
            start,
            span,
            flags,
            len,
            address
        );
        let ptr = NonNull::new(start as *mut c_void).ok_or(PatchError::NullAddress)?;
        mprotect(ptr, span, flags).map_err(|errno| PatchError::ProtectionChangeFailed {
            address,
            len,
            reason: errno.to_string(),
        })
    }
}

/// Protection flags of the mapping holding `address`, from `/proc/<pid>/maps` content.
#[cfg(target_os = "linux")]
pub fn protection_in_maps(contents: &str, address: usize) -> Option<ProtFlags> {
    let mapping = crate::resolver::mappings(contents).find(|mapping| mapping.contains(address))?;
    let mut flags = ProtFlags::PROT_NONE;
    for (perm, flag) in mapping.perms.chars().zip([
        ProtFlags::PROT_READ,
        ProtFlags::PROT_WRITE,
        ProtFlags::PROT_EXEC,
    ]) {
        if perm != '-' {
            flags |= flag;
        }
    }
    Some(flags)
}

/// Current protection of the page holding `address`.
#[cfg(target_os = "linux")]
pub fn current_protection(address: usize) -> PriorProtection {
    let contents = match std::fs::read_to_string("/proc/self/maps") {
        Ok(contents) => contents,
        Err(err) => {
            trace!("Unable to read /proc/self/maps: {}", err);
            return PriorProtection::Unknown;
        }
    };
    match protection_in_maps(&contents, address) {
        Some(flags) => PriorProtection::Flags(flags.bits() as u32),
        None => PriorProtection::Unknown,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn current_protection(_address: usize) -> PriorProtection {
    PriorProtection::Unknown
}

#[cfg(unix)]
impl ProtectionController for NativeProtection {
    unsafe fn set_writable(&self, address: usize, len: usize) -> Result<PriorProtection> {
        check_range(address, len)?;
        // mprotect does not report the old flags, take them from the mappings first
        let prior = current_protection(address);
        self.protect(
            address,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )?;
        Ok(prior)
    }

    unsafe fn restore(&self, address: usize, len: usize, prior: PriorProtection) -> Result<()> {
        check_range(address, len)?;
        let flags = match prior {
            PriorProtection::Unknown => ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            PriorProtection::Flags(bits) => ProtFlags::from_bits_truncate(bits as i32),
        };
        self.protect(address, len, flags)
    }
}

#[cfg(windows)]
impl NativeProtection {
    unsafe fn protect(&self, address: usize, len: usize, flags: DWORD) -> Result<DWORD> {
        trace!(
            "VirtualProtect({:#x}, {:#x}, {:#x})",
            address,
            len,
            flags
        );
        let mut old_protection: DWORD = 0x00;
        if VirtualProtect(address as PVOID, len as SIZE_T, flags, &mut old_protection) == 0 {
            return Err(PatchError::ProtectionChangeFailed {
                address,
                len,
                reason: format!("VirtualProtect failed with error {}", GetLastError()),
            });
        }
        Ok(old_protection)
    }
}

#[cfg(windows)]
impl ProtectionController for NativeProtection {
    unsafe fn set_writable(&self, address: usize, len: usize) -> Result<PriorProtection> {
        check_range(address, len)?;
        let old_protection = self.protect(address, len, PAGE_EXECUTE_READWRITE)?;
        Ok(PriorProtection::Flags(old_protection))
    }

    unsafe fn restore(&self, address: usize, len: usize, prior: PriorProtection) -> Result<()> {
        check_range(address, len)?;
        let flags = match prior {
            PriorProtection::Unknown => PAGE_EXECUTE_READ,
            PriorProtection::Flags(bits) => bits,
        };
        self.protect(address, len, flags).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size >= 0x1000);
        assert!(size.is_power_of_two());
        assert_eq!(page_size(), size);
    }

    #[test]
    fn span_covers_page_straddling_range() {
        let page = page_size();
        assert_eq!(page_span(page, 4), (page, 4));
        assert_eq!(page_span(page * 2 - 2, 4), (page, page + 2));
        // the span must reach the last requested byte on the next page
        let (start, span) = page_span(page * 2 - 2, 4);
        assert!(start + span > page * 2);
    }

    #[test]
    fn rejects_null_and_empty() {
        let protection = NativeProtection::new();
        assert!(matches!(
            unsafe { protection.set_writable(0, 4) },
            Err(PatchError::NullAddress)
        ));
        let data = [0u8; 4];
        assert!(matches!(
            unsafe { protection.set_writable(data.as_ptr() as usize, 0) },
            Err(PatchError::EmptyRange)
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_flags_from_maps() {
        const MAPS: &str = "\
55d0c0a28000-55d0c0b00000 r-xp 00028000 08:01 1311 /game/bin/linuxsteamrt64/libserver.so
55d0c0b10000-55d0c0b20000 rw-p 00110000 08:01 1312 /game/bin/linuxsteamrt64/libclient.so
7ffd1a100000-7ffd1a101000 ---p 00000000 00:00 0
";
        assert_eq!(
            protection_in_maps(MAPS, 0x55d0c0a28010),
            Some(ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)
        );
        assert_eq!(
            protection_in_maps(MAPS, 0x55d0c0b1ffff),
            Some(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        );
        assert_eq!(protection_in_maps(MAPS, 0x7ffd1a100000), Some(ProtFlags::PROT_NONE));
        assert_eq!(protection_in_maps(MAPS, 0x55d0c0b00000), None);
    }

    #[cfg(unix)]
    #[test]
    /// Maps a read-only page, makes part of it writable and writes through it
    fn makes_read_only_page_writable() {
        use nix::sys::mman::{mmap_anonymous, munmap, MapFlags};
        use std::num::NonZeroUsize;

        let page_len = page_size();
        let length = NonZeroUsize::new(page_len * 2).unwrap();
        let page = unsafe {
            mmap_anonymous(None, length, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE).unwrap()
        };
        // straddle the boundary between the two pages
        let address = page.as_ptr() as usize + page_len - 2;
        let (start, span) = page_span(address, 4);
        assert_eq!(start, page.as_ptr() as usize);
        assert_eq!(start % page_len, 0);
        assert!(start + span >= address + 4);

        let protection = NativeProtection::new();
        let prior = unsafe { protection.set_writable(address, 4).unwrap() };
        #[cfg(target_os = "linux")]
        assert_eq!(prior, PriorProtection::Flags(ProtFlags::PROT_READ.bits() as u32));

        unsafe { crate::memory::write_bytes(address, &[0x90, 0x90, 0x90, 0xC3]).unwrap() };
        let written = unsafe { crate::memory::read_bytes(address, 4).unwrap() };
        assert_eq!(written, vec![0x90, 0x90, 0x90, 0xC3]);

        unsafe {
            protection.restore(address, 4, prior).unwrap();
            munmap(page, length.get()).unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    /// A read+write page patched with hardening on must not come back executable
    fn hardening_keeps_read_write_page_flags() {
        use crate::config::{PatchDefinition, PatchEntry, PatcherConfig};
        use crate::module::{ModulePaths, Platform};
        use crate::resolver::ScanResolver;
        use crate::Patcher;
        use nix::sys::mman::{mmap_anonymous, munmap, MapFlags};
        use std::num::NonZeroUsize;

        let length = NonZeroUsize::new(page_size()).unwrap();
        let page = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .unwrap()
        };
        let base = page.as_ptr() as usize;
        unsafe { crate::memory::write_bytes(base, &[0x55, 0x48, 0x89, 0xE5]).unwrap() };
        let read_write = PriorProtection::Flags((ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).bits() as u32);
        assert_eq!(current_protection(base), read_write);

        let mut config = PatcherConfig::default();
        config.restore_protection_after_write = true;
        config.patches.insert(
            "early_return".into(),
            PatchDefinition {
                module: "server".into(),
                windows: PatchEntry::default(),
                linux: PatchEntry::new("55 48 ? E5", "C3"),
            },
        );
        let mut resolver = ScanResolver::new();
        unsafe { resolver.register("libserver.so", base, 4) };
        let patcher = Patcher::new(config, resolver)
            .with_platform(Platform::Linux)
            .with_module_paths(ModulePaths::new("", "", Platform::Linux));

        assert_eq!(patcher.apply("early_return").unwrap(), base);
        assert_eq!(current_protection(base), read_write);
        assert_eq!(unsafe { crate::memory::read_bytes(base, 1).unwrap() }, vec![0xC3]);

        patcher.restore("early_return").unwrap();
        assert_eq!(current_protection(base), read_write);
        assert_eq!(unsafe { crate::memory::read_bytes(base, 1).unwrap() }, vec![0x55]);

        unsafe { munmap(page, length.get()).unwrap() };
    }
}
