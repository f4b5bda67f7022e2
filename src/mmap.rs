//! Low-level reservation, commit and protection of the page-aligned
//! address ranges that hold generated code.
//!
//! A [`Mmap`] owns one OS reservation of uncommitted address space.
//! Pages inside a reservation are committed and re-protected through the
//! free functions in this module; the reservation is released when the
//! `Mmap` is dropped.

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

/// Page permissions used for code regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Protection {
    fn to_region(self) -> region::Protection {
        match self {
            Protection::ReadWrite => region::Protection::READ_WRITE,
            Protection::ReadExecute => region::Protection::READ_EXECUTE,
            Protection::ReadWriteExecute => region::Protection::READ_WRITE_EXECUTE,
        }
    }
}

/// Number of `set_permissions` calls made so far, for assertions about
/// syscall batching in tests.
pub(crate) static PROTECT_CALLS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn protect_call_count() -> usize {
    PROTECT_CALLS.load(SeqCst)
}

pub fn page_size() -> usize {
    region::page::size()
}

/// One reservation of virtual address space.
///
/// The address is stored as a `usize` instead of a pointer so the type is
/// natively `Send` and `Sync`; coordination happens at the OS layer. An
/// `Mmap` is either reserved or released; default-constructed is
/// released.
#[derive(Debug)]
pub struct Mmap {
    ptr: usize,
    len: usize,
}

impl Mmap {
    /// Construct a new empty (released) instance.
    pub fn new() -> Self {
        Self { ptr: 0, len: 0 }
    }

    /// Reserve `size` bytes of address space, preferably at `hint`
    /// (pass 0 for no preference), without committing any of it. `size`
    /// must be a page-size multiple. The pages are inaccessible until
    /// committed.
    #[cfg(not(target_os = "windows"))]
    pub fn reserve(size: usize, hint: usize) -> Result<Self> {
        let page_size = page_size();
        assert_eq!(size & (page_size - 1), 0);
        if size == 0 {
            return Ok(Self::new());
        }

        let ptr = unsafe {
            rustix::io::mmap_anonymous(
                hint as *mut std::ffi::c_void,
                size,
                rustix::io::ProtFlags::empty(),
                rustix::io::MapFlags::PRIVATE,
            )
            .context(format!("mmap failed to reserve {:#x} bytes", size))?
        };

        Ok(Self {
            ptr: ptr as usize,
            len: size,
        })
    }

    /// Reserve `size` bytes of address space, preferably at `hint`
    /// (pass 0 for no preference), without committing any of it. `size`
    /// must be a page-size multiple. The pages are inaccessible until
    /// committed.
    #[cfg(target_os = "windows")]
    pub fn reserve(size: usize, hint: usize) -> Result<Self> {
        use anyhow::bail;
        use std::io;
        use std::ptr;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};

        let page_size = page_size();
        assert_eq!(size & (page_size - 1), 0);
        if size == 0 {
            return Ok(Self::new());
        }

        // A placement hint is a hard request to VirtualAlloc; fall back
        // to letting the OS choose if the hinted range is taken.
        let mut ptr = unsafe { VirtualAlloc(hint as *mut _, size, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() && hint != 0 {
            ptr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        }
        if ptr.is_null() {
            bail!(
                "VirtualAlloc failed to reserve {:#x} bytes: {}",
                size,
                io::Error::last_os_error()
            );
        }

        Ok(Self {
            ptr: ptr as usize,
            len: size,
        })
    }

    pub fn address(&self) -> usize {
        self.ptr
    }

    pub fn end(&self) -> usize {
        self.ptr + self.len
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_reserved(&self) -> bool {
        self.len != 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.ptr <= addr && addr < self.end()
    }
}

impl Default for Mmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mmap {
    #[cfg(not(target_os = "windows"))]
    fn drop(&mut self) {
        if self.len != 0 {
            unsafe { rustix::io::munmap(self.ptr as *mut std::ffi::c_void, self.len) }
                .expect("munmap failed");
        }
    }

    #[cfg(target_os = "windows")]
    fn drop(&mut self) {
        if self.len != 0 {
            use winapi::ctypes::c_void;
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;
            let r = unsafe { VirtualFree(self.ptr as *mut c_void, 0, MEM_RELEASE) };
            assert_ne!(r, 0);
        }
    }
}

/// Commit previously reserved pages with the given permission. `addr`
/// and `len` must be page-aligned and lie inside a reservation.
#[cfg(not(target_os = "windows"))]
pub fn commit_pages(addr: usize, len: usize, protection: Protection) -> Result<()> {
    let page_size = page_size();
    assert_eq!(addr & (page_size - 1), 0);
    assert_eq!(len & (page_size - 1), 0);

    unsafe { region::protect(addr as *const u8, len, protection.to_region()) }
        .context(format!("failed to commit {:#x} bytes at {:#x}", len, addr))?;
    Ok(())
}

/// Commit previously reserved pages with the given permission. `addr`
/// and `len` must be page-aligned and lie inside a reservation.
#[cfg(target_os = "windows")]
pub fn commit_pages(addr: usize, len: usize, protection: Protection) -> Result<()> {
    use anyhow::bail;
    use std::io;
    use winapi::ctypes::c_void;
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READWRITE};

    let page_size = page_size();
    assert_eq!(addr & (page_size - 1), 0);
    assert_eq!(len & (page_size - 1), 0);

    let flags = match protection {
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ReadExecute => PAGE_EXECUTE_READ,
        Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
    };
    if unsafe { VirtualAlloc(addr as *mut c_void, len, MEM_COMMIT, flags) }.is_null() {
        bail!(
            "VirtualAlloc failed to commit {:#x} bytes at {:#x}: {}",
            len,
            addr,
            io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Change the permission of already-committed pages. `addr` and `len`
/// must be page-aligned.
pub fn set_permissions(addr: usize, len: usize, protection: Protection) -> Result<()> {
    let page_size = page_size();
    assert_eq!(addr & (page_size - 1), 0);
    assert_eq!(len & (page_size - 1), 0);

    PROTECT_CALLS.fetch_add(1, SeqCst);
    unsafe { region::protect(addr as *const u8, len, protection.to_region()) }.context(format!(
        "failed to protect {:#x} bytes at {:#x} as {:?}",
        len, addr, protection
    ))?;
    Ok(())
}

/// A randomized, page-aligned address usable as an mmap placement hint.
pub(crate) fn random_mmap_hint() -> usize {
    let raw: usize = SmallRng::from_entropy().gen();
    // Stay within the low 46 bits so the hint is mappable on all common
    // 64-bit configurations.
    #[cfg(target_pointer_width = "64")]
    let raw = raw & ((1 << 46) - 1);
    raw & !(page_size() - 1)
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Mmap>();
}
