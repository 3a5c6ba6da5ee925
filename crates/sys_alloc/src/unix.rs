use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes of anonymous memory.
    ///
    /// Reserve-only mappings start as `PROT_NONE`.
    ///
    /// # Safety
    ///
    /// Calls `mmap`.
    pub unsafe fn map_anon(len: usize, reserve_only: bool, no_reserve: bool) -> io::Result<Self> {
        let no_reserve = if no_reserve || reserve_only { MAP_NORESERVE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | no_reserve;
        let prot = if reserve_only {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the mapping.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        let rc = unsafe { libc::mprotect(start, len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the mapping and hold no live data.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        // Private anonymous pages read back as zero after MADV_DONTNEED.
        let rc = unsafe { libc::madvise(start, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
