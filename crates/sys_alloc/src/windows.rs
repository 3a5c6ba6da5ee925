use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` reservations are aligned to this value (typically 64KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves `len` bytes, committing them too unless `reserve_only`.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`.
    pub unsafe fn map_anon(len: usize, reserve_only: bool, _no_reserve: bool) -> io::Result<Self> {
        let kind = if reserve_only {
            MEM_RESERVE
        } else {
            MEM_COMMIT | MEM_RESERVE
        };
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, kind, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the reservation.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        let ptr = unsafe { VirtualAlloc(start, len, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the reservation and hold no live data.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        if unsafe { VirtualFree(start, len, MEM_DECOMMIT) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
