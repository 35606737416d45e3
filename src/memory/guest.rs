//! Host-side allocation backing the guest's physical memory.

use crate::arith;
use crate::error::{Error, Result};

/// Guest physical memory region.
///
/// This allocates a contiguous, page-aligned region of host memory that the
/// monitor owns exclusively. Guest addresses are plain offsets into it.
pub struct GuestMemory {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Size of the allocation in bytes
    size: usize,
}

// Safety: GuestMemory owns its allocation; shared access only hands out
// reads, mutation requires `&mut self`.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocate a new guest memory region.
    ///
    /// The memory is page-aligned and zero-initialized.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as usize } else { 4096 };
        let aligned_size = size
            .checked_add(page_size - 1)
            .map(|s| s & !(page_size - 1))
            .ok_or_else(|| Error::MemoryAllocationFailed(format!("size {size} overflows")))?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    /// Get the size of the memory region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host virtual address of guest address 0.
    pub fn host_address(&self) -> u64 {
        self.ptr as u64
    }

    /// Get a slice view of the memory region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Get a mutable slice view of the memory region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Validate `[addr, addr + len)` and return it as a host slice range.
    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let end = arith::checked_add(addr, len as u64).ok_or(Error::InvalidGuestAddress(addr))?;
        if end > self.size as u64 {
            return Err(Error::InvalidGuestAddress(end));
        }
        Ok(addr as usize..end as usize)
    }

    /// Host pointer corresponding to a guest address.
    pub fn host_ptr(&self, addr: u64) -> Result<*const u8> {
        if addr >= self.size as u64 {
            return Err(Error::InvalidGuestAddress(addr));
        }
        Ok(unsafe { self.ptr.add(addr as usize) })
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.as_slice()[range]);
        Ok(())
    }

    /// Borrow `len` bytes starting at a guest physical address.
    pub fn slice(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.as_slice()[range])
    }

    /// Write bytes to a guest physical address.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.as_mut_slice()[range].copy_from_slice(data);
        Ok(())
    }

    /// Fill `len` bytes starting at `addr` with `value`.
    pub fn fill(&mut self, addr: u64, len: usize, value: u8) -> Result<()> {
        let range = self.range(addr, len)?;
        self.as_mut_slice()[range].fill(value);
        Ok(())
    }

    /// Zero the whole region.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Read a plain-data value from a guest physical address.
    ///
    /// `T` must be a `#[repr(C)]` type without implicit padding.
    pub fn read_obj<T: Copy>(&self, addr: u64) -> Result<T> {
        let range = self.range(addr, std::mem::size_of::<T>())?;
        unsafe { Ok(std::ptr::read_unaligned(self.ptr.add(range.start) as *const T)) }
    }

    /// Write a plain-data value to a guest physical address.
    ///
    /// `T` must be a `#[repr(C)]` type without implicit padding.
    pub fn write_obj<T: Copy>(&mut self, addr: u64, value: T) -> Result<()> {
        let range = self.range(addr, std::mem::size_of::<T>())?;
        unsafe {
            std::ptr::write_unaligned(self.ptr.add(range.start) as *mut T, value);
        }
        Ok(())
    }

    /// Read a little-endian u64.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("host_address", &format_args!("0x{:x}", self.host_address()))
            .field("size", &format_args!("0x{:x}", self.size))
            .finish()
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}
