use std::ptr::NonNull;

use crate::utils::align;

/// This trait provides an abstraction over the place the heap gets its
/// region from. The allocator only needs "give me `len` contiguous bytes,
/// once" and a way to hand them back when the heap is dropped; how that is
/// done is up to the implementation.
pub trait MemoryProvider {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// start of the region or `None` if the request fails.
    ///
    /// The region must be readable, writable, at least 8-byte aligned and
    /// stay valid until it is given back with [`MemoryProvider::release`].
    fn reserve(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr`.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must come from a successful call to
    /// [`MemoryProvider::reserve`] on this provider, and nothing may access
    /// the region afterwards.
    unsafe fn release(&mut self, addr: NonNull<u8>, len: usize);
}

/// Memory straight from the kernel: `mmap` on unix, `VirtualAlloc` on
/// windows. Requests are rounded up to whole pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

/// Low level memory operations and syscalls. As the allocator, our top level
/// view of this has nothing to do with the concrete APIs offered by each
/// kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;
}

/// Virtual memory page size of the computer. This is usually 4096.
#[inline]
pub fn page_size() -> usize {
    SystemMemory::page_size()
}

impl MemoryProvider for SystemMemory {
    fn reserve(&mut self, len: usize) -> Option<NonNull<u8>> {
        let len = align(len, page_size());
        unsafe { SystemMemory::request_memory(len) }
    }

    unsafe fn release(&mut self, addr: NonNull<u8>, len: usize) {
        let len = align(len, page_size());
        unsafe { SystemMemory::return_memory(addr, len) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for SystemMemory {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
            let result = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };
            if result != 0 {
                log::error!("munmap({addr:p}, {len}) failed: {}", std::io::Error::last_os_error());
            }
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use super::{PlatformMemory, SystemMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemMemory {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) {
            let result = unsafe {
                Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE)
            };
            if let Err(err) = result {
                log::error!("VirtualFree({addr:p}) failed: {err}");
            }
        }

        fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
