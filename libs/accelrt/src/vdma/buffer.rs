// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Memory regions the DMA engine can read from or write to directly.
//!
//! Which allocation strategy applies depends on the platform driver:
//!
//! * caller supplied memory, wrapped as-is ([`UserDmaAbleBuffer`])
//! * plain page-aligned heap memory ([`PageAlignedDmaAbleBuffer`])
//! * memory allocated and mapped by the kernel driver ([`DriverDmaAbleBuffer`])
//!
//! Shared-memory buffers for isolated processes are not supported yet.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::device::{DmaAllocationKind, DmaDriver};
use crate::error::{AccelError, Result};

pub type DmaAbleBufferPtr = Arc<dyn DmaAbleBuffer>;

/// Opaque handle the driver uses to map a buffer into device address space.
pub type BufferIdentifier = u64;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Page size of the running system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

/// Address of caller-owned memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserAddress(NonNull<u8>);

impl UserAddress {
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of the buffer size for as
    /// long as any buffer wrapping it is alive, and must not be accessed
    /// through other references while a transfer is in flight.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn is_page_aligned(self) -> bool {
        (self.0.as_ptr() as usize) % page_size() == 0
    }
}

impl fmt::Debug for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.as_ptr())
    }
}

// SAFETY: the address is only dereferenced under the contract of `UserAddress::new`.
unsafe impl Send for UserAddress {}
unsafe impl Sync for UserAddress {}

pub trait DmaAbleBuffer: Send + Sync + fmt::Debug {
    fn user_address(&self) -> UserAddress;

    fn size(&self) -> usize;

    /// Driver handle, or `None` when the driver maps the address itself.
    fn buffer_identifier(&self) -> Option<BufferIdentifier>;

    /// Copy `src` to the start of the buffer.
    fn copy_from(&self, src: &[u8]) -> Result<()> {
        if src.len() > self.size() {
            return Err(AccelError::InvalidArgument(format!(
                "{} bytes do not fit a {} byte buffer",
                src.len(),
                self.size()
            )));
        }
        // SAFETY: the region is valid for `size` bytes (UserAddress contract
        // or owned allocation) and `src` cannot alias it.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.user_address().as_ptr(), src.len());
        }
        Ok(())
    }

    /// Copy the start of the buffer into `dst`.
    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.size() {
            return Err(AccelError::InvalidArgument(format!(
                "cannot read {} bytes from a {} byte buffer",
                dst.len(),
                self.size()
            )));
        }
        // SAFETY: see `copy_from`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.user_address().as_ptr(), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(AccelError::InvalidArgument(
            "DMA-able buffer size must be non-zero".into(),
        ));
    }
    Ok(())
}

/// Create a buffer without driver involvement.
///
/// With `user_address` the caller's memory is wrapped; alignment is checked
/// later, when the buffer is mapped.
pub fn create(size: usize, user_address: Option<UserAddress>) -> Result<DmaAbleBufferPtr> {
    check_size(size)?;
    match user_address {
        Some(address) => Ok(Arc::new(UserDmaAbleBuffer::new(address, size))),
        None => Ok(Arc::new(PageAlignedDmaAbleBuffer::new(size)?)),
    }
}

/// Create a buffer using whichever strategy `driver` requires.
pub fn create_with_driver(
    driver: Arc<dyn DmaDriver>,
    size: usize,
    user_address: Option<UserAddress>,
) -> Result<DmaAbleBufferPtr> {
    check_size(size)?;
    if let Some(address) = user_address {
        return Ok(Arc::new(UserDmaAbleBuffer::new(address, size)));
    }
    match driver.dma_allocation_kind() {
        DmaAllocationKind::UserAllocated => Ok(Arc::new(PageAlignedDmaAbleBuffer::new(size)?)),
        DmaAllocationKind::DriverAllocated => Ok(Arc::new(DriverDmaAbleBuffer::new(driver, size)?)),
        DmaAllocationKind::SharedMemory => Err(AccelError::NotSupported(
            "shared-memory DMA-able buffers".into(),
        )),
    }
}

/// Caller-owned memory. Never freed here.
#[derive(Debug)]
pub struct UserDmaAbleBuffer {
    address: UserAddress,
    size: usize,
}

impl UserDmaAbleBuffer {
    pub fn new(address: UserAddress, size: usize) -> Self {
        Self { address, size }
    }
}

impl DmaAbleBuffer for UserDmaAbleBuffer {
    fn user_address(&self) -> UserAddress {
        self.address
    }

    fn size(&self) -> usize {
        self.size
    }

    fn buffer_identifier(&self) -> Option<BufferIdentifier> {
        None
    }
}

/// Heap memory aligned to the system page size.
pub struct PageAlignedDmaAbleBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PageAlignedDmaAbleBuffer {
    pub fn new(size: usize) -> Result<Self> {
        check_size(size)?;
        let layout = Layout::from_size_align(size, page_size())
            .map_err(|e| AccelError::InvalidArgument(format!("buffer layout: {}", e)))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            AccelError::OutOfMemory(format!("page-aligned allocation of {} bytes", size))
        })?;
        Ok(Self { ptr, layout })
    }
}

impl fmt::Debug for PageAlignedDmaAbleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAlignedDmaAbleBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .finish()
    }
}

// SAFETY: the allocation is exclusively owned and only accessed via raw copies.
unsafe impl Send for PageAlignedDmaAbleBuffer {}
unsafe impl Sync for PageAlignedDmaAbleBuffer {}

impl DmaAbleBuffer for PageAlignedDmaAbleBuffer {
    fn user_address(&self) -> UserAddress {
        UserAddress(self.ptr)
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn buffer_identifier(&self) -> Option<BufferIdentifier> {
        None
    }
}

impl Drop for PageAlignedDmaAbleBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Memory allocated by the kernel driver; released through it on drop.
pub struct DriverDmaAbleBuffer {
    driver: Arc<dyn DmaDriver>,
    identifier: BufferIdentifier,
    address: UserAddress,
    size: usize,
}

impl DriverDmaAbleBuffer {
    pub fn new(driver: Arc<dyn DmaDriver>, size: usize) -> Result<Self> {
        check_size(size)?;
        let allocation = driver.allocate_driver_buffer(size).map_err(|e| {
            AccelError::OutOfMemory(format!(
                "driver cannot allocate a {} byte DMA buffer: {}",
                size, e
            ))
        })?;
        tracing::trace!(size, id = allocation.identifier, "Allocated driver DMA buffer");
        Ok(Self {
            driver,
            identifier: allocation.identifier,
            address: allocation.address,
            size,
        })
    }
}

impl fmt::Debug for DriverDmaAbleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDmaAbleBuffer")
            .field("identifier", &self.identifier)
            .field("address", &self.address)
            .field("size", &self.size)
            .finish()
    }
}

impl DmaAbleBuffer for DriverDmaAbleBuffer {
    fn user_address(&self) -> UserAddress {
        self.address
    }

    fn size(&self) -> usize {
        self.size
    }

    fn buffer_identifier(&self) -> Option<BufferIdentifier> {
        Some(self.identifier)
    }
}

impl Drop for DriverDmaAbleBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.driver.free_driver_buffer(self.identifier) {
            tracing::error!(id = self.identifier, error = %e, "Failed to free driver DMA buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DriverBuffer;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeDriver {
        kind: Option<DmaAllocationKind>,
        allocations: Mutex<HashMap<BufferIdentifier, Box<[u8]>>>,
        next_id: Mutex<BufferIdentifier>,
        max_size: usize,
    }

    impl FakeDriver {
        fn new(kind: DmaAllocationKind, max_size: usize) -> Arc<Self> {
            Arc::new(Self {
                kind: Some(kind),
                max_size,
                ..Default::default()
            })
        }
    }

    impl DmaDriver for FakeDriver {
        fn dma_allocation_kind(&self) -> DmaAllocationKind {
            self.kind.unwrap_or(DmaAllocationKind::UserAllocated)
        }

        fn allocate_driver_buffer(&self, size: usize) -> Result<DriverBuffer> {
            if size > self.max_size {
                return Err(AccelError::OutOfMemory("low memory exhausted".into()));
            }
            let mut id = self.next_id.lock();
            *id += 1;
            let mut memory = vec![0u8; size].into_boxed_slice();
            let address = unsafe { UserAddress::new(NonNull::new(memory.as_mut_ptr()).unwrap()) };
            self.allocations.lock().insert(*id, memory);
            Ok(DriverBuffer {
                identifier: *id,
                address,
            })
        }

        fn free_driver_buffer(&self, identifier: BufferIdentifier) -> Result<()> {
            self.allocations
                .lock()
                .remove(&identifier)
                .map(|_| ())
                .ok_or_else(|| AccelError::NotFound(format!("buffer {}", identifier)))
        }
    }

    #[test]
    fn test_page_aligned_allocation() {
        let buffer = create(100, None).unwrap();
        assert_eq!(buffer.size(), 100);
        assert!(buffer.user_address().is_page_aligned());
        assert!(buffer.buffer_identifier().is_none());

        buffer.copy_from(&[7u8; 100]).unwrap();
        let mut out = [0u8; 100];
        buffer.copy_to(&mut out).unwrap();
        assert_eq!(out, [7u8; 100]);
    }

    #[test]
    fn test_zero_size_is_invalid() {
        assert!(matches!(create(0, None), Err(AccelError::InvalidArgument(_))));
    }

    #[test]
    fn test_user_address_is_wrapped_without_allocation() {
        let mut memory = vec![0u8; 64];
        let address = unsafe { UserAddress::new(NonNull::new(memory.as_mut_ptr()).unwrap()) };
        let buffer = create(64, Some(address)).unwrap();
        assert_eq!(buffer.user_address(), address);
        buffer.copy_from(&[1, 2, 3]).unwrap();
        drop(buffer);
        assert_eq!(&memory[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_driver_buffer_released_on_drop() {
        let driver = FakeDriver::new(DmaAllocationKind::DriverAllocated, 4096);
        let buffer = create_with_driver(driver.clone(), 512, None).unwrap();
        assert_eq!(buffer.buffer_identifier(), Some(1));
        assert_eq!(driver.allocations.lock().len(), 1);
        drop(buffer);
        assert!(driver.allocations.lock().is_empty());
    }

    #[test]
    fn test_driver_that_cannot_allocate_is_out_of_memory() {
        let driver = FakeDriver::new(DmaAllocationKind::DriverAllocated, 16);
        let err = create_with_driver(driver, 512, None).unwrap_err();
        assert!(matches!(err, AccelError::OutOfMemory(_)));
    }

    #[test]
    fn test_shared_memory_strategy_is_not_supported() {
        let driver = FakeDriver::new(DmaAllocationKind::SharedMemory, 4096);
        let err = create_with_driver(driver, 512, None).unwrap_err();
        assert!(matches!(err, AccelError::NotSupported(_)));
    }

    #[test]
    fn test_user_allocated_driver_uses_page_aligned_memory() {
        let driver = FakeDriver::new(DmaAllocationKind::UserAllocated, 0);
        let buffer = create_with_driver(driver.clone(), 256, None).unwrap();
        assert!(buffer.user_address().is_page_aligned());
        assert!(driver.allocations.lock().is_empty());
    }
}
