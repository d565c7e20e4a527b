//! Device-control requests that allocate memory behind our back.

use std::{ffi::c_void, mem, slice};

use bytemuck::{Pod, Zeroable};
use libc::c_ulong;

/// Mali kbase `KBASE_IOCTL_MEM_ALLOC`
pub const KBASE_IOCTL_MEM_ALLOC: u32 = 0xC020_8005;
/// Mali kbase `KBASE_IOCTL_MEM_ALLOC_EX`
pub const KBASE_IOCTL_MEM_ALLOC_EX: u32 = 0xC040_803B;
/// Adreno kgsl `IOCTL_KGSL_GPUOBJ_ALLOC`
pub const KGSL_IOCTL_GPUOBJ_ALLOC: u32 = 0xC030_0945;
/// `DMA_HEAP_IOCTL_ALLOC` (linux/dma-heap.h)
pub const DMA_HEAP_IOCTL_ALLOC: u32 = 0xC018_4800;
/// `ION_IOC_ALLOC` (the post-4.12 ABI)
pub const ION_IOC_ALLOC: u32 = 0xC018_4900;

/// `struct dma_heap_allocation_data`
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DmaHeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

/// `struct ion_allocation_data`
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct IonAllocationData {
    pub len: u64,
    pub heap_id_mask: u32,
    pub flags: u32,
    pub fd: u32,
    pub unused: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorAlloc {
    DmaHeap,
    Ion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// A GPU driver is about to hand out memory that the caller maps next.
    GpuAlloc,
    /// The kernel returns a new dma-buf descriptor in the argument.
    DescriptorAlloc(DescriptorAlloc),
    Other,
}

impl Request {
    pub fn classify(request: c_ulong) -> Self {
        // Bionic declares the request as `int`; only the low 32 bits are
        // meaningful either way.
        match request as u32 {
            KBASE_IOCTL_MEM_ALLOC | KBASE_IOCTL_MEM_ALLOC_EX | KGSL_IOCTL_GPUOBJ_ALLOC => {
                Request::GpuAlloc
            }
            DMA_HEAP_IOCTL_ALLOC => Request::DescriptorAlloc(DescriptorAlloc::DmaHeap),
            ION_IOC_ALLOC => Request::DescriptorAlloc(DescriptorAlloc::Ion),
            _ => Request::Other,
        }
    }
}

/// A buffer returned by a successful descriptor allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedDescriptor {
    pub fd: i32,
    /// What the caller asked for.
    pub len: usize,
}

unsafe fn read_arg<T: Pod>(arg: *const c_void) -> T {
    let bytes = slice::from_raw_parts(arg.cast::<u8>(), mem::size_of::<T>());
    bytemuck::pod_read_unaligned(bytes)
}

impl DescriptorAlloc {
    /// Read the result of a successful allocation out of the request argument.
    ///
    /// # Safety
    /// `arg` must be the argument the kernel just accepted for this request.
    pub unsafe fn read(self, arg: *const c_void) -> Option<AllocatedDescriptor> {
        if arg.is_null() {
            return None;
        }
        let (fd, len) = match self {
            DescriptorAlloc::DmaHeap => {
                let data: DmaHeapAllocationData = read_arg(arg);
                (data.fd, data.len)
            }
            DescriptorAlloc::Ion => {
                let data: IonAllocationData = read_arg(arg);
                (data.fd, data.len)
            }
        };
        Some(AllocatedDescriptor {
            fd: i32::try_from(fd).ok()?,
            len: usize::try_from(len).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_the_kernel() {
        assert_eq!(mem::size_of::<DmaHeapAllocationData>(), 24);
        assert_eq!(mem::size_of::<IonAllocationData>(), 24);
        assert_eq!(mem::offset_of!(IonAllocationData, fd), 16);
        assert_eq!(mem::offset_of!(DmaHeapAllocationData, fd), 8);
    }

    #[test]
    fn classifies_known_requests() {
        assert_eq!(Request::classify(0xC020_8005), Request::GpuAlloc);
        assert_eq!(Request::classify(0xC030_0945), Request::GpuAlloc);
        assert_eq!(
            Request::classify(DMA_HEAP_IOCTL_ALLOC as c_ulong),
            Request::DescriptorAlloc(DescriptorAlloc::DmaHeap)
        );
        assert_eq!(Request::classify(0x5401), Request::Other);
    }

    #[test]
    fn sign_extended_request_still_matches() {
        let request = KBASE_IOCTL_MEM_ALLOC as i32 as i64 as c_ulong;
        assert_eq!(Request::classify(request), Request::GpuAlloc);
    }

    #[test]
    fn reads_the_returned_descriptor() {
        let data = DmaHeapAllocationData {
            len: 4096,
            fd: 7,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        let got = unsafe { DescriptorAlloc::DmaHeap.read(&data as *const _ as *const c_void) };
        assert_eq!(got, Some(AllocatedDescriptor { fd: 7, len: 4096 }));

        let ion = IonAllocationData {
            len: 1 << 20,
            heap_id_mask: 1,
            flags: 0,
            fd: 12,
            unused: 0,
        };
        let got = unsafe { DescriptorAlloc::Ion.read(&ion as *const _ as *const c_void) };
        assert_eq!(got, Some(AllocatedDescriptor { fd: 12, len: 1 << 20 }));
        assert_eq!(unsafe { DescriptorAlloc::Ion.read(std::ptr::null()) }, None);
    }
}
