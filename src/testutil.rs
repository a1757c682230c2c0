//! Test support: a heap-backed environment standing in for the platform.
//!
//! MMIO targets (the fake BAR0, DMA buffers, rings) are plain heap memory,
//! and virtual-to-physical translation is identity unless a test registers
//! an explicit mapping, so every device-visible store lands somewhere a
//! test can inspect.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::env::{DmaBuffer, DmaError, MappedBar, NvmeEnv, PciError};
use crate::regs::offsets;

/// Heap allocation with explicit alignment, freed on drop.
pub(crate) struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn virt(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.ptr)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Test double for [`NvmeEnv`].
pub(crate) struct MockEnv {
    bar0: AlignedBuf,
    extra_bar: Option<(u8, AlignedBuf)>,
    /// Explicit translations as (virt_start, len, phys_start); identity for
    /// everything else.
    translations: Mutex<Vec<(u64, u64, u64)>>,
    /// Addresses for which vtophys must fail.
    poisoned: Mutex<Vec<u64>>,
    live_allocs: Mutex<Vec<(u64, Layout)>>,
    cfg: Mutex<[u32; 16]>,
    pid: AtomicU32,
}

impl MockEnv {
    pub fn new() -> Self {
        Self {
            bar0: AlignedBuf::new(0x4000),
            extra_bar: None,
            translations: Mutex::new(Vec::new()),
            poisoned: Mutex::new(Vec::new()),
            live_allocs: Mutex::new(Vec::new()),
            cfg: Mutex::new([0; 16]),
            pid: AtomicU32::new(1),
        }
    }

    /// Attach a second BAR (for CMB tests).
    pub fn with_extra_bar(mut self, bar: u8, size: usize) -> Self {
        self.extra_bar = Some((bar, AlignedBuf::new(size)));
        self
    }

    pub fn bar0_virt(&self) -> VirtAddr {
        self.bar0.virt()
    }

    /// Register a translation overriding the identity mapping.
    pub fn map_translation(&self, virt: VirtAddr, len: u64, phys: u64) {
        self.translations.lock().push((virt.as_u64(), len, phys));
    }

    /// Make vtophys fail for this address.
    pub fn poison_translation(&self, virt: VirtAddr) {
        self.poisoned.lock().push(virt.as_u64());
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn set_cfg(&self, offset: u16, value: u32) {
        self.cfg.lock()[offset as usize / 4] = value;
    }

    pub fn cfg(&self, offset: u16) -> u32 {
        self.cfg.lock()[offset as usize / 4]
    }

    /// DMA buffers currently outstanding, for leak checks.
    pub fn live_dma_allocs(&self) -> usize {
        self.live_allocs.lock().len()
    }

    /// Read back a doorbell cell from the fake BAR0.
    pub fn read_doorbell(&self, qid: u16, is_completion: bool, stride_u32: u32) -> u32 {
        let slot = (2 * qid as u64) + if is_completion { 1 } else { 0 };
        let addr = self.bar0.virt() + offsets::DOORBELL_BASE + slot * (stride_u32 as u64 * 4);
        unsafe { core::ptr::read_volatile(addr.as_ptr::<u32>()) }
    }
}

impl NvmeEnv for MockEnv {
    fn vtophys(&self, virt: VirtAddr) -> Result<PhysAddr, DmaError> {
        if self.poisoned.lock().contains(&virt.as_u64()) {
            return Err(DmaError::TranslationFailed);
        }
        let v = virt.as_u64();
        for &(start, len, phys) in self.translations.lock().iter() {
            if v >= start && v < start + len {
                return Ok(PhysAddr::new(phys + (v - start)));
            }
        }
        Ok(PhysAddr::new(v))
    }

    fn dma_zalloc(&self, size: usize, align: usize) -> Result<DmaBuffer, DmaError> {
        let layout = Layout::from_size_align(size, align).map_err(|_| DmaError::OutOfMemory)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DmaError::OutOfMemory);
        }
        self.live_allocs.lock().push((ptr as u64, layout));
        let virt = VirtAddr::from_ptr(ptr);
        Ok(DmaBuffer {
            virt,
            phys: PhysAddr::new(virt.as_u64()),
            size,
        })
    }

    unsafe fn dma_free(&self, buffer: &DmaBuffer) {
        let mut allocs = self.live_allocs.lock();
        if let Some(pos) = allocs.iter().position(|&(p, _)| p == buffer.virt.as_u64()) {
            let (ptr, layout) = allocs.swap_remove(pos);
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }

    fn map_bar(&self, bar: u8) -> Result<MappedBar, PciError> {
        if bar == 0 {
            return Ok(MappedBar {
                virt: self.bar0.virt(),
                phys: PhysAddr::new(self.bar0.virt().as_u64()),
                size: self.bar0.len() as u64,
            });
        }
        match &self.extra_bar {
            Some((idx, buf)) if *idx == bar => Ok(MappedBar {
                virt: buf.virt(),
                phys: PhysAddr::new(buf.virt().as_u64()),
                size: buf.len() as u64,
            }),
            _ => Err(PciError::BarUnavailable),
        }
    }

    fn unmap_bar(&self, _mapped: &MappedBar) {}

    fn cfg_read32(&self, offset: u16) -> Result<u32, PciError> {
        Ok(self.cfg.lock()[offset as usize / 4])
    }

    fn cfg_write32(&self, value: u32, offset: u16) -> Result<(), PciError> {
        self.cfg.lock()[offset as usize / 4] = value;
        Ok(())
    }

    fn current_pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }
}
