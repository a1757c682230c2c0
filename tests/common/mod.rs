//! Shared test support: heap-backed platform services and a scripted fake
//! device that services the admin queue the way a controller would.

use nvme_pcie::env::{DmaBuffer, DmaError, MappedBar, NvmeEnv, PciError};
use spin::Mutex;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

/// Heap allocation with explicit alignment, freed on drop.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn virt(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.ptr)
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Host-side platform services over plain heap memory. Translation is
/// identity, so bus addresses the core programs into the fake device are
/// directly dereferencable.
pub struct TestEnv {
    bar0: AlignedBuf,
    extra_bar: Option<(u8, AlignedBuf)>,
    fail_map_bar: AtomicBool,
    live_allocs: Mutex<Vec<(u64, Layout)>>,
    cfg: Mutex<[u32; 16]>,
    pid: AtomicU32,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            bar0: AlignedBuf::new(0x4000),
            extra_bar: None,
            fail_map_bar: AtomicBool::new(false),
            live_allocs: Mutex::new(Vec::new()),
            cfg: Mutex::new([0; 16]),
            pid: AtomicU32::new(1),
        }
    }

    pub fn with_extra_bar(mut self, bar: u8, size: usize) -> Self {
        self.extra_bar = Some((bar, AlignedBuf::new(size)));
        self
    }

    pub fn bar0_virt(&self) -> VirtAddr {
        self.bar0.virt()
    }

    pub fn extra_bar_virt(&self) -> Option<VirtAddr> {
        self.extra_bar.as_ref().map(|(_, buf)| buf.virt())
    }

    pub fn set_fail_map_bar(&self, fail: bool) {
        self.fail_map_bar.store(fail, Ordering::Relaxed);
    }

    pub fn live_dma_allocs(&self) -> usize {
        self.live_allocs.lock().len()
    }

    pub fn read_reg32(&self, offset: u64) -> u32 {
        unsafe { (self.bar0.virt() + offset).as_ptr::<u32>().read_volatile() }
    }

    pub fn read_reg64(&self, offset: u64) -> u64 {
        unsafe { (self.bar0.virt() + offset).as_ptr::<u64>().read_volatile() }
    }

    pub fn write_reg32(&self, value: u32, offset: u64) {
        unsafe { (self.bar0.virt() + offset).as_mut_ptr::<u32>().write_volatile(value) }
    }

    pub fn write_reg64(&self, value: u64, offset: u64) {
        unsafe { (self.bar0.virt() + offset).as_mut_ptr::<u64>().write_volatile(value) }
    }
}

impl NvmeEnv for TestEnv {
    fn vtophys(&self, virt: VirtAddr) -> Result<PhysAddr, DmaError> {
        Ok(PhysAddr::new(virt.as_u64()))
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
        if self.fail_map_bar.load(Ordering::Relaxed) {
            return Err(PciError::BarUnavailable);
        }
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

/// Completion status field without the phase bit.
pub fn status(sct: u8, sc: u8, dnr: bool) -> u16 {
    ((sc as u16) << 1) | (((sct as u16) & 0x7) << 9) | ((dnr as u16) << 15)
}

unsafe fn r32(addr: u64) -> u32 {
    unsafe { (addr as *const u32).read_volatile() }
}

unsafe fn r64(addr: u64) -> u64 {
    unsafe { (addr as *const u64).read_volatile() }
}

unsafe fn w32(addr: u64, value: u32) {
    unsafe { (addr as *mut u32).write_volatile(value) }
}

/// A controller model servicing the admin queue from another thread:
/// mirrors CC.EN into CSTS.RDY, consumes submission entries behind the
/// admin tail doorbell, and posts completions with statuses taken from a
/// script (success when the script runs dry).
pub struct FakeDevice {
    stop: Arc<AtomicBool>,
    statuses: Arc<Mutex<VecDeque<u16>>>,
    opcodes: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDevice {
    pub fn spawn(env: &Arc<TestEnv>) -> Self {
        let bar = env.bar0_virt().as_u64();
        let stop = Arc::new(AtomicBool::new(false));
        let statuses: Arc<Mutex<VecDeque<u16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let opcodes: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let thread_stop = stop.clone();
        let thread_statuses = statuses.clone();
        let thread_opcodes = opcodes.clone();
        let handle = thread::spawn(move || {
            let mut sq_seen: u32 = 0;
            let mut cq_tail: u32 = 0;
            let mut phase = true;
            let mut asq: u64 = 0;
            let mut acq: u64 = 0;
            let mut entries: u32 = 0;

            while !thread_stop.load(Ordering::Acquire) {
                unsafe {
                    let cc = r32(bar + 0x14);
                    let csts = r32(bar + 0x1C);
                    if cc & 1 != 0 && csts & 1 == 0 {
                        let aqa = r32(bar + 0x24);
                        entries = (aqa & 0xFFF) + 1;
                        asq = r64(bar + 0x28);
                        acq = r64(bar + 0x30);
                        sq_seen = 0;
                        cq_tail = 0;
                        phase = true;
                        w32(bar + 0x1C, csts | 1);
                    } else if cc & 1 == 0 && csts & 1 != 0 {
                        w32(bar + 0x1C, csts & !1);
                    }

                    if entries != 0 {
                        // Admin submission tail doorbell.
                        let tail = r32(bar + 0x1000);
                        fence(Ordering::Acquire);
                        while sq_seen != tail {
                            let cmd = asq + sq_seen as u64 * 64;
                            let cdw0 = r32(cmd);
                            let cid = (cdw0 >> 16) & 0xFFFF;
                            thread_opcodes.lock().push((cdw0 & 0xFF) as u8);

                            let body =
                                thread_statuses.lock().pop_front().unwrap_or(0);
                            let cqe = acq + cq_tail as u64 * 16;
                            w32(cqe, 0);
                            w32(cqe + 4, 0);
                            w32(cqe + 8, (sq_seen + 1) % entries);
                            fence(Ordering::Release);
                            w32(cqe + 12, cid | (((body | phase as u16) as u32) << 16));

                            sq_seen = (sq_seen + 1) % entries;
                            cq_tail += 1;
                            if cq_tail == entries {
                                cq_tail = 0;
                                phase = !phase;
                            }
                        }
                    }
                }
                thread::sleep(Duration::from_micros(100));
            }
        });

        Self {
            stop,
            statuses,
            opcodes,
            handle: Some(handle),
        }
    }

    /// Queue the status for the next serviced admin command.
    pub fn push_status(&self, status: u16) {
        self.statuses.lock().push_back(status);
    }

    /// Opcodes of every admin command serviced so far, in order.
    pub fn command_log(&self) -> Vec<u8> {
        self.opcodes.lock().clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
