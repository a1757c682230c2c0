//! Collaborator interfaces consumed by the transport core.
//!
//! The transport never enumerates PCI devices, walks page tables or carves
//! DMA-safe memory itself; the embedding platform provides those services
//! through [`NvmeEnv`]. The core is generic over the environment so hosts
//! can plug in VFIO, a hugepage allocator, or (in tests) plain heap memory.

use x86_64::{PhysAddr, VirtAddr};

/// DMA-safe memory handed out by the platform allocator.
///
/// The region is zeroed, physically contiguous, and pinned for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    /// Size in bytes.
    pub size: usize,
}

/// A PCI Base Address Register mapped into the address space.
#[derive(Debug, Clone, Copy)]
pub struct MappedBar {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    /// Size of the BAR in bytes.
    pub size: u64,
}

/// DMA subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No contiguous region of the requested size/alignment available.
    OutOfMemory,
    /// The virtual address has no physical translation.
    TranslationFailed,
}

/// PCI access errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// The requested BAR is absent, an I/O BAR, or unassigned.
    BarUnavailable,
    /// Mapping the BAR into the address space failed.
    MappingFailed,
    /// Configuration space access failed.
    ConfigAccessFailed,
}

/// Platform services backing one NVMe controller.
///
/// All methods must be callable from any thread; queue pairs on different
/// threads share one environment.
pub trait NvmeEnv: Send + Sync {
    /// Translate a virtual address to its physical (bus) address.
    fn vtophys(&self, virt: VirtAddr) -> Result<PhysAddr, DmaError>;

    /// Allocate zeroed, physically contiguous, pinned memory.
    ///
    /// `align` is a power of two.
    fn dma_zalloc(&self, size: usize, align: usize) -> Result<DmaBuffer, DmaError>;

    /// Return memory obtained from [`NvmeEnv::dma_zalloc`].
    ///
    /// # Safety
    ///
    /// The buffer must no longer be referenced by the device: the caller
    /// has to quiesce or tear down every queue that points into it first.
    unsafe fn dma_free(&self, buffer: &DmaBuffer);

    /// Map a BAR of the controller's PCI function.
    fn map_bar(&self, bar: u8) -> Result<MappedBar, PciError>;

    /// Unmap a BAR previously mapped with [`NvmeEnv::map_bar`].
    fn unmap_bar(&self, mapped: &MappedBar);

    /// Read a dword from PCI configuration space.
    fn cfg_read32(&self, offset: u16) -> Result<u32, PciError>;

    /// Write a dword to PCI configuration space.
    fn cfg_write32(&self, value: u32, offset: u16) -> Result<(), PciError>;

    /// Identifier of the calling process. Admin completions are delivered
    /// on the process that originated the request.
    fn current_pid(&self) -> u32;
}

/// PCI configuration space offsets and command register bits used during
/// bring-up.
pub mod pci_cfg {
    /// Vendor ID (low word) / Device ID (high word).
    pub const ID_OFFSET: u16 = 0x00;
    /// Command register (low word) / Status register (high word).
    pub const COMMAND_OFFSET: u16 = 0x04;

    /// Command register: Bus Master Enable.
    pub const CMD_BUS_MASTER: u32 = 1 << 2;
    /// Command register: INTx assertion disable.
    pub const CMD_INTX_DISABLE: u32 = 1 << 10;
}
