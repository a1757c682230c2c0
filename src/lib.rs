//! User-space NVMe over PCIe transport.
//!
//! This crate drives NVMe commands directly against a PCIe SSD without
//! kernel mediation. It provides:
//!
//! - Controller bring-up: BAR0 mapping, doorbell stride discovery, admin
//!   queue arming, optional Controller Memory Buffer sub-allocation.
//! - Queue pairs: hardware-owned submission/completion rings, doorbell MMIO,
//!   phase-bit completion polling.
//! - Payload translation: caller buffers and gather lists become PRP lists
//!   or hardware SGL descriptors the device can consume.
//!
//! PCI enumeration, virtual-to-physical translation and DMA-safe allocation
//! are consumed through the [`env::NvmeEnv`] trait; the upper-layer
//! controller state machine (identify, namespace discovery) lives outside
//! this crate. Completion processing is polled: callers integrate
//! [`qpair::NvmeQueuePair::process_completions`] into their event loop.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod cmb;
pub mod cmd;
pub mod ctrlr;
pub mod env;
mod payload;
mod process;
pub mod qpair;
pub mod regs;
pub mod request;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testutil;

pub use cmd::{NvmeCommand, NvmeCompletion};
pub use ctrlr::{ControllerOptions, NvmeController};
pub use env::{DmaBuffer, DmaError, MappedBar, NvmeEnv, PciError};
pub use qpair::NvmeQueuePair;
pub use request::{Payload, Request, ScatterGather};

/// Host memory page size; PRP entries describe pages of this size.
pub const PAGE_SIZE: u64 = 4096;

/// Size of one tracker record. Fixed so the embedded PRP/SGL scratch area
/// never crosses a page boundary.
pub const TRACKER_SIZE: usize = 4096;

/// PRP entries that fit in one tracker's scratch area.
pub const PRP_LIST_ENTRIES: usize = 506;

/// SGL descriptors that fit in one tracker's scratch area.
pub const SGL_DESCRIPTORS: usize = 253;

/// Admin queue geometry: 128 slots, 16 in-flight commands.
pub const ADMIN_QUEUE_ENTRIES: u32 = 128;
pub const ADMIN_TRACKERS: u16 = 16;

/// Upper bound on in-flight commands for an I/O queue.
pub const MAX_IO_TRACKERS: u16 = 128;

/// Transport-level errors surfaced by bring-up and lifecycle operations.
/// Request-path failures are reported through completion status instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// DMA allocation failed during construction.
    OutOfMemory,
    /// Requested queue size is outside [2, 65536] or above the device cap.
    InvalidQueueSize,
    /// Payload could not be translated to PRP/SGL descriptors; the request
    /// was completed synchronously with `INVALID_FIELD`.
    PayloadRejected,
    /// A synchronously awaited admin command completed with an error status.
    CommandFailed(u16),
    /// A synchronously awaited admin command never completed.
    CommandTimeout,
    /// CSTS.RDY did not assert after CC.EN was set.
    ControllerEnableTimeout,
    /// I/O queue creation failed device-side.
    QueueCreationFailed,
    Pci(PciError),
    Dma(DmaError),
}

impl From<PciError> for NvmeError {
    fn from(value: PciError) -> Self {
        NvmeError::Pci(value)
    }
}

impl From<DmaError> for NvmeError {
    fn from(value: DmaError) -> Self {
        NvmeError::Dma(value)
    }
}
