//! Controller Memory Buffer management
//!
//! Some controllers expose device-resident memory the host may place
//! submission queues in. The region is discovered from `CMBSZ`/`CMBLOC`,
//! mapped through the indicated BAR, and handed out by a bump allocator:
//! allocations are one-shot per queue pair during bring-up and are never
//! returned, so the region only dies with the controller.

use log::{debug, warn};
use x86_64::{PhysAddr, VirtAddr};

use crate::env::{MappedBar, NvmeEnv};
use crate::regs::{NvmeRegisters, cmbloc_bits, cmbsz_bits, offsets};

pub struct CmbRegion {
    mapped: MappedBar,
    bir: u8,
    /// CMB base inside the BAR.
    virt: VirtAddr,
    phys: PhysAddr,
    size: u64,
    current_offset: u64,
}

impl CmbRegion {
    /// Discover and map the controller memory buffer, if any.
    ///
    /// Any defect in the advertised geometry degrades silently: the caller
    /// gets `None` and must run with host-memory submission queues.
    pub fn discover<E: NvmeEnv>(env: &E, regs: &NvmeRegisters) -> Option<CmbRegion> {
        let cmbsz = regs.read32(offsets::CMBSZ);
        let sz = (cmbsz >> cmbsz_bits::SZ_SHIFT) as u64;
        if sz == 0 {
            return None;
        }

        let szu = (cmbsz >> cmbsz_bits::SZU_SHIFT) & cmbsz_bits::SZU_MASK;
        let unit = 1u64 << (12 + 4 * szu);
        let size = sz * unit;

        let cmbloc = regs.read32(offsets::CMBLOC);
        let bir = (cmbloc & cmbloc_bits::BIR_MASK) as u8;
        let offset = ((cmbloc >> cmbloc_bits::OFST_SHIFT) as u64) * unit;

        // BIR 1 is reserved by the specification.
        if bir == 1 || bir > 5 {
            warn!("CMB advertises invalid BAR indicator {}", bir);
            return None;
        }

        let mapped = match env.map_bar(bir) {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("CMB BAR {} mapping failed: {:?}", bir, e);
                return None;
            }
        };

        if offset > mapped.size || offset + size > mapped.size {
            warn!(
                "CMB exceeds BAR {}: offset {:#x} + size {:#x} > {:#x}",
                bir, offset, size, mapped.size
            );
            env.unmap_bar(&mapped);
            return None;
        }

        debug!(
            "CMB mapped: BAR {}, offset {:#x}, size {} KB",
            bir,
            offset,
            size >> 10
        );

        Some(CmbRegion {
            mapped,
            bir,
            virt: mapped.virt + offset,
            phys: PhysAddr::new(mapped.phys.as_u64() + offset),
            size,
            current_offset: 0,
        })
    }

    /// Bump-allocate `length` bytes at the given power-of-two alignment.
    /// Returns the offset of the allocation inside the region.
    pub fn alloc(&mut self, length: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        let rounded = (self.current_offset + align - 1) & !(align - 1);
        if rounded + length > self.size {
            return None;
        }
        self.current_offset = rounded + length;
        Some(rounded)
    }

    pub fn virt_at(&self, offset: u64) -> VirtAddr {
        self.virt + offset
    }

    /// Bus address of an allocation, for programming into the device.
    pub fn phys_at(&self, offset: u64) -> PhysAddr {
        PhysAddr::new(self.phys.as_u64() + offset)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Unmap the backing BAR. Called once during controller teardown.
    pub fn unmap<E: NvmeEnv>(&self, env: &E) {
        debug!("unmapping CMB BAR {}", self.bir);
        env.unmap_bar(&self.mapped);
    }
}
