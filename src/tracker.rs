//! Command trackers
//!
//! Every in-flight command owns a tracker: its command identifier, the
//! request being tracked, and one page of DMA-addressable scratch that PRP
//! lists or SGL descriptors are built in. Tracker identity is its array
//! index; the completion path resolves a CID back to its tracker with a
//! plain index lookup.

use alloc::boxed::Box;
use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::cmd::SglDescriptor;
use crate::env::{DmaBuffer, NvmeEnv};
use crate::request::Request;
use crate::{NvmeError, PRP_LIST_ENTRIES, SGL_DESCRIPTORS, TRACKER_SIZE};

/// State for one in-flight command slot.
pub struct Tracker {
    /// Command identifier; equal to this tracker's index, never changes.
    pub cid: u16,
    /// Whether a submitted command currently owns this tracker.
    pub active: bool,
    /// The request being tracked, present while the tracker is outstanding.
    pub req: Option<Box<Request>>,
    scratch_virt: VirtAddr,
    scratch_phys: PhysAddr,
}

impl Tracker {
    /// Bus address of the scratch page, precomputed at construction.
    pub fn scratch_phys(&self) -> PhysAddr {
        self.scratch_phys
    }

    pub fn write_prp(&mut self, index: usize, addr: u64) {
        debug_assert!(index < PRP_LIST_ENTRIES);
        unsafe { self.scratch_virt.as_mut_ptr::<u64>().add(index).write_volatile(addr) }
    }

    pub fn write_sgl(&mut self, index: usize, descriptor: SglDescriptor) {
        debug_assert!(index < SGL_DESCRIPTORS);
        unsafe {
            self.scratch_virt
                .as_mut_ptr::<SglDescriptor>()
                .add(index)
                .write_volatile(descriptor)
        }
    }

    #[cfg(test)]
    pub(crate) fn read_prp(&self, index: usize) -> u64 {
        unsafe { self.scratch_virt.as_ptr::<u64>().add(index).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn read_sgl(&self, index: usize) -> SglDescriptor {
        unsafe {
            self.scratch_virt
                .as_ptr::<SglDescriptor>()
                .add(index)
                .read_volatile()
        }
    }
}

/// Fixed pool of trackers backed by one DMA allocation of
/// `num_trackers * 4096` bytes. A tracker is on exactly one of the free or
/// outstanding lists at any moment.
pub struct TrackerPool {
    storage: DmaBuffer,
    trackers: Vec<Tracker>,
    /// Free stack; seeded in reverse so the first acquire yields index 0.
    free: Vec<u16>,
    outstanding: Vec<u16>,
}

impl TrackerPool {
    pub fn new<E: NvmeEnv>(env: &E, num_trackers: u16) -> Result<Self, NvmeError> {
        let storage = env
            .dma_zalloc(num_trackers as usize * TRACKER_SIZE, TRACKER_SIZE)
            .map_err(|_| NvmeError::OutOfMemory)?;

        let trackers = (0..num_trackers)
            .map(|i| {
                let offset = i as u64 * TRACKER_SIZE as u64;
                Tracker {
                    cid: i,
                    active: false,
                    req: None,
                    scratch_virt: storage.virt + offset,
                    scratch_phys: PhysAddr::new(storage.phys.as_u64() + offset),
                }
            })
            .collect();

        Ok(Self {
            storage,
            trackers,
            free: (0..num_trackers).rev().collect(),
            outstanding: Vec::with_capacity(num_trackers as usize),
        })
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn outstanding(&self) -> &[u16] {
        &self.outstanding
    }

    /// Pop a free tracker and move it to the outstanding list.
    pub fn acquire(&mut self) -> Option<u16> {
        let cid = self.free.pop()?;
        self.outstanding.push(cid);
        Some(cid)
    }

    /// Move an outstanding tracker back to the free list.
    pub fn release(&mut self, cid: u16) {
        if let Some(pos) = self.outstanding.iter().position(|&c| c == cid) {
            self.outstanding.swap_remove(pos);
            self.free.push(cid);
        } else {
            debug_assert!(false, "released tracker {} was not outstanding", cid);
        }
    }

    pub fn get(&self, cid: u16) -> &Tracker {
        &self.trackers[cid as usize]
    }

    pub fn get_mut(&mut self, cid: u16) -> &mut Tracker {
        &mut self.trackers[cid as usize]
    }

    pub fn contains(&self, cid: u16) -> bool {
        (cid as usize) < self.trackers.len()
    }

    /// Release the backing DMA allocation.
    ///
    /// # Safety
    ///
    /// The device must no longer reference any tracker scratch page.
    pub unsafe fn destroy<E: NvmeEnv>(&mut self, env: &E) {
        unsafe { env.dma_free(&self.storage) };
    }
}
