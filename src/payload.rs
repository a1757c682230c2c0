//! Payload translation
//!
//! Converts a request's payload into the descriptors the device consumes:
//! a PRP pair (with the overflow pages in the tracker's scratch) for
//! physically contiguous transfers, PRP again for gather lists that happen
//! to be PRP-compatible, or a single segment of SGL data-block descriptors
//! when the device understands SGLs.
//!
//! All three builders leave the command's data pointers and PSDT field
//! valid on success. On any failure the caller completes the request
//! synchronously with `INVALID_FIELD`.

use log::trace;

use crate::cmd::{SglDescriptor, psdt};
use crate::env::NvmeEnv;
use crate::request::{Payload, Request};
use crate::tracker::Tracker;
use crate::{NvmeError, PAGE_SIZE, PRP_LIST_ENTRIES, SGL_DESCRIPTORS};

/// Pages spanned by a transfer of `len` bytes whose first byte sits
/// `unaligned` bytes into a page.
fn page_count(len: u64, unaligned: u64) -> u64 {
    let modulo = len & (PAGE_SIZE - 1);
    let mut nseg = len / PAGE_SIZE;
    if modulo != 0 || unaligned != 0 {
        nseg += 1 + (modulo + unaligned - 1) / PAGE_SIZE;
    }
    nseg
}

/// Build PRP entries for a virtually contiguous payload.
pub(crate) fn build_contig<E: NvmeEnv>(
    env: &E,
    tr: &mut Tracker,
    req: &mut Request,
) -> Result<(), NvmeError> {
    let (buffer, metadata) = match req.payload {
        Payload::Contig { buffer, metadata } => (buffer, metadata),
        _ => {
            debug_assert!(false, "contig builder fed a non-contig payload");
            return Err(NvmeError::PayloadRejected);
        }
    };

    let vaddr = buffer + req.payload_offset as u64;
    let phys = env
        .vtophys(vaddr)
        .map_err(|_| NvmeError::PayloadRejected)?
        .as_u64();

    let size = req.payload_size as u64;
    let unaligned = phys & (PAGE_SIZE - 1);
    let nseg = page_count(size, unaligned);
    trace!("contig payload: {} bytes over {} pages", size, nseg);

    req.cmd.prp1 = phys;
    req.cmd.prp2 = 0;

    if nseg == 2 {
        req.cmd.prp2 = env
            .vtophys(vaddr + (PAGE_SIZE - unaligned))
            .map_err(|_| NvmeError::PayloadRejected)?
            .as_u64();
    } else if nseg > 2 {
        if (nseg - 1) as usize > PRP_LIST_ENTRIES {
            return Err(NvmeError::PayloadRejected);
        }
        req.cmd.prp2 = tr.scratch_phys().as_u64();
        for i in 1..nseg {
            let page = env
                .vtophys(vaddr + i * PAGE_SIZE - unaligned)
                .map_err(|_| NvmeError::PayloadRejected)?
                .as_u64();
            tr.write_prp((i - 1) as usize, page);
        }
    }

    if let Some(md) = metadata {
        req.cmd.mptr = env
            .vtophys(md + req.md_offset as u64)
            .map_err(|_| NvmeError::PayloadRejected)?
            .as_u64();
    }

    req.cmd.set_psdt(psdt::PRP);
    Ok(())
}

/// Build PRP entries from a gather list. The device does not understand
/// SGLs, so the list must be PRP-compatible: every segment 4-byte aligned,
/// every non-final segment ending on a page boundary.
pub(crate) fn build_gather_prp<E: NvmeEnv>(
    env: &E,
    tr: &mut Tracker,
    req: &mut Request,
) -> Result<(), NvmeError> {
    let payload_offset = req.payload_offset;
    let payload_size = req.payload_size as u64;
    let Payload::Gather(list) = &mut req.payload else {
        debug_assert!(false, "gather builder fed a non-gather payload");
        return Err(NvmeError::PayloadRejected);
    };
    list.reset(payload_offset);

    let mut remaining = payload_size;
    // Pages accounted for vs. pages already emitted. The second page is
    // held back until we know whether it goes into prp2 directly or into
    // the scratch list.
    let mut total_nseg: u64 = 0;
    let mut last_nseg: u64 = 0;
    let mut second_page: u64 = 0;
    req.cmd.prp2 = 0;

    while remaining > 0 {
        let Some((vaddr, len)) = list.next() else {
            return Err(NvmeError::PayloadRejected);
        };
        if len == 0 {
            return Err(NvmeError::PayloadRejected);
        }
        let length = (len as u64).min(remaining);
        let phys = env
            .vtophys(vaddr)
            .map_err(|_| NvmeError::PayloadRejected)?
            .as_u64();

        if phys & 0x3 != 0 {
            return Err(NvmeError::PayloadRejected);
        }
        if length < remaining && (phys + length) & (PAGE_SIZE - 1) != 0 {
            return Err(NvmeError::PayloadRejected);
        }

        let unaligned = phys & (PAGE_SIZE - 1);
        if total_nseg == 0 {
            req.cmd.prp1 = phys;
        }

        // The unaligned head is carried by prp1 (or swallowed by the page
        // round-down for a later segment); subsequent entries are
        // page-aligned addresses relative to this segment's base.
        let base = phys - unaligned;
        let seg_first = total_nseg;
        total_nseg += page_count(length, unaligned);

        while last_nseg < total_nseg {
            if last_nseg >= 1 {
                let addr = base + (last_nseg - seg_first) * PAGE_SIZE;
                if last_nseg == 1 {
                    second_page = addr;
                } else {
                    let index = (last_nseg - 1) as usize;
                    if index >= PRP_LIST_ENTRIES {
                        return Err(NvmeError::PayloadRejected);
                    }
                    if last_nseg == 2 {
                        tr.write_prp(0, second_page);
                    }
                    tr.write_prp(index, addr);
                }
            }
            last_nseg += 1;
        }

        remaining -= length;
    }

    if total_nseg == 2 {
        req.cmd.prp2 = second_page;
    } else if total_nseg > 2 {
        req.cmd.prp2 = tr.scratch_phys().as_u64();
    }

    req.cmd.set_psdt(psdt::PRP);
    Ok(())
}

/// Build hardware SGL descriptors from a gather list: one data block per
/// segment, at most one segment of descriptors.
pub(crate) fn build_gather_sgl<E: NvmeEnv>(
    env: &E,
    tr: &mut Tracker,
    req: &mut Request,
) -> Result<(), NvmeError> {
    let payload_offset = req.payload_offset;
    let payload_size = req.payload_size as u64;
    let Payload::Gather(list) = &mut req.payload else {
        debug_assert!(false, "gather builder fed a non-gather payload");
        return Err(NvmeError::PayloadRejected);
    };
    list.reset(payload_offset);

    let mut remaining = payload_size;
    let mut nseg: usize = 0;
    // A single-descriptor transfer goes straight into SGL1; the scratch
    // stays untouched.
    let mut first = SglDescriptor::default();

    while remaining > 0 {
        let Some((vaddr, len)) = list.next() else {
            return Err(NvmeError::PayloadRejected);
        };
        if len == 0 {
            return Err(NvmeError::PayloadRejected);
        }
        let length = (len as u64).min(remaining) as u32;
        let phys = env
            .vtophys(vaddr)
            .map_err(|_| NvmeError::PayloadRejected)?
            .as_u64();

        let descriptor = SglDescriptor::data_block(phys, length);
        if nseg == 0 {
            first = descriptor;
        } else {
            if nseg >= SGL_DESCRIPTORS {
                return Err(NvmeError::PayloadRejected);
            }
            if nseg == 1 {
                tr.write_sgl(0, first);
            }
            tr.write_sgl(nseg, descriptor);
        }
        nseg += 1;
        remaining -= length as u64;
    }

    if nseg == 1 {
        req.cmd.set_sgl1(first);
    } else {
        req.cmd.set_sgl1(SglDescriptor::last_segment(
            tr.scratch_phys().as_u64(),
            (nseg * core::mem::size_of::<SglDescriptor>()) as u32,
        ));
    }

    req.cmd.set_psdt(psdt::SGL_MPTR_SGL);
    Ok(())
}
