//! Queue pair engine
//!
//! A queue pair owns one submission ring and one completion ring, both
//! device-visible, plus the doorbells that advance them and the tracker
//! pool that ties completions back to requests. Submission copies the
//! command into the ring and rings the tail doorbell; completion scans the
//! ring for entries whose phase bit matches the current generation.
//!
//! Access to one queue pair must be serialised by the caller. Different
//! queue pairs can progress on different threads; after construction they
//! only share the controller's register window through disjoint doorbell
//! addresses.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};
use log::{debug, error};
use x86_64::{PhysAddr, VirtAddr};

use crate::NvmeError;
use crate::cmd::{NvmeCommand, NvmeCompletion, generic_sc, opcodes, sct};
use crate::cmb::CmbRegion;
use crate::env::{DmaBuffer, NvmeEnv};
use crate::payload;
use crate::process::ControllerShared;
use crate::regs::NvmeRegisters;
use crate::request::{Payload, Request};
use crate::tracker::TrackerPool;

pub(crate) const SQ_ENTRY_SIZE: usize = 64;
pub(crate) const CQ_ENTRY_SIZE: usize = 16;

/// Geometry and behavior knobs for one queue pair.
pub(crate) struct QueuePairConfig {
    pub qid: u16,
    pub num_entries: u32,
    pub num_trackers: u16,
    pub sgl_supported: bool,
    pub retry_count: u8,
}

pub struct NvmeQueuePair<E: NvmeEnv> {
    env: Arc<E>,
    shared: Arc<ControllerShared>,
    qid: u16,
    num_entries: u32,
    sq_virt: VirtAddr,
    sq_phys: PhysAddr,
    /// Host memory backing the SQ; `None` when the SQ lives in the CMB.
    sq_host: Option<DmaBuffer>,
    sq_in_cmb: bool,
    cq: DmaBuffer,
    sq_tdbl: VirtAddr,
    cq_hdbl: VirtAddr,
    sq_tail: u32,
    cq_head: u32,
    phase: bool,
    trackers: TrackerPool,
    is_enabled: bool,
    sgl_supported: bool,
    retry_count: u8,
    /// Requests deferred because no tracker was free or the queue was
    /// disabled mid-reset.
    queued: VecDeque<Box<Request>>,
}

impl<E: NvmeEnv> NvmeQueuePair<E> {
    pub(crate) fn new(
        env: Arc<E>,
        shared: Arc<ControllerShared>,
        regs: &NvmeRegisters,
        stride_u32: u32,
        config: QueuePairConfig,
        cmb: Option<&mut CmbRegion>,
    ) -> Result<Self, NvmeError> {
        if config.num_entries < 2 || config.num_entries > 65536 {
            return Err(NvmeError::InvalidQueueSize);
        }
        debug_assert!(config.num_trackers as u32 <= config.num_entries - 1);

        let sq_bytes = config.num_entries as usize * SQ_ENTRY_SIZE;
        let cq_bytes = config.num_entries as usize * CQ_ENTRY_SIZE;

        // SQ placement: CMB when available at 4 KiB alignment, host DMA
        // memory otherwise.
        let cmb_slot = cmb.and_then(|region| {
            region
                .alloc(sq_bytes as u64, 4096)
                .map(|offset| (region.virt_at(offset), region.phys_at(offset)))
        });
        let (sq_virt, sq_phys, sq_host, sq_in_cmb) = match cmb_slot {
            Some((virt, phys)) => (virt, phys, None, true),
            None => {
                let buf = env
                    .dma_zalloc(sq_bytes, 4096)
                    .map_err(|_| NvmeError::OutOfMemory)?;
                (buf.virt, buf.phys, Some(buf), false)
            }
        };

        let cq = match env.dma_zalloc(cq_bytes, 4096) {
            Ok(buf) => buf,
            Err(_) => {
                if let Some(buf) = &sq_host {
                    unsafe { env.dma_free(buf) };
                }
                return Err(NvmeError::OutOfMemory);
            }
        };

        let trackers = match TrackerPool::new(&*env, config.num_trackers) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe {
                    if let Some(buf) = &sq_host {
                        env.dma_free(buf);
                    }
                    env.dma_free(&cq);
                }
                return Err(e);
            }
        };

        let sq_tdbl = regs.doorbell_addr(config.qid, false, stride_u32);
        let cq_hdbl = regs.doorbell_addr(config.qid, true, stride_u32);

        debug!(
            "Created NVMe queue {}: SQ at {:#x}{}, CQ at {:#x}",
            config.qid,
            sq_virt.as_u64(),
            if sq_in_cmb { " (CMB)" } else { "" },
            cq.virt.as_u64()
        );

        let mut qpair = Self {
            env,
            shared,
            qid: config.qid,
            num_entries: config.num_entries,
            sq_virt,
            sq_phys,
            sq_host,
            sq_in_cmb,
            cq,
            sq_tdbl,
            cq_hdbl,
            sq_tail: 0,
            cq_head: 0,
            phase: true,
            trackers,
            is_enabled: false,
            sgl_supported: config.sgl_supported,
            retry_count: config.retry_count,
            queued: VecDeque::new(),
        };
        qpair.reset();
        Ok(qpair)
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn sq_in_cmb(&self) -> bool {
        self.sq_in_cmb
    }

    /// Bus address of the submission ring, for `CREATE_IO_SQ`.
    pub fn sq_phys(&self) -> PhysAddr {
        self.sq_phys
    }

    /// Bus address of the completion ring, for `CREATE_IO_CQ`.
    pub fn cq_phys(&self) -> PhysAddr {
        self.cq.phys
    }

    pub fn outstanding_len(&self) -> usize {
        self.trackers.outstanding().len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Rewind both rings to a pristine state. The phase starts at 1
    /// because the device writes 1 into the phase bit of the first
    /// generation of completions.
    pub fn reset(&mut self) {
        self.sq_tail = 0;
        self.cq_head = 0;
        self.phase = true;
        unsafe {
            core::ptr::write_bytes(
                self.sq_virt.as_mut_ptr::<u8>(),
                0,
                self.num_entries as usize * SQ_ENTRY_SIZE,
            );
            core::ptr::write_bytes(
                self.cq.virt.as_mut_ptr::<u8>(),
                0,
                self.num_entries as usize * CQ_ENTRY_SIZE,
            );
        }
    }

    /// Start accepting submissions. Commands still outstanding from before
    /// a reset are synthetically aborted: without retry on the admin
    /// queue, with retry (subject to each request's counter) on I/O
    /// queues.
    pub fn enable(&mut self) {
        self.is_enabled = true;
        let dnr = self.qid == 0;
        self.abort_outstanding(generic_sc::ABORTED_BY_REQUEST, dnr, true);
    }

    /// Stop accepting submissions. On the admin queue, in-flight
    /// asynchronous event requests are aborted so teardown does not wait
    /// on them.
    pub fn disable(&mut self) {
        self.is_enabled = false;
        if self.qid == 0 {
            self.abort_aers();
        }
    }

    /// Abort everything outstanding, no retry.
    pub fn fail(&mut self) {
        self.abort_outstanding(generic_sc::ABORTED_BY_REQUEST, true, true);
    }

    /// Explicit teardown; ring and tracker memory is released.
    pub fn destroy(self) {}

    /// Submit a request. Never blocks: when no tracker is free or the
    /// queue is disabled by an ongoing controller reset, the request is
    /// parked on the deferred FIFO and resubmitted later.
    pub fn submit(&mut self, req: Box<Request>) -> Result<(), NvmeError> {
        if !self.is_enabled {
            if self.shared.is_resetting() {
                self.queued.push_back(req);
                return Ok(());
            }
            self.enable();
        }

        if !self.queued.is_empty() {
            // Keep FIFO order across previously deferred requests.
            self.queued.push_back(req);
            return self.drain_queued();
        }

        self.try_submit(req)
    }

    fn drain_queued(&mut self) -> Result<(), NvmeError> {
        let mut result = Ok(());
        while self.is_enabled && self.trackers.free_len() > 0 {
            let Some(req) = self.queued.pop_front() else {
                break;
            };
            if let Err(e) = self.try_submit(req) {
                result = Err(e);
            }
        }
        result
    }

    fn try_submit(&mut self, mut req: Box<Request>) -> Result<(), NvmeError> {
        let Some(cid) = self.trackers.acquire() else {
            self.queued.push_back(req);
            return Ok(());
        };
        req.cmd.set_command_id(cid);

        let env = Arc::clone(&self.env);
        let sgl_supported = self.sgl_supported;
        let built = {
            let tr = self.trackers.get_mut(cid);
            match &req.payload {
                Payload::None => {
                    req.cmd.prp1 = 0;
                    req.cmd.prp2 = 0;
                    Ok(())
                }
                Payload::Contig { .. } => payload::build_contig(&*env, tr, &mut req),
                Payload::Gather(_) => {
                    if sgl_supported {
                        payload::build_gather_sgl(&*env, tr, &mut req)
                    } else {
                        payload::build_gather_prp(&*env, tr, &mut req)
                    }
                }
            }
        };

        if let Err(e) = built {
            // Translation failed: complete synchronously with
            // INVALID_FIELD / DNR and surface the error to the caller.
            self.trackers.release(cid);
            error!(
                "payload of command {:#x} on queue {} could not be translated",
                req.cmd.opcode(),
                self.qid
            );
            let cpl = NvmeCompletion {
                dw0: 0,
                dw1: 0,
                sq_head: 0,
                sq_id: self.qid,
                cid,
                status: NvmeCompletion::make_status(
                    sct::GENERIC,
                    generic_sc::INVALID_FIELD,
                    true,
                    self.phase,
                ),
            };
            req.complete(&cpl);
            return Err(e);
        }

        let tr = self.trackers.get_mut(cid);
        tr.active = true;
        tr.req = Some(req);
        self.submit_tracker(cid);
        Ok(())
    }

    /// Copy a tracker's command into the ring and ring the tail doorbell.
    /// Also the resubmission path for retries.
    fn submit_tracker(&mut self, cid: u16) {
        let tr = self.trackers.get(cid);
        let Some(req) = tr.req.as_ref() else {
            debug_assert!(false, "tracker {} submitted without a request", cid);
            return;
        };
        let cmd = req.cmd;

        unsafe {
            self.sq_virt
                .as_mut_ptr::<NvmeCommand>()
                .add(self.sq_tail as usize)
                .write_volatile(cmd);
        }
        self.sq_tail = (self.sq_tail + 1) % self.num_entries;

        // The command slot must be visible before the new tail is.
        fence(Ordering::Release);
        unsafe {
            self.sq_tdbl.as_mut_ptr::<u32>().write_volatile(self.sq_tail);
        }
    }

    /// Reap up to `max_completions` completions (0 means as many as
    /// allowed). The cap of `num_entries - 1` keeps the head doorbell from
    /// wrapping within a single invocation.
    pub fn process_completions(&mut self, max_completions: u32) -> u32 {
        if !self.is_enabled {
            // Spurious call while the controller resets around us.
            return 0;
        }

        let cap = self.num_entries - 1;
        let max = if max_completions == 0 || max_completions > cap {
            cap
        } else {
            max_completions
        };

        let mut count = 0;
        while count < max {
            let cpl = unsafe {
                self.cq
                    .virt
                    .as_ptr::<NvmeCompletion>()
                    .add(self.cq_head as usize)
                    .read_volatile()
            };
            if cpl.phase() != self.phase {
                break;
            }

            if self.trackers.contains(cpl.cid) && self.trackers.get(cpl.cid).active {
                self.complete_tracker(cpl.cid, &cpl, true);
            } else {
                error!("cpl does not map to outstanding cmd (cid {})", cpl.cid);
                debug_assert!(false, "cpl does not map to outstanding cmd");
            }

            self.cq_head += 1;
            if self.cq_head == self.num_entries {
                self.cq_head = 0;
                self.phase = !self.phase;
            }
            count += 1;
        }

        if count > 0 {
            unsafe {
                self.cq_hdbl.as_mut_ptr::<u32>().write_volatile(self.cq_head);
            }
        }

        if self.qid == 0 {
            // Pick up admin completions other processes parked for us.
            self.shared.drain(self.env.current_pid());
        }

        count
    }

    fn complete_tracker(&mut self, cid: u16, cpl: &NvmeCompletion, print_on_error: bool) {
        let tr = self.trackers.get_mut(cid);
        let Some(mut req) = tr.req.take() else {
            error!("tracker {} completed without a request", cid);
            debug_assert!(false, "tracker completed without a request");
            return;
        };

        let failed = cpl.is_error();
        let retry = failed && cpl.requests_retry() && req.retries < self.retry_count;

        if failed && print_on_error {
            error!("command failed: {:?} cpl: {:?}", req.cmd, cpl);
        }

        tr.active = false;
        debug_assert_eq!(cpl.cid, req.cmd.command_id());

        if retry {
            req.retries += 1;
            let tr = self.trackers.get_mut(cid);
            tr.req = Some(req);
            tr.active = true;
            self.submit_tracker(cid);
            return;
        }

        if self.qid == 0 && req.pid != self.env.current_pid() {
            // Deliver on the originating process, not here.
            req.cpl = *cpl;
            self.shared.route(req);
        } else {
            req.complete(cpl);
        }
        self.trackers.release(cid);

        if !self.shared.is_resetting() {
            if let Some(next) = self.queued.pop_front() {
                let _ = self.try_submit(next);
            }
        }
    }

    /// Synthetically complete an outstanding tracker.
    fn abort_tracker(&mut self, cid: u16, sc: u8, dnr: bool, print_on_error: bool) {
        let cpl = NvmeCompletion {
            dw0: 0,
            dw1: 0,
            sq_head: 0,
            sq_id: self.qid,
            cid,
            status: NvmeCompletion::make_status(sct::GENERIC, sc, dnr, self.phase),
        };
        self.complete_tracker(cid, &cpl, print_on_error);
    }

    fn abort_outstanding(&mut self, sc: u8, dnr: bool, print_on_error: bool) {
        // Snapshot: retried trackers stay outstanding, released ones leave.
        let cids: Vec<u16> = self.trackers.outstanding().to_vec();
        for cid in cids {
            if self.trackers.get(cid).active {
                self.abort_tracker(cid, sc, dnr, print_on_error);
            }
        }
    }

    fn abort_aers(&mut self) {
        let cids: Vec<u16> = self.trackers.outstanding().to_vec();
        for cid in cids {
            let is_aer = self.trackers.get(cid).req.as_ref().is_some_and(|req| {
                req.cmd.opcode() == opcodes::ADMIN_ASYNC_EVENT_REQUEST
            });
            if is_aer {
                self.abort_tracker(cid, generic_sc::ABORTED_SQ_DELETION, true, false);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sq_entry(&self, index: usize) -> NvmeCommand {
        unsafe {
            self.sq_virt
                .as_ptr::<NvmeCommand>()
                .add(index)
                .read_volatile()
        }
    }

    #[cfg(test)]
    pub(crate) fn write_cq_entry(&mut self, index: usize, cpl: NvmeCompletion) {
        unsafe {
            self.cq
                .virt
                .as_mut_ptr::<NvmeCompletion>()
                .add(index)
                .write_volatile(cpl);
        }
    }

    #[cfg(test)]
    pub(crate) fn sq_tail(&self) -> u32 {
        self.sq_tail
    }

    #[cfg(test)]
    pub(crate) fn cq_head(&self) -> u32 {
        self.cq_head
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> bool {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn trackers(&self) -> &TrackerPool {
        &self.trackers
    }
}

impl<E: NvmeEnv> Drop for NvmeQueuePair<E> {
    fn drop(&mut self) {
        unsafe {
            if let Some(buf) = self.sq_host.take() {
                self.env.dma_free(&buf);
            }
            self.env.dma_free(&self.cq);
            self.trackers.destroy(&*self.env);
        }
    }
}
