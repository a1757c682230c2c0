//! NVMe controller bring-up and admin plumbing
//!
//! Maps BAR0, discovers the doorbell layout and the optional controller
//! memory buffer, arms the admin queue pair, and drives the admin commands
//! that create and delete I/O queues. The wider controller state machine
//! (identify, namespace discovery, feature negotiation) lives with the
//! upper layer; it talks to the device through the entry points here.

use alloc::boxed::Box;
use alloc::sync::Arc;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::cmb::CmbRegion;
use crate::cmd::{NvmeCommand, NvmeCompletion};
use crate::env::{MappedBar, NvmeEnv, pci_cfg};
use crate::process::ControllerShared;
use crate::qpair::{NvmeQueuePair, QueuePairConfig};
use crate::regs::NvmeRegisters;
use crate::request::Request;
use crate::{
    ADMIN_QUEUE_ENTRIES, ADMIN_TRACKERS, MAX_IO_TRACKERS, NvmeError, PAGE_SIZE, PRP_LIST_ENTRIES,
};

/// Spins waiting for CSTS.RDY after CC.EN is toggled.
const ENABLE_TIMEOUT_SPINS: u32 = 50_000_000;

/// Spins waiting for a synchronously issued admin command.
const SYNC_ADMIN_SPINS: u64 = 50_000_000;

/// Construction-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Place I/O submission queues in the controller memory buffer when
    /// the device has one.
    pub use_cmb_sqs: bool,
    pub admin_queue_entries: u32,
    pub io_queue_entries: u32,
    /// Resubmissions allowed per command on transient failures.
    pub retry_count: u8,
    /// The device accepts SGL descriptors for I/O commands; set by the
    /// upper layer from identify data.
    pub sgl_supported: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            use_cmb_sqs: false,
            admin_queue_entries: ADMIN_QUEUE_ENTRIES,
            io_queue_entries: 256,
            retry_count: 4,
            sgl_supported: false,
        }
    }
}

pub struct NvmeController<E: NvmeEnv> {
    env: Arc<E>,
    regs: NvmeRegisters,
    bar0: MappedBar,
    cmb: Option<CmbRegion>,
    opts: ControllerOptions,
    shared: Arc<ControllerShared>,
    stride_u32: u32,
    /// MQES + 1 from CAP.
    max_entries: u32,
    admin: NvmeQueuePair<E>,
}

impl<E: NvmeEnv> NvmeController<E> {
    /// Map the device and arm the admin queue. On failure everything built
    /// so far is torn down in reverse order.
    pub fn construct(env: Arc<E>, options: ControllerOptions) -> Result<Self, NvmeError> {
        info!("Initializing NVMe controller");
        let mut opts = options;

        let bar0 = env.map_bar(0)?;
        let regs = unsafe { NvmeRegisters::new(bar0.virt, bar0.size) };

        // CMB is best-effort: without one, submission queues stay in host
        // memory.
        let mut cmb = CmbRegion::discover(&*env, &regs);
        if opts.use_cmb_sqs && cmb.is_none() {
            debug!("no usable CMB; disabling CMB submission queues");
            opts.use_cmb_sqs = false;
        }

        let built = Self::arm_admin_queue(&env, &regs, &opts, cmb.as_mut());
        match built {
            Ok((stride_u32, max_entries, shared, admin)) => {
                info!(
                    "NVMe controller mapped: {} queue entries max, doorbell stride {} bytes",
                    max_entries,
                    stride_u32 * 4
                );
                Ok(Self {
                    env,
                    regs,
                    bar0,
                    cmb,
                    opts,
                    shared,
                    stride_u32,
                    max_entries,
                    admin,
                })
            }
            Err(e) => {
                if let Some(region) = &cmb {
                    region.unmap(&*env);
                }
                env.unmap_bar(&bar0);
                Err(e)
            }
        }
    }

    fn arm_admin_queue(
        env: &Arc<E>,
        regs: &NvmeRegisters,
        opts: &ControllerOptions,
        cmb: Option<&mut CmbRegion>,
    ) -> Result<(u32, u32, Arc<ControllerShared>, NvmeQueuePair<E>), NvmeError> {
        // Bus mastering on, legacy interrupts off; completions are polled.
        let command = env.cfg_read32(pci_cfg::COMMAND_OFFSET)?;
        env.cfg_write32(
            command | pci_cfg::CMD_BUS_MASTER | pci_cfg::CMD_INTX_DISABLE,
            pci_cfg::COMMAND_OFFSET,
        )?;

        let max_entries = regs.max_queue_entries();
        let stride_u32 = regs.doorbell_stride_u32();

        let shared = Arc::new(ControllerShared::new());
        shared.register_process(env.current_pid());

        let config = QueuePairConfig {
            qid: 0,
            num_entries: opts.admin_queue_entries.min(max_entries),
            num_trackers: ADMIN_TRACKERS,
            sgl_supported: false,
            retry_count: opts.retry_count,
        };
        let admin = NvmeQueuePair::new(
            env.clone(),
            shared.clone(),
            regs,
            stride_u32,
            config,
            if opts.use_cmb_sqs { cmb } else { None },
        )?;

        Ok((stride_u32, max_entries, shared, admin))
    }

    /// Program the admin queue registers and set CC.EN, then wait for the
    /// device to report ready.
    pub fn enable(&mut self) -> Result<(), NvmeError> {
        info!("Enabling NVMe controller");
        let entries = self.admin.num_entries();
        self.regs.set_admin_queue_attributes(entries, entries);
        self.regs.set_admin_sq_base(self.admin.sq_phys().as_u64());
        self.regs.set_admin_cq_base(self.admin.cq_phys().as_u64());
        self.regs.configure();

        for _ in 0..ENABLE_TIMEOUT_SPINS {
            if self.regs.is_ready() {
                info!("Controller enabled and ready");
                return Ok(());
            }
            core::hint::spin_loop();
        }
        error!("controller did not become ready");
        Err(NvmeError::ControllerEnableTimeout)
    }

    /// Clear CC.EN.
    pub fn disable(&mut self) {
        self.regs.disable();
    }

    /// Explicit teardown. In-flight asynchronous event requests are
    /// aborted so their callbacks do not fire into a dead controller.
    pub fn destruct(mut self) {
        info!("Destroying NVMe controller");
        self.admin.disable();
    }

    /// Flag an ongoing controller-level reset. While set, submissions on
    /// disabled queue pairs park on their deferred FIFOs.
    pub fn set_resetting(&self, resetting: bool) {
        self.shared.set_resetting(resetting);
    }

    pub fn is_resetting(&self) -> bool {
        self.shared.is_resetting()
    }

    pub fn register_process(&self, pid: u32) {
        self.shared.register_process(pid);
    }

    pub fn unregister_process(&self, pid: u32) {
        self.shared.unregister_process(pid);
    }

    pub fn admin_qpair(&self) -> &NvmeQueuePair<E> {
        &self.admin
    }

    /// Submit a request on the admin queue.
    pub fn submit_admin_request(&mut self, req: Box<Request>) -> Result<(), NvmeError> {
        self.admin.submit(req)
    }

    /// Poll the admin queue for completions.
    pub fn process_admin_completions(&mut self, max_completions: u32) -> u32 {
        self.admin.process_completions(max_completions)
    }

    /// Largest payload one command can carry: the PRP list in a tracker's
    /// scratch bounds the transfer.
    pub fn max_transfer_size(&self) -> u64 {
        PRP_LIST_ENTRIES as u64 * PAGE_SIZE
    }

    /// Vendor and device identifier from config space.
    pub fn pci_id(&self) -> Result<(u16, u16), NvmeError> {
        let id = self.env.cfg_read32(pci_cfg::ID_OFFSET)?;
        Ok(((id & 0xFFFF) as u16, (id >> 16) as u16))
    }

    pub fn get_register32(&self, offset: u64) -> u32 {
        self.regs.read32(offset)
    }

    pub fn get_register64(&self, offset: u64) -> u64 {
        self.regs.read64(offset)
    }

    pub fn set_register32(&self, value: u32, offset: u64) {
        self.regs.write32(value, offset)
    }

    pub fn set_register64(&self, value: u64, offset: u64) {
        self.regs.write64(value, offset)
    }

    /// Create an I/O queue pair: completion queue first, then the
    /// submission queue targeting it. A submission queue failure deletes
    /// the already-created completion queue before reporting the error.
    pub fn create_io_qpair(
        &mut self,
        qid: u16,
        priority: u8,
    ) -> Result<NvmeQueuePair<E>, NvmeError> {
        debug_assert!(qid != 0, "queue identifier 0 is the admin queue");

        let num_entries = self.opts.io_queue_entries.min(self.max_entries);
        let num_trackers = MAX_IO_TRACKERS.min((num_entries - 1) as u16);
        let config = QueuePairConfig {
            qid,
            num_entries,
            num_trackers,
            sgl_supported: self.opts.sgl_supported,
            retry_count: self.opts.retry_count,
        };
        let qpair = NvmeQueuePair::new(
            self.env.clone(),
            self.shared.clone(),
            &self.regs,
            self.stride_u32,
            config,
            if self.opts.use_cmb_sqs {
                self.cmb.as_mut()
            } else {
                None
            },
        )?;

        info!("Creating I/O queue pair {}", qid);
        self.create_io_queues_on_device(&qpair, priority)?;
        Ok(qpair)
    }

    fn create_io_queues_on_device(
        &mut self,
        qpair: &NvmeQueuePair<E>,
        priority: u8,
    ) -> Result<(), NvmeError> {
        let qid = qpair.qid();
        let num_entries = qpair.num_entries();

        let cpl = self.sync_admin_command(NvmeCommand::create_io_cq(
            qid,
            num_entries,
            qpair.cq_phys().as_u64(),
        ))?;
        if cpl.is_error() {
            error!(
                "CREATE_IO_CQ for queue {} failed: sct {:#x} sc {:#x}",
                qid,
                cpl.sct(),
                cpl.sc()
            );
            return Err(NvmeError::QueueCreationFailed);
        }

        let cpl = self.sync_admin_command(NvmeCommand::create_io_sq(
            qid,
            qid,
            num_entries,
            qpair.sq_phys().as_u64(),
            priority,
        ))?;
        if cpl.is_error() {
            error!(
                "CREATE_IO_SQ for queue {} failed: sct {:#x} sc {:#x}",
                qid,
                cpl.sct(),
                cpl.sc()
            );
            // The completion queue exists device-side; compensate.
            match self.sync_admin_command(NvmeCommand::delete_io_cq(qid)) {
                Ok(del) if !del.is_error() => {}
                _ => warn!("could not delete completion queue {} after SQ failure", qid),
            }
            return Err(NvmeError::QueueCreationFailed);
        }
        Ok(())
    }

    /// Delete an I/O queue pair device-side and release its memory.
    /// Submission queue first, then its completion queue.
    pub fn delete_io_qpair(&mut self, qpair: NvmeQueuePair<E>) -> Result<(), NvmeError> {
        let qid = qpair.qid();
        info!("Deleting I/O queue pair {}", qid);

        let mut result = Ok(());
        match self.sync_admin_command(NvmeCommand::delete_io_sq(qid)) {
            Ok(cpl) if !cpl.is_error() => {}
            Ok(cpl) => result = Err(NvmeError::CommandFailed(cpl.status)),
            Err(e) => result = Err(e),
        }
        match self.sync_admin_command(NvmeCommand::delete_io_cq(qid)) {
            Ok(cpl) if !cpl.is_error() => {}
            Ok(cpl) => result = Err(NvmeError::CommandFailed(cpl.status)),
            Err(e) => result = Err(e),
        }

        qpair.destroy();
        result
    }

    /// Re-create an existing I/O queue pair device-side after a controller
    /// reset, reusing its rings and trackers.
    pub fn reinit_io_qpair(
        &mut self,
        qpair: &mut NvmeQueuePair<E>,
        priority: u8,
    ) -> Result<(), NvmeError> {
        qpair.disable();
        qpair.reset();
        self.create_io_queues_on_device(qpair, priority)
    }

    /// Issue an admin command with no payload and busy-poll the admin
    /// queue until its completion arrives.
    fn sync_admin_command(&mut self, cmd: NvmeCommand) -> Result<NvmeCompletion, NvmeError> {
        let slot: Arc<Mutex<Option<NvmeCompletion>>> = Arc::new(Mutex::new(None));
        let done = slot.clone();
        let mut req = Request::new_null(
            self.env.current_pid(),
            Box::new(move |cpl| {
                *done.lock() = Some(*cpl);
            }),
        );
        req.cmd = cmd;
        self.admin.submit(req)?;

        let mut spins: u64 = 0;
        loop {
            self.admin.process_completions(0);
            if let Some(cpl) = *slot.lock() {
                return Ok(cpl);
            }
            spins += 1;
            if spins > SYNC_ADMIN_SPINS {
                error!("admin command {:#x} never completed", cmd.opcode());
                return Err(NvmeError::CommandTimeout);
            }
            core::hint::spin_loop();
        }
    }
}

impl<E: NvmeEnv> Drop for NvmeController<E> {
    fn drop(&mut self) {
        if let Some(region) = &self.cmb {
            region.unmap(&*self.env);
        }
        self.env.unmap_bar(&self.bar0);
    }
}
