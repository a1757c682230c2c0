//! Request objects submitted to queue pairs.

use alloc::boxed::Box;
use x86_64::VirtAddr;

use crate::cmd::{NvmeCommand, NvmeCompletion};

/// Invoked once when the request's completion (real or synthetic) arrives.
pub type CompletionCallback = Box<dyn FnMut(&NvmeCompletion) + Send>;

/// A caller-owned gather list. The payload builders walk it segment by
/// segment; `reset` rewinds it to the given byte offset into the transfer.
pub trait ScatterGather: Send {
    fn reset(&mut self, offset: usize);

    /// Next segment as (virtual address, length in bytes), or `None` when
    /// the list is exhausted.
    fn next(&mut self) -> Option<(VirtAddr, usize)>;
}

/// Data carried by a request.
pub enum Payload {
    /// No data transfer.
    None,
    /// Virtually contiguous buffer, plus an optional metadata buffer.
    Contig {
        buffer: VirtAddr,
        metadata: Option<VirtAddr>,
    },
    /// Caller-provided gather list.
    Gather(Box<dyn ScatterGather>),
}

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Payload::None => f.write_str("None"),
            Payload::Contig { buffer, metadata } => f
                .debug_struct("Contig")
                .field("buffer", buffer)
                .field("metadata", metadata)
                .finish(),
            Payload::Gather(_) => f.write_str("Gather"),
        }
    }
}

/// One NVMe command in flight, together with its payload description and
/// completion delivery.
pub struct Request {
    /// Command template; the queue pair fills in CID and data pointers.
    pub cmd: NvmeCommand,
    pub payload: Payload,
    /// Transfer length in bytes.
    pub payload_size: usize,
    /// Byte offset of the transfer inside the payload buffer/gather list.
    pub payload_offset: usize,
    /// Byte offset of the metadata transfer inside the metadata buffer.
    pub md_offset: usize,
    /// Times this command has been resubmitted after a transient failure.
    pub retries: u8,
    /// Process that originated the request; admin completions are routed
    /// back to it.
    pub pid: u32,
    /// Completion storage used when the completion must travel to another
    /// process before the callback can run.
    pub cpl: NvmeCompletion,
    cb: Option<CompletionCallback>,
}

impl Request {
    /// Build a request with no data transfer.
    pub fn new_null(pid: u32, cb: CompletionCallback) -> Box<Self> {
        Box::new(Self {
            cmd: NvmeCommand::new(),
            payload: Payload::None,
            payload_size: 0,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            cpl: NvmeCompletion::default(),
            cb: Some(cb),
        })
    }

    /// Build a request transferring a virtually contiguous buffer.
    pub fn new_contig(
        pid: u32,
        buffer: VirtAddr,
        payload_size: usize,
        metadata: Option<VirtAddr>,
        cb: CompletionCallback,
    ) -> Box<Self> {
        Box::new(Self {
            cmd: NvmeCommand::new(),
            payload: Payload::Contig { buffer, metadata },
            payload_size,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            cpl: NvmeCompletion::default(),
            cb: Some(cb),
        })
    }

    /// Build a request transferring a caller-owned gather list.
    pub fn new_gather(
        pid: u32,
        list: Box<dyn ScatterGather>,
        payload_size: usize,
        cb: CompletionCallback,
    ) -> Box<Self> {
        Box::new(Self {
            cmd: NvmeCommand::new(),
            payload: Payload::Gather(list),
            payload_size,
            payload_offset: 0,
            md_offset: 0,
            retries: 0,
            pid,
            cpl: NvmeCompletion::default(),
            cb: Some(cb),
        })
    }

    /// Deliver the completion to the request's callback.
    pub(crate) fn complete(&mut self, cpl: &NvmeCompletion) {
        if let Some(cb) = self.cb.as_mut() {
            cb(cpl);
        }
    }
}
