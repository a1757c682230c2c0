//! Per-process admin completion routing
//!
//! Several processes may share one controller. An admin completion must run
//! its callback in the process that originated the request, so completions
//! for foreign requests are parked in the originator's FIFO and picked up
//! the next time that process polls the admin queue.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::error;
use spin::Mutex;

use crate::request::Request;

struct ProcessChannel {
    pid: u32,
    pending: VecDeque<Box<Request>>,
}

/// State shared between a controller and all of its queue pairs.
pub struct ControllerShared {
    is_resetting: AtomicBool,
    /// Registry of active processes. Callbacks never run under this lock;
    /// requests are moved out first.
    processes: Mutex<Vec<ProcessChannel>>,
}

impl ControllerShared {
    pub fn new() -> Self {
        Self {
            is_resetting: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.is_resetting.load(Ordering::Acquire)
    }

    pub fn set_resetting(&self, resetting: bool) {
        self.is_resetting.store(resetting, Ordering::Release);
    }

    pub fn register_process(&self, pid: u32) {
        let mut processes = self.processes.lock();
        if !processes.iter().any(|p| p.pid == pid) {
            processes.push(ProcessChannel {
                pid,
                pending: VecDeque::new(),
            });
        }
    }

    /// Drop a process and any completions still parked for it.
    pub fn unregister_process(&self, pid: u32) {
        self.processes.lock().retain(|p| p.pid != pid);
    }

    /// Park a completed admin request for its originating process. The
    /// completion has already been copied into `req.cpl`. A request whose
    /// originator is gone is logged and freed.
    pub fn route(&self, req: Box<Request>) {
        let mut processes = self.processes.lock();
        match processes.iter_mut().find(|p| p.pid == req.pid) {
            Some(channel) => channel.pending.push_back(req),
            None => {
                error!(
                    "no process {} to deliver admin completion to; dropping request",
                    req.pid
                );
            }
        }
    }

    /// Deliver every parked completion for `pid`. Requests are taken out
    /// one at a time so the callbacks run without the registry lock held.
    pub fn drain(&self, pid: u32) {
        loop {
            let req = self
                .processes
                .lock()
                .iter_mut()
                .find(|p| p.pid == pid)
                .and_then(|p| p.pending.pop_front());
            match req {
                Some(mut req) => {
                    let cpl = req.cpl;
                    req.complete(&cpl);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self, pid: u32) -> usize {
        self.processes
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .map_or(0, |p| p.pending.len())
    }
}
