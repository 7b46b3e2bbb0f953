//! Per-call control flags and the server-wide set of in-flight calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why response metadata was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetadataRefusal {
    AlreadySent,
    AfterMessage,
    AfterEnd,
}

/// State shared by a call's driver, its surfaces and the server.
#[derive(Debug)]
pub(crate) struct CallControl {
    id: u64,
    path: String,
    cancelled: AtomicBool,
    cancel_waiters: Notify,
    forced: AtomicBool,
    force_waiters: Notify,
    metadata_sent: AtomicBool,
    message_written: AtomicBool,
    finished: AtomicBool,
}

impl CallControl {
    pub(crate) fn new(id: u64, path: impl Into<String>) -> Self {
        CallControl {
            id,
            path: path.into(),
            cancelled: AtomicBool::new(false),
            cancel_waiters: Notify::new(),
            forced: AtomicBool::new(false),
            force_waiters: Notify::new(),
            metadata_sent: AtomicBool::new(false),
            message_written: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_waiters.notify_waiters();
        }
    }

    /// Resolves once the call is cancelled.
    pub(crate) async fn cancelled(&self) {
        let notified = self.cancel_waiters.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Ask the driver to end the call with `UNAVAILABLE`.
    pub(crate) fn force_shutdown(&self) {
        if !self.forced.swap(true, Ordering::AcqRel) {
            self.force_waiters.notify_waiters();
        }
    }

    /// Resolves once [`CallControl::force_shutdown`] was called, and
    /// immediately on every later call.
    pub(crate) async fn forced(&self) {
        let notified = self.force_waiters.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.forced.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    pub(crate) fn claim_metadata(&self) -> Result<(), MetadataRefusal> {
        if self.finished.load(Ordering::Acquire) {
            return Err(MetadataRefusal::AfterEnd);
        }
        if self.message_written.load(Ordering::Acquire) {
            return Err(MetadataRefusal::AfterMessage);
        }
        if self.metadata_sent.swap(true, Ordering::AcqRel) {
            return Err(MetadataRefusal::AlreadySent);
        }
        Ok(())
    }

    pub(crate) fn mark_message_written(&self) {
        self.message_written.store(true, Ordering::Release);
    }

    /// First caller wins the right to complete the call.
    pub(crate) fn claim_finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Calls that have not reached their terminal status yet.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    calls: Mutex<HashMap<u64, Arc<CallControl>>>,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn insert(self: &Arc<Self>, control: Arc<CallControl>) -> InFlightGuard {
        let id = control.id();
        self.calls.lock().insert(id, control);
        InFlightGuard {
            calls: self.clone(),
            id,
        }
    }

    fn remove(&self, id: u64) {
        let now_idle = {
            let mut calls = self.calls.lock();
            calls.remove(&id);
            calls.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<CallControl>> {
        self.calls.lock().values().cloned().collect()
    }

    /// Resolves once no call is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.calls.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Removes its call from the in-flight set when dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    calls: Arc<InFlight>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.calls.remove(self.id);
    }
}
