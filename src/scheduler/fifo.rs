//! First-in first-out policy.
//!
//! Every head runs one as its fallback: requests are served in the order this policy accepted
//! them, and it never refuses a request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{NrsError, Result};
use crate::policy::{Policy, PolicyContext};
use crate::request::NrsRequest;
use crate::resource::{Resource, ResourceStep};

/// State allocated when the policy starts; doubles as the single resource level.
#[derive(Debug, Default)]
struct FifoHead {
    /// Requests keyed by arrival sequence.
    queue: Mutex<BTreeMap<u64, Arc<NrsRequest>>>,
    sequence: AtomicU64,
}

/// Arrival-order policy.
pub struct FifoPolicy {
    name: String,
    head: RwLock<Option<Arc<FifoHead>>>,
}

impl FifoPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            head: RwLock::new(None),
        }
    }

    fn head(&self) -> Option<Arc<FifoHead>> {
        self.head.read().clone()
    }

    /// Number of requests currently queued.
    pub fn len(&self) -> usize {
        self.head().map(|h| h.queue.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Policy for FifoPolicy {
    fn start(&self, _ctx: &PolicyContext) -> Result<()> {
        *self.head.write() = Some(Arc::new(FifoHead::default()));
        Ok(())
    }

    fn stop(&self) {
        if let Some(head) = self.head.write().take() {
            debug_assert!(head.queue.lock().is_empty());
        }
    }

    fn res_get(
        &self,
        _nrq: &NrsRequest,
        _parent: Option<&Resource>,
        _moving: bool,
    ) -> ResourceStep {
        match self.head() {
            Some(head) => ResourceStep::Done(Resource::new(0, head)),
            None => ResourceStep::Refused,
        }
    }

    fn req_enqueue(&self, nrq: &Arc<NrsRequest>, res: &Resource) -> Result<()> {
        let head = res
            .downcast::<FifoHead>()
            .ok_or_else(|| NrsError::InvalidArgument(format!("{}: foreign resource", self.name)))?;
        let seq = head.sequence.fetch_add(1, Ordering::Relaxed);
        nrq.set_sequence(seq);
        head.queue.lock().insert(seq, Arc::clone(nrq));
        Ok(())
    }

    fn req_poll(&self, _peek: bool) -> Option<Arc<NrsRequest>> {
        let head = self.head()?;
        let queue = head.queue.lock();
        queue.values().next().cloned()
    }

    fn req_dequeue(&self, nrq: &Arc<NrsRequest>, res: &Resource) {
        if let Some(head) = res.downcast::<FifoHead>() {
            head.queue.lock().remove(&nrq.sequence());
        }
    }

    fn req_start(&self, nrq: &NrsRequest) {
        debug!(
            policy = %self.name,
            nid = %nrq.identity().nid,
            seq = nrq.sequence(),
            "start request"
        );
    }

    fn req_stop(&self, nrq: &NrsRequest) {
        debug!(
            policy = %self.name,
            nid = %nrq.identity().nid,
            seq = nrq.sequence(),
            "stop request"
        );
    }
}
