//! Requests as seen by the scheduler.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::NrsError;
use crate::policy::PolicyId;
use crate::queue::QueueType;
use crate::resource::{ResourceSet, ResourceSlot};

static REQUEST_XID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Network identifier of a peer: an IPv4 address on a named network (`10.0.0.1@tcp`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid {
    pub addr: Ipv4Addr,
    pub net: String,
}

impl Nid {
    pub fn new(addr: Ipv4Addr, net: impl Into<String>) -> Self {
        Self {
            addr,
            net: normalize_net(&net.into()),
        }
    }
}

/// `tcp0` and `tcp` name the same network.
pub(crate) fn normalize_net(net: &str) -> String {
    match net.strip_suffix('0') {
        Some(base) if !base.is_empty() && !base.ends_with(|c: char| c.is_ascii_digit()) => {
            base.to_owned()
        }
        _ => net.to_owned(),
    }
}

/// Network names are a letter-led alphanumeric word such as `tcp`, `o2ib` or `o2ib1`.
pub(crate) fn is_valid_net(net: &str) -> bool {
    net.starts_with(|c: char| c.is_ascii_alphabetic())
        && net.chars().all(|c| c.is_ascii_alphanumeric())
}

impl FromStr for Nid {
    type Err = NrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, net) = match s.split_once('@') {
            Some((addr, net)) => (addr, net),
            None => (s, "tcp"),
        };
        if !is_valid_net(net) {
            return Err(NrsError::InvalidArgument(format!("bad network in nid {s:?}")));
        }
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| NrsError::InvalidArgument(format!("bad address in nid {s:?}")))?;
        Ok(Nid::new(addr, net))
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.net)
    }
}

/// Routing keys the scheduler may classify a request by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub nid: Nid,
    pub job_id: Option<String>,
}

impl RequestIdentity {
    pub fn from_nid(nid: Nid) -> Self {
        Self { nid, job_id: None }
    }

    pub fn with_job(nid: Nid, job_id: impl Into<String>) -> Self {
        Self {
            nid,
            job_id: Some(job_id.into()),
        }
    }
}

/// An inbound RPC, reduced to what the scheduler needs.
#[derive(Debug, Clone)]
pub struct Request {
    pub xid: u64,
    pub identity: RequestIdentity,
    pub arrived: Instant,
}

impl Request {
    pub fn new(identity: RequestIdentity) -> Self {
        Self {
            xid: REQUEST_XID_COUNTER.fetch_add(1, Ordering::Relaxed),
            identity,
            arrived: Instant::now(),
        }
    }
}

/// Scheduler-side bookkeeping for a request, guarded by [`NrsRequest::state`].
#[derive(Debug)]
pub struct NrsRequestState {
    pub initialized: bool,
    pub enqueued: bool,
    pub started: bool,
    pub finalized: bool,
    /// Head whose resources the request currently holds.
    pub queue: QueueType,
    pub resources: ResourceSet,
    /// Policy the request is queued on or being handled by.
    pub owner: Option<(PolicyId, ResourceSlot)>,
}

/// A request travelling through an NRS head.
///
/// Shared between the head's policy queues and the worker handling it, hence always used
/// behind an `Arc`.
#[derive(Debug)]
pub struct NrsRequest {
    request: Request,
    sequence: AtomicU64,
    state: Mutex<NrsRequestState>,
}

impl NrsRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            sequence: AtomicU64::new(0),
            state: Mutex::new(NrsRequestState {
                initialized: false,
                enqueued: false,
                started: false,
                finalized: false,
                queue: QueueType::Regular,
                resources: ResourceSet::default(),
                owner: None,
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.request.identity
    }

    pub fn xid(&self) -> u64 {
        self.request.xid
    }

    /// Ordering key assigned by the policy that queued the request.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, seq: u64) {
        self.sequence.store(seq, Ordering::Release);
    }

    /// Lock the bookkeeping. Always taken after the head lock, never before.
    pub(crate) fn state(&self) -> MutexGuard<'_, NrsRequestState> {
        self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_enqueued(&self) -> bool {
        self.state.lock().enqueued
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Queue whose resources the request holds.
    pub fn queue(&self) -> QueueType {
        self.state.lock().queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nid_parses_and_normalizes() {
        let nid: Nid = "192.168.1.10@tcp0".parse().unwrap();
        assert_eq!(nid.to_string(), "192.168.1.10@tcp");
        let bare: Nid = "10.0.0.1".parse().unwrap();
        assert_eq!(bare.net, "tcp");
        let ib: Nid = "10.0.0.1@o2ib1".parse().unwrap();
        assert_eq!(ib.net, "o2ib1");
        let ib10: Nid = "10.0.0.1@o2ib10".parse().unwrap();
        assert_eq!(ib10.net, "o2ib10");
    }

    #[test]
    fn nid_rejects_garbage() {
        assert!("10.0.0@tcp".parse::<Nid>().is_err());
        assert!("10.0.0.1@".parse::<Nid>().is_err());
        assert!("10.0.0.1@1tcp".parse::<Nid>().is_err());
    }

    #[test]
    fn fresh_request_has_no_flags() {
        let nrq = NrsRequest::new(Request::new(RequestIdentity::with_job(
            "10.0.0.1@tcp".parse().unwrap(),
            "dd.1000",
        )));
        assert!(!nrq.is_initialized());
        assert!(!nrq.is_enqueued());
        assert!(!nrq.is_started());
        assert!(!nrq.is_finalized());
        assert_eq!(nrq.queue(), QueueType::Regular);
        assert_eq!(nrq.identity().job_id.as_deref(), Some("dd.1000"));
    }

    #[test]
    fn xids_are_unique() {
        let identity = RequestIdentity::from_nid("10.0.0.1@tcp".parse().unwrap());
        let a = Request::new(identity.clone());
        let b = Request::new(identity);
        assert_ne!(a.xid, b.xid);
    }
}
