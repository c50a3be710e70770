//! Policy contract, lifecycle states and descriptors.
//!
//! A policy *type* is described by a [`PolicyDescriptor`] held in the registry. Every NRS head
//! the type is compatible with gets its own *instance*, built by the descriptor's factory and
//! driven through the [`Policy`] trait.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, MonotonicClock};
use crate::config::TbfConfig;
use crate::error::{NrsError, Result};
use crate::head::Throttle;
use crate::queue::QueueType;
use crate::request::NrsRequest;
use crate::resource::{Resource, ResourceStep};
use crate::scheduler::tbf::{RuleCommand, RuleInfo};
use crate::timer::{ThreadTimerFactory, TimerFactory};

/// Maximum length of a policy name.
pub const POLICY_NAME_MAX: usize = 16;

/// Identifier of a policy instance within one head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId(pub u32);

/// Lifecycle of a policy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    /// Registered but not offered to administrators yet.
    Unavailable,
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PolicyState::Unavailable => "unavailable",
            PolicyState::Stopped => "stopped",
            PolicyState::Starting => "starting",
            PolicyState::Started => "started",
            PolicyState::Stopping => "stopping",
        };
        write!(f, "{label}")
    }
}

/// Descriptor flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PolicyFlags(u32);

impl PolicyFlags {
    pub const NONE: PolicyFlags = PolicyFlags(0);
    /// The head's mandatory fallback policy.
    pub const FALLBACK: PolicyFlags = PolicyFlags(1 << 0);
    /// Start instances as soon as they are registered.
    pub const REG_START: PolicyFlags = PolicyFlags(1 << 1);
    /// Registered from outside the scheduler; instances start unavailable.
    pub const REG_EXTERN: PolicyFlags = PolicyFlags(1 << 2);

    pub const fn contains(self, other: PolicyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: PolicyFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for PolicyFlags {
    type Output = PolicyFlags;

    fn bitor(self, rhs: PolicyFlags) -> PolicyFlags {
        PolicyFlags(self.0 | rhs.0)
    }
}

/// Identity of the head an instance is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeadInfo {
    pub service: String,
    pub partition: usize,
    pub queue: QueueType,
}

impl fmt::Display for HeadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]/{}", self.service, self.partition, self.queue)
    }
}

/// Which heads a policy type can be instantiated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCompat {
    All,
    /// Only partitions of the named service.
    Service(String),
}

impl PolicyCompat {
    pub fn matches(&self, head: &HeadInfo) -> bool {
        match self {
            PolicyCompat::All => true,
            PolicyCompat::Service(name) => *name == head.service,
        }
    }
}

/// Process-wide collaborators handed to policies.
#[derive(Clone)]
pub struct PolicyEnv {
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<dyn TimerFactory>,
    pub tbf: TbfConfig,
}

impl PolicyEnv {
    /// Real clock, one timer thread per throttling policy.
    pub fn system(tbf: TbfConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let timers = Arc::new(ThreadTimerFactory::new(Arc::clone(&clock)));
        Self { clock, timers, tbf }
    }

    pub fn new(clock: Arc<dyn Clock>, timers: Arc<dyn TimerFactory>, tbf: TbfConfig) -> Self {
        Self { clock, timers, tbf }
    }
}

impl fmt::Debug for PolicyEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEnv").field("tbf", &self.tbf).finish()
    }
}

/// Everything a policy instance knows about where it runs.
#[derive(Clone, Debug)]
pub struct PolicyContext {
    pub head: HeadInfo,
    pub env: PolicyEnv,
    pub throttle: Throttle,
}

/// Status of one policy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub name: String,
    pub queue: QueueType,
    pub fallback: bool,
    pub state: PolicyState,
    pub queued: u64,
    pub started: u64,
}

/// Control opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NrsCtl {
    Start,
    Stop,
    GetInfo,
    /// Reserved for reclaiming policy memory; not implemented.
    Shrink,
    ReadRules,
    WriteRule(RuleCommand),
}

/// Result payload of a control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlOutput {
    None,
    Info(PolicyInfo),
    Rules(Vec<RuleInfo>),
}

/// Scheduling algorithm contract.
///
/// The head calls `start`/`stop` with its lock dropped; every other hook may run under the
/// head lock and must not block. `res_get`/`res_put` run without the head lock.
pub trait Policy: Send + Sync {
    /// Allocate the instance's private state.
    fn start(&self, ctx: &PolicyContext) -> Result<()>;

    /// Release private state. Called once the instance is idle.
    fn stop(&self);

    /// Policy specific control (rule reads and writes).
    fn ctl(&self, ctl: &NrsCtl) -> Result<CtlOutput> {
        Err(NrsError::NotSupported(format!("{ctl:?}")))
    }

    /// Produce the next resource level for `nrq` below `parent`.
    ///
    /// `moving` is set when the request is being promoted to another head while the partition
    /// lock is held.
    fn res_get(&self, nrq: &NrsRequest, parent: Option<&Resource>, moving: bool)
        -> ResourceStep;

    /// Take back a resource level obtained from `res_get`.
    fn res_put(&self, _res: Resource) {}

    /// Queue a request using the innermost resource this policy granted it.
    fn req_enqueue(&self, nrq: &Arc<NrsRequest>, res: &Resource) -> Result<()>;

    /// Next request to serve. With `peek` the policy must not change its state.
    fn req_poll(&self, peek: bool) -> Option<Arc<NrsRequest>>;

    /// Remove a queued request.
    fn req_dequeue(&self, nrq: &Arc<NrsRequest>, res: &Resource);

    fn req_start(&self, _nrq: &NrsRequest) {}

    fn req_stop(&self, _nrq: &NrsRequest) {}
}

/// Builds a policy instance for one head.
pub type PolicyFactory = Arc<dyn Fn(&PolicyContext) -> Arc<dyn Policy> + Send + Sync>;

/// A registered policy type.
#[derive(Clone)]
pub struct PolicyDescriptor {
    pub name: String,
    pub flags: PolicyFlags,
    pub compat: PolicyCompat,
    pub factory: PolicyFactory,
}

impl PolicyDescriptor {
    pub fn new(
        name: impl Into<String>,
        flags: PolicyFlags,
        compat: PolicyCompat,
        factory: impl Fn(&PolicyContext) -> Arc<dyn Policy> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            compat,
            factory: Arc::new(factory),
        }
    }

    /// Names are non-empty and shorter than [`POLICY_NAME_MAX`].
    pub fn validate_name(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() >= POLICY_NAME_MAX {
            return Err(NrsError::InvalidArgument(format!(
                "policy name {:?} must be 1..{} characters",
                self.name,
                POLICY_NAME_MAX - 1
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PolicyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDescriptor")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("compat", &self.compat)
            .finish_non_exhaustive()
    }
}
