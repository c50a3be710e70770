//! Built-in scheduling policies.
//!
//! - [`fifo`]: arrival order, the fallback of every head.
//! - [`tbf`]: per-client token bucket rate limiting.

pub mod fifo;
pub mod tbf;

use std::sync::Arc;

use crate::policy::{Policy, PolicyCompat, PolicyDescriptor, PolicyFlags};

pub use fifo::FifoPolicy;
pub use tbf::TbfPolicy;

/// Name of the fallback policy type.
pub const FIFO_POLICY: &str = "fifo";
/// Name of the token bucket filter policy type.
pub const TBF_POLICY: &str = "tbf";

/// FIFO: fallback on every head, started as soon as it is registered.
pub fn fifo_descriptor() -> PolicyDescriptor {
    PolicyDescriptor::new(
        FIFO_POLICY,
        PolicyFlags::FALLBACK | PolicyFlags::REG_START,
        PolicyCompat::All,
        |_ctx| Arc::new(FifoPolicy::new(FIFO_POLICY)) as Arc<dyn Policy>,
    )
}

/// TBF: registered stopped on every head; administrators start it.
pub fn tbf_descriptor() -> PolicyDescriptor {
    PolicyDescriptor::new(
        TBF_POLICY,
        PolicyFlags::NONE,
        PolicyCompat::All,
        |_ctx| Arc::new(TbfPolicy::new(TBF_POLICY)) as Arc<dyn Policy>,
    )
}

/// Descriptors registered when a registry is created.
pub fn builtin_descriptors() -> Vec<PolicyDescriptor> {
    vec![fifo_descriptor(), tbf_descriptor()]
}
