//! Network request scheduler for a partitioned RPC service.
//!
//! Every service partition owns one [`head::NrsHead`] per request queue. A head holds the
//! registered policy instances: a FIFO fallback that always accepts work and at most one
//! primary policy (for example the TBF rate limiter) that gets first refusal on every request.

pub mod clock;
pub mod config;
pub mod error;
pub mod head;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod request;
pub mod resource;
pub mod scheduler;
pub mod service;
pub mod threading;
pub mod timer;

pub use config::NrsConfig;
pub use error::{NrsError, Result};
pub use head::NrsHead;
pub use metrics::ServiceSnapshot;
pub use policy::{CtlOutput, NrsCtl, Policy, PolicyDescriptor, PolicyEnv, PolicyState};
pub use queue::{QueueSelector, QueueType};
pub use registry::PolicyRegistry;
pub use request::{Nid, NrsRequest, Request, RequestIdentity};
pub use service::{Service, ServicePartition};
