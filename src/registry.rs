//! Process-wide catalogue of policy types.
//!
//! The registry owns every [`PolicyDescriptor`] and knows every live NRS head. Registering a
//! type instantiates it on each compatible head; attaching a head instantiates every compatible
//! type on it. Both operations are all-or-nothing.
//!
//! Lock order: registry, then head.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{NrsError, Result};
use crate::head::NrsHead;
use crate::policy::{PolicyDescriptor, PolicyFlags};
use crate::scheduler::builtin_descriptors;

struct RegistryCore {
    descriptors: Vec<PolicyDescriptor>,
    heads: Vec<Weak<NrsHead>>,
}

impl RegistryCore {
    fn find(&self, name: &str) -> Option<&PolicyDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    fn live_heads(&mut self) -> Vec<Arc<NrsHead>> {
        self.heads.retain(|h| h.strong_count() > 0);
        self.heads.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Registered policy types and the heads they are instantiated on.
pub struct PolicyRegistry {
    core: Mutex<RegistryCore>,
}

impl PolicyRegistry {
    /// Registry holding the built-in FIFO and TBF types.
    pub fn new() -> Self {
        Self::with_descriptors(builtin_descriptors())
    }

    /// Registry holding exactly `descriptors`.
    pub fn with_descriptors(descriptors: Vec<PolicyDescriptor>) -> Self {
        Self {
            core: Mutex::new(RegistryCore {
                descriptors,
                heads: Vec::new(),
            }),
        }
    }

    /// Names of the registered types, in registration order.
    pub fn policy_names(&self) -> Vec<String> {
        self.core
            .lock()
            .descriptors
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.core.lock().find(name).is_some()
    }

    /// Heads currently attached.
    pub fn head_count(&self) -> usize {
        self.core.lock().live_heads().len()
    }

    /// Instantiate every compatible type on a new head.
    ///
    /// On failure the instances already created on the head are unregistered again.
    pub fn attach_head(&self, head: &Arc<NrsHead>) -> Result<()> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let mut registered: Vec<&str> = Vec::new();
        for desc in &core.descriptors {
            if !desc.compat.matches(head.info()) {
                continue;
            }
            if let Err(err) = head.register_policy(desc) {
                error!(head = %head.info(), policy = %desc.name, %err, "failed to set up policy");
                for name in registered.iter().rev() {
                    if let Err(undo) = head.unregister_policy(name) {
                        warn!(head = %head.info(), policy = name, %undo, "failed to undo policy setup");
                    }
                }
                return Err(err);
            }
            registered.push(&desc.name);
        }
        for desc in &core.descriptors {
            if desc.flags.contains(PolicyFlags::REG_EXTERN) {
                head.make_available(&desc.name);
            }
        }
        core.heads.push(Arc::downgrade(head));
        debug!(head = %head.info(), policies = registered.len(), "head attached");
        Ok(())
    }

    /// Forget a head. Its policy instances are left to the caller.
    pub fn detach_head(&self, head: &Arc<NrsHead>) {
        let target = Arc::downgrade(head);
        self.core
            .lock()
            .heads
            .retain(|h| h.strong_count() > 0 && !h.ptr_eq(&target));
    }

    /// Register an external policy type and instantiate it on every compatible head.
    ///
    /// External types may not claim the fallback role or start on registration. The instances
    /// are created unavailable and promoted once every head has one.
    pub fn register(&self, desc: PolicyDescriptor) -> Result<()> {
        desc.validate_name()?;
        if desc
            .flags
            .intersects(PolicyFlags::FALLBACK | PolicyFlags::REG_START)
        {
            error!(policy = %desc.name, flags = desc.flags.bits(), "invalid flags for external policy");
            return Err(NrsError::InvalidArgument(format!(
                "policy {} may not be registered with fallback or start flags",
                desc.name
            )));
        }

        let mut core = self.core.lock();
        if core.find(&desc.name).is_some() {
            error!(policy = %desc.name, "policy type already registered");
            return Err(NrsError::AlreadyExists(desc.name));
        }

        let desc = PolicyDescriptor {
            flags: desc.flags | PolicyFlags::REG_EXTERN,
            ..desc
        };
        let heads: Vec<Arc<NrsHead>> = core
            .live_heads()
            .into_iter()
            .filter(|h| desc.compat.matches(h.info()))
            .collect();

        for (done, head) in heads.iter().enumerate() {
            if let Err(err) = head.register_policy(&desc) {
                error!(head = %head.info(), policy = %desc.name, %err, "failed to register policy");
                for undo in heads[..done].iter().rev() {
                    if let Err(undo_err) = undo.unregister_policy(&desc.name) {
                        warn!(head = %undo.info(), policy = %desc.name, %undo_err, "rollback failed");
                    }
                }
                return Err(err);
            }
        }
        for head in &heads {
            head.make_available(&desc.name);
        }

        info!(policy = %desc.name, heads = heads.len(), "policy type registered");
        core.descriptors.push(desc);
        Ok(())
    }

    /// Remove a policy type from every head and from the registry.
    ///
    /// Fails without removing anything if any instance is still referenced: every head is
    /// checked first, and instances already removed are recreated if a head turns busy
    /// meanwhile.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut core = self.core.lock();
        let Some(desc) = core.find(name) else {
            error!(policy = name, "unregistering unknown policy type");
            return Err(NrsError::NotFound(format!("policy type {name}")));
        };
        if desc.flags.contains(PolicyFlags::FALLBACK) {
            error!(policy = name, "cannot unregister a fallback policy type");
            return Err(NrsError::PermissionDenied(format!(
                "{name} is a fallback policy type"
            )));
        }

        let desc = desc.clone();
        let heads = core.live_heads();
        for head in &heads {
            match head.check_unregister(name) {
                Ok(()) | Err(NrsError::NoDevice(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let mut removed: Vec<&Arc<NrsHead>> = Vec::with_capacity(heads.len());
        for head in &heads {
            match head.unregister_policy(name) {
                Ok(()) => removed.push(head),
                Err(NrsError::NoDevice(_)) => {}
                Err(err) => {
                    error!(head = %head.info(), policy = name, %err, "failed to unregister policy");
                    for undo in removed.iter().rev() {
                        match undo.register_policy(&desc) {
                            Ok(()) => undo.make_available(name),
                            Err(undo_err) => {
                                warn!(head = %undo.info(), policy = name, %undo_err, "rollback failed");
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }

        core.descriptors.retain(|d| d.name != name);
        info!(policy = name, "policy type unregistered");
        Ok(())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
