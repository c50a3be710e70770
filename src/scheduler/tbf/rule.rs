//! TBF rules and the ordered rule list.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NrsError, Result};

use super::client::ClientKey;
use super::selector::SelectorList;

/// Name of the rule every TBF instance starts with. It matches everything and cannot be stopped.
pub const DEFAULT_RULE: &str = "default";

/// Rule names are at most this many characters.
pub const RULE_NAME_MAX: usize = 15;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Check a rule name: 1..=15 characters out of `[A-Za-z0-9_]`.
pub fn validate_rule_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > RULE_NAME_MAX {
        return Err(NrsError::InvalidArgument(format!(
            "rule name {name:?} must be 1..={RULE_NAME_MAX} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(NrsError::InvalidArgument(format!(
            "rule name {name:?} may only contain letters, digits and '_'"
        )));
    }
    Ok(())
}

/// A selector plus the rate/depth applied to the clients it matches.
#[derive(Debug)]
pub struct TbfRule {
    name: String,
    selectors: SelectorList,
    rate: AtomicU64,
    depth: u64,
    /// Bumped on every rate change so bound clients refresh lazily.
    generation: AtomicU64,
    bound_clients: AtomicU64,
    stopping: AtomicBool,
}

impl TbfRule {
    pub fn new(name: impl Into<String>, selectors: SelectorList, rate: u64, depth: u64) -> Self {
        Self {
            name: name.into(),
            selectors,
            rate: AtomicU64::new(rate.max(1)),
            depth,
            generation: AtomicU64::new(0),
            bound_clients: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selectors(&self) -> &SelectorList {
        &self.selectors
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    /// Nanoseconds between two tokens.
    pub fn nsecs_per_token(&self) -> u64 {
        NSEC_PER_SEC / self.rate()
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bound_clients(&self) -> u64 {
        self.bound_clients.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn matches(&self, key: &ClientKey) -> bool {
        !self.is_stopping() && self.selectors.matches(key)
    }

    pub(crate) fn set_rate(&self, rate: u64) {
        self.rate.store(rate.max(1), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn bind(&self) {
        self.bound_clients.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unbind(&self) {
        self.bound_clients.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            name: self.name.clone(),
            selectors: self.selectors.text().to_owned(),
            rate: self.rate(),
            refs: self.bound_clients(),
            stopping: self.is_stopping(),
        }
    }
}

/// Snapshot of one rule as reported by a rule dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub name: String,
    pub selectors: String,
    pub rate: u64,
    /// Clients currently bound to the rule.
    pub refs: u64,
    pub stopping: bool,
}

impl RuleInfo {
    /// Command that recreates this rule on a fresh instance.
    pub fn to_command(&self) -> String {
        format!("start {} {{{}}} {}", self.name, self.selectors, self.rate)
    }
}

impl fmt::Display for RuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{{}}} {}, ref {}, {}",
            self.name,
            self.selectors,
            self.rate,
            self.refs,
            if self.stopping { "stopping" } else { "active" }
        )
    }
}

/// Rules of one TBF instance, newest first. The default rule is always last.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Arc<TbfRule>>,
    default_rule: Arc<TbfRule>,
}

impl RuleSet {
    pub fn new(default_rate: u64, depth: u64) -> Self {
        let default_rule = Arc::new(TbfRule::new(
            DEFAULT_RULE,
            SelectorList::everything(),
            default_rate,
            depth,
        ));
        Self {
            rules: vec![Arc::clone(&default_rule)],
            default_rule,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<TbfRule>> {
        self.rules.iter().find(|r| r.name() == name && !r.is_stopping())
    }

    /// Newest rule matching `key`, or the default rule.
    pub fn matching(&self, key: &ClientKey) -> Arc<TbfRule> {
        self.rules
            .iter()
            .find(|r| r.matches(key))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_rule))
    }

    /// Link a new rule in front of the others.
    pub fn add(&mut self, rule: TbfRule) -> Result<Arc<TbfRule>> {
        if self.find(rule.name()).is_some() {
            return Err(NrsError::AlreadyExists(format!("rule {}", rule.name())));
        }
        let rule = Arc::new(rule);
        self.rules.insert(0, Arc::clone(&rule));
        Ok(rule)
    }

    pub fn change(&self, name: &str, rate: u64) -> Result<()> {
        let rule = self
            .find(name)
            .ok_or_else(|| NrsError::NotFound(format!("rule {name}")))?;
        rule.set_rate(rate);
        Ok(())
    }

    /// Unlink a rule. Clients still bound to it rebind the next time they are seen.
    pub fn stop(&mut self, name: &str) -> Result<Arc<TbfRule>> {
        if name == DEFAULT_RULE {
            return Err(NrsError::PermissionDenied(
                "the default rule cannot be stopped".into(),
            ));
        }
        let pos = self
            .rules
            .iter()
            .position(|r| r.name() == name && !r.is_stopping())
            .ok_or_else(|| NrsError::NotFound(format!("rule {name}")))?;
        let rule = self.rules.remove(pos);
        rule.mark_stopping();
        Ok(rule)
    }

    pub fn infos(&self) -> Vec<RuleInfo> {
        self.rules.iter().map(|r| r.info()).collect()
    }
}
