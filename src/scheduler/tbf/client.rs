//! TBF clients: one token bucket per classification key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::TbfClassifier;
use crate::request::{Nid, NrsRequest, RequestIdentity};

use super::heap::HeapKey;
use super::rule::TbfRule;

/// What a request is classified by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    Nid(Nid),
    JobId(String),
}

impl ClientKey {
    /// Requests without a job id share the empty job id in job-id mode.
    pub fn classify(classifier: TbfClassifier, identity: &RequestIdentity) -> ClientKey {
        match classifier {
            TbfClassifier::Nid => ClientKey::Nid(identity.nid.clone()),
            TbfClassifier::JobId => ClientKey::JobId(identity.job_id.clone().unwrap_or_default()),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::Nid(nid) => write!(f, "{nid}"),
            ClientKey::JobId(job) => write!(f, "job:{job}"),
        }
    }
}

/// Handle stored in the client table and in every request's client-level resource.
///
/// The client lives as long as some request holds it; its bucket sits in the policy's
/// scheduling state under the same id.
#[derive(Debug)]
pub struct TbfClient {
    pub key: ClientKey,
    pub id: u64,
}

/// Token bucket and backlog of one client. Only touched under the scheduling lock.
#[derive(Debug)]
pub(crate) struct ClientBucket {
    pub rule: Arc<TbfRule>,
    /// Rule-list sequence the binding was computed against.
    pub rule_sequence: u64,
    /// Rule generation the rate was copied from.
    pub rule_generation: u64,
    pub rate: u64,
    pub nsecs: u64,
    pub depth: u64,
    pub ntoken: u64,
    pub check_time: u64,
    /// Queued requests by arrival sequence.
    pub pending: BTreeMap<u64, Arc<NrsRequest>>,
}

impl ClientBucket {
    /// Bind a new bucket to `rule` with a full bucket.
    pub fn bind(rule: Arc<TbfRule>, sequence: u64, now: u64) -> Self {
        rule.bind();
        let mut bucket = Self {
            rule_generation: rule.generation(),
            rate: rule.rate(),
            nsecs: rule.nsecs_per_token(),
            depth: rule.depth(),
            ntoken: rule.depth(),
            check_time: now,
            rule,
            rule_sequence: sequence,
            pending: BTreeMap::new(),
        };
        bucket.reset(now);
        bucket
    }

    /// Move to another rule; tokens start over.
    pub fn rebind(&mut self, rule: Arc<TbfRule>, sequence: u64, now: u64) {
        self.rule.unbind();
        rule.bind();
        self.rule = rule;
        self.rule_sequence = sequence;
        self.reset(now);
    }

    fn reset(&mut self, now: u64) {
        self.rate = self.rule.rate();
        self.nsecs = self.rule.nsecs_per_token();
        self.depth = self.rule.depth();
        self.ntoken = self.depth;
        self.check_time = now;
        self.rule_generation = self.rule.generation();
    }

    /// Pick up a rate change of the bound rule, keeping accumulated tokens.
    pub fn refresh_rate(&mut self, now: u64) {
        self.refill(now);
        self.rate = self.rule.rate();
        self.nsecs = self.rule.nsecs_per_token();
        self.depth = self.rule.depth();
        self.ntoken = self.ntoken.min(self.depth);
        self.rule_generation = self.rule.generation();
    }

    /// Convert elapsed time into whole tokens. The unconverted remainder is kept by only
    /// advancing `check_time` by the time actually converted; a full bucket restarts at `now`.
    pub fn refill(&mut self, now: u64) {
        if now <= self.check_time {
            return;
        }
        if self.ntoken >= self.depth {
            self.check_time = now;
            return;
        }
        let earned = (now - self.check_time) / self.nsecs;
        if earned == 0 {
            return;
        }
        if self.ntoken + earned >= self.depth {
            self.ntoken = self.depth;
            self.check_time = now;
        } else {
            self.ntoken += earned;
            self.check_time += earned * self.nsecs;
        }
    }

    /// Time at which this client can next be served.
    pub fn next_token_time(&self) -> u64 {
        if self.ntoken > 0 {
            self.check_time
        } else {
            self.check_time + self.nsecs
        }
    }

    pub fn heap_key(&self, client: u64) -> HeapKey {
        HeapKey {
            next_token_ns: self.next_token_time(),
            check_time_ns: self.check_time,
            client,
        }
    }

    /// Give up the rule binding. Called once when the client is dropped.
    pub fn release(self) {
        self.rule.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tbf::selector::SelectorList;

    const MS: u64 = 1_000_000;

    fn rule(rate: u64) -> Arc<TbfRule> {
        Arc::new(TbfRule::new("r", SelectorList::everything(), rate, 3))
    }

    #[test]
    fn classification_follows_classifier() {
        let identity = RequestIdentity::with_job("10.0.0.1@tcp".parse().unwrap(), "dd.1");
        assert_eq!(
            ClientKey::classify(TbfClassifier::Nid, &identity).to_string(),
            "10.0.0.1@tcp"
        );
        assert_eq!(
            ClientKey::classify(TbfClassifier::JobId, &identity),
            ClientKey::JobId("dd.1".into())
        );
    }

    #[test]
    fn refill_keeps_remainder() {
        let mut bucket = ClientBucket::bind(rule(10), 0, 0);
        assert_eq!(bucket.ntoken, 3);
        bucket.ntoken = 0;
        bucket.check_time = 0;

        bucket.refill(150 * MS);
        assert_eq!(bucket.ntoken, 1);
        assert_eq!(bucket.check_time, 100 * MS);
        bucket.refill(250 * MS);
        assert_eq!(bucket.ntoken, 2);
        assert_eq!(bucket.check_time, 200 * MS);
        bucket.refill(10_000 * MS);
        assert_eq!(bucket.ntoken, 3);
        assert_eq!(bucket.check_time, 10_000 * MS);
    }

    #[test]
    fn next_token_time_depends_on_stored_tokens() {
        let mut bucket = ClientBucket::bind(rule(10), 0, 5 * MS);
        assert_eq!(bucket.next_token_time(), 5 * MS);
        bucket.ntoken = 0;
        assert_eq!(bucket.next_token_time(), 105 * MS);
    }

    #[test]
    fn binding_tracks_rule_refs() {
        let a = rule(10);
        let b = rule(20);
        let mut bucket = ClientBucket::bind(Arc::clone(&a), 0, 0);
        assert_eq!(a.bound_clients(), 1);
        bucket.ntoken = 0;
        bucket.rebind(Arc::clone(&b), 1, 0);
        assert_eq!(a.bound_clients(), 0);
        assert_eq!(b.bound_clients(), 1);
        assert_eq!(bucket.ntoken, 3);
        assert_eq!(bucket.rate, 20);
        bucket.release();
        assert_eq!(b.bound_clients(), 0);
    }

    #[test]
    fn rate_refresh_keeps_tokens() {
        let r = rule(10);
        let mut bucket = ClientBucket::bind(Arc::clone(&r), 0, 0);
        bucket.ntoken = 1;
        r.set_rate(100);
        bucket.refresh_rate(0);
        assert_eq!(bucket.ntoken, 1);
        assert_eq!(bucket.rate, 100);
        assert_eq!(bucket.nsecs, 10 * MS);
        assert_eq!(bucket.rule_generation, r.generation());
    }
}
