//! Rule selectors: which clients a TBF rule applies to.
//!
//! In NID mode a selector is `*`, `*@net`, or an address pattern such as
//! `192.168.1.[2-10,20]@tcp` where each octet is `*`, a number or a bracketed list of numbers
//! and ranges. In job-id mode a selector is a job id with optional `*` wildcards.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::config::TbfClassifier;
use crate::error::{NrsError, Result};
use crate::request::{is_valid_net, normalize_net, Nid};

use super::client::ClientKey;

/// One octet of an address pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OctetPattern {
    Any,
    Ranges(SmallVec<[(u8, u8); 4]>),
}

impl OctetPattern {
    fn matches(&self, octet: u8) -> bool {
        match self {
            OctetPattern::Any => true,
            OctetPattern::Ranges(ranges) => ranges.iter().any(|&(lo, hi)| lo <= octet && octet <= hi),
        }
    }

    fn parse(text: &str) -> Option<OctetPattern> {
        if text == "*" {
            return Some(OctetPattern::Any);
        }
        let body = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .unwrap_or(text);
        if body.is_empty() {
            return None;
        }
        let mut ranges = SmallVec::new();
        for item in body.split(',') {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (lo.parse::<u8>().ok()?, hi.parse::<u8>().ok()?),
                None => {
                    let value = item.parse::<u8>().ok()?;
                    (value, value)
                }
            };
            if lo > hi {
                return None;
            }
            ranges.push((lo, hi));
        }
        Some(OctetPattern::Ranges(ranges))
    }
}

/// Pattern over network identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NidPattern {
    /// `*`
    Any,
    /// `*@net`
    AnyOnNet(String),
    Addr {
        octets: [OctetPattern; 4],
        net: String,
    },
}

impl NidPattern {
    pub fn matches(&self, nid: &Nid) -> bool {
        match self {
            NidPattern::Any => true,
            NidPattern::AnyOnNet(net) => *net == nid.net,
            NidPattern::Addr { octets, net } => {
                *net == nid.net
                    && octets
                        .iter()
                        .zip(nid.addr.octets())
                        .all(|(pattern, octet)| pattern.matches(octet))
            }
        }
    }
}

impl FromStr for NidPattern {
    type Err = NrsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || NrsError::InvalidArgument(format!("bad nid pattern {s:?}"));
        if s == "*" {
            return Ok(NidPattern::Any);
        }
        let (addr, net) = s.split_once('@').unwrap_or((s, "tcp"));
        if !is_valid_net(net) {
            return Err(invalid());
        }
        let net = normalize_net(net);
        if addr == "*" {
            return Ok(NidPattern::AnyOnNet(net));
        }

        let parts: SmallVec<[&str; 4]> = addr.split('.').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let parse = |i: usize| OctetPattern::parse(parts[i]).ok_or_else(invalid);
        Ok(NidPattern::Addr {
            octets: [parse(0)?, parse(1)?, parse(2)?, parse(3)?],
            net,
        })
    }
}

#[derive(Debug, Clone)]
enum Selector {
    Everything,
    Nid(NidPattern),
    JobId(glob::Pattern),
}

impl Selector {
    fn matches(&self, key: &ClientKey) -> bool {
        match (self, key) {
            (Selector::Everything, _) => true,
            (Selector::Nid(pattern), ClientKey::Nid(nid)) => pattern.matches(nid),
            (Selector::JobId(pattern), ClientKey::JobId(job)) => pattern.matches(job),
            _ => false,
        }
    }
}

/// Space separated selectors of one rule; matches when any selector does.
#[derive(Debug, Clone)]
pub struct SelectorList {
    selectors: Vec<Selector>,
    text: String,
}

impl SelectorList {
    /// Selector of the default rule.
    pub fn everything() -> Self {
        Self {
            selectors: vec![Selector::Everything],
            text: "*".to_owned(),
        }
    }

    pub fn parse(classifier: TbfClassifier, text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(NrsError::InvalidArgument("empty selector list".into()));
        }
        let selectors = tokens
            .iter()
            .map(|token| match classifier {
                TbfClassifier::Nid => token.parse::<NidPattern>().map(Selector::Nid),
                TbfClassifier::JobId => parse_job_pattern(token).map(Selector::JobId),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            selectors,
            text: tokens.join(" "),
        })
    }

    pub fn matches(&self, key: &ClientKey) -> bool {
        self.selectors.iter().any(|s| s.matches(key))
    }

    /// Normalized source text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for SelectorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

fn parse_job_pattern(token: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(token)
        .map_err(|e| NrsError::InvalidArgument(format!("bad job id pattern {token:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(s: &str) -> ClientKey {
        ClientKey::Nid(s.parse().unwrap())
    }

    #[test]
    fn wildcard_patterns() {
        let any: NidPattern = "*".parse().unwrap();
        assert!(any.matches(&"1.2.3.4@o2ib".parse().unwrap()));

        let tcp: NidPattern = "*@tcp".parse().unwrap();
        assert!(tcp.matches(&"1.2.3.4@tcp0".parse().unwrap()));
        assert!(!tcp.matches(&"1.2.3.4@o2ib".parse().unwrap()));
    }

    #[test]
    fn octet_ranges() {
        let pattern: NidPattern = "192.168.1.[2-10,20]@tcp".parse().unwrap();
        assert!(pattern.matches(&"192.168.1.2@tcp".parse().unwrap()));
        assert!(pattern.matches(&"192.168.1.10@tcp".parse().unwrap()));
        assert!(pattern.matches(&"192.168.1.20@tcp".parse().unwrap()));
        assert!(!pattern.matches(&"192.168.1.11@tcp".parse().unwrap()));
        assert!(!pattern.matches(&"192.168.2.2@tcp".parse().unwrap()));

        let star: NidPattern = "10.0.*.1".parse().unwrap();
        assert!(star.matches(&"10.0.77.1@tcp".parse().unwrap()));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["10.0.0", "10.0.0.256", "10.0.0.[5-2]", "10.0.0.[]", "10.0.0.1@", "a.b.c.d"] {
            assert!(bad.parse::<NidPattern>().is_err(), "{bad} accepted");
        }
        assert!(SelectorList::parse(TbfClassifier::Nid, "   ").is_err());
    }

    #[test]
    fn list_matches_any_member() {
        let list = SelectorList::parse(TbfClassifier::Nid, "10.0.0.1@tcp  10.0.0.2@tcp").unwrap();
        assert_eq!(list.text(), "10.0.0.1@tcp 10.0.0.2@tcp");
        assert!(list.matches(&nid("10.0.0.2@tcp")));
        assert!(!list.matches(&nid("10.0.0.3@tcp")));
        assert!(!list.matches(&ClientKey::JobId("10.0.0.1@tcp".into())));
    }

    #[test]
    fn job_id_globs() {
        let list = SelectorList::parse(TbfClassifier::JobId, "dd.* cp.1000").unwrap();
        assert!(list.matches(&ClientKey::JobId("dd.500".into())));
        assert!(list.matches(&ClientKey::JobId("cp.1000".into())));
        assert!(!list.matches(&ClientKey::JobId("cp.1001".into())));
    }

    #[test]
    fn everything_matches_both_kinds() {
        let all = SelectorList::everything();
        assert!(all.matches(&nid("1.1.1.1@tcp")));
        assert!(all.matches(&ClientKey::JobId(String::new())));
        assert_eq!(all.to_string(), "*");
    }
}
