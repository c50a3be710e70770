//! Text commands for managing TBF rules.
//!
//! ```text
//! [reg|hp] start <name> {<selector> ...} [<rate>]
//! [reg|hp] change <name> <rate>
//! [reg|hp] stop <name>
//! ```

use crate::config::TBF_RATE_CEILING;
use crate::error::{NrsError, Result};
use crate::queue::QueueSelector;

use super::rule::validate_rule_name;

/// One rule mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCommand {
    /// `rate` falls back to the instance's default rate when absent.
    Start {
        name: String,
        selectors: String,
        rate: Option<u64>,
    },
    Change {
        name: String,
        rate: u64,
    },
    Stop {
        name: String,
    },
}

impl RuleCommand {
    pub fn name(&self) -> &str {
        match self {
            RuleCommand::Start { name, .. }
            | RuleCommand::Change { name, .. }
            | RuleCommand::Stop { name } => name,
        }
    }
}

/// A parsed command line: target queue(s) plus the rule mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TbfCommand {
    pub queue: QueueSelector,
    pub rule: RuleCommand,
}

impl TbfCommand {
    /// Parse with the standard rate ceiling.
    pub fn parse(text: &str) -> Result<TbfCommand> {
        Self::parse_with_ceiling(text, TBF_RATE_CEILING)
    }

    /// Parse a command; rates must lie in `1..rate_ceiling`.
    pub fn parse_with_ceiling(text: &str, rate_ceiling: u64) -> Result<TbfCommand> {
        let invalid = |why: &str| NrsError::InvalidArgument(format!("{why}: {:?}", text.trim()));

        let mut rest = text.trim();
        let mut queue = QueueSelector::Both;
        if let Some((first, tail)) = split_token(rest) {
            if let Some(selected) = QueueSelector::from_token(first) {
                queue = selected;
                rest = tail;
            }
        }

        let (op, tail) = split_token(rest).ok_or_else(|| invalid("missing command"))?;
        let (name, tail) = split_token(tail).ok_or_else(|| invalid("missing rule name"))?;
        validate_rule_name(name)?;
        let name = name.to_owned();

        let rule = match op {
            "start" => {
                let body = tail
                    .trim_start()
                    .strip_prefix('{')
                    .ok_or_else(|| invalid("start needs a {selector} list"))?;
                let (selectors, after) = body
                    .split_once('}')
                    .ok_or_else(|| invalid("unterminated selector list"))?;
                let selectors = selectors.split_whitespace().collect::<Vec<_>>().join(" ");
                if selectors.is_empty() {
                    return Err(invalid("empty selector list"));
                }
                let rate = match after.trim() {
                    "" => None,
                    rate => Some(parse_rate(rate, rate_ceiling)?),
                };
                RuleCommand::Start {
                    name,
                    selectors,
                    rate,
                }
            }
            "change" => {
                let rate = tail.trim();
                if rate.is_empty() {
                    return Err(invalid("change needs a rate"));
                }
                RuleCommand::Change {
                    name,
                    rate: parse_rate(rate, rate_ceiling)?,
                }
            }
            "stop" => {
                if !tail.trim().is_empty() {
                    return Err(invalid("stop takes only a rule name"));
                }
                RuleCommand::Stop { name }
            }
            _ => return Err(invalid("unknown command")),
        };
        Ok(TbfCommand { queue, rule })
    }
}

/// First whitespace separated token and the remainder.
fn split_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(end) => Some((&text[..end], &text[end..])),
        None => Some((text, "")),
    }
}

fn parse_rate(text: &str, ceiling: u64) -> Result<u64> {
    let rate: u64 = text
        .parse()
        .map_err(|_| NrsError::InvalidArgument(format!("bad rate {text:?}")))?;
    if rate == 0 || rate >= ceiling {
        return Err(NrsError::InvalidArgument(format!(
            "rate {rate} must be in 1..{ceiling}"
        )));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_and_without_rate() {
        let cmd = TbfCommand::parse("start a {10.0.0.1@tcp 10.0.0.2@tcp} 50").unwrap();
        assert_eq!(cmd.queue, QueueSelector::Both);
        assert_eq!(
            cmd.rule,
            RuleCommand::Start {
                name: "a".into(),
                selectors: "10.0.0.1@tcp 10.0.0.2@tcp".into(),
                rate: Some(50),
            }
        );

        let cmd = TbfCommand::parse("hp start b {*@o2ib}").unwrap();
        assert_eq!(cmd.queue, QueueSelector::HighPriority);
        assert!(matches!(cmd.rule, RuleCommand::Start { rate: None, .. }));
    }

    #[test]
    fn parses_change_and_stop() {
        let cmd = TbfCommand::parse("reg change a 7").unwrap();
        assert_eq!(cmd.queue, QueueSelector::Regular);
        assert_eq!(
            cmd.rule,
            RuleCommand::Change {
                name: "a".into(),
                rate: 7
            }
        );
        let cmd = TbfCommand::parse("stop a").unwrap();
        assert_eq!(cmd.rule, RuleCommand::Stop { name: "a".into() });
        assert_eq!(cmd.rule.name(), "a");
    }

    #[test]
    fn rejects_malformed_commands() {
        for bad in [
            "",
            "reg",
            "start",
            "start a",
            "start a 10",
            "start a {} 10",
            "start a {10.0.0.1@tcp 10",
            "start a {10.0.0.1@tcp} 0",
            "start a {10.0.0.1@tcp} 65535",
            "start a {10.0.0.1@tcp} fast",
            "start bad-name {*} 10",
            "start a234567890123456 {*} 10",
            "change a",
            "change a -1",
            "stop a 10",
            "pause a",
        ] {
            let err = TbfCommand::parse(bad).unwrap_err();
            assert_eq!(err.errno(), -libc::EINVAL, "{bad:?} accepted");
        }
    }

    #[test]
    fn ceiling_is_configurable() {
        assert!(TbfCommand::parse_with_ceiling("change a 100", 100).is_err());
        assert!(TbfCommand::parse_with_ceiling("change a 99", 100).is_ok());
    }
}
