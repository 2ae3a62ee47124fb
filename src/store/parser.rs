//! Decoding of script replies.
//!
//! Scripts answer loosely typed Redis values. Every parser here degrades to
//! a zero-effect default (nothing added, nothing removed, nothing claimed)
//! when the reply has an unexpected shape, logs a warning and counts the
//! event, so one malformed reply never takes the scheduler loop down.

use redis::Value;
use tracing::warn;

use crate::metrics::MetricsCollector;

use super::{ClaimedAgent, RemovalResult, RescheduleOutcome, Score};

/// Renders a scalar reply as text.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Okay => Some("OK".to_string()),
        Value::Nil | Value::Bulk(_) => None,
    }
}

/// Reads a scalar reply as an integer. Fractional scores are floored.
pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Data(_) | Value::Status(_) => {
            let text = value_to_string(value)?;
            let text = text.trim();
            if let Ok(i) = text.parse::<i64>() {
                return Some(i);
            }
            text.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f.floor() as i64)
        }
        _ => None,
    }
}

fn malformed(script: &str, reason: &str, value: &Value) {
    warn!(
        script = script,
        reason = reason,
        reply = ?value,
        "Unexpected script result shape; treating as no-op"
    );
    MetricsCollector::new().record_script_parse_error(script);
}

/// Parses a `{count, members}` reply.
///
/// When the count and the member list disagree the member list wins, since
/// it names what actually changed.
pub fn parse_counted_members(script: &str, value: &Value) -> (usize, Vec<String>) {
    let Value::Bulk(items) = value else {
        malformed(script, "expected a two-element list", value);
        return (0, Vec::new());
    };
    if items.len() != 2 {
        malformed(script, "expected a two-element list", value);
        return (0, Vec::new());
    }

    let Some(count) = value_to_i64(&items[0]).filter(|c| *c >= 0) else {
        malformed(script, "count is not a non-negative integer", value);
        return (0, Vec::new());
    };

    let members: Vec<String> = match &items[1] {
        Value::Bulk(members) => members.iter().filter_map(value_to_string).collect(),
        // An empty Lua table may come back as nil on some servers.
        Value::Nil => Vec::new(),
        _ => {
            malformed(script, "member list is not a list", value);
            return (0, Vec::new());
        }
    };

    let count = count as usize;
    if count != members.len() {
        warn!(
            script = script,
            count = count,
            members = members.len(),
            "Script count disagrees with member list; using member list"
        );
        return (members.len(), members);
    }
    (count, members)
}

/// Parses the reply of the add-agents script into the number inserted.
pub fn parse_add_agents_count(value: &Value) -> usize {
    parse_counted_members("addAgents", value).0
}

/// Parses the reply of the conditional removal script.
pub fn parse_remove_agents_conditional(value: &Value) -> RemovalResult {
    let (removed_count, removed) = parse_counted_members("removeAgentsConditional", value);
    RemovalResult {
        removed_count,
        removed,
    }
}

/// Parses the reply of the orphan restore script.
pub fn parse_restored_orphans(value: &Value) -> Vec<String> {
    parse_counted_members("restoreOrphans", value).1
}

/// Parses the flat `[agent, score, ...]` reply of the claim script.
///
/// A malformed reply yields no claims; the affected members are no longer
/// pending but stay registered and unleased, so orphan recovery returns them
/// to the queue.
pub fn parse_claimed(value: &Value) -> Vec<ClaimedAgent> {
    let items = match value {
        Value::Bulk(items) => items,
        Value::Nil => return Vec::new(),
        _ => {
            malformed("claimDue", "expected a list", value);
            return Vec::new();
        }
    };
    if items.len() % 2 != 0 {
        malformed("claimDue", "odd number of elements", value);
        return Vec::new();
    }

    let mut claimed = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        let key = value_to_string(&pair[0]);
        let score: Option<Score> = value_to_i64(&pair[1]);
        match (key, score) {
            (Some(key), Some(score)) => claimed.push(ClaimedAgent { key, score }),
            _ => {
                malformed("claimDue", "unreadable member or score", value);
                return Vec::new();
            }
        }
    }
    claimed
}

/// Parses the reply of the ownership-checked reschedule script.
///
/// Unknown replies are read as `NotOwner`, the outcome that changes nothing.
pub fn parse_reschedule_outcome(value: &Value) -> RescheduleOutcome {
    match value_to_string(value)
        .as_deref()
        .and_then(RescheduleOutcome::parse)
    {
        Some(outcome) => outcome,
        None => {
            malformed("rescheduleOwned", "unknown outcome", value);
            RescheduleOutcome::NotOwner
        }
    }
}

/// Parses a 1/0 flag reply; anything else counts as 0.
pub fn parse_flag(script: &str, value: &Value) -> bool {
    match value_to_i64(value) {
        Some(n) => n > 0,
        None => {
            malformed(script, "expected an integer flag", value);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_add_agents_count() {
        let reply = Value::Bulk(vec![
            Value::Int(2),
            Value::Bulk(vec![data("a"), data("b")]),
        ]);
        assert_eq!(parse_add_agents_count(&reply), 2);
    }

    #[test]
    fn test_add_agents_count_malformed() {
        assert_eq!(parse_add_agents_count(&Value::Int(3)), 0);
        assert_eq!(parse_add_agents_count(&Value::Nil), 0);
        assert_eq!(parse_add_agents_count(&Value::Bulk(vec![Value::Int(1)])), 0);
    }

    #[test]
    fn test_remove_conditional_result() {
        let reply = Value::Bulk(vec![
            Value::Int(2),
            Value::Bulk(vec![data("A"), data("C")]),
        ]);
        let result = parse_remove_agents_conditional(&reply);
        assert_eq!(result.removed_count, 2);
        assert_eq!(result.removed, vec!["A".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_remove_conditional_scalar_reply() {
        let result = parse_remove_agents_conditional(&Value::Int(7));
        assert_eq!(result.removed_count, 0);
        assert!(result.removed.is_empty());

        let result = parse_remove_agents_conditional(&data("OK"));
        assert_eq!(result, RemovalResult::default());
    }

    #[test]
    fn test_remove_conditional_count_disagreement() {
        let reply = Value::Bulk(vec![Value::Int(5), Value::Bulk(vec![data("A")])]);
        let result = parse_remove_agents_conditional(&reply);
        assert_eq!(result.removed_count, 1);
        assert_eq!(result.removed, vec!["A".to_string()]);
    }

    #[test]
    fn test_remove_conditional_empty_member_table() {
        let reply = Value::Bulk(vec![Value::Int(0), Value::Nil]);
        assert_eq!(parse_remove_agents_conditional(&reply), RemovalResult::default());
    }

    #[test]
    fn test_parse_claimed() {
        let reply = Value::Bulk(vec![data("job-1"), data("100"), data("job-2"), data("101.0")]);
        let claimed = parse_claimed(&reply);
        assert_eq!(
            claimed,
            vec![
                ClaimedAgent {
                    key: "job-1".to_string(),
                    score: 100
                },
                ClaimedAgent {
                    key: "job-2".to_string(),
                    score: 101
                },
            ]
        );
    }

    #[test]
    fn test_parse_claimed_malformed() {
        assert!(parse_claimed(&Value::Bulk(vec![data("job-1")])).is_empty());
        assert!(parse_claimed(&Value::Int(1)).is_empty());
        assert!(parse_claimed(&Value::Bulk(vec![data("job-1"), data("soon")])).is_empty());
        assert!(parse_claimed(&Value::Nil).is_empty());
    }

    #[test]
    fn test_parse_reschedule_outcome() {
        assert_eq!(
            parse_reschedule_outcome(&data("rescheduled")),
            RescheduleOutcome::Rescheduled
        );
        assert_eq!(
            parse_reschedule_outcome(&Value::Status("requeued".to_string())),
            RescheduleOutcome::Requeued
        );
        assert_eq!(
            parse_reschedule_outcome(&Value::Int(1)),
            RescheduleOutcome::NotOwner
        );
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("claimLease", &Value::Int(1)));
        assert!(!parse_flag("claimLease", &Value::Int(0)));
        assert!(!parse_flag("claimLease", &Value::Nil));
    }

    #[test]
    fn test_value_to_i64_floors_fractional_scores() {
        assert_eq!(value_to_i64(&data("42.9")), Some(42));
        assert_eq!(value_to_i64(&data("-1.5")), Some(-2));
        assert_eq!(value_to_i64(&data("nope")), None);
        assert_eq!(value_to_i64(&Value::Nil), None);
    }
}
