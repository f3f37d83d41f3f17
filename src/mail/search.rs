//! Build an IMAP `SEARCH` query from configured filter conditions.
//!
//! Unknown condition types and unusable values are skipped with a warning so a
//! partially valid filter still polls.

use chrono::NaiveDate;
use serde_yaml::Value;
use tracing::warn;

use crate::config::SearchCondition;

/// Conditions are ANDed; an empty list (or one where nothing survived) is `ALL`.
pub fn build_query(conditions: &[SearchCondition]) -> String {
    let terms: Vec<String> = conditions.iter().filter_map(term).collect();
    if terms.is_empty() {
        "ALL".to_string()
    } else {
        terms.join(" ")
    }
}

fn term(condition: &SearchCondition) -> Option<String> {
    let kind = condition.kind.to_uppercase();
    let value = condition.value.as_ref();
    let term = match kind.as_str() {
        "ALL" => Some("ALL".to_string()),
        "NEW" | "RECENT" | "SEEN" | "UNSEEN" => Some(kind.clone()),
        "SUBJECT" | "BODY" | "FROM" | "TO" => {
            text(value).map(|v| format!("{kind} {}", quote(&v)))
        }
        "BEFORE_DATE" => date(value).map(|d| format!("BEFORE {d}")),
        "ON_DATE" => date(value).map(|d| format!("ON {d}")),
        "SINCE_DATE" => date(value).map(|d| format!("SINCE {d}")),
        "SID_LIST" => id_set(value),
        "UID_LIST" => id_set(value).map(|set| format!("UID {set}")),
        _ => {
            warn!(condition = %condition.kind, "Unknown search condition type, ignoring");
            return None;
        }
    };
    if term.is_none() {
        warn!(condition = %condition.kind, "Search condition has no usable value, ignoring");
    }
    term
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `2024-01-15` (or `2024/01/15`) as an IMAP date: `15-Jan-2024`.
fn date(value: Option<&Value>) -> Option<String> {
    let raw = text(value)?;
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .ok()
        .map(|d| d.format("%d-%b-%Y").to_string())
}

/// Sequence set from `[{range: [1]}, {range: [5, 10]}]` or plain numbers.
fn id_set(value: Option<&Value>) -> Option<String> {
    let entries = value?.as_sequence()?;
    let parts: Vec<String> = entries
        .iter()
        .filter_map(|entry| {
            let range = entry.get("range").unwrap_or(entry);
            match range {
                Value::Number(n) => n.as_u64().map(|n| n.to_string()),
                Value::Sequence(ids) => {
                    let ids: Vec<u64> = ids.iter().filter_map(Value::as_u64).collect();
                    match ids.as_slice() {
                        [single] => Some(single.to_string()),
                        [start, end] => Some(format!("{start}:{end}")),
                        _ => None,
                    }
                }
                _ => None,
            }
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(yaml: &str) -> Vec<SearchCondition> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_filter_matches_all() {
        assert_eq!(build_query(&[]), "ALL");
    }

    #[test]
    fn flags_and_text() {
        let query = build_query(&conditions(
            r#"
- type: UNSEEN
- type: SUBJECT
  value: "job \"nightly\""
- type: FROM
  value: ops@example.com
"#,
        ));
        assert_eq!(
            query,
            r#"UNSEEN SUBJECT "job \"nightly\"" FROM "ops@example.com""#
        );
    }

    #[test]
    fn dates_use_imap_format() {
        let query = build_query(&conditions(
            "- {type: SINCE_DATE, value: 2024-01-05}\n- {type: BEFORE_DATE, value: 2024/02/10}",
        ));
        assert_eq!(query, "SINCE 05-Jan-2024 BEFORE 10-Feb-2024");
    }

    #[test]
    fn id_lists() {
        let query = build_query(&conditions(
            "- type: UID_LIST\n  value:\n    - range: [3]\n    - range: [10, 20]\n- type: SID_LIST\n  value: [7]",
        ));
        assert_eq!(query, "UID 3,10:20 7");
    }

    #[test]
    fn unknown_and_incomplete_conditions_are_skipped() {
        let query = build_query(&conditions(
            "- type: FLAGGED\n- type: SUBJECT\n- type: ON_DATE\n  value: yesterday\n- type: SEEN",
        ));
        assert_eq!(query, "SEEN");
    }
}
