//! Post-processing pipeline applied after locator evaluation.
//!
//! Steps are pure and total: a step that cannot apply (wrong input shape,
//! invalid pattern) logs a warning and passes the value through unchanged,
//! so later steps always see the pre-failure value.

use serde_json::Value as Json;
use tracing::warn;

use super::Value;

/// A single post-processing step, parsed from `{"method": ..., "params": {...}}`.
///
/// The method set is closed; an unrecognized method is kept as [`PostProcessStep::Unknown`]
/// and skipped (with a warning) at apply time.
#[derive(Debug, Clone, PartialEq)]
pub enum PostProcessStep {
    Strip { chars: Option<String> },
    Replace { old: String, new: String },
    RegexReplace { pattern: String, repl: String },
    Join { separator: String },
    Split { separator: String },
    ExtractFirst,
    ExtractIndex { index: usize },
    Unknown { method: String },
}

impl PostProcessStep {
    /// Parse a step from its JSON form. Returns `None` if the value is not
    /// an object carrying a `method` field.
    pub fn from_json(value: &Json) -> Option<Self> {
        let method = value.get("method")?.as_str()?;
        let params = value.get("params").cloned().unwrap_or(Json::Null);
        let str_param = |name: &str| -> Option<String> {
            params.get(name).and_then(scalar_to_string)
        };

        let step = match method {
            "strip" => Self::Strip {
                chars: str_param("chars"),
            },
            "replace" => Self::Replace {
                old: str_param("old").unwrap_or_default(),
                new: str_param("new").unwrap_or_default(),
            },
            "regex_replace" => Self::RegexReplace {
                pattern: str_param("pattern").unwrap_or_default(),
                repl: str_param("repl").unwrap_or_default(),
            },
            "join" => Self::Join {
                separator: str_param("separator").unwrap_or_default(),
            },
            "split" => Self::Split {
                separator: str_param("separator").unwrap_or_else(|| " ".to_string()),
            },
            "extract_first" => Self::ExtractFirst,
            "extract_index" => Self::ExtractIndex {
                index: params
                    .get("index")
                    .and_then(Json::as_u64)
                    .unwrap_or(0) as usize,
            },
            other => Self::Unknown {
                method: other.to_string(),
            },
        };
        Some(step)
    }

    fn method_name(&self) -> &str {
        match self {
            Self::Strip { .. } => "strip",
            Self::Replace { .. } => "replace",
            Self::RegexReplace { .. } => "regex_replace",
            Self::Join { .. } => "join",
            Self::Split { .. } => "split",
            Self::ExtractFirst => "extract_first",
            Self::ExtractIndex { .. } => "extract_index",
            Self::Unknown { method } => method,
        }
    }
}

fn scalar_to_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Per-step record produced in trace mode, surfaced by the probe endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepTrace {
    pub step: usize,
    pub method: String,
    pub before: String,
    pub after: String,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Run all steps in order.
pub fn apply(mut value: Value, steps: &[PostProcessStep]) -> Value {
    for step in steps {
        value = apply_step(value, step).0;
    }
    value
}

/// Run all steps in order, recording a before/after trace per step.
pub fn apply_traced(mut value: Value, steps: &[PostProcessStep]) -> (Value, Vec<StepTrace>) {
    let mut traces = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let before = preview(&value);
        let (next, note) = apply_step(value, step);
        let after = preview(&next);
        traces.push(StepTrace {
            step: i + 1,
            method: step.method_name().to_string(),
            changed: before != after,
            before,
            after,
            note,
        });
        value = next;
    }
    (value, traces)
}

fn apply_step(value: Value, step: &PostProcessStep) -> (Value, Option<String>) {
    match step {
        PostProcessStep::Strip { chars } => (map_strings(value, |s| strip(&s, chars.as_deref())), None),

        PostProcessStep::Replace { old, new } => match value {
            Value::Str(s) => {
                let (out, note) = replace_smart(&s, old, new);
                (Value::Str(out), note)
            }
            Value::List(items) => (
                Value::List(items.into_iter().map(|s| s.replace(old.as_str(), new)).collect()),
                None,
            ),
            Value::Null => (Value::Null, None),
        },

        PostProcessStep::RegexReplace { pattern, repl } => match regex::Regex::new(pattern) {
            Ok(re) => (
                map_strings(value, |s| re.replace_all(&s, repl.as_str()).into_owned()),
                None,
            ),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "skipping regex_replace step with invalid pattern");
                (value, Some(format!("invalid pattern: {e}")))
            }
        },

        PostProcessStep::Join { separator } => match value {
            Value::List(items) => (Value::Str(items.join(separator)), None),
            other => (other, None),
        },

        PostProcessStep::Split { separator } => match value {
            Value::Str(s) => {
                if separator.is_empty() {
                    warn!("skipping split step with empty separator");
                    (Value::Str(s), Some("empty separator".to_string()))
                } else {
                    (
                        Value::List(s.split(separator.as_str()).map(str::to_string).collect()),
                        None,
                    )
                }
            }
            other => (other, None),
        },

        PostProcessStep::ExtractFirst => match value {
            Value::List(items) if !items.is_empty() => {
                (Value::Str(items.into_iter().next().unwrap_or_default()), None)
            }
            other => (other, None),
        },

        PostProcessStep::ExtractIndex { index } => match value {
            Value::List(mut items) if items.len() > *index => {
                (Value::Str(items.swap_remove(*index)), None)
            }
            other => (other, None),
        },

        PostProcessStep::Unknown { method } => {
            warn!(method = %method, "skipping unknown post-process step");
            (value, Some("unknown method".to_string()))
        }
    }
}

fn map_strings(value: Value, f: impl Fn(String) -> String) -> Value {
    match value {
        Value::Str(s) => Value::Str(f(s)),
        Value::List(items) => Value::List(items.into_iter().map(f).collect()),
        Value::Null => Value::Null,
    }
}

fn strip(s: &str, chars: Option<&str>) -> String {
    match chars {
        Some(set) => s.trim_matches(|c: char| set.contains(c)).to_string(),
        None => s.trim().to_string(),
    }
}

/// Literal replacement with a non-breaking-space fallback: when `old` does
/// not occur verbatim, both sides are normalized (U+00A0 to ordinary space)
/// and the replacement is retried against the normalized text.
fn replace_smart(s: &str, old: &str, new: &str) -> (String, Option<String>) {
    if old.is_empty() {
        return (s.to_string(), None);
    }
    if s.contains(old) {
        return (s.replace(old, new), None);
    }
    let normalized = s.replace('\u{a0}', " ");
    let normalized_old = old.replace('\u{a0}', " ");
    if !normalized_old.is_empty() && normalized.contains(&normalized_old) {
        return (
            normalized.replace(&normalized_old, new),
            Some("matched after space normalization".to_string()),
        );
    }
    (s.to_string(), None)
}

fn preview(value: &Value) -> String {
    const LIMIT: usize = 100;
    match value {
        Value::Null => "null".to_string(),
        Value::Str(s) => truncate(s, LIMIT),
        Value::List(items) => {
            let head = items
                .first()
                .map(|s| truncate(s, LIMIT))
                .unwrap_or_default();
            format!("[{} items] {head}", items.len())
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(limit).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(json: serde_json::Value) -> PostProcessStep {
        PostProcessStep::from_json(&json).expect("step json")
    }

    #[test]
    fn strip_trims_whitespace_and_custom_chars() {
        let v = apply(
            Value::Str("  hello  ".into()),
            &[step(serde_json::json!({"method": "strip"}))],
        );
        assert_eq!(v, Value::Str("hello".into()));

        let v = apply(
            Value::Str("##hello##".into()),
            &[step(serde_json::json!({"method": "strip", "params": {"chars": "#"}}))],
        );
        assert_eq!(v, Value::Str("hello".into()));
    }

    #[test]
    fn strip_applies_elementwise_to_lists() {
        let v = apply(
            Value::List(vec![" a ".into(), " b ".into()]),
            &[step(serde_json::json!({"method": "strip"}))],
        );
        assert_eq!(v, Value::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn replace_normalizes_non_breaking_spaces_on_miss() {
        // The configured needle uses an ordinary space, the page a NBSP.
        let v = apply(
            Value::Str("作者：\u{a0}张三".into()),
            &[step(serde_json::json!({
                "method": "replace",
                "params": {"old": "作者： ", "new": ""}
            }))],
        );
        assert_eq!(v, Value::Str("张三".into()));
    }

    #[test]
    fn replace_prefers_verbatim_match() {
        let v = apply(
            Value::Str("a b".into()),
            &[step(serde_json::json!({"method": "replace", "params": {"old": "a b", "new": "x"}}))],
        );
        assert_eq!(v, Value::Str("x".into()));
    }

    #[test]
    fn regex_replace_substitutes() {
        let v = apply(
            Value::Str("chapter 12 of 30".into()),
            &[step(serde_json::json!({
                "method": "regex_replace",
                "params": {"pattern": r"\d+", "repl": "N"}
            }))],
        );
        assert_eq!(v, Value::Str("chapter N of N".into()));
    }

    #[test]
    fn invalid_regex_is_skipped() {
        let v = apply(
            Value::Str("keep".into()),
            &[step(serde_json::json!({
                "method": "regex_replace",
                "params": {"pattern": "([", "repl": ""}
            }))],
        );
        assert_eq!(v, Value::Str("keep".into()));
    }

    #[test]
    fn join_then_split_round_trips() {
        let steps = [
            step(serde_json::json!({"method": "split", "params": {"separator": ","}})),
            step(serde_json::json!({"method": "join", "params": {"separator": ","}})),
        ];
        let v = apply(Value::Str("a,b,c".into()), &steps);
        assert_eq!(v, Value::Str("a,b,c".into()));
    }

    #[test]
    fn extract_first_and_index() {
        let list = Value::List(vec!["a".into(), "b".into(), "c".into()]);
        let v = apply(list.clone(), &[step(serde_json::json!({"method": "extract_first"}))]);
        assert_eq!(v, Value::Str("a".into()));

        let v = apply(
            list,
            &[step(serde_json::json!({"method": "extract_index", "params": {"index": 2}}))],
        );
        assert_eq!(v, Value::Str("c".into()));
    }

    #[test]
    fn extract_index_out_of_range_is_a_no_op() {
        let list = Value::List(vec!["a".into()]);
        let v = apply(
            list.clone(),
            &[step(serde_json::json!({"method": "extract_index", "params": {"index": 5}}))],
        );
        assert_eq!(v, list);
    }

    #[test]
    fn unknown_method_is_skipped_and_value_preserved() {
        let v = apply(
            Value::Str("keep".into()),
            &[step(serde_json::json!({"method": "frobnicate"}))],
        );
        assert_eq!(v, Value::Str("keep".into()));
    }

    #[test]
    fn trace_records_before_and_after() {
        let steps = [
            step(serde_json::json!({"method": "strip"})),
            step(serde_json::json!({"method": "replace", "params": {"old": "b", "new": "x"}})),
        ];
        let (v, trace) = apply_traced(Value::Str(" ab ".into()), &steps);
        assert_eq!(v, Value::Str("ax".into()));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].method, "strip");
        assert!(trace[0].changed);
        assert_eq!(trace[1].after, "ax");
    }
}
