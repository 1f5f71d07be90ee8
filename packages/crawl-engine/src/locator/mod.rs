//! Declarative locator evaluation.
//!
//! A [`LocatorSpec`] pairs an xpath or regex expression with index
//! semantics, an optional default, and a post-processing pipeline. The
//! central primitive is [`evaluate`]; [`evaluate_traced`] additionally
//! records a per-step trace for interactive config probing.

pub mod postprocess;
mod xpath;

use std::collections::BTreeMap;

use regex::Regex;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};
use url::Url;

pub use postprocess::{PostProcessStep, StepTrace};

use crate::config::ChapterListSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    Xpath,
    Regex,
}

/// Index into the match sequence.
///
/// `null` and the sentinel `999` both select the whole list; any other
/// integer indexes the sequence with signed semantics (`-1` is the last
/// match). Out-of-range resolves to null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpec {
    All,
    Nth(i64),
}

#[derive(Debug, Clone)]
pub struct LocatorSpec {
    pub kind: LocatorKind,
    pub expression: String,
    pub index: IndexSpec,
    pub default: Option<String>,
    pub process: Vec<PostProcessStep>,
}

impl LocatorSpec {
    /// Parse a locator from its JSON object form. Returns `None` when the
    /// value is not an object.
    pub fn from_json(value: &Json) -> Option<Self> {
        let obj = value.as_object()?;

        let kind = match obj.get("type").and_then(Json::as_str) {
            Some("regex") => LocatorKind::Regex,
            Some("xpath") | None => LocatorKind::Xpath,
            Some(other) => {
                warn!(kind = other, "unknown locator type, treating as xpath");
                LocatorKind::Xpath
            }
        };

        let index = match obj.get("index") {
            None => IndexSpec::Nth(-1),
            Some(Json::Null) => IndexSpec::All,
            Some(v) => match coerce_i64(v) {
                Some(999) => IndexSpec::All,
                Some(n) => IndexSpec::Nth(n),
                None => IndexSpec::Nth(-1),
            },
        };

        let default = obj.get("default").and_then(|v| match v {
            Json::String(s) => Some(s.clone()),
            Json::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let process = obj
            .get("process")
            .and_then(Json::as_array)
            .map(|steps| steps.iter().filter_map(PostProcessStep::from_json).collect())
            .unwrap_or_default();

        Some(Self {
            kind,
            expression: obj
                .get("expression")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
            index,
            default,
            process,
        })
    }

    /// Shorthand for an all-matches xpath locator.
    pub fn xpath_all(expression: impl Into<String>) -> Self {
        Self {
            kind: LocatorKind::Xpath,
            expression: expression.into(),
            index: IndexSpec::All,
            default: None,
            process: Vec::new(),
        }
    }
}

impl<'de> Deserialize<'de> for LocatorSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Json::deserialize(deserializer)?;
        LocatorSpec::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom("locator spec must be a JSON object"))
    }
}

pub(crate) fn coerce_i64(value: &Json) -> Option<i64> {
    match value {
        Json::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Json::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// The result of locator evaluation: null, a single string, or an ordered
/// list of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    List(Vec<String>),
}

impl Value {
    /// Null or an empty list.
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(_) => false,
            Value::List(items) => items.is_empty(),
        }
    }

    /// Collapse to a single piece of text: a string as-is, a list's first
    /// non-empty element, null to `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Str(s) => Some(s.clone()),
            Value::List(items) => items.iter().find(|s| !s.trim().is_empty()).cloned(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

/// Evaluate a locator against HTML: select matches, apply the index,
/// substitute the default on a miss, then run the post-process pipeline.
pub fn evaluate(html: &str, spec: &LocatorSpec) -> Value {
    let value = raw_value(html, spec);
    postprocess::apply(value, &spec.process)
}

/// Raw value plus per-step post-process trace, for the probe endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EvalTrace {
    pub raw: Value,
    pub steps: Vec<StepTrace>,
}

pub fn evaluate_traced(html: &str, spec: &LocatorSpec) -> (Value, EvalTrace) {
    let raw = raw_value(html, spec);
    let (value, steps) = postprocess::apply_traced(raw.clone(), &spec.process);
    (value, EvalTrace { raw, steps })
}

fn raw_value(html: &str, spec: &LocatorSpec) -> Value {
    let matches = select(html, spec);
    let mut value = apply_index(matches, spec.index);
    if value.is_missing() {
        if let Some(default) = &spec.default {
            value = Value::Str(default.clone());
        }
    }
    value
}

fn select(html: &str, spec: &LocatorSpec) -> Vec<String> {
    match spec.kind {
        LocatorKind::Xpath => match xpath::select_all(html, &spec.expression) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(expression = %spec.expression, error = %e, "xpath evaluation failed");
                Vec::new()
            }
        },
        LocatorKind::Regex => match select_regex(html, &spec.expression) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(expression = %spec.expression, error = %e, "regex evaluation failed");
                Vec::new()
            }
        },
    }
}

/// `findall`-style matching. A pattern with a single capture group yields
/// that group's text; with several groups the whole match is selected.
fn select_regex(html: &str, expression: &str) -> Result<Vec<String>, regex::Error> {
    let re = Regex::new(expression)?;
    let groups = re.captures_len() - 1;
    let matches = match groups {
        0 => re.find_iter(html).map(|m| m.as_str().to_string()).collect(),
        1 => re
            .captures_iter(html)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect(),
        _ => {
            warn!(
                expression,
                groups, "regex has multiple capture groups, selecting the whole match"
            );
            re.find_iter(html).map(|m| m.as_str().to_string()).collect()
        }
    };
    Ok(matches)
}

fn apply_index(matches: Vec<String>, index: IndexSpec) -> Value {
    match index {
        IndexSpec::All => Value::List(matches),
        IndexSpec::Nth(i) => {
            if matches.is_empty() {
                return Value::Null;
            }
            let len = matches.len() as i64;
            let pos = if i < 0 { len + i } else { i };
            if (0..len).contains(&pos) {
                let mut matches = matches;
                Value::Str(matches.swap_remove(pos as usize))
            } else {
                debug!(index = i, matches = len, "locator index out of range");
                Value::Null
            }
        }
    }
}

/// Evaluate every non-comment field of a parser map against the same HTML.
pub fn extract_fields(
    html: &str,
    fields: &BTreeMap<String, LocatorSpec>,
) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|(name, spec)| (name.clone(), evaluate(html, spec)))
        .collect()
}

/// A discovered chapter-list entry, in page order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterItem {
    pub title: String,
    pub url: String,
}

/// Evaluate the `items` locator to obtain serialized subtrees, then resolve
/// `title` and `url` within each subtree's local scope. A subtree that
/// misses either field is skipped.
pub fn extract_chapter_items(
    html: &str,
    spec: &ChapterListSpec,
    base_url: &str,
) -> Vec<ChapterItem> {
    let items = match evaluate(html, &spec.items) {
        Value::List(items) => items,
        Value::Str(single) => vec![single],
        Value::Null => Vec::new(),
    };

    let mut chapters = Vec::new();
    for item_html in &items {
        let Some(title) = evaluate(item_html, &spec.title).as_text() else {
            debug!("skipping chapter item without a title");
            continue;
        };
        let Some(href) = evaluate(item_html, &spec.url).as_text() else {
            debug!(title = %title, "skipping chapter item without a url");
            continue;
        };
        if title.trim().is_empty() || href.trim().is_empty() {
            continue;
        }
        chapters.push(ChapterItem {
            title,
            url: join_url(base_url, &href),
        });
    }
    chapters
}

/// Resolve a possibly-relative href against the site base URL.
pub(crate) fn join_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}
