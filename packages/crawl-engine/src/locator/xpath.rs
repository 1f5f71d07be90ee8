//! XPath evaluation over the `scraper` DOM.
//!
//! The Rust HTML ecosystem standardizes on CSS selectors, so this module
//! evaluates the location-path subset that site configurations actually
//! use directly against `scraper`'s parse tree:
//!
//! - `/child` and `//descendant` steps, `*` and name tests
//! - terminal `text()` and `@attr` steps
//! - predicates: `[n]`, `[last()]`, `[position()=n]`, `[@attr]`,
//!   `[@attr='v']`, `[contains(@attr,'v')]`, `[contains(text(),'v')]`
//! - top-level unions (`a | b`)
//!
//! Selection follows `getall()` conventions: `text()` and `@attr` steps
//! yield strings, element steps yield serialized outer HTML.

use std::collections::HashSet;

use scraper::{ElementRef, Html};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unsupported xpath expression: {0}")]
pub struct XPathError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    AnyElement,
    Name(String),
    Text,
    Attr(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Last,
    HasAttr(String),
    AttrEquals(String, String),
    AttrContains(String, String),
    TextContains(String),
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

/// Evaluate `expr` against `html` and return every match in document order.
pub(crate) fn select_all(html: &str, expr: &str) -> Result<Vec<String>, XPathError> {
    let mut paths = Vec::new();
    for branch in split_union(expr) {
        paths.push(parse_path(branch)?);
    }

    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for steps in &paths {
        evaluate_path(&doc, steps, &mut out);
    }
    Ok(out)
}

fn evaluate_path(doc: &Html, steps: &[Step], out: &mut Vec<String>) {
    if steps.is_empty() {
        return;
    }
    let root = doc.root_element();

    // `None` is the virtual root above the document element.
    let mut contexts: Option<Vec<ElementRef>> = None;

    for (i, step) in steps.iter().enumerate() {
        let is_last = i + 1 == steps.len();

        match &step.test {
            NodeTest::Text => {
                if is_last {
                    collect_text(contexts.as_deref().unwrap_or(&[root]), step.axis, out);
                }
                return;
            }
            NodeTest::Attr(name) => {
                if is_last {
                    for el in contexts.as_deref().unwrap_or(&[root]) {
                        if let Some(v) = el.value().attr(name) {
                            out.push(v.to_string());
                        }
                    }
                }
                return;
            }
            _ => {}
        }

        let mut next: Vec<ElementRef> = Vec::new();
        let mut seen = HashSet::new();
        let source: Vec<Option<ElementRef>> = match &contexts {
            None => vec![None],
            Some(els) => els.iter().copied().map(Some).collect(),
        };

        for ctx in source {
            let mut candidates = step_candidates(ctx, root, step.axis);
            if let NodeTest::Name(name) = &step.test {
                candidates.retain(|el| el.value().name().eq_ignore_ascii_case(name));
            }
            for pred in &step.predicates {
                candidates = apply_predicate(candidates, pred);
            }
            for el in candidates {
                if seen.insert(el.id()) {
                    next.push(el);
                }
            }
        }

        if next.is_empty() {
            return;
        }
        contexts = Some(next);
    }

    if let Some(els) = contexts {
        for el in els {
            out.push(el.html());
        }
    }
}

fn step_candidates<'a>(
    ctx: Option<ElementRef<'a>>,
    root: ElementRef<'a>,
    axis: Axis,
) -> Vec<ElementRef<'a>> {
    match (ctx, axis) {
        (None, Axis::Child) => vec![root],
        // Descendants of the virtual root include the document element itself.
        (None, Axis::Descendant) => root.descendants().filter_map(ElementRef::wrap).collect(),
        (Some(el), Axis::Child) => el.children().filter_map(ElementRef::wrap).collect(),
        (Some(el), Axis::Descendant) => {
            el.descendants().skip(1).filter_map(ElementRef::wrap).collect()
        }
    }
}

fn collect_text(contexts: &[ElementRef], axis: Axis, out: &mut Vec<String>) {
    for ctx in contexts {
        match axis {
            Axis::Child => {
                for child in ctx.children() {
                    if let Some(text) = child.value().as_text() {
                        out.push(text.to_string());
                    }
                }
            }
            Axis::Descendant => {
                for node in ctx.descendants() {
                    if let Some(text) = node.value().as_text() {
                        out.push(text.to_string());
                    }
                }
            }
        }
    }
}

fn apply_predicate<'a>(
    candidates: Vec<ElementRef<'a>>,
    pred: &Predicate,
) -> Vec<ElementRef<'a>> {
    let len = candidates.len();
    candidates
        .into_iter()
        .enumerate()
        .filter(|(i, el)| match pred {
            Predicate::Position(n) => i + 1 == *n,
            Predicate::Last => i + 1 == len,
            Predicate::HasAttr(a) => el.value().attr(a).is_some(),
            Predicate::AttrEquals(a, v) => el.value().attr(a) == Some(v.as_str()),
            Predicate::AttrContains(a, v) => {
                el.value().attr(a).is_some_and(|x| x.contains(v.as_str()))
            }
            Predicate::TextContains(v) => el.text().collect::<String>().contains(v.as_str()),
        })
        .map(|(_, el)| el)
        .collect()
}

/// Split on `|` at the top level (outside quotes and predicates).
fn split_union(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '|' if depth == 0 => {
                    parts.push(&expr[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&expr[start..]);
    parts
}

fn parse_path(path: &str) -> Result<Vec<Step>, XPathError> {
    let mut rest = path.trim();
    if rest.is_empty() {
        return Err(XPathError("empty path".into()));
    }
    // Relative paths anchored at the context node: strip the leading dot.
    if let Some(r) = rest.strip_prefix('.') {
        rest = r;
    }

    let mut steps = Vec::new();
    let mut leading = true;
    while !rest.is_empty() {
        let axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            Axis::Child
        } else if leading {
            Axis::Child
        } else {
            return Err(XPathError(format!("unexpected input at '{rest}'")));
        };
        leading = false;
        if rest.is_empty() {
            return Err(XPathError("path ends with a slash".into()));
        }

        let end = rest.find(['/', '[']).unwrap_or(rest.len());
        let (test_str, mut tail) = rest.split_at(end);
        let test_str = test_str.trim();
        if test_str.is_empty() {
            return Err(XPathError(format!("missing node test in '{path}'")));
        }

        let test = if test_str == "text()" {
            NodeTest::Text
        } else if let Some(attr) = test_str.strip_prefix('@') {
            NodeTest::Attr(attr.trim().to_string())
        } else if test_str == "*" || test_str == "node()" {
            NodeTest::AnyElement
        } else if test_str.contains('(') {
            return Err(XPathError(format!("unsupported function '{test_str}'")));
        } else {
            NodeTest::Name(test_str.to_ascii_lowercase())
        };

        let mut predicates = Vec::new();
        while tail.starts_with('[') {
            let close = find_closing_bracket(tail)
                .ok_or_else(|| XPathError(format!("unbalanced predicate in '{path}'")))?;
            predicates.push(parse_predicate(&tail[1..close])?);
            tail = &tail[close + 1..];
        }

        steps.push(Step { axis, test, predicates });
        rest = tail;
    }
    Ok(steps)
}

fn find_closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                ']' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_predicate(inner: &str) -> Result<Predicate, XPathError> {
    let inner = inner.trim();

    if let Ok(n) = inner.parse::<usize>() {
        return Ok(Predicate::Position(n));
    }
    if inner == "last()" {
        return Ok(Predicate::Last);
    }
    if let Some(n) = inner
        .strip_prefix("position()")
        .and_then(|r| r.trim().strip_prefix('='))
    {
        let n = n
            .trim()
            .parse::<usize>()
            .map_err(|_| XPathError(format!("bad position predicate '{inner}'")))?;
        return Ok(Predicate::Position(n));
    }

    if let Some(args) = inner
        .strip_prefix("contains(")
        .and_then(|r| r.strip_suffix(')'))
    {
        let (subject, needle) = args
            .split_once(',')
            .ok_or_else(|| XPathError(format!("bad contains predicate '{inner}'")))?;
        let subject = subject.trim();
        let needle = unquote(needle.trim())
            .ok_or_else(|| XPathError(format!("unquoted contains argument '{inner}'")))?;
        if let Some(attr) = subject.strip_prefix('@') {
            return Ok(Predicate::AttrContains(attr.to_string(), needle));
        }
        if subject == "text()" || subject == "." {
            return Ok(Predicate::TextContains(needle));
        }
        return Err(XPathError(format!("unsupported contains subject '{subject}'")));
    }

    if let Some(attr_expr) = inner.strip_prefix('@') {
        return match attr_expr.split_once('=') {
            None => Ok(Predicate::HasAttr(attr_expr.trim().to_string())),
            Some((name, value)) => {
                let value = unquote(value.trim())
                    .ok_or_else(|| XPathError(format!("unquoted attribute value '{inner}'")))?;
                Ok(Predicate::AttrEquals(name.trim().to_string(), value))
            }
        };
    }

    Err(XPathError(format!("unsupported predicate '{inner}'")))
}

fn unquote(s: &str) -> Option<String> {
    let mut chars = s.chars();
    let first = chars.next()?;
    if (first == '\'' || first == '"') && s.len() >= 2 && s.ends_with(first) {
        Some(s[1..s.len() - 1].to_string())
    } else {
        None
    }
}
