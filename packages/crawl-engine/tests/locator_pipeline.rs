//! End-to-end locator checks: spec parsing from JSON through evaluation
//! and the post-process pipeline, the way site configs exercise them.

use crawl_engine::locator::{evaluate, evaluate_traced, LocatorSpec, Value};

const BOOK_PAGE: &str = r#"
    <html><body>
      <div class="bookname"><h1>霜降</h1></div>
      <div class="info">
        <p>作者：&#160;张三</p>
        <p>分类：玄幻</p>
      </div>
      <div id="content">
        <p>第一段。</p>
        <p>第二段。</p>
        <p>&#160;</p>
      </div>
    </body></html>
"#;

fn spec(json: serde_json::Value) -> LocatorSpec {
    serde_json::from_value(json).expect("locator spec")
}

#[test]
fn author_extraction_survives_non_breaking_spaces() {
    // The page uses U+00A0 after the label; the config was written with an
    // ordinary space. The replace step must still strip the label.
    let author = spec(serde_json::json!({
        "type": "xpath",
        "expression": "//div[@class='info']/p[1]/text()",
        "index": 0,
        "process": [
            {"method": "replace", "params": {"old": "作者： ", "new": ""}},
            {"method": "strip"}
        ]
    }));
    assert_eq!(evaluate(BOOK_PAGE, &author), Value::Str("张三".to_string()));
}

#[test]
fn content_pipeline_joins_and_cleans() {
    let content = spec(serde_json::json!({
        "type": "xpath",
        "expression": "//div[@id='content']/p/text()",
        "index": null,
        "process": [
            {"method": "strip"},
            {"method": "join", "params": {"separator": "\n"}},
            {"method": "regex_replace", "params": {"pattern": "\\n+", "repl": "\n"}},
            {"method": "strip"}
        ]
    }));
    assert_eq!(
        evaluate(BOOK_PAGE, &content),
        Value::Str("第一段。\n第二段。".to_string())
    );
}

#[test]
fn regex_locator_extracts_from_raw_html() {
    let category = spec(serde_json::json!({
        "type": "regex",
        "expression": "分类：(\\p{Han}+)",
        "index": 0
    }));
    assert_eq!(evaluate(BOOK_PAGE, &category), Value::Str("玄幻".to_string()));
}

#[test]
fn trace_mode_reports_each_step() {
    let title = spec(serde_json::json!({
        "type": "xpath",
        "expression": "//div[@class='bookname']/h1/text()",
        "index": 0,
        "process": [
            {"method": "strip"},
            {"method": "replace", "params": {"old": "霜", "new": "初"}}
        ]
    }));
    let (value, trace) = evaluate_traced(BOOK_PAGE, &title);
    assert_eq!(value, Value::Str("初降".to_string()));
    assert_eq!(trace.raw, Value::Str("霜降".to_string()));
    assert_eq!(trace.steps.len(), 2);
    assert_eq!(trace.steps[1].method, "replace");
    assert!(trace.steps[1].changed);
}

#[test]
fn default_applies_when_nothing_matches() {
    let missing = spec(serde_json::json!({
        "type": "xpath",
        "expression": "//div[@class='cover']/img/@src",
        "index": 0,
        "default": "/static/default-cover.png"
    }));
    assert_eq!(
        evaluate(BOOK_PAGE, &missing),
        Value::Str("/static/default-cover.png".to_string())
    );
}
