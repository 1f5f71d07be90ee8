//! Site configuration: loading, validation, typed accessors, and URL
//! templating.
//!
//! A site config is a UTF-8 JSON document (`config_<name>.json`). Loading
//! normalizes it into strongly-typed records so downstream code never
//! inspects raw JSON; any key beginning with `_` is a comment and ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value as Json;
use thiserror::Error;
use url::Url;

use crate::locator::{coerce_i64, LocatorSpec};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_DELAY_SECS: f64 = 0.3;
pub const DEFAULT_MAX_RETRIES: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SiteInfo {
    pub name: String,
    pub base_url: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub request_delay_secs: f64,
    pub max_retries: u32,
}

/// Chapter-list parser: a locator for the item subtrees plus per-item
/// `title`/`url` locators evaluated in each subtree's local scope.
#[derive(Debug, Clone)]
pub struct ChapterListSpec {
    pub items: LocatorSpec,
    pub title: LocatorSpec,
    pub url: LocatorSpec,
    pub pagination: Option<PaginationSpec>,
}

#[derive(Debug, Clone)]
pub struct PaginationSpec {
    pub enabled: bool,
    pub max_page_manual: u32,
    pub max_page_xpath: Option<LocatorSpec>,
}

#[derive(Debug, Clone)]
pub struct ChapterContentSpec {
    pub content: LocatorSpec,
    pub next_page: Option<NextPageSpec>,
    pub clean: Vec<crate::locator::PostProcessStep>,
}

#[derive(Debug, Clone)]
pub struct NextPageSpec {
    pub enabled: bool,
    pub max_pages_manual: u32,
    pub max_page_xpath: Option<LocatorSpec>,
}

#[derive(Debug, Clone)]
pub struct Parsers {
    pub document_info: BTreeMap<String, LocatorSpec>,
    pub chapter_list: ChapterListSpec,
    pub chapter_content: ChapterContentSpec,
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub site: SiteInfo,
    pub request: RequestConfig,
    pub crawl: CrawlConfig,
    pub url_templates: BTreeMap<String, String>,
    pub parsers: Parsers,
}

impl SiteConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let json: Json = serde_json::from_slice(bytes)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<Self, ConfigError> {
        let errors = validate(json);
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let site_obj = &json["site"];
        let site = SiteInfo {
            name: str_field(site_obj, "name").unwrap_or_default(),
            base_url: str_field(site_obj, "base_url").unwrap_or_default(),
            description: str_field(site_obj, "description"),
        };

        let request_obj = json.get("request").cloned().unwrap_or(Json::Null);
        let request = RequestConfig {
            headers: string_map(request_obj.get("headers")),
            timeout_secs: request_obj
                .get("timeout_secs")
                .and_then(coerce_i64)
                .filter(|n| *n >= 1)
                .map(|n| n as u64)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            encoding: str_field(&request_obj, "encoding"),
        };

        let crawl_obj = json.get("crawl").cloned().unwrap_or(Json::Null);
        let crawl = CrawlConfig {
            request_delay_secs: crawl_obj
                .get("request_delay_secs")
                .and_then(coerce_f64)
                .filter(|d| *d >= 0.0)
                .unwrap_or(DEFAULT_REQUEST_DELAY_SECS),
            max_retries: crawl_obj
                .get("max_retries")
                .and_then(coerce_i64)
                .filter(|n| *n >= 1)
                .map(|n| n as u32)
                .unwrap_or(DEFAULT_MAX_RETRIES),
        };

        let url_templates = string_map(json.get("url_templates"));

        let parsers_obj = &json["parsers"];
        let parsers = Parsers {
            document_info: locator_map(parsers_obj.get("document_info")),
            chapter_list: parse_chapter_list(&parsers_obj["chapter_list"]),
            chapter_content: parse_chapter_content(&parsers_obj["chapter_content"]),
        };

        Ok(Self {
            site,
            request,
            crawl,
            url_templates,
            parsers,
        })
    }

    /// Substitute named placeholders into a URL template and resolve the
    /// result against the site base URL. Returns `None` when the template
    /// is missing or a placeholder stays unresolved — callers treat that
    /// as "this site has no such page", not as an error.
    pub fn build_url(&self, template: &str, params: &[(&str, &str)]) -> Option<String> {
        if template.starts_with('_') {
            return None;
        }
        let mut built = self.url_templates.get(template)?.clone();
        for (name, value) in params {
            built = built.replace(&format!("{{{name}}}"), value);
        }
        if built.contains('{') {
            tracing::debug!(template, url = %built, "url template left unresolved");
            return None;
        }
        if built.starts_with("http://") || built.starts_with("https://") {
            return Some(built);
        }
        Url::parse(&self.site.base_url)
            .and_then(|base| base.join(&built))
            .map(|u| u.to_string())
            .ok()
    }
}

/// Collect every validation error in one pass, for the validate endpoint.
pub fn validate(json: &Json) -> Vec<String> {
    let mut errors = Vec::new();

    match json.get("site") {
        None => errors.push("missing field: site".to_string()),
        Some(site) => {
            if str_field(site, "name").map_or(true, |s| s.trim().is_empty()) {
                errors.push("missing field: site.name".to_string());
            }
            if str_field(site, "base_url").map_or(true, |s| s.trim().is_empty()) {
                errors.push("missing field: site.base_url".to_string());
            }
        }
    }

    match json.get("parsers") {
        None => errors.push("missing field: parsers".to_string()),
        Some(parsers) => {
            match parsers.get("chapter_list") {
                None => errors.push("missing field: parsers.chapter_list".to_string()),
                Some(list) => {
                    for field in ["items", "title", "url"] {
                        if list.get(field).map_or(true, |v| !v.is_object()) {
                            errors.push(format!("missing field: parsers.chapter_list.{field}"));
                        }
                    }
                }
            }
            match parsers.get("chapter_content") {
                None => errors.push("missing field: parsers.chapter_content".to_string()),
                Some(content) => {
                    if content.get("content").map_or(true, |v| !v.is_object()) {
                        errors.push("missing field: parsers.chapter_content.content".to_string());
                    }
                }
            }
        }
    }

    errors
}

fn parse_chapter_list(json: &Json) -> ChapterListSpec {
    let locator = |field: &str| {
        json.get(field)
            .and_then(LocatorSpec::from_json)
            .unwrap_or_else(|| LocatorSpec::xpath_all(""))
    };
    ChapterListSpec {
        items: locator("items"),
        title: locator("title"),
        url: locator("url"),
        pagination: json.get("pagination").map(|p| PaginationSpec {
            enabled: coerce_bool(p.get("enabled")),
            max_page_manual: p
                .get("max_page_manual")
                .and_then(coerce_i64)
                .filter(|n| *n >= 1)
                .map(|n| n as u32)
                .unwrap_or(1),
            max_page_xpath: p.get("max_page_xpath").and_then(LocatorSpec::from_json),
        }),
    }
}

fn parse_chapter_content(json: &Json) -> ChapterContentSpec {
    ChapterContentSpec {
        content: json
            .get("content")
            .and_then(LocatorSpec::from_json)
            .unwrap_or_else(|| LocatorSpec::xpath_all("")),
        next_page: json.get("next_page").map(|n| NextPageSpec {
            enabled: coerce_bool(n.get("enabled")),
            max_pages_manual: n
                .get("max_pages_manual")
                .and_then(coerce_i64)
                .filter(|v| *v >= 1)
                .map(|v| v as u32)
                .unwrap_or(50),
            max_page_xpath: n.get("max_page_xpath").and_then(LocatorSpec::from_json),
        }),
        clean: json
            .get("clean")
            .and_then(Json::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(crate::locator::PostProcessStep::from_json)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn str_field(json: &Json, field: &str) -> Option<String> {
    json.get(field)
        .and_then(Json::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn string_map(json: Option<&Json>) -> BTreeMap<String, String> {
    json.and_then(Json::as_object)
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn locator_map(json: Option<&Json>) -> BTreeMap<String, LocatorSpec> {
    json.and_then(Json::as_object)
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .filter_map(|(k, v)| LocatorSpec::from_json(v).map(|spec| (k.clone(), spec)))
                .collect()
        })
        .unwrap_or_default()
}

fn coerce_bool(json: Option<&Json>) -> bool {
    match json {
        Some(Json::Bool(b)) => *b,
        Some(Json::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Some(Json::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn coerce_f64(json: &Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> serde_json::Value {
        serde_json::json!({
            "site": {"name": "example", "base_url": "https://example.com"},
            "request": {"headers": {"user-agent": "test"}, "timeout_secs": 10},
            "crawl": {"request_delay_secs": 0, "max_retries": 2},
            "url_templates": {
                "book_detail": "/book/{book_id}/",
                "chapter_list_page": "/book/{book_id}/page/{page}",
                "_comment": "templates use named placeholders"
            },
            "parsers": {
                "document_info": {
                    "title": {"expression": "//h1/text()", "index": 0},
                    "_note": "comment keys are ignored"
                },
                "chapter_list": {
                    "items": {"expression": "//dd", "index": null},
                    "title": {"expression": ".//a/text()", "index": 0},
                    "url": {"expression": ".//a/@href", "index": 0}
                },
                "chapter_content": {
                    "content": {"expression": "//div[@id='content']//text()", "index": null}
                }
            }
        })
    }

    #[test]
    fn loads_a_minimal_config() {
        let config = SiteConfig::from_json(&minimal_config()).unwrap();
        assert_eq!(config.site.name, "example");
        assert_eq!(config.request.timeout_secs, 10);
        assert_eq!(config.crawl.max_retries, 2);
        assert_eq!(config.parsers.document_info.len(), 1);
        assert!(!config.url_templates.contains_key("_comment"));
    }

    #[test]
    fn validation_collects_every_error() {
        let errors = validate(&serde_json::json!({"site": {"name": "x"}}));
        assert!(errors.contains(&"missing field: site.base_url".to_string()));
        assert!(errors.contains(&"missing field: parsers".to_string()));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn invalid_config_fails_to_load() {
        let result = SiteConfig::from_json(&serde_json::json!({}));
        match result {
            Err(ConfigError::Invalid(errors)) => assert!(!errors.is_empty()),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn numeric_accessors_coerce_strings_and_fall_back() {
        let mut json = minimal_config();
        json["request"]["timeout_secs"] = serde_json::json!("15");
        json["crawl"]["request_delay_secs"] = serde_json::json!("0.5");
        json["crawl"]["max_retries"] = serde_json::json!("not a number");
        let config = SiteConfig::from_json(&json).unwrap();
        assert_eq!(config.request.timeout_secs, 15);
        assert!((config.crawl.request_delay_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.crawl.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn build_url_substitutes_and_resolves_relative_templates() {
        let config = SiteConfig::from_json(&minimal_config()).unwrap();
        assert_eq!(
            config.build_url("book_detail", &[("book_id", "42")]),
            Some("https://example.com/book/42/".to_string())
        );
        assert_eq!(
            config.build_url("chapter_list_page", &[("book_id", "42"), ("page", "3")]),
            Some("https://example.com/book/42/page/3".to_string())
        );
    }

    #[test]
    fn build_url_is_unresolved_on_missing_template_or_placeholder() {
        let config = SiteConfig::from_json(&minimal_config()).unwrap();
        assert_eq!(config.build_url("chapter_content_page", &[]), None);
        assert_eq!(config.build_url("chapter_list_page", &[("book_id", "42")]), None);
    }

    #[test]
    fn absolute_templates_are_kept_verbatim() {
        let mut json = minimal_config();
        json["url_templates"]["book_detail"] =
            serde_json::json!("https://mirror.example.net/b/{book_id}");
        let config = SiteConfig::from_json(&json).unwrap();
        assert_eq!(
            config.build_url("book_detail", &[("book_id", "7")]),
            Some("https://mirror.example.net/b/7".to_string())
        );
    }

    #[test]
    fn pagination_defaults_and_coercion() {
        let mut json = minimal_config();
        json["parsers"]["chapter_list"]["pagination"] = serde_json::json!({
            "enabled": "true",
            "max_page_xpath": {"expression": "//select/option[last()]/text()", "index": 0}
        });
        let config = SiteConfig::from_json(&json).unwrap();
        let pagination = config.parsers.chapter_list.pagination.unwrap();
        assert!(pagination.enabled);
        assert_eq!(pagination.max_page_manual, 1);
        assert!(pagination.max_page_xpath.is_some());
    }
}
