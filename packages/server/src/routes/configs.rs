//! Site-config resources: CRUD over `config_*.json` files, validation, and
//! the interactive locator probe.

use std::path::PathBuf;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use crawl_engine::config::{validate, SiteConfig};
use crawl_engine::locator::{self, Value};
use crawl_engine::Fetcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use super::ApiError;
use crate::app::AppState;

pub const TEMPLATE_FILENAME: &str = "config_template.json";

/// Config filenames must look like `config_<name>.json` with no path
/// tricks.
fn valid_filename(name: &str) -> bool {
    name.starts_with("config_")
        && name.ends_with(".json")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

fn config_path(state: &AppState, filename: &str) -> Result<PathBuf, ApiError> {
    if !valid_filename(filename) {
        return Err(ApiError::bad_request("invalid config filename"));
    }
    Ok(state.config_dir.join(filename))
}

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub filename: String,
    pub name: String,
    pub base_url: String,
    pub description: Option<String>,
}

pub async fn list_configs(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<ConfigSummary>>, ApiError> {
    let mut entries = tokio::fs::read_dir(&state.config_dir)
        .await
        .map_err(|e| ApiError::internal(format!("config directory unavailable: {e}")))?;

    let mut summaries = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "config directory iteration failed");
                break;
            }
        };
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !valid_filename(&filename) || filename == TEMPLATE_FILENAME {
            continue;
        }
        match tokio::fs::read(entry.path()).await {
            Ok(bytes) => match serde_json::from_slice::<JsonValue>(&bytes) {
                Ok(json) => {
                    let site = json.get("site").cloned().unwrap_or(JsonValue::Null);
                    summaries.push(ConfigSummary {
                        filename,
                        name: site
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        base_url: site
                            .get("base_url")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        description: site
                            .get("description")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string),
                    });
                }
                Err(e) => warn!(file = %filename, error = %e, "unreadable config skipped"),
            },
            Err(e) => warn!(file = %filename, error = %e, "unreadable config skipped"),
        }
    }
    summaries.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub site_name: String,
    #[serde(default)]
    pub config: Option<JsonValue>,
}

pub async fn create_config(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateConfigRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let site_name = body.site_name.trim();
    if site_name.is_empty() {
        return Err(ApiError::bad_request("site_name must not be empty"));
    }
    let filename = format!("config_{site_name}.json");
    let path = config_path(&state, &filename)?;
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::conflict("config already exists"));
    }

    let content = match body.config {
        Some(config) => config,
        None => {
            // Seed new configs from the reserved template.
            let template_path = state.config_dir.join(TEMPLATE_FILENAME);
            let mut template: JsonValue = match tokio::fs::read(&template_path).await {
                Ok(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| ApiError::internal(format!("template unreadable: {e}")))?,
                Err(_) => json!({"site": {}, "parsers": {}}),
            };
            template["site"]["name"] = json!(site_name);
            template
        }
    };

    let rendered = serde_json::to_vec_pretty(&content)
        .map_err(|e| ApiError::internal(format!("serialize failed: {e}")))?;
    tokio::fs::write(&path, rendered)
        .await
        .map_err(|e| ApiError::internal(format!("write failed: {e}")))?;

    Ok((StatusCode::CREATED, Json(json!({ "filename": filename }))))
}

pub async fn read_config(
    Extension(state): Extension<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let path = config_path(&state, &filename)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("config not found"))?;
    let json: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::internal(format!("config is not valid JSON: {e}")))?;
    Ok(Json(json))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub config: JsonValue,
}

pub async fn update_config(
    Extension(state): Extension<AppState>,
    Path(filename): Path<String>,
    Json(body): Json<UpdateConfigRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let path = config_path(&state, &filename)?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::not_found("config not found"));
    }
    let rendered = serde_json::to_vec_pretty(&body.config)
        .map_err(|e| ApiError::internal(format!("serialize failed: {e}")))?;
    tokio::fs::write(&path, rendered)
        .await
        .map_err(|e| ApiError::internal(format!("write failed: {e}")))?;
    Ok(Json(json!({ "updated": true })))
}

pub async fn delete_config(
    Extension(state): Extension<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    if filename == TEMPLATE_FILENAME {
        return Err(ApiError::bad_request("the template cannot be deleted"));
    }
    let path = config_path(&state, &filename)?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|_| ApiError::not_found("config not found"))?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn get_template(
    Extension(state): Extension<AppState>,
) -> Result<Json<JsonValue>, ApiError> {
    let path = state.config_dir.join(TEMPLATE_FILENAME);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("template not found"))?;
    let json: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::internal(format!("template is not valid JSON: {e}")))?;
    Ok(Json(json))
}

#[derive(Debug, Deserialize, Default)]
pub struct ValidateRequest {
    #[serde(default)]
    pub config: Option<JsonValue>,
}

/// Validate either the posted config content or, absent a body, the file
/// on disk. Returns every error, not just the first.
pub async fn validate_config(
    Extension(state): Extension<AppState>,
    Path(filename): Path<String>,
    body: Option<Json<ValidateRequest>>,
) -> Result<Json<JsonValue>, ApiError> {
    let json = match body.and_then(|Json(b)| b.config) {
        Some(config) => config,
        None => {
            let path = config_path(&state, &filename)?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|_| ApiError::not_found("config not found"))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::bad_request(format!("config is not valid JSON: {e}")))?
        }
    };
    let errors = validate(&json);
    Ok(Json(json!({ "valid": errors.is_empty(), "errors": errors })))
}

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub url: String,
    pub test_type: String,
}

/// Run one parser of a config against a live page, in trace mode. The
/// response carries the typed result plus the per-step post-process trace.
pub async fn probe_config(
    Extension(state): Extension<AppState>,
    Path(filename): Path<String>,
    Json(body): Json<ProbeRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    if body.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }
    let path = config_path(&state, &filename)?;
    let config = SiteConfig::load(&path).map_err(|e| match e {
        crawl_engine::ConfigError::Io(_) => ApiError::not_found("config not found"),
        other => ApiError::bad_request(format!("{other}")),
    })?;

    let fetcher = Fetcher::new(&config, None)
        .map_err(|e| ApiError::internal(format!("http client: {e}")))?;
    let html = fetcher
        .get_with_retries(&body.url, 3)
        .await
        .ok_or_else(|| ApiError::bad_request("failed to fetch the probe url"))?;

    let result = match body.test_type.as_str() {
        "document_info" => {
            let mut data = serde_json::Map::new();
            let mut trace = serde_json::Map::new();
            for (field, spec) in &config.parsers.document_info {
                let (value, field_trace) = locator::evaluate_traced(&html, spec);
                data.insert(field.clone(), serde_json::to_value(&value).unwrap_or_default());
                trace.insert(
                    field.clone(),
                    serde_json::to_value(&field_trace).unwrap_or_default(),
                );
            }
            json!({ "test_type": "document_info", "data": data, "trace": trace })
        }
        "chapter_list" => {
            let items = locator::extract_chapter_items(
                &html,
                &config.parsers.chapter_list,
                &config.site.base_url,
            );
            let sample: Vec<_> = items
                .iter()
                .take(5)
                .map(|c| json!({ "title": c.title, "url": c.url }))
                .collect();
            json!({ "test_type": "chapter_list", "total": items.len(), "sample": sample })
        }
        "chapter_content" => {
            let spec = &config.parsers.chapter_content;
            let (value, content_trace) = locator::evaluate_traced(&html, &spec.content);
            let joined = match value {
                Value::Str(s) => s,
                Value::List(items) => items
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Value::Null => String::new(),
            };
            let (cleaned, clean_trace) =
                locator::postprocess::apply_traced(Value::Str(joined), &spec.clean);
            let content = match cleaned {
                Value::Str(s) => s,
                Value::List(items) => items.join("\n"),
                Value::Null => String::new(),
            };
            let preview: String = content.chars().take(500).collect();
            json!({
                "test_type": "chapter_content",
                "length": content.chars().count(),
                "preview": preview,
                "content_trace": content_trace,
                "clean_trace": clean_trace,
            })
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown test_type '{other}' (expected document_info, chapter_list, or chapter_content)"
            )))
        }
    };

    Ok(Json(json!({
        "result": result,
        "html_length": html.chars().count(),
    })))
}
