//! Web tools: URL fetch and (optionally configured) web search.

use super::args::{required_str, usize_or};
use super::ToolSurface;
use crate::types::error::{OrchestratorError, ProviderError, ValidationError};

/// Cap on fetched body size.
const MAX_FETCH_BYTES: usize = 200_000;

/// `fetch_url`: GET a URL and return extracted text.
pub async fn fetch_url(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let raw_url = required_str(&arguments, "url")?;
    let url = url::Url::parse(&raw_url).map_err(|e| ValidationError::InvalidValue {
        field: "url".to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidValue {
            field: "url".to_string(),
            reason: format!("unsupported scheme: {}", url.scheme()),
        }
        .into());
    }

    let response = surface
        .services()
        .http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ProviderError::transient(format!("fetch failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::from_status(
            status.as_u16(),
            format!("fetch of {url} failed"),
        )
        .into());
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::transient(format!("read failed: {e}")))?;
    let body: String = body.chars().take(MAX_FETCH_BYTES).collect();

    let content = if content_type.contains("html") {
        strip_html(&body)
    } else {
        body
    };

    Ok(serde_json::json!({
        "url": url.to_string(),
        "content_type": content_type,
        "content": content,
    }))
}

/// `search_web`: query a configured JSON search endpoint. Without one, the
/// tool reports an empty result set rather than failing.
pub async fn search_web(
    surface: &ToolSurface,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, OrchestratorError> {
    let query = required_str(&arguments, "query")?;
    let limit = usize_or(&arguments, "k", 5);

    let Some(endpoint) = surface.services().config.search_endpoint.clone() else {
        return Ok(serde_json::json!({
            "results": [],
            "note": "no search endpoint configured (PARALLAX_SEARCH_ENDPOINT)",
        }));
    };

    let response = surface
        .services()
        .http
        .get(&endpoint)
        .query(&[("q", query.as_str()), ("format", "json")])
        .send()
        .await
        .map_err(|e| ProviderError::transient(format!("search failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), "search failed".into()).into());
    }

    let payload: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ProviderError::permanent(format!("bad search payload: {e}")))?;

    // SearXNG-style `results` array; tolerate a bare array too.
    let results = payload
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .or_else(|| payload.as_array().cloned())
        .unwrap_or_default();

    let trimmed: Vec<serde_json::Value> = results
        .into_iter()
        .take(limit)
        .map(|r| {
            serde_json::json!({
                "title": r.get("title").cloned().unwrap_or_default(),
                "url": r.get("url").cloned().unwrap_or_default(),
                "snippet": r.get("content").or_else(|| r.get("snippet")).cloned().unwrap_or_default(),
            })
        })
        .collect();

    Ok(serde_json::json!({ "results": trimmed }))
}

/// Drop tags, scripts, and styles; collapse whitespace.
pub(crate) fn strip_html(html: &str) -> String {
    let script_re = regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .expect("static regex");
    let tag_re = regex::Regex::new(r"(?s)<[^>]+>").expect("static regex");
    let without_scripts = script_re.replace_all(html, " ");
    let without_tags = tag_re.replace_all(&without_scripts, " ");
    without_tags
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
