//! Argument normalization for the tool surface.
//!
//! A closed alias table maps short argument names onto canonical fields
//! before validation; bare string elements in attachment arrays are promoted
//! to structured entries with synthetic names. Unknown fields are rejected.

use serde::Deserialize;

use crate::types::error::ValidationError;
use crate::types::{
    AudienceLevel, CostTier, ImageAttachment, OutputFormat, ResearchParams, StructuredData,
    TextDocument,
};

/// Closed alias table: alias → canonical field.
const ALIASES: &[(&str, &str)] = &[
    ("q", "query"),
    ("cost", "costPreference"),
    ("aud", "audienceLevel"),
    ("fmt", "outputFormat"),
    ("src", "includeSources"),
    ("imgs", "images"),
    ("docs", "textDocuments"),
    ("data", "structuredData"),
];

/// Apply the alias table to a raw argument object. An alias only fills a
/// canonical field that is absent; it never overwrites one.
pub fn apply_aliases(args: &mut serde_json::Value) {
    let Some(map) = args.as_object_mut() else {
        return;
    };
    for (alias, canonical) in ALIASES {
        if map.contains_key(*alias) && !map.contains_key(*canonical) {
            if let Some(value) = map.remove(*alias) {
                map.insert(canonical.to_string(), value);
            }
        } else {
            map.remove(*alias);
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wire shape of research arguments after aliasing.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResearchArgs {
    query: String,
    #[serde(default, rename = "costPreference")]
    cost_preference: CostTier,
    #[serde(default, rename = "audienceLevel")]
    audience_level: AudienceLevel,
    #[serde(default, rename = "outputFormat")]
    output_format: OutputFormat,
    #[serde(default = "default_true", rename = "includeSources")]
    include_sources: bool,
    #[serde(default, rename = "maxLength")]
    max_length: Option<u32>,
    #[serde(default)]
    images: Vec<serde_json::Value>,
    #[serde(default, rename = "textDocuments")]
    text_documents: Vec<serde_json::Value>,
    #[serde(default, rename = "structuredData")]
    structured_data: Vec<serde_json::Value>,
    #[serde(default = "default_true", rename = "async")]
    run_async: bool,
    #[serde(default, rename = "idempotencyKey")]
    idempotency_key: Option<String>,
}

/// Fully normalized research request.
#[derive(Debug, Clone)]
pub struct NormalizedResearch {
    pub params: ResearchParams,
    pub run_async: bool,
    pub idempotency_key: Option<String>,
}

/// Normalize and validate `research`/`submit_research` arguments.
pub fn normalize_research_args(
    mut args: serde_json::Value,
) -> Result<NormalizedResearch, ValidationError> {
    apply_aliases(&mut args);

    let parsed: ResearchArgs =
        serde_json::from_value(args).map_err(|e| classify_serde_error(&e.to_string()))?;

    if parsed.query.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "query".to_string(),
        });
    }

    let images = promote_images(parsed.images)?;
    let text_documents = promote_documents(parsed.text_documents)?;
    let structured_data = promote_structured(parsed.structured_data)?;

    Ok(NormalizedResearch {
        params: ResearchParams {
            query: parsed.query.trim().to_string(),
            cost_preference: parsed.cost_preference,
            audience_level: parsed.audience_level,
            output_format: parsed.output_format,
            include_sources: parsed.include_sources,
            max_length: parsed.max_length,
            images,
            text_documents,
            structured_data,
        },
        run_async: parsed.run_async,
        idempotency_key: parsed.idempotency_key,
    })
}

fn classify_serde_error(message: &str) -> ValidationError {
    if let Some(rest) = message.strip_prefix("unknown field `") {
        if let Some(field) = rest.split('`').next() {
            return ValidationError::UnknownField {
                field: field.to_string(),
            };
        }
    }
    if message.contains("missing field `query`") {
        return ValidationError::MissingField {
            field: "query".to_string(),
        };
    }
    ValidationError::InvalidValue {
        field: "arguments".to_string(),
        reason: message.to_string(),
    }
}

fn promote_images(raw: Vec<serde_json::Value>) -> Result<Vec<ImageAttachment>, ValidationError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            serde_json::Value::String(s) => Ok(ImageAttachment {
                name: format!("image_{}", i + 1),
                url: Some(s),
                data: None,
                media_type: None,
            }),
            other => serde_json::from_value(other).map_err(|e| ValidationError::InvalidValue {
                field: "images".to_string(),
                reason: e.to_string(),
            }),
        })
        .collect()
}

fn promote_documents(raw: Vec<serde_json::Value>) -> Result<Vec<TextDocument>, ValidationError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            serde_json::Value::String(s) => Ok(TextDocument {
                name: format!("document_{}", i + 1),
                content: s,
            }),
            other => serde_json::from_value(other).map_err(|e| ValidationError::InvalidValue {
                field: "textDocuments".to_string(),
                reason: e.to_string(),
            }),
        })
        .collect()
}

fn promote_structured(raw: Vec<serde_json::Value>) -> Result<Vec<StructuredData>, ValidationError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            serde_json::Value::String(s) => {
                // A bare string may itself be JSON; keep it verbatim if not.
                let data = serde_json::from_str(&s)
                    .unwrap_or(serde_json::Value::String(s));
                Ok(StructuredData {
                    name: format!("data_{}", i + 1),
                    data,
                })
            }
            other => serde_json::from_value(other).map_err(|e| ValidationError::InvalidValue {
                field: "structuredData".to_string(),
                reason: e.to_string(),
            }),
        })
        .collect()
}

/// Read a required string field.
pub fn required_str(
    args: &serde_json::Value,
    field: &str,
) -> Result<String, ValidationError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ValidationError::MissingField {
            field: field.to_string(),
        })
}

/// Read an optional unsigned integer with a default.
pub fn usize_or(args: &serde_json::Value, field: &str, default: usize) -> usize {
    args.get(field)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}
