//! Typed errors decoded from the vendor's JSON error payloads.
//!
//! Apple's endpoints report failures in several incompatible shapes, often
//! alongside a 2xx status. Every text response is run through [`detect`],
//! which tries each parser in [`PARSERS`] in order and returns the first error
//! found.

use serde::Deserialize;
use serde_json::Value;

/// Apple's code for an incorrect two-factor verification code.
pub const WRONG_VERIFICATION_CODE: &str = "-21669";

/// A vendor-reported semantic error: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct VendorError {
    pub code: String,
    pub message: String,
}

impl VendorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A single payload parser. Returns `None` when the payload does not match
/// its shape or matches without carrying an error.
pub type Parser = fn(&[u8]) -> Option<VendorError>;

/// Parser order matters: a payload may satisfy more than one shape.
pub const PARSERS: &[Parser] = &[
    service_errors,
    reason_with_text_error,
    reason_with_numeric_error,
    error_code_list,
];

/// Run every parser in order; the first one yielding an error wins.
pub fn detect(body: &[u8]) -> Option<VendorError> {
    detect_with(PARSERS, body)
}

pub fn detect_with(parsers: &[Parser], body: &[u8]) -> Option<VendorError> {
    parsers.iter().find_map(|p| p(body))
}

/// `{"service_errors":[{"code":"-21669","title":"…","message":"…"}],"hasError":true}`
fn service_errors(body: &[u8]) -> Option<VendorError> {
    #[derive(Deserialize)]
    struct Entry {
        #[serde(default)]
        code: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        message: String,
    }
    #[derive(Deserialize)]
    struct Shape {
        #[serde(default)]
        service_errors: Vec<Entry>,
        #[serde(default, rename = "hasError")]
        has_error: bool,
    }

    let shape: Shape = serde_json::from_slice(body).ok()?;
    for entry in &shape.service_errors {
        if entry.code.is_empty() || entry.code == "0" {
            continue;
        }
        let title = entry.title.trim_matches('.');
        let message = entry.message.trim_matches('.');
        let text = if message.to_lowercase() != title.to_lowercase() {
            format!("{title}, {message}")
        } else {
            title.to_string()
        };
        return Some(VendorError::new(entry.code.clone(), text));
    }
    if shape.has_error {
        let raw = serde_json::from_slice::<Value>(body)
            .map(|v| v.to_string())
            .unwrap_or_default();
        return Some(VendorError::new("1", format!("unknown error: {raw}")));
    }
    None
}

/// `{"reason":"…","error":"…"}`
fn reason_with_text_error(body: &[u8]) -> Option<VendorError> {
    #[derive(Deserialize)]
    struct Shape {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        error: String,
    }

    let shape: Shape = serde_json::from_slice(body).ok()?;
    if shape.error.is_empty() {
        return None;
    }
    let message = if shape.reason.is_empty() {
        shape.error
    } else {
        format!("{} {}", shape.error, shape.reason)
    };
    Some(VendorError::new("-2", message))
}

/// `{"reason":"…","error":1}`
fn reason_with_numeric_error(body: &[u8]) -> Option<VendorError> {
    #[derive(Deserialize)]
    struct Shape {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        error: i64,
    }

    let shape: Shape = serde_json::from_slice(body).ok()?;
    if shape.reason.is_empty() {
        return None;
    }
    Some(VendorError::new(shape.error.to_string(), shape.reason))
}

/// `{"errors":[{"errorCode":"CLOUD_DB_FAILURE"}],"requestUUID":"…"}`
fn error_code_list(body: &[u8]) -> Option<VendorError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Entry {
        #[serde(default)]
        error_code: String,
    }
    #[derive(Deserialize)]
    struct Shape {
        #[serde(default)]
        errors: Vec<Entry>,
    }

    let shape: Shape = serde_json::from_slice(body).ok()?;
    let first = shape.errors.into_iter().next()?;
    Some(VendorError::new("-2", first.error_code))
}
