//! Filters available inside `${...}` placeholders
//!
//! - `default`: fallback for a missing parameter
//! - `required`: fail with a clear message when a parameter is missing
//! - `upper` / `lower`: case conversion
//! - `base64_encode` / `base64_decode`

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Error, ErrorKind, Value};

use super::context::param_string;

/// Default filter - returns fallback if value is undefined or none
///
/// Usage: `${values.namespace | default("guestbook")}`
pub fn default_filter(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

/// Required filter - fails if value is undefined
///
/// Usage: `${server | required}`
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required parameter is missing",
        ))
    } else {
        Ok(value)
    }
}

/// Upper case filter
pub fn upper(value: Value) -> Result<String, Error> {
    Ok(param_string(&value)?.to_uppercase())
}

/// Lower case filter
pub fn lower(value: Value) -> Result<String, Error> {
    Ok(param_string(&value)?.to_lowercase())
}

/// Base64 encode filter
pub fn base64_encode(value: Value) -> Result<String, Error> {
    Ok(STANDARD.encode(param_string(&value)?.as_bytes()))
}

/// Base64 decode filter
pub fn base64_decode(value: Value) -> Result<String, Error> {
    let bytes = STANDARD.decode(param_string(&value)?).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode error: {}", e),
        )
    })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {}", e),
        )
    })
}
