//! Common utilities and helper functions
//!
//! Device identity helpers live here: validation of externally supplied ids
//! and generation of readable ids from the host name.

pub mod retry;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::models::DeviceType;

/// Maximum accepted device id length
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Maximum length of the host name component in generated ids
const MAX_HOSTNAME_LEN: usize = 20;

fn identifier_regex() -> &'static Regex {
    static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid regex pattern"))
}

/// Check that a string is a non-empty `[A-Za-z0-9_-]` identifier
pub fn is_valid_identifier(s: &str) -> bool {
    identifier_regex().is_match(s)
}

/// Validate a device id
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(Error::validation("device_id must not be empty"));
    }

    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(Error::validation(format!(
            "device_id longer than {MAX_DEVICE_ID_LEN} characters"
        )));
    }

    if !is_valid_identifier(device_id) {
        return Err(Error::validation(format!(
            "device_id {device_id:?} contains characters outside [A-Za-z0-9_-]"
        )));
    }

    Ok(())
}

/// Reduce a host name to lowercase `[a-z0-9-]`, at most 20 characters
pub fn sanitize_hostname(hostname: &str) -> Option<String> {
    static HOSTNAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME_RE.get_or_init(|| Regex::new(r"[^a-z0-9-]").expect("Invalid regex pattern"));

    let sanitized: String = re
        .replace_all(&hostname.to_lowercase(), "")
        .chars()
        .take(MAX_HOSTNAME_LEN)
        .collect();

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

/// Generate a readable device id
///
/// Layout is `{type}[-{datacenter}][-{suffix | hostname}]`, falling back to
/// `{type}-001` when no other component is available.
pub fn generate_device_id(
    device_type: DeviceType,
    datacenter: Option<&str>,
    suffix: Option<&str>,
) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| sanitize_hostname(&h));

    build_device_id(device_type, datacenter, suffix, host.as_deref())
}

fn build_device_id(
    device_type: DeviceType,
    datacenter: Option<&str>,
    suffix: Option<&str>,
    host: Option<&str>,
) -> String {
    let mut components = vec![device_type.as_str().to_string()];

    if let Some(dc) = datacenter.filter(|s| !s.is_empty()) {
        components.push(dc.to_string());
    }

    match suffix.filter(|s| !s.is_empty()) {
        Some(s) => components.push(s.to_string()),
        None => {
            if let Some(h) = host {
                components.push(h.to_string());
            }
        }
    }

    if components.len() == 1 {
        components.push("001".to_string());
    }

    components.join("-")
}

/// Oldest timestamp kept by a retention window of `days` ending at `now`.
/// Windows reaching past the representable range keep everything.
pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
