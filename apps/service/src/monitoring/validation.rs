use anyhow::{Result, anyhow};
use serde_json::Value;
use url::Url;

use super::checker::{MAX_PING_COUNT, max_ping_count};
use super::secrets;
use super::snmp::parse_oid;
use super::types::{Params, int_param};
use crate::database::models::{Check, seconds_to_duration};

const MIN_INTERVAL: u64 = 1;
const MAX_INTERVAL: u64 = 86400; // 24 hours

const MAX_TIMEOUT: f64 = 300.0; // 5 minutes

/// Validate a device host: an IP address or DNS name
pub fn validate_host(host: &str) -> Result<()> {
    let host = host.trim();
    if host.is_empty() {
        return Err(anyhow!("Host must not be empty"));
    }
    if host.chars().any(char::is_whitespace) {
        return Err(anyhow!("Host must not contain whitespace: {:?}", host));
    }
    if host.contains("://") || host.contains('/') {
        return Err(anyhow!("Host must be an address or name, not a URL: {}", host));
    }
    Ok(())
}

/// Validate a whole check definition against the registered kinds.
///
/// The scheduler trusts what it loads, so anything a checker would reject on
/// every poll is refused here instead.
pub fn validate_check(check: &Check, known_kinds: &[&str]) -> Result<()> {
    if !known_kinds.contains(&check.kind.as_str()) {
        return Err(anyhow!(
            "Unsupported check kind: {} (expected one of: {})",
            check.kind,
            known_kinds.join(", ")
        ));
    }
    validate_check_interval(check.interval_seconds)?;
    validate_timeout(check.timeout_seconds)?;

    if check.timeout_seconds >= check.interval_seconds as f64 {
        tracing::warn!(
            "Check timeout {}s is not shorter than its interval {}s - polls will run back to back",
            check.timeout_seconds,
            check.interval_seconds
        );
    }

    validate_thresholds(&check.params)?;
    validate_params(&check.kind, &check.params, check.timeout_seconds)
}

/// Validate kind-specific parameters for a check bounded by `timeout_seconds`
pub fn validate_params(kind: &str, params: &Params, timeout_seconds: f64) -> Result<()> {
    match kind {
        "tcp" => validate_tcp_params(params),
        "http" => validate_http_params(params),
        "ping" => validate_ping_params(params, timeout_seconds),
        "snmpv3_get" => validate_snmp_params(params),
        _ => Ok(()),
    }
}

fn validate_tcp_params(params: &Params) -> Result<()> {
    if !params.contains_key("port") {
        return Err(anyhow!("TCP checks require a 'port' param"));
    }
    validate_port(params)
}

fn validate_http_params(params: &Params) -> Result<()> {
    if let Some(url) = params.get("url") {
        let url = url.as_str().ok_or_else(|| anyhow!("'url' must be a string"))?;
        // References are resolved at execution time
        if !secrets::is_reference(url) {
            let parsed = Url::parse(url).map_err(|e| anyhow!("Invalid URL: {}", e))?;
            validate_scheme(parsed.scheme())?;
        }
    }

    if let Some(scheme) = params.get("scheme") {
        validate_scheme(scheme.as_str().ok_or_else(|| anyhow!("'scheme' must be a string"))?)?;
    }
    if params.contains_key("port") {
        validate_port(params)?;
    }
    if let Some(path) = params.get("path") {
        path.as_str().ok_or_else(|| anyhow!("'path' must be a string"))?;
    }

    match params.get("headers") {
        None => {}
        Some(Value::Object(headers)) => {
            for (name, value) in headers {
                if !value.is_string() {
                    return Err(anyhow!("Header '{}' must be a string", name));
                }
            }
        }
        Some(_) => return Err(anyhow!("'headers' must be an object")),
    }

    if let Some(token) = params.get("bearer_token") {
        token.as_str().ok_or_else(|| anyhow!("'bearer_token' must be a string"))?;
    }

    match params.get("down_on_status") {
        None => {}
        Some(Value::Array(codes)) => {
            for code in codes {
                if !code.as_u64().is_some_and(|c| (100..=599).contains(&c)) {
                    return Err(anyhow!("'down_on_status' entries must be HTTP status codes, got {}", code));
                }
            }
        }
        Some(_) => return Err(anyhow!("'down_on_status' must be an array of status codes")),
    }

    Ok(())
}

/// Every echo has to fit in the check timeout
fn validate_ping_params(params: &Params, timeout_seconds: f64) -> Result<()> {
    if params.contains_key("count") {
        let fits = i64::from(max_ping_count(seconds_to_duration(timeout_seconds)));
        match int_param(params, "count") {
            Some(count) if (1..=i64::from(MAX_PING_COUNT)).contains(&count) => {
                if count > fits {
                    return Err(anyhow!(
                        "'count' {} does not fit in a {}s timeout (at most {})",
                        count,
                        timeout_seconds,
                        fits
                    ));
                }
            }
            _ => return Err(anyhow!("'count' must be an integer between 1 and {}", MAX_PING_COUNT)),
        }
    }
    Ok(())
}

fn validate_snmp_params(params: &Params) -> Result<()> {
    if params.contains_key("port") {
        validate_port(params)?;
    }

    match params.get("username").and_then(Value::as_str) {
        Some(user) if !user.trim().is_empty() => {}
        _ => return Err(anyhow!("SNMPv3 checks require a 'username' param")),
    }
    for key in ["auth_key", "priv_key", "context_name"] {
        if params.get(key).is_some_and(|v| !v.is_string()) {
            return Err(anyhow!("'{}' must be a string", key));
        }
    }

    validate_choice(params, "auth_proto", &["NONE", "MD5", "SHA"])?;
    validate_choice(params, "priv_proto", &["NONE", "DES", "AES"])?;

    let non_empty = |key: &str| params.get(key).and_then(Value::as_str).is_some_and(|v| !v.is_empty());
    if non_empty("priv_key") && !non_empty("auth_key") {
        return Err(anyhow!("'priv_key' requires an 'auth_key'"));
    }
    if non_empty("context_name") {
        return Err(anyhow!("'context_name' is not supported, only the default context can be queried"));
    }

    match params.get("oids") {
        None => {}
        Some(Value::Array(oids)) if !oids.is_empty() => {
            for oid in oids {
                if !oid.as_str().is_some_and(|o| parse_oid(o).is_some()) {
                    return Err(anyhow!("Invalid OID: {}", oid));
                }
            }
        }
        Some(_) => return Err(anyhow!("'oids' must be a non-empty array of dotted OIDs")),
    }

    Ok(())
}

fn validate_choice(params: &Params, key: &str, allowed: &[&str]) -> Result<()> {
    let Some(value) = params.get(key) else {
        return Ok(());
    };
    match value.as_str().map(str::to_ascii_uppercase) {
        Some(choice) if allowed.contains(&choice.as_str()) => Ok(()),
        _ => Err(anyhow!("'{}' must be one of: {}", key, allowed.join(", "))),
    }
}

fn validate_scheme(scheme: &str) -> Result<()> {
    match scheme {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("Invalid scheme for HTTP check: {}", other)),
    }
}

/// Validate the `port` param is in 1..=65535
fn validate_port(params: &Params) -> Result<()> {
    match int_param(params, "port") {
        Some(port) if (1..=65535).contains(&port) => Ok(()),
        _ => Err(anyhow!("'port' must be an integer between 1 and 65535")),
    }
}

/// Per-check incident thresholds must be positive integers when present
fn validate_thresholds(params: &Params) -> Result<()> {
    for key in ["open_after_downs", "close_after_ups"] {
        if params.contains_key(key) && !int_param(params, key).is_some_and(|v| v >= 1) {
            return Err(anyhow!("'{}' must be a positive integer", key));
        }
    }
    Ok(())
}

/// Validate check interval
pub fn validate_check_interval(interval_seconds: u64) -> Result<()> {
    if interval_seconds < MIN_INTERVAL {
        return Err(anyhow!(
            "Check interval too short: {} seconds (minimum: {})",
            interval_seconds,
            MIN_INTERVAL
        ));
    }

    if interval_seconds > MAX_INTERVAL {
        return Err(anyhow!(
            "Check interval too long: {} seconds (maximum: {})",
            interval_seconds,
            MAX_INTERVAL
        ));
    }

    Ok(())
}

/// Validate timeout is reasonable
pub fn validate_timeout(timeout_seconds: f64) -> Result<()> {
    if !timeout_seconds.is_finite() || timeout_seconds <= 0.0 {
        return Err(anyhow!("Timeout must be a positive number of seconds: {}", timeout_seconds));
    }

    if timeout_seconds > MAX_TIMEOUT {
        return Err(anyhow!(
            "Timeout too long: {} seconds (maximum: {})",
            timeout_seconds,
            MAX_TIMEOUT
        ));
    }

    Ok(())
}
