use serde_json::Value;
use std::fmt;

use crate::entitlement::EntitlementId;

/// Payload extraction errors
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    MissingField(&'static str),
    WrongType(&'static str),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MissingField(field) => write!(f, "payload field '{}' is missing", field),
            ExtractError::WrongType(field) => write!(f, "payload field '{}' has the wrong type", field),
        }
    }
}

impl std::error::Error for ExtractError {}

/// One security's worth of data pulled out of a response payload.
#[derive(Clone, Debug, PartialEq)]
pub struct SecurityData {
    pub security: String,
    pub entitlement_ids: Vec<EntitlementId>,
    pub fields: Value,
}

/// Extract the granted entitlement ids from an authorization success payload.
///
/// Expected shape: `{"entitlements": [u32, ...]}`. An absent or empty list is
/// a valid grant set (the identity then only sees items requiring nothing).
pub fn extract_grants(payload: &Value) -> Result<Vec<EntitlementId>, ExtractError> {
    let list = match payload.get("entitlements") {
        None => return Ok(Vec::new()),
        Some(v) => v.as_array().ok_or(ExtractError::WrongType("entitlements"))?,
    };

    list.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(ExtractError::WrongType("entitlements"))
        })
        .collect()
}

/// Extract the per-security entries from a partial or final response payload.
///
/// Expected shape:
/// `{"securities": [{"security": "...", "entitlement_ids": [...], "fields": {...}}, ...]}`.
/// `entitlement_ids` and `fields` are optional per entry; a missing id list
/// means the item requires no entitlement.
pub fn extract_securities(payload: &Value) -> Result<Vec<SecurityData>, ExtractError> {
    let entries = payload
        .get("securities")
        .ok_or(ExtractError::MissingField("securities"))?
        .as_array()
        .ok_or(ExtractError::WrongType("securities"))?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let security = entry
            .get("security")
            .ok_or(ExtractError::MissingField("security"))?
            .as_str()
            .ok_or(ExtractError::WrongType("security"))?
            .to_string();

        let entitlement_ids = match entry.get("entitlement_ids") {
            None => Vec::new(),
            Some(v) => v
                .as_array()
                .ok_or(ExtractError::WrongType("entitlement_ids"))?
                .iter()
                .map(|id| {
                    id.as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or(ExtractError::WrongType("entitlement_ids"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let fields = entry.get("fields").cloned().unwrap_or_else(|| Value::Object(Default::default()));

        out.push(SecurityData {
            security,
            entitlement_ids,
            fields,
        });
    }

    Ok(out)
}

/// Extract the optional reason string carried by failure and termination
/// payloads.
pub fn extract_reason(payload: &Value) -> Option<String> {
    payload.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Extract the service name from a service status payload.
pub fn extract_service(payload: &Value) -> Result<String, ExtractError> {
    payload
        .get("service")
        .ok_or(ExtractError::MissingField("service"))?
        .as_str()
        .ok_or(ExtractError::WrongType("service"))
        .map(|s| s.to_string())
}
