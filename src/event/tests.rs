use super::*;
use serde_json::json;

#[test]
fn test_correlation_ids_are_unique() {
    let a = CorrelationId::new();
    let b = CorrelationId::new();
    assert_ne!(a, b);
}

#[test]
fn test_correlation_id_display_is_uuid_format() {
    let token = CorrelationId::new();
    assert_eq!(token.to_string().len(), 36);
}

#[test]
fn test_extract_grants() {
    let grants = extract_grants(&json!({"entitlements": [5, 9, 12]})).unwrap();
    assert_eq!(grants, vec![5, 9, 12]);
}

#[test]
fn test_extract_grants_missing_list_is_empty_grant_set() {
    let grants = extract_grants(&json!({})).unwrap();
    assert!(grants.is_empty());
}

#[test]
fn test_extract_grants_rejects_non_numeric() {
    let result = extract_grants(&json!({"entitlements": ["five"]}));
    assert_eq!(result.unwrap_err(), ExtractError::WrongType("entitlements"));
}

#[test]
fn test_extract_securities() {
    let payload = json!({
        "securities": [
            {"security": "S1", "entitlement_ids": [5, 9], "fields": {"LAST_PRICE": 101.25}},
            {"security": "S2"},
        ]
    });

    let securities = extract_securities(&payload).unwrap();
    assert_eq!(securities.len(), 2);
    assert_eq!(securities[0].security, "S1");
    assert_eq!(securities[0].entitlement_ids, vec![5, 9]);
    assert_eq!(securities[0].fields, json!({"LAST_PRICE": 101.25}));
    // Missing id list means no entitlement required
    assert_eq!(securities[1].security, "S2");
    assert!(securities[1].entitlement_ids.is_empty());
    assert_eq!(securities[1].fields, json!({}));
}

#[test]
fn test_extract_securities_missing_list_fails() {
    let result = extract_securities(&json!({"reason": "oops"}));
    assert_eq!(result.unwrap_err(), ExtractError::MissingField("securities"));
}

#[test]
fn test_extract_securities_unnamed_entry_fails() {
    let result = extract_securities(&json!({"securities": [{"entitlement_ids": [1]}]}));
    assert_eq!(result.unwrap_err(), ExtractError::MissingField("security"));
}

#[test]
fn test_extract_reason_optional() {
    assert_eq!(
        extract_reason(&json!({"reason": "denied by provider"})),
        Some("denied by provider".to_string())
    );
    assert_eq!(extract_reason(&json!({})), None);
}

#[test]
fn test_extract_service() {
    let service = extract_service(&json!({"service": "//provider/refdata"})).unwrap();
    assert_eq!(service, "//provider/refdata");
    assert_eq!(
        extract_service(&json!({})).unwrap_err(),
        ExtractError::MissingField("service")
    );
}
