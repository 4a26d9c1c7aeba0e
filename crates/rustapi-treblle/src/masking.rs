//! Redaction of sensitive values in bodies and headers.
//!
//! A key is sensitive when its lowercase form contains any of the policy's
//! hidden-key patterns. Masking always works on a copy; the captured body is
//! never touched.

use http::HeaderMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Replacement for every masked body value.
pub const MASK: &str = "*****";

/// Sensitive-key patterns applied when no additions are configured.
pub const DEFAULT_HIDDEN_KEYS: &[&str] = &[
    "password",
    "pwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "api-key",
    "card_number",
    "cardnumber",
    "ccv",
    "cvv",
    "ssn",
    "credit_score",
    "creditscore",
    "cookie",
];

/// Authorization schemes that stay visible when the credential is masked.
const COMMON_AUTH_SCHEMES: &[&str] = &[
    "basic",
    "bearer",
    "digest",
    "negotiate",
    "oauth",
    "aws4-hmac-sha256",
    "hoba",
    "mutual",
];

/// Immutable redaction rules shared by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskingPolicy {
    hidden_keys: BTreeSet<String>,
    mask_auth_header: bool,
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>(), true)
    }
}

impl MaskingPolicy {
    /// Build a policy from the default list plus `additions`.
    ///
    /// Patterns are lowercased; blank patterns are ignored since they would
    /// match every key.
    pub fn new(additions: impl IntoIterator<Item = impl Into<String>>, mask_auth_header: bool) -> Self {
        let hidden_keys = DEFAULT_HIDDEN_KEYS
            .iter()
            .map(|k| k.to_string())
            .chain(additions.into_iter().map(Into::into))
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        Self {
            hidden_keys,
            mask_auth_header,
        }
    }

    /// The lowercase hidden-key patterns.
    pub fn hidden_keys(&self) -> impl Iterator<Item = &str> {
        self.hidden_keys.iter().map(String::as_str)
    }

    /// Whether the Authorization header gets scheme-preserving masking.
    pub fn masks_auth_header(&self) -> bool {
        self.mask_auth_header
    }

    /// Check if a mapping key or header name is sensitive.
    pub fn is_hidden(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.hidden_keys.iter().any(|pattern| key.contains(pattern.as_str()))
    }

    /// Return a masked copy of a JSON tree.
    ///
    /// The value under a sensitive key is replaced wholesale by [`MASK`],
    /// whatever its type; everything else is walked recursively.
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, inner)| {
                        let masked = if self.is_hidden(key) {
                            Value::String(MASK.to_string())
                        } else {
                            self.mask_value(inner)
                        };
                        (key.clone(), masked)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Mask a single header value.
    pub fn mask_header(&self, name: &str, value: &str) -> String {
        if self.mask_auth_header && name.eq_ignore_ascii_case("authorization") {
            return mask_authorization(value);
        }
        if self.is_hidden(name) {
            return stars(value);
        }
        value.to_string()
    }

    /// Flatten and mask a header map.
    ///
    /// Repeated headers are joined with `", "`. Non-UTF-8 values are decoded
    /// lossily before masking.
    pub fn mask_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let raw = String::from_utf8_lossy(value.as_bytes());
            let masked = self.mask_header(name.as_str(), &raw);
            out.entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&masked);
                })
                .or_insert(masked);
        }
        out
    }
}

fn stars(value: &str) -> String {
    "*".repeat(value.chars().count())
}

/// Keep a known scheme, star out the credential.
///
/// Values without a space or with an unknown scheme are starred out entirely.
fn mask_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, credential))
            if COMMON_AUTH_SCHEMES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(scheme)) =>
        {
            format!("{} {}", scheme, stars(credential))
        }
        _ => stars(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_masks_nested_keys() {
        let policy = MaskingPolicy::default();
        let body = json!({
            "user": {
                "name": "alice",
                "Password": "hunter2",
                "cards": [{"card_number": "4111111111111111", "label": "main"}]
            },
            "access_token": {"nested": "object"}
        });

        let masked = policy.mask_value(&body);

        assert_eq!(masked["user"]["name"], "alice");
        assert_eq!(masked["user"]["Password"], MASK);
        assert_eq!(masked["user"]["cards"][0]["card_number"], MASK);
        assert_eq!(masked["user"]["cards"][0]["label"], "main");
        // The flagged subtree is replaced, not descended into.
        assert_eq!(masked["access_token"], MASK);
    }

    #[test]
    fn test_substring_match_is_case_insensitive() {
        let policy = MaskingPolicy::new(vec!["Internal"], true);
        assert!(policy.is_hidden("X-INTERNAL-ID"));
        assert!(policy.is_hidden("userPassword"));
        assert!(!policy.is_hidden("username"));
    }

    #[test]
    fn test_original_body_is_untouched() {
        let policy = MaskingPolicy::default();
        let body = json!({"password": "hunter2"});
        let _ = policy.mask_value(&body);
        assert_eq!(body["password"], "hunter2");
    }

    #[test]
    fn test_scalars_pass_through() {
        let policy = MaskingPolicy::default();
        assert_eq!(policy.mask_value(&json!(42)), json!(42));
        assert_eq!(policy.mask_value(&json!(null)), json!(null));
        assert_eq!(policy.mask_value(&json!(["a", 1])), json!(["a", 1]));
    }

    #[test]
    fn test_bearer_keeps_scheme() {
        let policy = MaskingPolicy::default();
        let masked = policy.mask_header("Authorization", "Bearer abc123");
        assert_eq!(masked, "Bearer ******");
        assert!(!masked.contains("abc123"));
    }

    #[test]
    fn test_unknown_scheme_is_fully_masked() {
        let policy = MaskingPolicy::default();
        assert_eq!(policy.mask_header("authorization", "Custom xyz"), "**********");
        assert_eq!(policy.mask_header("authorization", "abc123"), "******");
    }

    #[test]
    fn test_auth_header_left_alone_when_disabled() {
        let policy = MaskingPolicy::new(std::iter::empty::<String>(), false);
        assert_eq!(
            policy.mask_header("Authorization", "Bearer abc123"),
            "Bearer abc123"
        );
    }

    #[test]
    fn test_hidden_header_name_is_replaced() {
        let policy = MaskingPolicy::default();
        assert_eq!(policy.mask_header("x-api-token", "abcd"), "****");
        assert_eq!(policy.mask_header("content-type", "text/plain"), "text/plain");
    }

    #[test]
    fn test_hyphenated_api_key_header_is_masked() {
        let policy = MaskingPolicy::default();
        assert_eq!(policy.mask_header("X-API-Key", "abcd"), "****");

        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", "live-key-123".parse().unwrap());
        let masked = policy.mask_headers(&headers);
        assert_eq!(masked["x-api-key"], "************");
    }

    #[test]
    fn test_mask_headers_joins_repeated_values() {
        let policy = MaskingPolicy::default();
        let mut headers = HeaderMap::new();
        headers.append("accept", "text/html".parse().unwrap());
        headers.append("accept", "application/json".parse().unwrap());
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());

        let masked = policy.mask_headers(&headers);
        assert_eq!(masked["accept"], "text/html, application/json");
        assert_eq!(masked["authorization"], "Basic ************");
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map(
                    prop_oneof![
                        Just("password".to_string()),
                        Just("Secret_Key".to_string()),
                        Just("session_token".to_string()),
                        "[a-z]{1,8}",
                    ],
                    inner,
                    0..6
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn assert_no_hidden_leaks(policy: &MaskingPolicy, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    if policy.is_hidden(key) {
                        assert_eq!(inner, &Value::String(MASK.to_string()));
                    } else {
                        assert_no_hidden_leaks(policy, inner);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| assert_no_hidden_leaks(policy, v)),
            _ => {}
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_hidden_values_masked_at_any_depth(value in arb_json()) {
            let policy = MaskingPolicy::default();
            let masked = policy.mask_value(&value);
            assert_no_hidden_leaks(&policy, &masked);
        }

        #[test]
        fn prop_masking_is_idempotent(value in arb_json()) {
            let policy = MaskingPolicy::new(vec!["name"], true);
            let once = policy.mask_value(&value);
            let twice = policy.mask_value(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_auth_header_never_exposes_credential(credential in "[A-Za-z0-9]{1,40}") {
            let policy = MaskingPolicy::default();
            let masked = policy.mask_header("Authorization", &format!("Bearer {credential}"));
            prop_assert!(masked.starts_with("Bearer "));
            prop_assert!(masked["Bearer ".len()..].chars().all(|c| c == '*'));
            prop_assert_eq!(policy.mask_header("Authorization", &masked), masked);
        }
    }
}
