//! NVP wire codec.
//!
//! The processor speaks a legacy name-value-pair encoding: percent-encoded
//! `KEY=value&KEY=value` bodies on both requests and responses. This module
//! owns encoding, decoding, the `"N/A"` sentinel for absent fields, and
//! sanitization of credential fields before anything reaches a log line.

use std::collections::HashMap;

use url::form_urlencoded;

/// Sentinel returned for fields the processor did not send. The parser never
/// fails on missing data; validation happens downstream.
pub const NA: &str = "N/A";

/// Keys whose values must never appear in plaintext in audit logs.
const SENSITIVE_KEYS: [&str; 3] = ["USER", "PWD", "SIGNATURE"];

/// Encode key/value pairs as an NVP request body.
pub fn encode<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Decode an NVP body into a field map. Later duplicates win, which matches
/// the processor's documented behavior.
pub fn decode(body: &str) -> HashMap<String, String> {
    form_urlencoded::parse(body.as_bytes()).into_owned().collect()
}

/// Re-encode a request body with credential values masked, preserving field
/// order so audit logs stay diffable against raw captures.
pub fn sanitize(body: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(body.as_bytes()) {
        if SENSITIVE_KEYS.contains(&key.as_ref()) {
            serializer.append_pair(&key, "***");
        } else {
            serializer.append_pair(&key, &value);
        }
    }
    serializer.finish()
}

/// A decoded NVP response.
#[derive(Debug, Clone)]
pub struct NvpResponse {
    fields: HashMap<String, String>,
}

impl NvpResponse {
    pub fn parse(body: &str) -> Self {
        Self { fields: decode(body) }
    }

    #[cfg(test)]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Field value, or the `"N/A"` sentinel when absent.
    pub fn get_or_na(&self, key: &str) -> &str {
        self.get(key).unwrap_or(NA)
    }

    pub fn ack(&self) -> &str {
        self.get_or_na("ACK")
    }

    /// `Success` and `SuccessWithWarning` both count as success; a held
    /// transaction arrives as a warning, not a failure.
    pub fn is_success(&self) -> bool {
        matches!(self.ack(), "Success" | "SuccessWithWarning")
    }

    /// First error code of the indexed error list, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.get("L_ERRORCODE0")
    }

    pub fn short_message(&self) -> Option<&str> {
        self.get("L_SHORTMESSAGE0")
    }

    pub fn long_message(&self) -> Option<&str> {
        self.get("L_LONGMESSAGE0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_with_reserved_characters() {
        let body = encode([("INVNUM", "PS-42&co"), ("DESC", "monthly plan = 10%")]);
        let fields = decode(&body);
        assert_eq!(fields["INVNUM"], "PS-42&co");
        assert_eq!(fields["DESC"], "monthly plan = 10%");
    }

    #[test]
    fn sanitize_masks_credentials_and_keeps_order() {
        let body = encode([
            ("METHOD", "DoReferenceTransaction"),
            ("USER", "merchant_api1.example.com"),
            ("PWD", "hunter2"),
            ("SIGNATURE", "AiPC9BjkCyDFQXbSkoZcgqH3hpacAX"),
            ("AMT", "10.00"),
        ]);
        let sanitized = sanitize(&body);
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("AiPC9Bjk"));
        assert!(sanitized.starts_with("METHOD=DoReferenceTransaction"));
        assert!(sanitized.ends_with("AMT=10.00"));
        assert!(sanitized.contains("PWD=***"));
    }

    #[test]
    fn missing_fields_return_sentinel() {
        let resp = NvpResponse::parse("ACK=Success&TRANSACTIONID=8XY12345");
        assert_eq!(resp.get_or_na("PENDINGREASON"), NA);
        assert_eq!(resp.get("TRANSACTIONID"), Some("8XY12345"));
    }

    #[test]
    fn success_with_warning_is_success() {
        let resp = NvpResponse::parse("ACK=SuccessWithWarning&L_ERRORCODE0=11610");
        assert!(resp.is_success());
        assert_eq!(resp.error_code(), Some("11610"));
    }

    #[test]
    fn failure_ack_is_not_success() {
        let resp = NvpResponse::parse("ACK=Failure&L_ERRORCODE0=10002&L_LONGMESSAGE0=Security%20error");
        assert!(!resp.is_success());
        assert_eq!(resp.long_message(), Some("Security error"));
    }
}
