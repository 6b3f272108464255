//! Redaction of sensitive values before events are buffered.
//!
//! Buffers hold raw event bytes for the lifetime of a baseline, and
//! explanations and logs may quote them, so secrets are removed at the
//! door. JSON members with a sensitive key are blanked; free-text patterns
//! are blanked everywhere. With `drop_non_compliant` the event is refused
//! instead.

use std::borrow::Cow;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::detect::{DetectError, Result};

pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enabled: bool,
    /// JSON keys whose values are always blanked (case-insensitive).
    pub redact_fields: Vec<String>,
    /// Regular expressions blanked anywhere in the event.
    pub redact_patterns: Vec<String>,
    /// Drop events that would need redaction instead of rewriting them.
    pub drop_non_compliant: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_fields: ["password", "secret", "token", "api_key", "ssn", "credit_card"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            redact_patterns: vec![
                r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}".into(),
                r"\b\d{3}-\d{2}-\d{4}\b".into(),
            ],
            drop_non_compliant: false,
        }
    }
}

impl PrivacyConfig {
    pub fn validate(&self) -> std::result::Result<(), DetectError> {
        for pattern in &self.redact_patterns {
            Regex::new(pattern).map_err(|e| {
                DetectError::InvalidConfig(format!("invalid privacy pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// What the filter decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivacyVerdict<'a> {
    Pass(Cow<'a, [u8]>),
    /// Event contained sensitive values and the policy drops such events.
    Drop { findings: usize },
}

/// Compiled form of a [`PrivacyConfig`].
pub struct PrivacyFilter {
    enabled: bool,
    fields: Vec<String>,
    patterns: Vec<Regex>,
    drop_non_compliant: bool,
}

impl PrivacyFilter {
    pub fn new(config: &PrivacyConfig) -> Result<Self> {
        let patterns = config
            .redact_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    DetectError::InvalidConfig(format!("invalid privacy pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enabled: config.enabled,
            fields: config
                .redact_fields
                .iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
            patterns,
            drop_non_compliant: config.drop_non_compliant,
        })
    }

    /// A filter that passes everything through.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            fields: Vec::new(),
            patterns: Vec::new(),
            drop_non_compliant: false,
        }
    }

    pub fn apply<'a>(&self, data: &'a [u8]) -> PrivacyVerdict<'a> {
        if !self.enabled {
            return PrivacyVerdict::Pass(Cow::Borrowed(data));
        }

        let mut findings = 0usize;
        let mut out: Cow<'a, [u8]> = Cow::Borrowed(data);

        if !self.fields.is_empty() {
            if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(data) {
                let hits = self.redact_value(&mut value);
                if hits > 0 {
                    findings += hits;
                    if let Ok(bytes) = serde_json::to_vec(&value) {
                        out = Cow::Owned(bytes);
                    }
                }
            }
        }

        for re in &self.patterns {
            let hits = re.find_iter(&out).count();
            if hits == 0 {
                continue;
            }
            findings += hits;
            let replaced = re.replace_all(&out, REDACTED.as_bytes()).into_owned();
            out = Cow::Owned(replaced);
        }

        if findings > 0 && self.drop_non_compliant {
            return PrivacyVerdict::Drop { findings };
        }
        PrivacyVerdict::Pass(out)
    }

    fn redact_value(&self, value: &mut serde_json::Value) -> usize {
        match value {
            serde_json::Value::Object(map) => {
                let mut hits = 0;
                for (key, v) in map.iter_mut() {
                    if self.fields.iter().any(|f| key.eq_ignore_ascii_case(f)) {
                        *v = serde_json::Value::String(REDACTED.into());
                        hits += 1;
                    } else {
                        hits += self.redact_value(v);
                    }
                }
                hits
            }
            serde_json::Value::Array(items) => items.iter_mut().map(|v| self.redact_value(v)).sum(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(verdict: PrivacyVerdict<'_>) -> Vec<u8> {
        match verdict {
            PrivacyVerdict::Pass(bytes) => bytes.into_owned(),
            PrivacyVerdict::Drop { findings } => panic!("unexpected drop ({findings} findings)"),
        }
    }

    #[test]
    fn test_json_fields_redacted_recursively() {
        let filter = PrivacyFilter::new(&PrivacyConfig::default()).unwrap();
        let out = pass(filter.apply(br#"{"user":"bob","auth":{"Password":"hunter2"},"n":1}"#));
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["auth"]["Password"], REDACTED);
        assert_eq!(v["user"], "bob");
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn test_clean_event_is_borrowed() {
        let filter = PrivacyFilter::new(&PrivacyConfig::default()).unwrap();
        let input = br#"{ "user" : "bob" }"#;
        match filter.apply(input) {
            PrivacyVerdict::Pass(Cow::Borrowed(b)) => assert_eq!(b, input),
            other => panic!("expected untouched event, got {other:?}"),
        }
    }

    #[test]
    fn test_patterns_redact_free_text() {
        let filter = PrivacyFilter::new(&PrivacyConfig::default()).unwrap();
        let out = pass(filter.apply(b"customer ssn: 123-45-6789 called"));
        assert_eq!(out, b"customer ssn: [REDACTED] called");
    }

    #[test]
    fn test_email_redacted_inside_json_string() {
        let filter = PrivacyFilter::new(&PrivacyConfig::default()).unwrap();
        let out = pass(filter.apply(br#"{"msg":"mail bob@example.com now"}"#));
        assert_eq!(out, br#"{"msg":"mail [REDACTED] now"}"#);
    }

    #[test]
    fn test_drop_non_compliant() {
        let cfg = PrivacyConfig {
            drop_non_compliant: true,
            ..PrivacyConfig::default()
        };
        let filter = PrivacyFilter::new(&cfg).unwrap();
        assert_eq!(
            filter.apply(br#"{"token":"abc"}"#),
            PrivacyVerdict::Drop { findings: 1 }
        );
        assert!(matches!(filter.apply(br#"{"ok":true}"#), PrivacyVerdict::Pass(_)));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let cfg = PrivacyConfig {
            redact_patterns: vec!["(unclosed".into()],
            ..PrivacyConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(matches!(
            PrivacyFilter::new(&cfg),
            Err(DetectError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_disabled_passes_everything() {
        let out = pass(PrivacyFilter::disabled().apply(br#"{"password":"x"}"#));
        assert_eq!(out, br#"{"password":"x"}"#);
    }
}
