//! Redaction of sensitive fields before a payload leaves the process.
//!
//! Scrub rules come from configuration as a flat list and are split once into
//! four disjoint partitions:
//!
//! - bare names (no `.`), masked anywhere under `data`;
//! - request body paths (prefix `data.body.request.body.`);
//! - response body paths (prefix `data.body.response.body.`);
//! - every other dotted path, resolved against the whole document.
//!
//! Bodies are tried as structured JSON first. When none of their paths
//! resolve, the body value is treated as a string that may itself contain a
//! JSON object, which is scrubbed and written back re-serialized. Other
//! string formats are left untouched.
//!
//! Order matters: request body, response body, dotted paths, then names.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

pub mod path;

pub use path::{scrub_names, scrub_paths};

/// Replacement written over every scrubbed value.
pub const SCRUB_MASK: &str = "***";

/// Property under which bare names are searched.
pub const DATA_ROOT: &str = "data";

/// Prefix of rules targeting the HTTP request body.
pub const REQUEST_BODY_PREFIX: &str = "data.body.request.body.";

/// Prefix of rules targeting the HTTP response body.
pub const RESPONSE_BODY_PREFIX: &str = "data.body.response.body.";

/// Configured scrub rules split into their four partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubRules {
    names: Vec<String>,
    paths: Vec<String>,
    request_body_paths: Vec<String>,
    response_body_paths: Vec<String>,
}

impl ScrubRules {
    /// Partitions `rules`. Every rule lands in exactly one partition.
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut partitioned = Self::default();
        for rule in rules {
            let rule = rule.into();
            if rule.starts_with(REQUEST_BODY_PREFIX) {
                partitioned.request_body_paths.push(rule);
            } else if rule.starts_with(RESPONSE_BODY_PREFIX) {
                partitioned.response_body_paths.push(rule);
            } else if rule.contains('.') {
                partitioned.paths.push(rule);
            } else {
                partitioned.names.push(rule);
            }
        }
        partitioned
    }

    /// Filters `fields` against `critical` and partitions the remainder.
    pub fn from_fields<S: AsRef<str>, C: AsRef<str>>(fields: &[S], critical: Option<&[C]>) -> Self {
        Self::new(filter_out_critical_fields(fields, critical))
    }

    /// Bare field names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Dotted paths outside the body prefixes.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Paths under the request body.
    pub fn request_body_paths(&self) -> &[String] {
        &self.request_body_paths
    }

    /// Paths under the response body.
    pub fn response_body_paths(&self) -> &[String] {
        &self.response_body_paths
    }

    /// Total number of rules across all partitions.
    pub fn len(&self) -> usize {
        self.names.len()
            + self.paths.len()
            + self.request_body_paths.len()
            + self.response_body_paths.len()
    }

    /// True if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes every candidate that exactly matches a critical field.
///
/// Critical fields are the ones delivery depends on, such as access tokens.
/// An absent or empty critical set leaves the candidates unchanged.
pub fn filter_out_critical_fields<S: AsRef<str>, C: AsRef<str>>(
    candidates: &[S],
    critical: Option<&[C]>,
) -> Vec<String> {
    let critical = critical.unwrap_or(&[]);
    candidates
        .iter()
        .map(AsRef::as_ref)
        .filter(|candidate| !critical.iter().any(|c| c.as_ref() == *candidate))
        .map(str::to_string)
        .collect()
}

/// How a body partition was handled during a scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyOutcome {
    /// No rules target this body.
    NoRules,
    /// At least one path resolved against the structured body.
    Structured,
    /// The body was a string holding a JSON object, scrubbed and re-serialized.
    EmbeddedJson,
    /// The body string is not a JSON object (XML, `key=value`, plain text).
    UnsupportedFormat,
    /// The body is absent, blank, or not a string.
    Untouched,
}

/// Summary of one scrub pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrubReport {
    /// Request body handling.
    pub request_body: BodyOutcome,
    /// Response body handling.
    pub response_body: BodyOutcome,
    /// Dotted paths that resolved and were masked.
    pub paths_masked: usize,
}

/// Applies a fixed rule set to payload documents.
#[derive(Debug, Clone)]
pub struct PayloadScrubber {
    rules: ScrubRules,
    mask: String,
}

impl PayloadScrubber {
    /// Creates a scrubber using the default `***` mask.
    pub fn new(rules: ScrubRules) -> Self {
        Self::with_mask(rules, SCRUB_MASK)
    }

    /// Creates a scrubber with a custom mask.
    pub fn with_mask(rules: ScrubRules, mask: impl Into<String>) -> Self {
        Self { rules, mask: mask.into() }
    }

    /// Rule partitions in use.
    pub fn rules(&self) -> &ScrubRules {
        &self.rules
    }

    /// Returns a scrubbed copy of `payload`; the input is not touched.
    pub fn scrub(&self, payload: &Value) -> Value {
        let mut copy = payload.clone();
        self.scrub_in_place(&mut copy);
        copy
    }

    /// Parses, scrubs and re-serializes a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if `json` is not valid JSON.
    pub fn scrub_str(&self, json: &str) -> Result<String> {
        let mut document: Value = serde_json::from_str(json)?;
        self.scrub_in_place(&mut document);
        Ok(serde_json::to_string(&document)?)
    }

    /// Scrubs `payload` in place and reports what happened to each body.
    pub fn scrub_in_place(&self, payload: &mut Value) -> ScrubReport {
        let request_body =
            self.scrub_body(payload, REQUEST_BODY_PREFIX, &self.rules.request_body_paths);
        let response_body =
            self.scrub_body(payload, RESPONSE_BODY_PREFIX, &self.rules.response_body_paths);

        let paths_masked = scrub_paths(payload, &self.rules.paths, &self.mask);

        if !self.rules.names.is_empty() {
            if let Some(data) = payload.get_mut(DATA_ROOT) {
                scrub_names(data, &self.rules.names, &self.mask);
            }
        }

        let report = ScrubReport { request_body, response_body, paths_masked };
        debug!(?report, "payload scrubbed");
        report
    }

    fn scrub_body(&self, payload: &mut Value, prefix: &str, paths: &[String]) -> BodyOutcome {
        if paths.is_empty() {
            return BodyOutcome::NoRules;
        }

        if scrub_paths(payload, paths, &self.mask) > 0 {
            return BodyOutcome::Structured;
        }

        let body_root = prefix.trim_end_matches('.');
        let Some(text) = path::value_at(payload, body_root).and_then(Value::as_str) else {
            return BodyOutcome::Untouched;
        };
        if text.trim().is_empty() {
            return BodyOutcome::Untouched;
        }

        let mut embedded = match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => value,
            _ => return BodyOutcome::UnsupportedFormat,
        };

        let relative: Vec<&str> =
            paths.iter().filter_map(|full| full.strip_prefix(prefix)).collect();
        scrub_paths(&mut embedded, &relative, &self.mask);

        path::set_value(payload, body_root, Value::String(embedded.to_string()));
        BodyOutcome::EmbeddedJson
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rules_partition_is_a_strict_split() {
        let input = [
            "password",
            "data.person.email",
            "data.body.request.body.pwd",
            "data.body.response.body.token",
            "custom.secret",
            "data.body.request.body",
        ];
        let rules = ScrubRules::new(input);

        assert_eq!(rules.names(), ["password"]);
        assert_eq!(rules.paths(), ["data.person.email", "custom.secret", "data.body.request.body"]);
        assert_eq!(rules.request_body_paths(), ["data.body.request.body.pwd"]);
        assert_eq!(rules.response_body_paths(), ["data.body.response.body.token"]);
        assert_eq!(rules.len(), input.len());
    }

    #[test]
    fn critical_fields_are_removed_exactly() {
        let fields = ["access_token", "Access_Token", "password"];
        let filtered = filter_out_critical_fields(&fields, Some(&["access_token"]));
        assert_eq!(filtered, ["Access_Token", "password"]);

        let untouched = filter_out_critical_fields::<_, &str>(&fields, None);
        assert_eq!(untouched, fields);
    }

    #[test]
    fn names_are_only_scrubbed_under_data() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["secret"]));
        let doc = json!({"secret": "top", "data": {"secret": "inner", "list": [{"secret": 1}]}});

        let scrubbed = scrubber.scrub(&doc);

        assert_eq!(
            scrubbed,
            json!({"secret": "top", "data": {"secret": "***", "list": [{"secret": "***"}]}})
        );
        assert_eq!(doc["data"]["secret"], "inner");
    }

    #[test]
    fn structured_request_body_is_scrubbed_natively() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["data.body.request.body.pwd"]));
        let mut doc =
            json!({"data": {"body": {"request": {"body": {"pwd": "secret", "user": "u"}}}}});

        let report = scrubber.scrub_in_place(&mut doc);

        assert_eq!(report.request_body, BodyOutcome::Structured);
        assert_eq!(report.response_body, BodyOutcome::NoRules);
        assert_eq!(doc["data"]["body"]["request"]["body"], json!({"pwd": "***", "user": "u"}));
    }

    #[test]
    fn string_request_body_is_scrubbed_as_embedded_json() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["data.body.request.body.pwd"]));
        let mut doc = json!({
            "data": {"body": {"request": {"url": "/login", "body": "{\"pwd\":\"secret\"}"}}}
        });

        let report = scrubber.scrub_in_place(&mut doc);

        assert_eq!(report.request_body, BodyOutcome::EmbeddedJson);
        assert_eq!(doc["data"]["body"]["request"]["body"], json!("{\"pwd\":\"***\"}"));
        assert_eq!(doc["data"]["body"]["request"]["url"], json!("/login"));
    }

    #[test]
    fn non_json_string_bodies_are_left_alone() {
        let scrubber = PayloadScrubber::new(ScrubRules::new([
            "data.body.request.body.pwd",
            "data.body.response.body.pwd",
        ]));
        let mut doc = json!({"data": {"body": {
            "request": {"body": "pwd=secret&user=u"},
            "response": {"body": "<pwd>secret</pwd>"}
        }}});
        let before = doc.clone();

        let report = scrubber.scrub_in_place(&mut doc);

        assert_eq!(report.request_body, BodyOutcome::UnsupportedFormat);
        assert_eq!(report.response_body, BodyOutcome::UnsupportedFormat);
        assert_eq!(doc, before);
    }

    #[test]
    fn blank_or_missing_bodies_are_untouched() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["data.body.response.body.pwd"]));

        let mut blank = json!({"data": {"body": {"response": {"body": "   "}}}});
        assert_eq!(scrubber.scrub_in_place(&mut blank).response_body, BodyOutcome::Untouched);

        let mut missing = json!({"data": {}});
        assert_eq!(scrubber.scrub_in_place(&mut missing).response_body, BodyOutcome::Untouched);
    }

    #[test]
    fn path_masking_runs_before_name_masking() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["data.user", "email"]));
        let doc = json!({"data": {"user": {"email": "a@b.c"}, "email": "x@y.z"}});

        let scrubbed = scrubber.scrub(&doc);

        assert_eq!(scrubbed, json!({"data": {"user": "***", "email": "***"}}));
    }

    #[test]
    fn scrub_str_rejects_invalid_json() {
        let scrubber = PayloadScrubber::new(ScrubRules::new(["password"]));
        assert!(scrubber.scrub_str("{not json").is_err());
        assert_eq!(
            scrubber.scrub_str(r#"{"data":{"password":"p"}}"#).unwrap(),
            r#"{"data":{"password":"***"}}"#
        );
    }
}
